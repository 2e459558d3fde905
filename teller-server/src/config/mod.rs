//! Config loading and validation.

mod file;

pub use file::FileConfig;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use teller_core::config::{
    BoxExchangerConfig, BtcScannerConfig, ConfigError, DummyConfig, SkyScannerConfig, TellerConfig,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("config file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config file {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },

    #[error("{0} file does not exist")]
    AddressFileMissing(PathBuf),

    #[error("btc_rpc.{0} missing")]
    BtcRpcFieldMissing(&'static str),

    #[error("sky_rpc.address missing")]
    SkyRpcAddressMissing,

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Validated runtime configuration assembled from the file.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub dbfile: PathBuf,
    pub btc_addresses: PathBuf,
    pub sky_addresses: PathBuf,
    pub kitty_api_addr: String,
    pub verifier_addr: String,
    pub kitty_client_addr: String,
    pub btc_rpc: BtcRpc,
    pub sky_rpc_address: String,
    pub teller: TellerConfig,
    pub btc_scanner: BtcScannerConfig,
    pub sky_scanner: SkyScannerConfig,
    pub box_exchanger: BoxExchangerConfig,
    pub http_addr: SocketAddr,
    pub dummy: DummyConfig,
}

#[derive(Debug, Clone)]
pub struct BtcRpc {
    pub server: String,
    pub user: String,
    pub pass: String,
}

/// Read, parse, and validate the configuration file.
pub fn load(path: &Path) -> Result<RuntimeConfig, ConfigLoadError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let file: FileConfig = toml::from_str(&raw).map_err(|source| ConfigLoadError::Malformed {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    validate(file)
}

fn validate(file: FileConfig) -> Result<RuntimeConfig, ConfigLoadError> {
    if !file.btc_addresses.exists() {
        return Err(ConfigLoadError::AddressFileMissing(file.btc_addresses));
    }
    if !file.sky_addresses.exists() {
        return Err(ConfigLoadError::AddressFileMissing(file.sky_addresses));
    }

    let btc_scanner = BtcScannerConfig {
        enabled: file.btc_scanner.enabled,
        scan_period: Duration::from_secs(file.btc_scanner.scan_period_secs),
        initial_scan_height: file.btc_scanner.initial_scan_height,
        confirmations_required: file.btc_scanner.confirmations_required,
    };
    btc_scanner.validate()?;

    let sky_scanner = SkyScannerConfig {
        enabled: file.sky_scanner.enabled,
        scan_period: Duration::from_secs(file.sky_scanner.scan_period_secs),
        initial_scan_height: file.sky_scanner.initial_scan_height,
    };
    sky_scanner.validate()?;

    let box_exchanger = BoxExchangerConfig {
        max_decimals: file.box_exchanger.max_decimals,
        genesis_key: file.box_exchanger.genesis_key.clone(),
        tx_confirmation_check_wait: Duration::from_secs(
            file.box_exchanger.tx_confirmation_check_wait_secs,
        ),
        send_enabled: file.box_exchanger.send_enabled,
    };
    box_exchanger.validate()?;

    // The node RPC settings only matter when the real scanners run.
    if !file.dummy.scanner && file.btc_scanner.enabled {
        if file.btc_rpc.server.is_empty() {
            return Err(ConfigLoadError::BtcRpcFieldMissing("server"));
        }
        if file.btc_rpc.user.is_empty() {
            return Err(ConfigLoadError::BtcRpcFieldMissing("user"));
        }
        if file.btc_rpc.pass.is_empty() {
            return Err(ConfigLoadError::BtcRpcFieldMissing("pass"));
        }
    }
    if !file.dummy.scanner && file.sky_scanner.enabled && file.sky_rpc.address.is_empty() {
        return Err(ConfigLoadError::SkyRpcAddressMissing);
    }

    Ok(RuntimeConfig {
        dbfile: file.dbfile,
        btc_addresses: file.btc_addresses,
        sky_addresses: file.sky_addresses,
        kitty_api_addr: file.kitty_api_addr,
        verifier_addr: file.verifier_addr,
        kitty_client_addr: file.kitty_client_addr,
        btc_rpc: BtcRpc {
            server: file.btc_rpc.server,
            user: file.btc_rpc.user,
            pass: file.btc_rpc.pass,
        },
        sky_rpc_address: file.sky_rpc.address,
        teller: TellerConfig {
            max_bound_addresses: file.teller.max_bound_addrs,
            bind_enabled: file.teller.bind_enabled,
        },
        btc_scanner,
        sky_scanner,
        box_exchanger,
        http_addr: file.web.http_addr,
        dummy: DummyConfig {
            scanner: file.dummy.scanner,
            sender: file.dummy.sender,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn base_config(dir: &Path) -> String {
        let btc = write_file(dir, "btc.json", r#"{"addresses": []}"#);
        let sky = write_file(dir, "sky.json", r#"{"addresses": []}"#);
        format!(
            r#"
btc_addresses = "{}"
sky_addresses = "{}"
kitty_api_addr = "http://127.0.0.1:8080"
verifier_addr = "http://127.0.0.1:8081"
kitty_client_addr = "http://127.0.0.1:8082"

[box_exchanger]
genesis_key = "gk"
"#,
            btc.display(),
            sky.display()
        )
    }

    #[test]
    fn test_missing_address_file_is_fatal() {
        let toml_str = r#"
btc_addresses = "/nonexistent/btc.json"
sky_addresses = "/nonexistent/sky.json"
kitty_api_addr = "http://api"
verifier_addr = "http://verify"
kitty_client_addr = "http://ledger"
"#;
        let file: FileConfig = toml::from_str(toml_str).unwrap();
        assert!(matches!(
            validate(file),
            Err(ConfigLoadError::AddressFileMissing(_))
        ));
    }

    #[test]
    fn test_real_scanner_requires_rpc_settings() {
        let dir = tempfile::tempdir().unwrap();
        let file: FileConfig = toml::from_str(&base_config(dir.path())).unwrap();
        assert!(matches!(
            validate(file),
            Err(ConfigLoadError::BtcRpcFieldMissing("server"))
        ));
    }

    #[test]
    fn test_dummy_mode_skips_rpc_settings() {
        let dir = tempfile::tempdir().unwrap();
        let toml_str = format!("{}\n[dummy]\nscanner = true\n", base_config(dir.path()));
        let file: FileConfig = toml::from_str(&toml_str).unwrap();
        let config = validate(file).unwrap();
        assert!(config.dummy.scanner);
        assert!(!config.dummy.sender);
    }
}
