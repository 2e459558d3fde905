//! TOML file configuration structures.
//!
//! These structs map the `teller.toml` file one to one; validation and
//! conversion into the core config sections happens in the loader.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// Where the database file is saved.
    #[serde(default = "default_db_file")]
    pub dbfile: PathBuf,

    /// Path of the BTC deposit addresses JSON file.
    pub btc_addresses: PathBuf,
    /// Path of the SKY deposit addresses JSON file.
    pub sky_addresses: PathBuf,

    /// Base URL of the kitty API catalog service.
    pub kitty_api_addr: String,
    /// Base URL of the verification-code service.
    pub verifier_addr: String,
    /// Base URL of the kitty ledger node.
    pub kitty_client_addr: String,

    #[serde(default)]
    pub teller: TellerSection,
    #[serde(default)]
    pub btc_rpc: BtcRpcSection,
    #[serde(default)]
    pub sky_rpc: SkyRpcSection,
    #[serde(default)]
    pub btc_scanner: BtcScannerSection,
    #[serde(default)]
    pub sky_scanner: SkyScannerSection,
    #[serde(default)]
    pub box_exchanger: BoxExchangerSection,
    #[serde(default)]
    pub web: WebSection,
    #[serde(default)]
    pub dummy: DummySection,
}

fn default_db_file() -> PathBuf {
    PathBuf::from("teller.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TellerSection {
    pub max_bound_addrs: usize,
    pub bind_enabled: bool,
}

impl Default for TellerSection {
    fn default() -> Self {
        Self {
            max_bound_addrs: 5,
            bind_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BtcRpcSection {
    pub server: String,
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkyRpcSection {
    pub address: String,
}

impl Default for SkyRpcSection {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6420".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BtcScannerSection {
    pub enabled: bool,
    pub scan_period_secs: u64,
    pub initial_scan_height: i64,
    pub confirmations_required: i64,
}

impl Default for BtcScannerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_period_secs: 20,
            initial_scan_height: 492_478,
            confirmations_required: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkyScannerSection {
    pub enabled: bool,
    pub scan_period_secs: u64,
    pub initial_scan_height: i64,
}

impl Default for SkyScannerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_period_secs: 10,
            initial_scan_height: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxExchangerSection {
    pub max_decimals: u32,
    pub genesis_key: String,
    pub tx_confirmation_check_wait_secs: u64,
    pub send_enabled: bool,
}

impl Default for BoxExchangerSection {
    fn default() -> Self {
        Self {
            max_decimals: 3,
            genesis_key: String::new(),
            tx_confirmation_check_wait_secs: 5,
            send_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub http_addr: SocketAddr,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:7071".parse().unwrap_or_else(|_| {
                SocketAddr::from(([127, 0, 0, 1], 7071))
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DummySection {
    pub scanner: bool,
    pub sender: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let toml_str = r#"
btc_addresses = "btc_addresses.json"
sky_addresses = "sky_addresses.json"
kitty_api_addr = "http://127.0.0.1:8080"
verifier_addr = "http://127.0.0.1:8081"
kitty_client_addr = "http://127.0.0.1:8082"

[box_exchanger]
genesis_key = "gk"
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.dbfile, PathBuf::from("teller.db"));
        assert!(config.btc_scanner.enabled);
        assert_eq!(config.btc_scanner.scan_period_secs, 20);
        assert_eq!(config.teller.max_bound_addrs, 5);
        assert_eq!(config.web.http_addr.port(), 7071);
        assert!(!config.dummy.scanner);
    }

    #[test]
    fn test_overrides_apply() {
        let toml_str = r#"
dbfile = "/var/lib/teller/teller.db"
btc_addresses = "btc.json"
sky_addresses = "sky.json"
kitty_api_addr = "http://api"
verifier_addr = "http://verify"
kitty_client_addr = "http://ledger"

[btc_scanner]
enabled = false

[dummy]
scanner = true
sender = true

[web]
http_addr = "0.0.0.0:9000"
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert!(!config.btc_scanner.enabled);
        assert!(config.dummy.scanner);
        assert_eq!(config.web.http_addr.port(), 9000);
    }
}
