//! Validated runtime configuration sections.
//!
//! These are the typed sections the pipeline components consume. Parsing
//! the config file into them is handled by the server crate.

use crate::exchange::SendConfig;
use crate::scanner::ScanConfig;
use std::time::Duration;
use thiserror::Error;

/// Droplets use at most six decimal places.
pub const MAX_DROPLET_PRECISION: u32 = 6;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("btc_scanner.confirmations_required must be >= 0")]
    NegativeConfirmations,

    #[error("{section}.initial_scan_height must be >= 0")]
    NegativeScanHeight { section: &'static str },

    #[error("{section}.scan_period must be positive")]
    ZeroScanPeriod { section: &'static str },

    #[error("box_exchanger.max_decimals is larger than the droplet precision {MAX_DROPLET_PRECISION}")]
    MaxDecimalsTooLarge,

    #[error("box_exchanger.genesis_key missing")]
    GenesisKeyMissing,
}

/// BTC scanner section.
#[derive(Debug, Clone)]
pub struct BtcScannerConfig {
    pub enabled: bool,
    pub scan_period: Duration,
    pub initial_scan_height: i64,
    pub confirmations_required: i64,
}

impl Default for BtcScannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_period: Duration::from_secs(20),
            initial_scan_height: 492_478,
            confirmations_required: 1,
        }
    }
}

impl BtcScannerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.confirmations_required < 0 {
            return Err(ConfigError::NegativeConfirmations);
        }
        if self.initial_scan_height < 0 {
            return Err(ConfigError::NegativeScanHeight {
                section: "btc_scanner",
            });
        }
        if self.scan_period.is_zero() {
            return Err(ConfigError::ZeroScanPeriod {
                section: "btc_scanner",
            });
        }
        Ok(())
    }

    pub fn scan_config(&self, deposit_buffer_size: usize) -> ScanConfig {
        ScanConfig {
            scan_period: self.scan_period,
            initial_scan_height: self.initial_scan_height,
            confirmations_required: self.confirmations_required,
            deposit_buffer_size,
        }
    }
}

/// SKY scanner section. Skycoin blocks are final on sight, so there is no
/// confirmation depth knob.
#[derive(Debug, Clone)]
pub struct SkyScannerConfig {
    pub enabled: bool,
    pub scan_period: Duration,
    pub initial_scan_height: i64,
}

impl Default for SkyScannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_period: Duration::from_secs(10),
            initial_scan_height: 0,
        }
    }
}

impl SkyScannerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_scan_height < 0 {
            return Err(ConfigError::NegativeScanHeight {
                section: "sky_scanner",
            });
        }
        if self.scan_period.is_zero() {
            return Err(ConfigError::ZeroScanPeriod {
                section: "sky_scanner",
            });
        }
        Ok(())
    }

    pub fn scan_config(&self, deposit_buffer_size: usize) -> ScanConfig {
        ScanConfig {
            scan_period: self.scan_period,
            initial_scan_height: self.initial_scan_height,
            confirmations_required: 0,
            deposit_buffer_size,
        }
    }
}

/// Box exchanger section.
#[derive(Debug, Clone)]
pub struct BoxExchangerConfig {
    /// Decimal places SKY amounts are truncated to.
    pub max_decimals: u32,
    /// Key signing outbound box transfers.
    pub genesis_key: String,
    /// Wait between transaction confirmation checks.
    pub tx_confirmation_check_wait: Duration,
    /// Deposits are still received and recorded when false; boxes are just
    /// not sent.
    pub send_enabled: bool,
}

impl Default for BoxExchangerConfig {
    fn default() -> Self {
        Self {
            max_decimals: 3,
            genesis_key: String::new(),
            tx_confirmation_check_wait: Duration::from_secs(5),
            send_enabled: true,
        }
    }
}

impl BoxExchangerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_decimals > MAX_DROPLET_PRECISION {
            return Err(ConfigError::MaxDecimalsTooLarge);
        }
        if self.send_enabled && self.genesis_key.is_empty() {
            return Err(ConfigError::GenesisKeyMissing);
        }
        Ok(())
    }

    pub fn send_config(&self) -> SendConfig {
        SendConfig {
            tx_confirmation_check_wait: self.tx_confirmation_check_wait,
            send_enabled: self.send_enabled,
        }
    }
}

/// Teller service section.
#[derive(Debug, Clone)]
pub struct TellerConfig {
    /// Max reservations (and thus bound addresses) per buyer.
    pub max_bound_addresses: usize,
    /// Allow new reservations.
    pub bind_enabled: bool,
}

impl Default for TellerConfig {
    fn default() -> Self {
        Self {
            max_bound_addresses: 5,
            bind_enabled: true,
        }
    }
}

/// Dummy-mode switches: replace the scanner and/or sender with in-memory
/// fakes driven over the admin mux.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyConfig {
    pub scanner: bool,
    pub sender: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_btc_scanner_validation() {
        BtcScannerConfig::default().validate().unwrap();

        let mut cfg = BtcScannerConfig::default();
        cfg.confirmations_required = -1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NegativeConfirmations)
        ));

        let mut cfg = BtcScannerConfig::default();
        cfg.initial_scan_height = -1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NegativeScanHeight { .. })
        ));
    }

    #[test]
    fn test_exchanger_validation() {
        let mut cfg = BoxExchangerConfig::default();
        cfg.genesis_key = "gk".to_string();
        cfg.validate().unwrap();

        cfg.max_decimals = MAX_DROPLET_PRECISION + 1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MaxDecimalsTooLarge)
        ));

        let mut cfg = BoxExchangerConfig::default();
        cfg.send_enabled = true;
        cfg.genesis_key = String::new();
        assert!(matches!(cfg.validate(), Err(ConfigError::GenesisKeyMissing)));

        // No key needed while sending is disabled.
        cfg.send_enabled = false;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_sky_scan_config_has_no_confirmation_depth() {
        let cfg = SkyScannerConfig::default();
        assert_eq!(cfg.scan_config(10).confirmations_required, 0);
    }
}
