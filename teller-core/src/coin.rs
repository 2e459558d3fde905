//! Supported deposit coin types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a coin type string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported coin type: {0}")]
pub struct UnsupportedCoinType(pub String);

/// The coins the teller accepts deposits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoinType {
    #[serde(rename = "BTC")]
    Btc,
    #[serde(rename = "SKY")]
    Sky,
}

impl CoinType {
    /// All supported coin types.
    pub const ALL: [CoinType; 2] = [CoinType::Btc, CoinType::Sky];

    pub fn as_str(&self) -> &'static str {
        match self {
            CoinType::Btc => "BTC",
            CoinType::Sky => "SKY",
        }
    }

    /// Lowercase suffix used to build per-coin bucket names.
    pub fn bucket_suffix(&self) -> &'static str {
        match self {
            CoinType::Btc => "btc",
            CoinType::Sky => "sky",
        }
    }
}

impl fmt::Display for CoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoinType {
    type Err = UnsupportedCoinType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BTC" => Ok(CoinType::Btc),
            "SKY" => Ok(CoinType::Sky),
            other => Err(UnsupportedCoinType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coin_type_round_trip() {
        for coin in CoinType::ALL {
            let parsed: CoinType = coin.as_str().parse().unwrap();
            assert_eq!(parsed, coin);
        }
    }

    #[test]
    fn test_unknown_coin_type() {
        let err = "ETH".parse::<CoinType>().unwrap_err();
        assert_eq!(err, UnsupportedCoinType("ETH".to_string()));
    }

    #[test]
    fn test_serde_uses_wire_names() {
        assert_eq!(serde_json::to_string(&CoinType::Btc).unwrap(), "\"BTC\"");
        assert_eq!(
            serde_json::from_str::<CoinType>("\"SKY\"").unwrap(),
            CoinType::Sky
        );
    }
}
