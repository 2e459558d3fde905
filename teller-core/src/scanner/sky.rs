//! Skycoin node client (REST API).

use super::{BlockOutput, ChainBlock, ChainClient, ScannerError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Droplets per whole SKY.
const DROPLETS: i64 = 1_000_000;

/// Thin skycoin REST client covering the calls the scanner needs.
pub struct SkyRpcClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BlockchainMetadata {
    head: BlockHead,
}

#[derive(Debug, Deserialize)]
struct BlockHead {
    seq: u64,
}

#[derive(Debug, Deserialize)]
struct SkyBlock {
    header: SkyBlockHeader,
    body: SkyBlockBody,
}

#[derive(Debug, Deserialize)]
struct SkyBlockHeader {
    seq: u64,
}

#[derive(Debug, Deserialize)]
struct SkyBlockBody {
    txns: Vec<SkyTxn>,
}

#[derive(Debug, Deserialize)]
struct SkyTxn {
    txid: String,
    outputs: Vec<SkyOutput>,
}

#[derive(Debug, Deserialize)]
struct SkyOutput {
    dst: String,
    /// Decimal string, e.g. `"61.000000"`.
    coins: String,
}

impl SkyRpcClient {
    pub fn new(address: &str) -> Self {
        let base_url = if address.starts_with("http") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{address}")
        };
        Self {
            http: reqwest::Client::builder()
                .timeout(RPC_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url,
        }
    }
}

#[async_trait]
impl ChainClient for SkyRpcClient {
    async fn block_count(&self) -> Result<i64, ScannerError> {
        let url = format!("{}/api/v1/blockchain/metadata", self.base_url);
        let metadata: BlockchainMetadata = self.http.get(&url).send().await?.json().await?;
        Ok(metadata.head.seq as i64)
    }

    async fn block(&self, height: i64) -> Result<ChainBlock, ScannerError> {
        let url = format!("{}/api/v1/block", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("seq", height.to_string())])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ScannerError::BlockNotFound { height });
        }

        let block: SkyBlock = response.json().await?;
        let mut outputs = Vec::new();
        for txn in &block.body.txns {
            for (n, output) in txn.outputs.iter().enumerate() {
                outputs.push(BlockOutput {
                    address: output.dst.clone(),
                    value: droplets_from_coins(&output.coins)?,
                    tx: txn.txid.clone(),
                    n: n as u32,
                });
            }
        }

        Ok(ChainBlock {
            height: block.header.seq as i64,
            outputs,
        })
    }
}

/// Parse a decimal SKY amount string into droplets.
fn droplets_from_coins(coins: &str) -> Result<i64, ScannerError> {
    let bad = || ScannerError::Parse(format!("invalid coin amount: {coins:?}"));

    let (whole, frac) = match coins.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (coins, ""),
    };
    if frac.len() > 6 {
        return Err(bad());
    }

    let whole: i64 = whole.parse().map_err(|_| bad())?;
    let frac_value: i64 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{frac:0<6}");
        padded.parse().map_err(|_| bad())?
    };

    Ok(whole * DROPLETS + frac_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_droplets_from_coins() {
        assert_eq!(droplets_from_coins("61.000000").unwrap(), 61_000_000);
        assert_eq!(droplets_from_coins("0.5").unwrap(), 500_000);
        assert_eq!(droplets_from_coins("3").unwrap(), 3_000_000);
        assert_eq!(droplets_from_coins("0.000001").unwrap(), 1);
        assert!(droplets_from_coins("0.0000001").is_err());
        assert!(droplets_from_coins("abc").is_err());
    }
}
