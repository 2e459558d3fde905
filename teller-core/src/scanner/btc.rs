//! Bitcoin node client (JSON-RPC over HTTP).

use super::{BlockOutput, ChainBlock, ChainClient, ScannerError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Satoshis per BTC.
const SATOSHIS: f64 = 100_000_000.0;

/// Thin bitcoind JSON-RPC client covering the calls the scanner needs.
pub struct BtcRpcClient {
    http: reqwest::Client,
    url: String,
    user: String,
    pass: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct BtcBlock {
    height: i64,
    tx: Vec<BtcTx>,
}

#[derive(Debug, Deserialize)]
struct BtcTx {
    txid: String,
    vout: Vec<BtcVout>,
}

#[derive(Debug, Deserialize)]
struct BtcVout {
    /// Amount in BTC.
    value: f64,
    n: u32,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: BtcScriptPubKey,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct BtcScriptPubKey {
    address: Option<String>,
    addresses: Option<Vec<String>>,
}

impl BtcRpcClient {
    pub fn new(server: &str, user: &str, pass: &str) -> Self {
        let url = if server.starts_with("http") {
            server.to_string()
        } else {
            format!("http://{server}")
        };
        Self {
            http: reqwest::Client::builder()
                .timeout(RPC_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            url,
            user: user.to_string(),
            pass: pass.to_string(),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, ScannerError> {
        let body = serde_json::json!({
            "jsonrpc": "1.0",
            "id": "teller",
            "method": method,
            "params": params,
        });

        let response: RpcResponse<T> = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.pass))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(ScannerError::Node {
                code: err.code,
                message: err.message,
            });
        }
        response
            .result
            .ok_or_else(|| ScannerError::Parse(format!("{method}: missing result")))
    }
}

#[async_trait]
impl ChainClient for BtcRpcClient {
    async fn block_count(&self) -> Result<i64, ScannerError> {
        self.call("getblockcount", serde_json::json!([])).await
    }

    async fn block(&self, height: i64) -> Result<ChainBlock, ScannerError> {
        let hash: String = match self.call("getblockhash", serde_json::json!([height])).await {
            Ok(hash) => hash,
            // -8: "Block height out of range"
            Err(ScannerError::Node { code: -8, .. }) => {
                return Err(ScannerError::BlockNotFound { height })
            }
            Err(err) => return Err(err),
        };

        // Verbosity 2 includes full transaction data.
        let block: BtcBlock = self.call("getblock", serde_json::json!([hash, 2])).await?;

        let mut outputs = Vec::new();
        for tx in &block.tx {
            for vout in &tx.vout {
                for address in vout.script_pub_key.iter_addresses() {
                    outputs.push(BlockOutput {
                        address: address.to_string(),
                        value: (vout.value * SATOSHIS).round() as i64,
                        tx: tx.txid.clone(),
                        n: vout.n,
                    });
                }
            }
        }

        Ok(ChainBlock {
            height: block.height,
            outputs,
        })
    }
}

impl BtcScriptPubKey {
    /// Addresses paid by this output. Older nodes report a list, newer ones
    /// a single address.
    fn iter_addresses(&self) -> impl Iterator<Item = &str> {
        self.address
            .iter()
            .map(String::as_str)
            .chain(self.addresses.iter().flatten().map(String::as_str))
    }
}
