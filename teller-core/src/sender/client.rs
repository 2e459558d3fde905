//! Kitty ledger client: transaction construction, injection, lookup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;

const LEDGER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The ledger node rejected the request (malformed tx, missing key,
    /// insufficient balance, ...).
    #[error("ledger api error: {0}")]
    Api(String),

    #[error("ledger request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unable to decode address {address}: {reason}")]
    AddressDecode { address: String, reason: String },
}

/// A signed kitty transfer transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KittyTransaction {
    pub kitty_id: u64,
    /// Address currently holding the kitty.
    pub from: String,
    /// Recipient address.
    pub to: String,
    /// Hex signature over the transfer.
    pub sig: String,
}

impl KittyTransaction {
    /// Transaction hash, hex encoded.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kitty_id.to_be_bytes());
        hasher.update(self.from.as_bytes());
        hasher.update(self.to.as_bytes());
        hasher.update(self.sig.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Sign the transfer with the teller's genesis key.
    pub fn sign(kitty_id: u64, from: &str, to: &str, key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.update(kitty_id.to_be_bytes());
        hasher.update(from.as_bytes());
        hasher.update(to.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Reject obviously malformed base58 ledger addresses before building a
/// transaction for them.
pub fn validate_address(address: &str) -> Result<(), LedgerError> {
    let decode_err = |reason: &str| LedgerError::AddressDecode {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    if address.is_empty() {
        return Err(decode_err("empty"));
    }
    if address.len() < 20 || address.len() > 40 {
        return Err(decode_err("bad length"));
    }
    if address
        .chars()
        .any(|c| !c.is_ascii_alphanumeric() || matches!(c, '0' | 'O' | 'I' | 'l'))
    {
        return Err(decode_err("invalid base58 character"));
    }
    Ok(())
}

/// RPC access to the kitty ledger node.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Build and sign a transfer of `kitty_id` to `recv_addr` offline.
    async fn create_transaction(
        &self,
        recv_addr: &str,
        kitty_id: u64,
    ) -> Result<KittyTransaction, LedgerError>;

    /// Broadcast a transaction; returns its hash once the node accepts it.
    async fn inject_transaction(&self, tx: &KittyTransaction) -> Result<String, LedgerError>;

    /// Fetch a transaction by hash. `None` means the ledger does not know
    /// it (yet); a transport failure is an `Err`.
    async fn get_transaction(
        &self,
        tx_hash: &str,
    ) -> Result<Option<KittyTransaction>, LedgerError>;

    /// Number of kitties left in the teller wallet.
    async fn balance(&self) -> Result<i64, LedgerError>;
}

/// HTTP implementation of [`LedgerClient`].
pub struct KittyLedgerClient {
    http: reqwest::Client,
    base_url: String,
    genesis_key: String,
}

#[derive(Debug, Deserialize)]
struct KittyOwnerResponse {
    address: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    count: i64,
}

impl KittyLedgerClient {
    pub fn new(base_url: &str, genesis_key: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(LEDGER_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
            genesis_key: genesis_key.to_string(),
        }
    }

    async fn api_error(response: reqwest::Response) -> LedgerError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        LedgerError::Api(format!("{status}: {body}"))
    }
}

#[async_trait]
impl LedgerClient for KittyLedgerClient {
    async fn create_transaction(
        &self,
        recv_addr: &str,
        kitty_id: u64,
    ) -> Result<KittyTransaction, LedgerError> {
        validate_address(recv_addr)?;

        // The kitty's current holder is the transfer input.
        let url = format!("{}/api/kitty/{}/owner", self.base_url, kitty_id);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let owner: KittyOwnerResponse = response.json().await?;

        let sig = KittyTransaction::sign(kitty_id, &owner.address, recv_addr, &self.genesis_key);
        Ok(KittyTransaction {
            kitty_id,
            from: owner.address,
            to: recv_addr.to_string(),
            sig,
        })
    }

    async fn inject_transaction(&self, tx: &KittyTransaction) -> Result<String, LedgerError> {
        let url = format!("{}/api/tx/inject", self.base_url);
        let response = self.http.post(&url).json(tx).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(tx.hash())
    }

    async fn get_transaction(
        &self,
        tx_hash: &str,
    ) -> Result<Option<KittyTransaction>, LedgerError> {
        let url = format!("{}/api/tx/{}", self.base_url, tx_hash);
        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(Some(response.json().await?))
    }

    async fn balance(&self) -> Result<i64, LedgerError> {
        let url = format!("{}/api/balance", self.base_url);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let balance: BalanceResponse = response.json().await?;
        Ok(balance.count)
    }
}
