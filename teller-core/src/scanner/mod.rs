//! Blockchain deposit scanning.
//!
//! One [`BlockScanner`] per enabled coin walks its chain forward from a
//! persisted cursor, records deposits to watched addresses, and publishes
//! them as [`DepositNote`]s. The consumer acknowledges every note; a deposit
//! is only flagged processed (and the cursor only advances) once the note
//! has been answered. The [`Multiplexer`] fans several scanners into one
//! stream for the exchange.

mod block_scanner;
mod btc;
mod dummy;
mod multiplexer;
mod sky;
mod store;

pub use block_scanner::{BlockScanner, ScanConfig};
pub use btc::BtcRpcClient;
pub use dummy::DummyScanner;
pub use multiplexer::Multiplexer;
pub use sky::SkyRpcClient;
pub use store::{ScanSetHandle, ScanStore};

use crate::coin::{CoinType, UnsupportedCoinType};
use crate::storage::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("rpc request failed: {0}")]
    Rpc(#[from] reqwest::Error),

    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("unparseable node response: {0}")]
    Parse(String),

    #[error("block {height} not found")]
    BlockNotFound { height: i64 },

    #[error("chain tip {tip} is below initial scan height {initial}")]
    TipBelowInitialHeight { tip: i64, initial: i64 },

    #[error("scanner of coin type {0} already exists")]
    DuplicateScanner(CoinType),

    #[error("deposit stream already taken")]
    DepositsTaken,

    #[error("deposit channel closed")]
    ChannelClosed,

    #[error(transparent)]
    UnsupportedCoinType(#[from] UnsupportedCoinType),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An on-chain transaction output paying a watched deposit address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub coin: CoinType,
    /// Receiving deposit address.
    pub address: String,
    /// Amount in the smallest unit (satoshis for BTC, droplets for SKY).
    pub value: i64,
    /// Height of the block containing the transaction.
    pub height: i64,
    /// Transaction id.
    pub tx: String,
    /// Index of the output within the transaction.
    pub n: u32,
    /// Whether the exchange has durably recorded this deposit.
    pub processed: bool,
}

impl Deposit {
    /// Globally unique `"{txid}:{n}"` identifier.
    pub fn deposit_id(&self) -> String {
        format!("{}:{}", self.tx, self.n)
    }
}

/// Acknowledgement side of a [`DepositNote`].
///
/// `Ok(())` means the consumer has durably recorded the deposit and it will
/// never be redelivered. An `Err` leaves the deposit unprocessed so it is
/// replayed on the next process start.
pub type DepositAck = oneshot::Sender<Result<(), String>>;

/// A deposit paired with its acknowledgement channel.
#[derive(Debug)]
pub struct DepositNote {
    pub deposit: Deposit,
    pub ack: DepositAck,
}

impl DepositNote {
    pub fn new(deposit: Deposit) -> (Self, oneshot::Receiver<Result<(), String>>) {
        let (ack, ack_rx) = oneshot::channel();
        (Self { deposit, ack }, ack_rx)
    }
}

/// A normalized block returned by a [`ChainClient`].
#[derive(Debug, Clone)]
pub struct ChainBlock {
    pub height: i64,
    pub outputs: Vec<BlockOutput>,
}

/// One candidate transaction output within a [`ChainBlock`].
#[derive(Debug, Clone)]
pub struct BlockOutput {
    pub address: String,
    pub value: i64,
    pub tx: String,
    pub n: u32,
}

/// Read access to one blockchain, normalized across coins.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current chain tip height.
    async fn block_count(&self) -> Result<i64, ScannerError>;

    /// Fetch the block at `height` with its candidate outputs.
    async fn block(&self, height: i64) -> Result<ChainBlock, ScannerError>;
}

/// The scan-set side of a scanner, shared with the multiplexer.
///
/// Both the real scanner (backed by the scan-address bucket) and the dummy
/// scanner implement this, so address binding works the same in both modes.
pub trait ScanAddressRegistrar: Send + Sync {
    /// Add a deposit address to this scanner's watch set. Idempotent.
    fn add_scan_address(&self, address: &str) -> Result<(), ScannerError>;

    /// All addresses currently in the watch set.
    fn scan_addresses(&self) -> Result<Vec<String>, ScannerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deposit_id_format() {
        let dep = Deposit {
            coin: CoinType::Btc,
            address: "1N8G4JM8krsHLQZjC51R7ZgwDyihmgsQYA".to_string(),
            value: 100_000,
            height: 235_206,
            tx: "b45a8e".to_string(),
            n: 3,
            processed: false,
        };
        assert_eq!(dep.deposit_id(), "b45a8e:3");
    }
}
