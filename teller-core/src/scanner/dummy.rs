//! In-memory scanner fake for dummy mode and tests.

use super::{Deposit, DepositNote, ScanAddressRegistrar, ScannerError};
use crate::coin::CoinType;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

/// A scanner stand-in whose deposits are injected programmatically (over the
/// admin mux when dummy mode is enabled, or directly in tests).
pub struct DummyScanner {
    coin: CoinType,
    deposit_tx: mpsc::Sender<DepositNote>,
    addresses: Mutex<HashSet<String>>,
}

impl DummyScanner {
    /// Create the fake plus the receiving end of its deposit channel,
    /// matching the shape the multiplexer expects from a real scanner.
    pub fn new(coin: CoinType, buffer: usize) -> (Arc<Self>, mpsc::Receiver<DepositNote>) {
        let (deposit_tx, deposit_rx) = mpsc::channel(buffer);
        (
            Arc::new(Self {
                coin,
                deposit_tx,
                addresses: Mutex::new(HashSet::new()),
            }),
            deposit_rx,
        )
    }

    pub fn coin(&self) -> CoinType {
        self.coin
    }

    /// Publish a deposit as if it had been found on-chain. Returns the
    /// receiver carrying the consumer's acknowledgement.
    pub async fn inject_deposit(
        &self,
        deposit: Deposit,
    ) -> Result<oneshot::Receiver<Result<(), String>>, ScannerError> {
        info!(coin = %self.coin, deposit_id = deposit.deposit_id(), "Injecting dummy deposit");
        let (note, ack_rx) = DepositNote::new(deposit);
        self.deposit_tx
            .send(note)
            .await
            .map_err(|_| ScannerError::ChannelClosed)?;
        Ok(ack_rx)
    }
}

impl ScanAddressRegistrar for DummyScanner {
    fn add_scan_address(&self, address: &str) -> Result<(), ScannerError> {
        if let Ok(mut addresses) = self.addresses.lock() {
            addresses.insert(address.to_string());
        }
        Ok(())
    }

    fn scan_addresses(&self) -> Result<Vec<String>, ScannerError> {
        Ok(self
            .addresses
            .lock()
            .map(|a| a.iter().cloned().collect())
            .unwrap_or_default())
    }
}
