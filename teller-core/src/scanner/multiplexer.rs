//! Fan-in of per-coin scanners into one deposit stream.

use super::{DepositNote, ScanAddressRegistrar, ScannerError};
use crate::coin::{CoinType, UnsupportedCoinType};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

/// Buffer size of the unified deposit stream.
const OUTPUT_BUFFER: usize = 100;

struct ScannerEntry {
    registrar: Arc<dyn ScanAddressRegistrar>,
    deposits: Option<mpsc::Receiver<DepositNote>>,
}

/// Composes N coin scanners into one stream with per-deposit ack.
///
/// The acknowledgement channel travels inside each [`DepositNote`], so the
/// consumer's answer reaches the originating scanner without the multiplexer
/// having to route it.
pub struct Multiplexer {
    entries: Mutex<HashMap<CoinType, ScannerEntry>>,
    out_tx: mpsc::Sender<DepositNote>,
    out_rx: Mutex<Option<mpsc::Receiver<DepositNote>>>,
}

impl Multiplexer {
    pub fn new() -> Self {
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_BUFFER);
        Self {
            entries: Mutex::new(HashMap::new()),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
        }
    }

    /// Register a scanner for `coin`: its scan-set handle plus the receiving
    /// end of its deposit channel. Fails if the coin is already registered.
    pub fn add_scanner(
        &self,
        coin: CoinType,
        registrar: Arc<dyn ScanAddressRegistrar>,
        deposits: mpsc::Receiver<DepositNote>,
    ) -> Result<(), ScannerError> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(&coin) {
            return Err(ScannerError::DuplicateScanner(coin));
        }
        entries.insert(
            coin,
            ScannerEntry {
                registrar,
                deposits: Some(deposits),
            },
        );
        Ok(())
    }

    pub fn scanner_count(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Whether a scanner is registered for `coin`.
    pub fn validate_coin_type(&self, coin: CoinType) -> Result<(), ScannerError> {
        if lock(&self.entries).contains_key(&coin) {
            Ok(())
        } else {
            Err(UnsupportedCoinType(coin.to_string()).into())
        }
    }

    /// Dispatch a scan-set addition to the scanner watching `coin`.
    pub fn add_scan_address(&self, address: &str, coin: CoinType) -> Result<(), ScannerError> {
        let registrar = {
            let entries = lock(&self.entries);
            let entry = entries
                .get(&coin)
                .ok_or_else(|| UnsupportedCoinType(coin.to_string()))?;
            entry.registrar.clone()
        };
        registrar.add_scan_address(address)
    }

    /// Scan addresses registered for `coin`.
    pub fn scan_addresses(&self, coin: CoinType) -> Result<Vec<String>, ScannerError> {
        let registrar = {
            let entries = lock(&self.entries);
            let entry = entries
                .get(&coin)
                .ok_or_else(|| UnsupportedCoinType(coin.to_string()))?;
            entry.registrar.clone()
        };
        registrar.scan_addresses()
    }

    /// Take the unified deposit stream. May only be taken once.
    pub fn take_deposits(&self) -> Result<mpsc::Receiver<DepositNote>, ScannerError> {
        lock(&self.out_rx).take().ok_or(ScannerError::DepositsTaken)
    }

    /// Forward every registered scanner's deposits onto the unified stream
    /// until shutdown. Blocks until all forwarding tasks have drained.
    pub async fn multiplex(&self, shutdown_rx: watch::Receiver<bool>) {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        {
            let mut entries = lock(&self.entries);
            for (coin, entry) in entries.iter_mut() {
                let Some(mut deposits) = entry.deposits.take() else {
                    continue;
                };
                let coin = *coin;
                let out_tx = self.out_tx.clone();
                let mut shutdown_rx = shutdown_rx.clone();
                handles.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            biased;

                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    break;
                                }
                            }

                            note = deposits.recv() => match note {
                                Some(note) => {
                                    if out_tx.send(note).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                    info!(coin = %coin, "Multiplexer forwarder stopped");
                }));
            }
        }

        info!(scanners = handles.len(), "Multiplexer started");
        for handle in handles {
            let _ = handle.await;
        }
        info!("Multiplexer shutdown complete");
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{Deposit, DummyScanner};

    fn deposit(coin: CoinType, tx: &str) -> Deposit {
        Deposit {
            coin,
            address: "A1".to_string(),
            value: 1_000,
            height: 10,
            tx: tx.to_string(),
            n: 0,
            processed: false,
        }
    }

    #[test]
    fn test_duplicate_scanner_rejected() {
        let multiplexer = Multiplexer::new();
        let (btc, btc_rx) = DummyScanner::new(CoinType::Btc, 10);
        multiplexer
            .add_scanner(CoinType::Btc, btc.clone(), btc_rx)
            .unwrap();
        assert_eq!(multiplexer.scanner_count(), 1);

        let (_btc2, btc2_rx) = DummyScanner::new(CoinType::Btc, 10);
        let err = multiplexer
            .add_scanner(CoinType::Btc, btc, btc2_rx)
            .unwrap_err();
        assert!(matches!(err, ScannerError::DuplicateScanner(CoinType::Btc)));
        assert_eq!(multiplexer.scanner_count(), 1);
    }

    #[test]
    fn test_validate_coin_type() {
        let multiplexer = Multiplexer::new();
        let (btc, btc_rx) = DummyScanner::new(CoinType::Btc, 10);
        multiplexer.add_scanner(CoinType::Btc, btc, btc_rx).unwrap();

        multiplexer.validate_coin_type(CoinType::Btc).unwrap();
        assert!(multiplexer.validate_coin_type(CoinType::Sky).is_err());
    }

    #[tokio::test]
    async fn test_fan_in_with_ack_routing() {
        let multiplexer = Arc::new(Multiplexer::new());
        let (btc, btc_rx) = DummyScanner::new(CoinType::Btc, 10);
        let (sky, sky_rx) = DummyScanner::new(CoinType::Sky, 10);
        multiplexer
            .add_scanner(CoinType::Btc, btc.clone(), btc_rx)
            .unwrap();
        multiplexer
            .add_scanner(CoinType::Sky, sky.clone(), sky_rx)
            .unwrap();

        let mut unified = multiplexer.take_deposits().unwrap();
        assert!(multiplexer.take_deposits().is_err());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mux = multiplexer.clone();
        let mux_handle = tokio::spawn(async move { mux.multiplex(shutdown_rx).await });

        let btc_ack = btc.inject_deposit(deposit(CoinType::Btc, "b1")).await.unwrap();
        let sky_ack = sky.inject_deposit(deposit(CoinType::Sky, "s1")).await.unwrap();

        let mut coins = Vec::new();
        for _ in 0..2 {
            let note = unified.recv().await.unwrap();
            coins.push(note.deposit.coin);
            note.ack.send(Ok(())).unwrap();
        }
        coins.sort_by_key(|c| c.as_str());
        assert_eq!(coins, vec![CoinType::Btc, CoinType::Sky]);

        // Each ack reached the scanner that published the deposit.
        assert!(btc_ack.await.unwrap().is_ok());
        assert!(sky_ack.await.unwrap().is_ok());

        shutdown_tx.send(true).unwrap();
        mux_handle.await.unwrap();
    }
}
