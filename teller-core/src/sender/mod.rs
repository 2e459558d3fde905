//! Outbound kitty transfers.
//!
//! The [`SendService`] worker owns the ledger client and serves two request
//! channels, broadcast and confirm. Both retry indefinitely on failure with
//! a fixed wait, giving up only on shutdown; callers observe shutdown as a
//! null response. [`RetrySender`] is the cloneable handle the exchange talks
//! to.

mod client;
mod dummy;

pub use client::{
    validate_address, KittyLedgerClient, KittyTransaction, LedgerClient, LedgerError,
};
pub use dummy::DummySender;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

const REQUEST_BUFFER: usize = 10;

/// Request to broadcast a signed transaction.
pub struct BroadcastTxRequest {
    pub tx: KittyTransaction,
    pub rsp: oneshot::Sender<Result<BroadcastTxResponse, LedgerError>>,
}

#[derive(Debug, Clone)]
pub struct BroadcastTxResponse {
    pub txid: String,
}

/// Request to check whether a transaction is confirmed.
pub struct ConfirmRequest {
    pub txid: String,
    pub rsp: oneshot::Sender<Result<ConfirmResponse, LedgerError>>,
}

#[derive(Debug, Clone)]
pub struct ConfirmResponse {
    pub confirmed: bool,
}

/// Sending surface the exchange depends on; implemented by [`RetrySender`]
/// and by the dummy-mode fake.
///
/// `broadcast_transaction` and `is_tx_confirmed` return `None` when the
/// send service has shut down.
#[async_trait]
pub trait BoxSender: Send + Sync {
    async fn create_transaction(
        &self,
        recv_addr: &str,
        kitty_id: u64,
    ) -> Result<KittyTransaction, LedgerError>;

    async fn broadcast_transaction(
        &self,
        tx: KittyTransaction,
    ) -> Option<Result<BroadcastTxResponse, LedgerError>>;

    async fn is_tx_confirmed(&self, txid: &str) -> Option<Result<ConfirmResponse, LedgerError>>;

    async fn balance(&self) -> Result<i64, LedgerError>;
}

/// Retry waits between attempts.
#[derive(Debug, Clone)]
pub struct SendServiceConfig {
    pub broadcast_tx_retry_wait: Duration,
    pub confirm_tx_retry_wait: Duration,
}

impl Default for SendServiceConfig {
    fn default() -> Self {
        Self {
            broadcast_tx_retry_wait: Duration::from_secs(3),
            confirm_tx_retry_wait: Duration::from_secs(3),
        }
    }
}

/// Worker that injects and confirms ledger transactions, retrying
/// indefinitely across transient node failures.
pub struct SendService {
    client: Arc<dyn LedgerClient>,
    cfg: SendServiceConfig,
    broadcast_rx: mpsc::Receiver<BroadcastTxRequest>,
    confirm_rx: mpsc::Receiver<ConfirmRequest>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SendService {
    /// Create the worker and its request handle.
    pub fn new(
        client: Arc<dyn LedgerClient>,
        cfg: SendServiceConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (Self, RetrySender) {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(REQUEST_BUFFER);
        let (confirm_tx, confirm_rx) = mpsc::channel(REQUEST_BUFFER);
        let service = Self {
            client: client.clone(),
            cfg,
            broadcast_rx,
            confirm_rx,
            shutdown_rx,
        };
        let sender = RetrySender {
            broadcast_tx,
            confirm_tx,
            client,
        };
        (service, sender)
    }

    pub async fn run(mut self) {
        info!("Send service started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }

                Some(req) = self.broadcast_rx.recv() => {
                    match self.broadcast_retry(&req.tx).await {
                        Some(rsp) => {
                            let _ = req.rsp.send(rsp);
                        }
                        // Shutdown mid-retry: drop the request so the
                        // caller observes a null response.
                        None => break,
                    }
                }

                Some(req) = self.confirm_rx.recv() => {
                    match self.confirm_retry(&req.txid).await {
                        Some(rsp) => {
                            let _ = req.rsp.send(rsp);
                        }
                        None => break,
                    }
                }

                else => break,
            }
        }
        info!("Send service shutdown complete");
    }

    /// Inject until the node accepts. Returns `None` on shutdown.
    async fn broadcast_retry(
        &mut self,
        tx: &KittyTransaction,
    ) -> Option<Result<BroadcastTxResponse, LedgerError>> {
        if tx.to.is_empty() || tx.sig.is_empty() {
            return Some(Err(LedgerError::Api("transaction incomplete".to_string())));
        }

        loop {
            match self.client.inject_transaction(tx).await {
                Ok(txid) => return Some(Ok(BroadcastTxResponse { txid })),
                Err(err) => {
                    warn!(
                        kitty_id = tx.kitty_id,
                        error = %err,
                        "inject transaction failed, trying again"
                    );
                    if self.wait(self.cfg.broadcast_tx_retry_wait).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Look the transaction up, retrying transport errors. A transaction
    /// the ledger does not know is reported as unconfirmed, not retried.
    /// Returns `None` on shutdown.
    async fn confirm_retry(
        &mut self,
        txid: &str,
    ) -> Option<Result<ConfirmResponse, LedgerError>> {
        if txid.is_empty() {
            return Some(Err(LedgerError::Api("txid empty".to_string())));
        }

        loop {
            match self.client.get_transaction(txid).await {
                Ok(Some(_)) => return Some(Ok(ConfirmResponse { confirmed: true })),
                Ok(None) => return Some(Ok(ConfirmResponse { confirmed: false })),
                Err(err) => {
                    warn!(txid, error = %err, "get transaction failed, trying again");
                    if self.wait(self.cfg.confirm_tx_retry_wait).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep between retries. Returns true if shutdown fired.
    async fn wait(&mut self, duration: Duration) -> bool {
        tokio::select! {
            biased;

            _ = self.shutdown_rx.changed() => *self.shutdown_rx.borrow(),
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

/// Cloneable handle onto the [`SendService`] worker.
#[derive(Clone)]
pub struct RetrySender {
    broadcast_tx: mpsc::Sender<BroadcastTxRequest>,
    confirm_tx: mpsc::Sender<ConfirmRequest>,
    client: Arc<dyn LedgerClient>,
}

#[async_trait]
impl BoxSender for RetrySender {
    async fn create_transaction(
        &self,
        recv_addr: &str,
        kitty_id: u64,
    ) -> Result<KittyTransaction, LedgerError> {
        self.client.create_transaction(recv_addr, kitty_id).await
    }

    async fn broadcast_transaction(
        &self,
        tx: KittyTransaction,
    ) -> Option<Result<BroadcastTxResponse, LedgerError>> {
        let (rsp, rsp_rx) = oneshot::channel();
        self.broadcast_tx
            .send(BroadcastTxRequest { tx, rsp })
            .await
            .ok()?;
        rsp_rx.await.ok()
    }

    async fn is_tx_confirmed(&self, txid: &str) -> Option<Result<ConfirmResponse, LedgerError>> {
        let (rsp, rsp_rx) = oneshot::channel();
        self.confirm_tx
            .send(ConfirmRequest {
                txid: txid.to_string(),
                rsp,
            })
            .await
            .ok()?;
        rsp_rx.await.ok()
    }

    async fn balance(&self) -> Result<i64, LedgerError> {
        self.client.balance().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Ledger fake that fails a configurable number of times per call.
    struct FlakyLedger {
        inject_failures: Mutex<u32>,
        confirm_failures: Mutex<u32>,
        known_txs: Mutex<HashSet<String>>,
    }

    impl FlakyLedger {
        fn new(inject_failures: u32, confirm_failures: u32) -> Self {
            Self {
                inject_failures: Mutex::new(inject_failures),
                confirm_failures: Mutex::new(confirm_failures),
                known_txs: Mutex::new(HashSet::new()),
            }
        }
    }

    #[async_trait]
    impl LedgerClient for FlakyLedger {
        async fn create_transaction(
            &self,
            recv_addr: &str,
            kitty_id: u64,
        ) -> Result<KittyTransaction, LedgerError> {
            Ok(KittyTransaction {
                kitty_id,
                from: "owner".to_string(),
                to: recv_addr.to_string(),
                sig: "sig".to_string(),
            })
        }

        async fn inject_transaction(&self, tx: &KittyTransaction) -> Result<String, LedgerError> {
            let mut failures = self.inject_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(LedgerError::Api("node unavailable".to_string()));
            }
            self.known_txs.lock().unwrap().insert(tx.hash());
            Ok(tx.hash())
        }

        async fn get_transaction(
            &self,
            tx_hash: &str,
        ) -> Result<Option<KittyTransaction>, LedgerError> {
            let mut failures = self.confirm_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(LedgerError::Api("node unavailable".to_string()));
            }
            if self.known_txs.lock().unwrap().contains(tx_hash) {
                Ok(Some(KittyTransaction {
                    kitty_id: 1,
                    from: "owner".to_string(),
                    to: "recipient".to_string(),
                    sig: "sig".to_string(),
                }))
            } else {
                Ok(None)
            }
        }

        async fn balance(&self) -> Result<i64, LedgerError> {
            Ok(7)
        }
    }

    fn fast_config() -> SendServiceConfig {
        SendServiceConfig {
            broadcast_tx_retry_wait: Duration::from_millis(5),
            confirm_tx_retry_wait: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_broadcast_retries_until_accepted() {
        let client = Arc::new(FlakyLedger::new(3, 0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (service, sender) = SendService::new(client, fast_config(), shutdown_rx);
        let handle = tokio::spawn(service.run());

        let tx = sender.create_transaction("recipient-addr", 42).await.unwrap();
        let expected = tx.hash();
        let rsp = sender.broadcast_transaction(tx).await.unwrap().unwrap();
        assert_eq!(rsp.txid, expected);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_tx_reports_not_confirmed() {
        let client = Arc::new(FlakyLedger::new(0, 2));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (service, sender) = SendService::new(client, fast_config(), shutdown_rx);
        let handle = tokio::spawn(service.run());

        // Transport errors are retried; "not found" comes back as an
        // unconfirmed answer.
        let rsp = sender.is_tx_confirmed("deadbeef").await.unwrap().unwrap();
        assert!(!rsp.confirmed);

        let tx = sender.create_transaction("recipient-addr", 42).await.unwrap();
        let txid = sender
            .broadcast_transaction(tx)
            .await
            .unwrap()
            .unwrap()
            .txid;
        let rsp = sender.is_tx_confirmed(&txid).await.unwrap().unwrap();
        assert!(rsp.confirmed);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_mid_retry_returns_null_response() {
        // Inject never succeeds; the caller must observe shutdown as None.
        let client = Arc::new(FlakyLedger::new(u32::MAX, 0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (service, sender) = SendService::new(client, fast_config(), shutdown_rx);
        let handle = tokio::spawn(service.run());

        let tx = sender.create_transaction("recipient-addr", 42).await.unwrap();
        let broadcast = tokio::spawn(async move { sender.broadcast_transaction(tx).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();

        assert!(broadcast.await.unwrap().is_none());
        handle.await.unwrap();
    }
}
