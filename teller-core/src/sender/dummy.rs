//! In-memory sender fake for dummy mode and tests.

use super::{
    BoxSender, BroadcastTxResponse, ConfirmResponse, KittyTransaction, LedgerError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

/// A sender stand-in. Transactions are accepted immediately and confirmed
/// when the admin mux (or a test) flips them confirmed.
pub struct DummySender {
    from_addr: String,
    confirmed: Mutex<HashMap<String, bool>>,
    broadcast: Mutex<Vec<KittyTransaction>>,
    create_transaction_err: Mutex<Option<String>>,
}

impl DummySender {
    pub fn new() -> Self {
        Self {
            from_addr: "nYTKxHm6SZWAMdDVx6U9BqxKMuCjmSLp93".to_string(),
            confirmed: Mutex::new(HashMap::new()),
            broadcast: Mutex::new(Vec::new()),
            create_transaction_err: Mutex::new(None),
        }
    }

    /// The txid that `create_transaction` + `broadcast_transaction` will
    /// produce for this transfer.
    pub fn predict_txid(&self, recv_addr: &str, kitty_id: u64) -> String {
        self.build_tx(recv_addr, kitty_id).hash()
    }

    /// Mark a broadcast transaction as confirmed on the fake ledger.
    pub fn set_tx_confirmed(&self, txid: &str) {
        if let Ok(mut confirmed) = self.confirmed.lock() {
            confirmed.insert(txid.to_string(), true);
        }
    }

    /// Make the next `create_transaction` calls fail with an API error.
    pub fn fail_create_transaction(&self, message: Option<&str>) {
        if let Ok(mut err) = self.create_transaction_err.lock() {
            *err = message.map(str::to_string);
        }
    }

    /// Transactions broadcast so far.
    pub fn broadcast_transactions(&self) -> Vec<KittyTransaction> {
        self.broadcast.lock().map(|b| b.clone()).unwrap_or_default()
    }

    fn build_tx(&self, recv_addr: &str, kitty_id: u64) -> KittyTransaction {
        KittyTransaction {
            kitty_id,
            from: self.from_addr.clone(),
            to: recv_addr.to_string(),
            sig: KittyTransaction::sign(kitty_id, &self.from_addr, recv_addr, "dummy"),
        }
    }
}

impl Default for DummySender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BoxSender for DummySender {
    async fn create_transaction(
        &self,
        recv_addr: &str,
        kitty_id: u64,
    ) -> Result<KittyTransaction, LedgerError> {
        if let Some(message) = self
            .create_transaction_err
            .lock()
            .ok()
            .and_then(|e| e.clone())
        {
            return Err(LedgerError::Api(message));
        }
        Ok(self.build_tx(recv_addr, kitty_id))
    }

    async fn broadcast_transaction(
        &self,
        tx: KittyTransaction,
    ) -> Option<Result<BroadcastTxResponse, LedgerError>> {
        let txid = tx.hash();
        info!(kitty_id = tx.kitty_id, txid, "Dummy sender broadcast");
        if let Ok(mut broadcast) = self.broadcast.lock() {
            broadcast.push(tx);
        }
        Some(Ok(BroadcastTxResponse { txid }))
    }

    async fn is_tx_confirmed(&self, txid: &str) -> Option<Result<ConfirmResponse, LedgerError>> {
        let confirmed = self
            .confirmed
            .lock()
            .map(|c| c.get(txid).copied().unwrap_or(false))
            .unwrap_or(false);
        Some(Ok(ConfirmResponse { confirmed }))
    }

    async fn balance(&self) -> Result<i64, LedgerError> {
        Ok(1)
    }
}
