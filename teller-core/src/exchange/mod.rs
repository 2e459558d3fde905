//! The deposit-to-delivery exchange.
//!
//! Receive, Process, and Send run as three tasks joined by bounded
//! channels:
//!
//! ```text
//! Multiplexer -> Receive -> Process -> Send -> ledger
//! ```
//!
//! The [`Exchange`] owns the three tasks; the first stage error shuts the
//! siblings down. [`Exchanger`] is the query/binding facade the teller
//! service and HTTP layer use.

mod deposit;
mod process;
mod receive;
mod send;
mod store;

pub use deposit::{
    BoundAddress, DepositInfo, DepositStats, DepositTrack, Status, ValidateError,
};
pub use process::Process;
pub use receive::Receive;
pub use send::{Send, SendConfig};
pub use store::ExchangeStore;

use crate::coin::CoinType;
use crate::scanner::{DepositNote, Multiplexer, ScannerError};
use crate::sender::{BoxSender, LedgerError};
use crate::storage::StoreError;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Buffer between pipeline stages.
const STAGE_BUFFER: usize = 100;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("address already bound to a kitty id")]
    AddressAlreadyBound,

    #[error("deposit has no bound kitty id")]
    NoBoundAddress,

    #[error("no deposit track for address {0}")]
    NoDepositTrack(String),

    #[error("deposit info {0} not found")]
    DepositInfoNotFound(String),

    #[error("kitty {0} not found")]
    KittyNotFound(String),

    #[error("kitty id {0:?} is not numeric")]
    InvalidKittyId(String),

    #[error("transaction is not confirmed yet")]
    NotConfirmed,

    #[error("no response from the send service")]
    NoResponse,

    #[error("deposit status cannot be handled")]
    DepositStatusInvalid,

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error(transparent)]
    Validate(#[from] ValidateError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Scanner(#[from] ScannerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<redb::TransactionError> for ExchangeError {
    fn from(err: redb::TransactionError) -> Self {
        ExchangeError::Store(err.into())
    }
}

impl From<redb::TableError> for ExchangeError {
    fn from(err: redb::TableError) -> Self {
        ExchangeError::Store(err.into())
    }
}

impl From<redb::StorageError> for ExchangeError {
    fn from(err: redb::StorageError) -> Self {
        ExchangeError::Store(err.into())
    }
}

impl From<redb::CommitError> for ExchangeError {
    fn from(err: redb::CommitError) -> Self {
        ExchangeError::Store(err.into())
    }
}

/// Event emitted when a box transfer is confirmed on the ledger.
#[derive(Debug, Clone)]
pub struct DeliveredBox {
    pub kitty_id: String,
    pub owner_address: String,
    pub txid: String,
}

/// Deposit status summary for one box.
#[derive(Debug, Clone, Serialize)]
pub struct DepositStatus {
    pub seq: u64,
    pub updated_at: i64,
    pub status: String,
    pub coin_type: String,
}

/// Full deposit status row, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct DepositStatusDetail {
    pub seq: u64,
    pub updated_at: i64,
    pub status: String,
    pub kitty_id: String,
    pub deposit_address: String,
    pub owner_address: String,
    pub coin_type: String,
    pub txid: String,
}

/// The running pipeline: Receive, Process, and Send plus supervision.
pub struct Exchange {
    receive: Receive,
    process: Process,
    send: Send,
    shutdown_rx: watch::Receiver<bool>,
    internal_shutdown_tx: watch::Sender<bool>,
}

impl Exchange {
    /// Wire the three stages together.
    ///
    /// `notes_rx` is the multiplexer's unified deposit stream;
    /// `delivered_tx`, when given, receives one event per confirmed
    /// delivery.
    pub fn new(
        store: ExchangeStore,
        notes_rx: mpsc::Receiver<DepositNote>,
        sender: Arc<dyn BoxSender>,
        cfg: SendConfig,
        shutdown_rx: watch::Receiver<bool>,
        delivered_tx: Option<mpsc::Sender<DeliveredBox>>,
    ) -> Self {
        let (internal_shutdown_tx, internal_shutdown_rx) = watch::channel(false);
        let (decide_tx, decide_rx) = mpsc::channel(STAGE_BUFFER);
        let (send_tx, send_rx) = mpsc::channel(STAGE_BUFFER);

        let receive = Receive::new(
            store.clone(),
            notes_rx,
            decide_tx,
            internal_shutdown_rx.clone(),
        );
        let process = Process::new(
            store.clone(),
            decide_rx,
            send_tx,
            internal_shutdown_rx.clone(),
        );
        let send = Send::new(
            store,
            sender,
            cfg,
            send_rx,
            delivered_tx,
            internal_shutdown_rx,
        );

        Self {
            receive,
            process,
            send,
            shutdown_rx,
            internal_shutdown_tx,
        }
    }

    /// Run all stages; terminate every sibling on the first stage error.
    pub async fn run(mut self) -> Result<(), ExchangeError> {
        info!("Exchange started");

        let (err_tx, mut err_rx) = mpsc::channel::<ExchangeError>(3);
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        let receive = self.receive;
        let receive_err = err_tx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = receive.run().await {
                error!(error = %err, "Receive failed");
                let _ = receive_err.send(err).await;
            }
        }));

        let process = self.process;
        let process_err = err_tx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = process.run().await {
                error!(error = %err, "Process failed");
                let _ = process_err.send(err).await;
            }
        }));

        let send = self.send;
        let send_err = err_tx;
        handles.push(tokio::spawn(async move {
            if let Err(err) = send.run().await {
                error!(error = %err, "Send failed");
                let _ = send_err.send(err).await;
            }
        }));

        let mut first_err = None;
        tokio::select! {
            biased;

            _ = self.shutdown_rx.changed() => {
                info!("Exchange received shutdown signal");
            }

            err = err_rx.recv() => {
                if let Some(err) = err {
                    error!(error = %err, "Exchange terminating early");
                    first_err = Some(err);
                }
            }
        }

        let _ = self.internal_shutdown_tx.send(true);
        for handle in handles {
            let _ = handle.await;
        }

        info!("Exchange shutdown complete");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Query and binding facade over the exchange state.
#[derive(Clone)]
pub struct Exchanger {
    store: ExchangeStore,
    multiplexer: Arc<Multiplexer>,
    sender: Arc<dyn BoxSender>,
}

impl Exchanger {
    pub fn new(
        store: ExchangeStore,
        multiplexer: Arc<Multiplexer>,
        sender: Arc<dyn BoxSender>,
    ) -> Self {
        Self {
            store,
            multiplexer,
            sender,
        }
    }

    /// Bind a deposit address to a box and start watching it on-chain.
    pub fn bind_address(
        &self,
        kitty_id: &str,
        deposit_address: &str,
        coin: CoinType,
    ) -> Result<BoundAddress, ExchangeError> {
        self.multiplexer.validate_coin_type(coin)?;
        let wtx = self.store.begin_write()?;
        let bound = self
            .store
            .bind_address(&wtx, kitty_id, deposit_address, coin)?;
        wtx.commit().map_err(StoreError::from)?;
        self.multiplexer.add_scan_address(deposit_address, coin)?;
        Ok(bound)
    }

    /// Bind inside a caller-owned transaction. The caller must register the
    /// address with [`Exchanger::watch_address`] once the transaction has
    /// committed.
    pub fn bind_address_tx(
        &self,
        wtx: &redb::WriteTransaction,
        kitty_id: &str,
        deposit_address: &str,
        coin: CoinType,
    ) -> Result<BoundAddress, ExchangeError> {
        self.multiplexer.validate_coin_type(coin)?;
        self.store.bind_address(wtx, kitty_id, deposit_address, coin)
    }

    /// Add a committed binding's address to its scanner's watch set.
    pub fn watch_address(
        &self,
        deposit_address: &str,
        coin: CoinType,
    ) -> Result<(), ExchangeError> {
        Ok(self.multiplexer.add_scan_address(deposit_address, coin)?)
    }

    pub fn is_bound(&self, kitty_id: &str) -> Result<bool, StoreError> {
        self.store.is_bound(kitty_id)
    }

    /// Deposit status summaries of a box.
    pub fn get_deposit_statuses(
        &self,
        kitty_id: &str,
    ) -> Result<Vec<DepositStatus>, ExchangeError> {
        let rows = self.store.get_deposit_info_of_kitty(kitty_id)?;
        Ok(rows
            .into_iter()
            .map(|info| DepositStatus {
                seq: info.seq,
                updated_at: info.updated_at,
                status: info.status.to_string(),
                coin_type: info.coin_type.to_string(),
            })
            .collect())
    }

    /// Full deposit rows matching a filter.
    pub fn get_deposit_status_detail<F>(
        &self,
        filter: F,
    ) -> Result<Vec<DepositStatusDetail>, StoreError>
    where
        F: Fn(&DepositInfo) -> bool,
    {
        let rows = self.store.get_deposit_info_array(filter)?;
        Ok(rows
            .into_iter()
            .map(|info| DepositStatusDetail {
                seq: info.seq,
                updated_at: info.updated_at,
                status: info.status.to_string(),
                kitty_id: info.kitty_id,
                deposit_address: info.deposit_address,
                owner_address: info.owner_address,
                coin_type: info.coin_type.to_string(),
                txid: info.txid,
            })
            .collect())
    }

    pub fn get_deposit_stats(&self) -> Result<DepositStats, StoreError> {
        self.store.get_deposit_stats()
    }

    /// Kitties left in the teller wallet.
    pub async fn balance(&self) -> Result<i64, LedgerError> {
        self.sender.balance().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Reservation, ReservationStatus, RegistryStore};
    use crate::scanner::{Deposit, DummyScanner};
    use crate::sender::DummySender;
    use crate::storage::open_db;

    fn seeded_exchanger() -> (tempfile::TempDir, Exchanger, ExchangeStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(open_db(dir.path().join("test.db")).unwrap());

        let registry_store = RegistryStore::new(db.clone()).unwrap();
        registry_store
            .put_reservation(&Reservation {
                kitty_id: "42".to_string(),
                status: ReservationStatus::Reserved,
                deposit_address: Some("A1".to_string()),
                owner_address: Some("B1".to_string()),
                price_btc: 100_000,
                price_sky: 5_000_000,
                coin_type: Some(CoinType::Btc),
            })
            .unwrap();

        let store = ExchangeStore::new(db).unwrap();
        let multiplexer = Arc::new(Multiplexer::new());
        let (scanner, scanner_rx) = DummyScanner::new(CoinType::Btc, 10);
        multiplexer
            .add_scanner(CoinType::Btc, scanner, scanner_rx)
            .unwrap();
        let exchanger = Exchanger::new(store.clone(), multiplexer, Arc::new(DummySender::new()));
        (dir, exchanger, store)
    }

    #[tokio::test]
    async fn test_bind_and_query_surface() {
        let (_dir, exchanger, store) = seeded_exchanger();

        assert!(!exchanger.is_bound("42").unwrap());
        exchanger.bind_address("42", "A1", CoinType::Btc).unwrap();
        assert!(exchanger.is_bound("42").unwrap());

        let err = exchanger
            .bind_address("42", "A1", CoinType::Btc)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::AddressAlreadyBound));

        // No on-chain activity yet: the box reports one synthetic
        // waiting_deposit row.
        let statuses = exchanger.get_deposit_statuses("42").unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, "waiting_deposit");

        // A recorded deposit shows up in the detail listing and the stats.
        store
            .get_or_create_deposit_info(&Deposit {
                coin: CoinType::Btc,
                address: "A1".to_string(),
                value: 100_000,
                height: 500,
                tx: "t".to_string(),
                n: 0,
                processed: false,
            })
            .unwrap();

        let details = exchanger
            .get_deposit_status_detail(|info| info.status == Status::WaitDecide)
            .unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].kitty_id, "42");
        assert_eq!(details[0].owner_address, "B1");

        let stats = exchanger.get_deposit_stats().unwrap();
        assert_eq!(stats.total_btc_received, 100_000);
        assert_eq!(stats.total_boxes_sent, 0);

        assert_eq!(exchanger.balance().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bind_rejects_unregistered_coin() {
        // Only a BTC scanner is registered.
        let (_dir, exchanger, _store) = seeded_exchanger();
        let err = exchanger
            .bind_address("42", "2Ag9SGMnVyaxzQbGL1EUfau2Fx1ztfNZsWt", CoinType::Sky)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Scanner(_)));
    }
}
