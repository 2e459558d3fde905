//! Process stage: accumulate payments, decide when a box is paid for.

use super::deposit::{DepositInfo, Status};
use super::store::ExchangeStore;
use super::ExchangeError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Folds each recorded deposit into its address's payment track and
/// forwards fully-paid deposits to the send stage.
pub struct Process {
    store: ExchangeStore,
    receive_rx: mpsc::Receiver<DepositInfo>,
    send_tx: mpsc::Sender<DepositInfo>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Process {
    pub fn new(
        store: ExchangeStore,
        receive_rx: mpsc::Receiver<DepositInfo>,
        send_tx: mpsc::Sender<DepositInfo>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            receive_rx,
            send_tx,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> Result<(), ExchangeError> {
        info!("Process started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }

                info = self.receive_rx.recv() => match info {
                    Some(info) => {
                        if !self.handle_deposit(info).await {
                            break;
                        }
                    }
                    None => {
                        info!("Deposit info channel closed");
                        break;
                    }
                }
            }
        }
        info!("Process shutdown complete");
        Ok(())
    }

    /// Advance one deposit through the decide step. Returns false on
    /// shutdown.
    async fn handle_deposit(&mut self, info: DepositInfo) -> bool {
        let updated = match self.store.process_deposit(&info.deposit_id) {
            Ok(updated) => updated,
            Err(err) => {
                error!(
                    deposit_id = info.deposit_id,
                    error = %err,
                    "processing deposit failed; it will not be reprocessed until restart"
                );
                return true;
            }
        };

        match updated.status {
            Status::WaitSend => {
                tokio::select! {
                    biased;

                    _ = self.shutdown_rx.changed() => false,
                    sent = self.send_tx.send(updated) => sent.is_ok(),
                }
            }
            status => {
                debug!(
                    deposit_id = info.deposit_id,
                    status = %status,
                    "Deposit not ready for send"
                );
                true
            }
        }
    }
}
