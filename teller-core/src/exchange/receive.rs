//! Receive stage: scanner notes in, recorded deposit rows out.

use super::deposit::{DepositInfo, Status};
use super::store::ExchangeStore;
use super::ExchangeError;
use crate::scanner::DepositNote;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// Reads deposit notes from the multiplexer, records each deposit, and
/// acknowledges the scanner. A deposit is only acked with success after its
/// row is committed, so the scanner's redelivery guarantee composes with
/// the store's idempotent insert into exactly-once recording.
pub struct Receive {
    store: ExchangeStore,
    notes_rx: mpsc::Receiver<DepositNote>,
    deposits_tx: mpsc::Sender<DepositInfo>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Receive {
    pub fn new(
        store: ExchangeStore,
        notes_rx: mpsc::Receiver<DepositNote>,
        deposits_tx: mpsc::Sender<DepositInfo>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            notes_rx,
            deposits_tx,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> Result<(), ExchangeError> {
        // Rows that were recorded but never handed to the processor are
        // requeued before new scanner input is accepted.
        let wait_decide = self
            .store
            .get_deposit_info_array(|info| info.status == Status::WaitDecide)?;
        if !wait_decide.is_empty() {
            info!(count = wait_decide.len(), "Requeueing recorded deposits");
            for info in wait_decide {
                if !self.forward(info).await {
                    return Ok(());
                }
            }
        }

        info!("Receive started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }

                note = self.notes_rx.recv() => match note {
                    Some(note) => {
                        if !self.handle_note(note).await {
                            break;
                        }
                    }
                    None => {
                        info!("Deposit note channel closed");
                        break;
                    }
                }
            }
        }

        info!("Receive shutdown complete");
        Ok(())
    }

    /// Record one deposit and answer the scanner. Returns false on
    /// shutdown.
    async fn handle_note(&mut self, note: DepositNote) -> bool {
        let deposit_id = note.deposit.deposit_id();
        match self.store.get_or_create_deposit_info(&note.deposit) {
            Ok(info) => {
                let _ = note.ack.send(Ok(()));
                self.forward(info).await
            }
            Err(err) => {
                error!(
                    deposit_id,
                    error = %err,
                    "saving deposit failed; it will be redelivered on restart"
                );
                let _ = note.ack.send(Err(err.to_string()));
                true
            }
        }
    }

    /// Hand a recorded row to the processor. Returns false on shutdown.
    async fn forward(&mut self, info: DepositInfo) -> bool {
        tokio::select! {
            biased;

            _ = self.shutdown_rx.changed() => false,
            sent = self.deposits_tx.send(info) => sent.is_ok(),
        }
    }
}
