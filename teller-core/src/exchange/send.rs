//! Send stage: create, broadcast, and confirm outbound box transfers.

use super::deposit::{DepositInfo, Status};
use super::store::ExchangeStore;
use super::{DeliveredBox, ExchangeError};
use crate::sender::{BoxSender, LedgerError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Send stage tuning.
#[derive(Debug, Clone)]
pub struct SendConfig {
    /// Wait between confirmation polls and transient-error retries.
    pub tx_confirmation_check_wait: Duration,
    /// When false, paid deposits are drained and logged instead of sent.
    pub send_enabled: bool,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            tx_confirmation_check_wait: Duration::from_secs(3),
            send_enabled: true,
        }
    }
}

enum DepositOutcome {
    Settled,
    Quit,
}

/// Drives `WaitSend -> WaitConfirm -> Done`, one deposit at a time. A box
/// is never sent twice: the outbound txid is persisted before broadcast,
/// and a resumed `WaitConfirm` row goes straight to confirmation polling.
pub struct Send {
    store: ExchangeStore,
    sender: Arc<dyn BoxSender>,
    cfg: SendConfig,
    process_rx: mpsc::Receiver<DepositInfo>,
    delivered_tx: Option<mpsc::Sender<DeliveredBox>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Send {
    pub fn new(
        store: ExchangeStore,
        sender: Arc<dyn BoxSender>,
        cfg: SendConfig,
        process_rx: mpsc::Receiver<DepositInfo>,
        delivered_tx: Option<mpsc::Sender<DeliveredBox>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            sender,
            cfg,
            process_rx,
            delivered_tx,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> Result<(), ExchangeError> {
        if !self.cfg.send_enabled {
            return self.run_no_send().await;
        }

        // Drain interrupted work before taking new deposits: transfers
        // awaiting confirmation first, then paid-for boxes never sent.
        let wait_confirm = self
            .store
            .get_deposit_info_array(|info| info.status == Status::WaitConfirm)?;
        let wait_send = self
            .store
            .get_deposit_info_array(|info| info.status == Status::WaitSend)?;
        if !wait_confirm.is_empty() || !wait_send.is_empty() {
            info!(
                wait_confirm = wait_confirm.len(),
                wait_send = wait_send.len(),
                "Resuming interrupted sends"
            );
        }
        for info in wait_confirm.into_iter().chain(wait_send) {
            if let DepositOutcome::Quit = self.settle_deposit(info).await {
                return Ok(());
            }
        }

        info!("Send started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }

                info = self.process_rx.recv() => match info {
                    Some(info) => {
                        if let DepositOutcome::Quit = self.settle_deposit(info).await {
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

        info!("Send shutdown complete");
        Ok(())
    }

    /// Flush the channel so it does not fill up while sending is disabled.
    async fn run_no_send(&mut self) -> Result<(), ExchangeError> {
        info!("Send started with sending disabled");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        return Ok(());
                    }
                }

                info = self.process_rx.recv() => match info {
                    Some(info) => {
                        warn!(
                            deposit_id = info.deposit_id,
                            "Received deposit, but sending is disabled"
                        );
                    }
                    None => return Ok(()),
                }
            }
        }
    }

    /// Drive one deposit until it settles or a fatal error sidelines it.
    /// Transient failures sleep and retry indefinitely.
    async fn settle_deposit(&mut self, mut info: DepositInfo) -> DepositOutcome {
        info!(
            deposit_id = info.deposit_id,
            status = %info.status,
            "Settling deposit"
        );

        loop {
            if *self.shutdown_rx.borrow() {
                return DepositOutcome::Quit;
            }

            match self.advance(info.clone()).await {
                Ok(updated) => {
                    info = updated;
                    if info.status == Status::Done {
                        self.announce_delivery(&info).await;
                        return DepositOutcome::Settled;
                    }
                }
                Err(ExchangeError::NoResponse) => {
                    warn!(deposit_id = info.deposit_id, "Sender closed");
                    return DepositOutcome::Quit;
                }
                Err(err) if is_transient(&err) => {
                    if !matches!(err, ExchangeError::NotConfirmed) {
                        warn!(deposit_id = info.deposit_id, error = %err, "transient send failure");
                    }
                    if self.wait_check_period().await {
                        return DepositOutcome::Quit;
                    }
                }
                Err(err) => {
                    error!(
                        deposit_id = info.deposit_id,
                        error = %err,
                        "settling deposit failed; it will not be reprocessed until restart"
                    );
                    return DepositOutcome::Settled;
                }
            }
        }
    }

    /// One state-machine step for a deposit.
    async fn advance(&mut self, info: DepositInfo) -> Result<DepositInfo, ExchangeError> {
        info.validate_for_status()?;

        match info.status {
            Status::WaitSend => {
                let kitty_id: u64 = info
                    .kitty_id
                    .parse()
                    .map_err(|_| ExchangeError::InvalidKittyId(info.kitty_id.clone()))?;
                if info.owner_address.is_empty() {
                    return Err(ExchangeError::Integrity(format!(
                        "deposit {} has no owner address",
                        info.deposit_id
                    )));
                }

                let tx = self
                    .sender
                    .create_transaction(&info.owner_address, kitty_id)
                    .await?;
                let txid = tx.hash();

                // The txid is durable before the broadcast goes out, so a
                // restart resumes at confirmation instead of re-sending.
                let updated = self.store.update_deposit_info(&info.deposit_id, |mut d| {
                    d.txid = txid.clone();
                    d.status = Status::WaitConfirm;
                    d
                })?;

                info!(
                    deposit_id = updated.deposit_id,
                    kitty_id = updated.kitty_id,
                    txid,
                    "Broadcasting box transfer"
                );
                match self.sender.broadcast_transaction(tx).await {
                    None => Err(ExchangeError::NoResponse),
                    Some(Err(err)) => Err(err.into()),
                    Some(Ok(_)) => Ok(updated),
                }
            }

            Status::WaitConfirm => match self.sender.is_tx_confirmed(&info.txid).await {
                None => Err(ExchangeError::NoResponse),
                Some(Err(err)) => Err(err.into()),
                Some(Ok(rsp)) if !rsp.confirmed => Err(ExchangeError::NotConfirmed),
                Some(Ok(_)) => {
                    let updated = self.store.update_deposit_info(&info.deposit_id, |mut d| {
                        d.status = Status::Done;
                        d
                    })?;
                    info!(
                        deposit_id = updated.deposit_id,
                        kitty_id = updated.kitty_id,
                        txid = updated.txid,
                        "Box transfer confirmed"
                    );
                    Ok(updated)
                }
            },

            Status::Done => {
                warn!(deposit_id = info.deposit_id, "Deposit already processed");
                Ok(info)
            }

            _ => Err(ExchangeError::DepositStatusInvalid),
        }
    }

    async fn announce_delivery(&mut self, info: &DepositInfo) {
        let Some(delivered_tx) = &self.delivered_tx else {
            return;
        };
        let event = DeliveredBox {
            kitty_id: info.kitty_id.clone(),
            owner_address: info.owner_address.clone(),
            txid: info.txid.clone(),
        };
        if delivered_tx.send(event).await.is_err() {
            warn!(kitty_id = info.kitty_id, "Delivery listener dropped");
        }
    }

    /// Sleep one confirmation-check period. Returns true if shutdown fired.
    async fn wait_check_period(&mut self) -> bool {
        tokio::select! {
            biased;

            _ = self.shutdown_rx.changed() => *self.shutdown_rx.borrow(),
            _ = tokio::time::sleep(self.cfg.tx_confirmation_check_wait) => false,
        }
    }
}

/// Whether a failure should be slept on and retried rather than sidelining
/// the deposit. Ledger API errors look permanent but are usually a drained
/// wallet or an unavailable node, so they are retried too.
fn is_transient(err: &ExchangeError) -> bool {
    match err {
        ExchangeError::NotConfirmed => true,
        ExchangeError::Ledger(LedgerError::Api(_) | LedgerError::Transport(_)) => true,
        ExchangeError::Ledger(LedgerError::AddressDecode { .. }) => false,
        _ => false,
    }
}
