//! The per-coin block-walking scanner.

use super::{ChainClient, Deposit, DepositNote, ScanStore, ScannerError};
use crate::coin::CoinType;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Scanner tuning knobs.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// How often to poll for new blocks.
    pub scan_period: Duration,
    /// First block height to scan when no cursor has been persisted.
    pub initial_scan_height: i64,
    /// How many blocks must bury a block before it is scanned.
    pub confirmations_required: i64,
    /// Buffer size of the deposit output channel.
    pub deposit_buffer_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_period: Duration::from_secs(20),
            initial_scan_height: 0,
            confirmations_required: 1,
            deposit_buffer_size: 100,
        }
    }
}

enum ScanStep {
    /// Every deposit in the block was answered; move to the next height.
    Advance,
    /// Transient failure; retry the same height after a scan period.
    Retry,
    Quit,
}

enum AckOutcome {
    Answered,
    Quit,
}

/// Walks one chain forward, publishing confirmed deposits to watched
/// addresses and gating cursor advancement on consumer acknowledgement.
pub struct BlockScanner {
    coin: CoinType,
    client: Box<dyn ChainClient>,
    store: ScanStore,
    cfg: ScanConfig,
    deposit_tx: mpsc::Sender<DepositNote>,
    shutdown_rx: watch::Receiver<bool>,
}

impl BlockScanner {
    pub fn new(
        coin: CoinType,
        client: Box<dyn ChainClient>,
        store: ScanStore,
        cfg: ScanConfig,
        deposit_tx: mpsc::Sender<DepositNote>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            coin,
            client,
            store,
            cfg,
            deposit_tx,
            shutdown_rx,
        }
    }

    /// Run the scan loop until shutdown.
    ///
    /// Fails fast if the chain tip is below the configured initial scan
    /// height; after that, RPC errors are logged and retried on the next
    /// scan period without advancing the cursor.
    pub async fn run(mut self) -> Result<(), ScannerError> {
        let tip = self.client.block_count().await?;
        if tip < self.cfg.initial_scan_height {
            return Err(ScannerError::TipBelowInitialHeight {
                tip,
                initial: self.cfg.initial_scan_height,
            });
        }

        // Deposits the consumer never acknowledged in a previous run are
        // redelivered before any new block is scanned.
        let pending = self.store.unprocessed_deposits(self.coin)?;
        if !pending.is_empty() {
            info!(
                coin = %self.coin,
                count = pending.len(),
                "Replaying unprocessed deposits"
            );
            for deposit in pending {
                if let AckOutcome::Quit = self.publish(deposit).await {
                    return Ok(());
                }
            }
        }

        let mut height = self
            .store
            .scan_cursor(self.coin)?
            .unwrap_or(self.cfg.initial_scan_height);

        info!(coin = %self.coin, height, tip, "Scanner started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let tip = match self.client.block_count().await {
                Ok(tip) => tip,
                Err(err) => {
                    warn!(coin = %self.coin, error = %err, "block count failed");
                    if self.wait_scan_period().await {
                        break;
                    }
                    continue;
                }
            };

            if tip - height < self.cfg.confirmations_required {
                debug!(coin = %self.coin, height, tip, "Waiting for confirmations");
                if self.wait_scan_period().await {
                    break;
                }
                continue;
            }

            match self.scan_height(height).await? {
                ScanStep::Quit => break,
                ScanStep::Retry => {
                    if self.wait_scan_period().await {
                        break;
                    }
                }
                ScanStep::Advance => {
                    height += 1;
                    self.store.set_scan_cursor(self.coin, height)?;
                }
            }
        }

        info!(coin = %self.coin, "Scanner shutdown complete");
        Ok(())
    }

    /// Scan one block: persist unseen deposits, publish the unprocessed
    /// ones, and wait for each acknowledgement.
    async fn scan_height(&mut self, height: i64) -> Result<ScanStep, ScannerError> {
        let block = match self.client.block(height).await {
            Ok(block) => block,
            Err(err) => {
                warn!(coin = %self.coin, height, error = %err, "block fetch failed");
                return Ok(ScanStep::Retry);
            }
        };

        let scan_set = self.store.scan_address_set(self.coin)?;
        let mut pending = Vec::new();
        for output in &block.outputs {
            if !scan_set.contains(&output.address) {
                continue;
            }
            let deposit = Deposit {
                coin: self.coin,
                address: output.address.clone(),
                value: output.value,
                height,
                tx: output.tx.clone(),
                n: output.n,
                processed: false,
            };
            let stored = self.store.upsert_deposit(&deposit)?;
            if !stored.processed {
                pending.push(stored);
            }
        }

        if !pending.is_empty() {
            debug!(coin = %self.coin, height, count = pending.len(), "Publishing deposits");
        }

        for deposit in pending {
            if let AckOutcome::Quit = self.publish(deposit).await {
                return Ok(ScanStep::Quit);
            }
        }

        Ok(ScanStep::Advance)
    }

    /// Publish one deposit and wait for the consumer's answer.
    async fn publish(&mut self, deposit: Deposit) -> AckOutcome {
        let deposit_id = deposit.deposit_id();
        let coin = deposit.coin;
        let (note, ack_rx) = DepositNote::new(deposit);

        tokio::select! {
            biased;

            _ = self.shutdown_rx.changed() => AckOutcome::Quit,

            sent = self.deposit_tx.send(note) => {
                if sent.is_err() {
                    warn!(coin = %coin, "Deposit channel closed");
                    AckOutcome::Quit
                } else {
                    self.await_ack(coin, &deposit_id, ack_rx).await
                }
            }
        }
    }

    async fn await_ack(
        &mut self,
        coin: CoinType,
        deposit_id: &str,
        ack_rx: oneshot::Receiver<Result<(), String>>,
    ) -> AckOutcome {
        tokio::select! {
            biased;

            _ = self.shutdown_rx.changed() => AckOutcome::Quit,

            answer = ack_rx => match answer {
                Ok(Ok(())) => {
                    if let Err(err) = self.store.set_deposit_processed(coin, deposit_id) {
                        error!(coin = %coin, deposit_id, error = %err, "failed to flag deposit processed");
                    }
                    AckOutcome::Answered
                }
                Ok(Err(reason)) => {
                    // Left unprocessed; redelivered on next process start.
                    warn!(coin = %coin, deposit_id, reason, "Deposit rejected by consumer");
                    AckOutcome::Answered
                }
                Err(_) => {
                    warn!(coin = %coin, deposit_id, "Consumer dropped deposit note");
                    AckOutcome::Quit
                }
            }
        }
    }

    /// Sleep one scan period. Returns true if shutdown fired.
    async fn wait_scan_period(&mut self) -> bool {
        tokio::select! {
            biased;

            _ = self.shutdown_rx.changed() => *self.shutdown_rx.borrow(),
            _ = tokio::time::sleep(self.cfg.scan_period) => false,
        }
    }
}
