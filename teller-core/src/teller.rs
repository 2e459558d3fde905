//! The teller service: reservation, binding, and query surface.
//!
//! Composes the address manager, reservation registry, and exchange into
//! the operations the HTTP layer exposes. Reserving a box allocates a
//! deposit address, records the reservation, and binds the address, all
//! under one storage transaction; the scan-set registration follows the
//! commit.

use crate::addrs::{AddrManager, AddrsError};
use crate::coin::CoinType;
use crate::config::TellerConfig;
use crate::exchange::{
    DeliveredBox, DepositStats, DepositStatus, ExchangeError, ExchangeStore, Exchanger,
};
use crate::registry::{
    Catalog, Reservation, ReservationFilter, ReservationRegistry, ReservationStatus,
    RegistryError, Verifier,
};
use crate::storage::StoreError;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum TellerError {
    #[error("box already bound to a payment address")]
    BoxAlreadyBound,

    #[error("address binding is disabled")]
    BindDisabled,

    #[error(transparent)]
    Addrs(#[from] AddrsError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reservation and query operations over the assembled components.
pub struct TellerService {
    cfg: TellerConfig,
    store: ExchangeStore,
    exchanger: Exchanger,
    addr_manager: Arc<AddrManager>,
    registry: Arc<ReservationRegistry>,
    verifier: Arc<dyn Verifier>,
}

impl TellerService {
    pub fn new(
        cfg: TellerConfig,
        store: ExchangeStore,
        exchanger: Exchanger,
        addr_manager: Arc<AddrManager>,
        registry: Arc<ReservationRegistry>,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        Self {
            cfg,
            store,
            exchanger,
            addr_manager,
            registry,
            verifier,
        }
    }

    /// Reserve a box for a buyer and bind a fresh deposit address to it.
    pub async fn reserve_box(
        &self,
        owner_address: &str,
        kitty_id: &str,
        coin: CoinType,
        verification_code: &str,
    ) -> Result<Reservation, TellerError> {
        if !self.cfg.bind_enabled {
            return Err(TellerError::BindDisabled);
        }
        if self.exchanger.is_bound(kitty_id)? {
            return Err(TellerError::BoxAlreadyBound);
        }

        // Both checks run before any state changes, the address
        // allocation included.
        self.registry.verify_code(verification_code).await?;
        self.registry.can_reserve(owner_address, kitty_id)?;

        let deposit_address = self.addr_manager.new_address(coin)?;

        let wtx = self.store.begin_write()?;
        let reservation = self.registry.make_reservation(
            &wtx,
            &deposit_address,
            owner_address,
            kitty_id,
            coin,
        )?;
        self.exchanger
            .bind_address_tx(&wtx, kitty_id, &deposit_address, coin)?;
        wtx.commit().map_err(StoreError::from)?;

        self.exchanger.watch_address(&deposit_address, coin)?;

        if let Err(err) = self.verifier.satisfy_code(verification_code, kitty_id).await {
            warn!(kitty_id, error = %err, "satisfying verification code failed");
        }

        info!(kitty_id, owner_address, deposit_address, "Reservation complete");
        Ok(reservation)
    }

    pub fn get_reservations(&self, filter: ReservationFilter) -> Vec<Reservation> {
        self.registry.get_reservations(filter)
    }

    pub fn get_kitty_deposit_address(&self, kitty_id: &str) -> Result<String, TellerError> {
        Ok(self.registry.get_kitty_deposit_address(kitty_id)?)
    }

    pub fn get_deposit_statuses(&self, kitty_id: &str) -> Result<Vec<DepositStatus>, TellerError> {
        Ok(self.exchanger.get_deposit_statuses(kitty_id)?)
    }

    pub fn get_deposit_stats(&self) -> Result<DepositStats, TellerError> {
        Ok(self.exchanger.get_deposit_stats()?)
    }

    /// Whether the store answers a read transaction.
    pub fn database_ready(&self) -> bool {
        self.store.is_ready()
    }

    pub fn exchanger(&self) -> &Exchanger {
        &self.exchanger
    }

    pub fn config(&self) -> &TellerConfig {
        &self.cfg
    }
}

/// Propagate confirmed deliveries to the registry and the catalog.
pub async fn run_delivery_updates(
    registry: Arc<ReservationRegistry>,
    catalog: Arc<dyn Catalog>,
    mut delivered_rx: mpsc::Receiver<DeliveredBox>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("Delivery update loop started");
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            event = delivered_rx.recv() => match event {
                Some(event) => {
                    if let Err(err) =
                        registry.change_status(&event.kitty_id, ReservationStatus::Delivered)
                    {
                        error!(kitty_id = event.kitty_id, error = %err, "marking delivered failed");
                    }
                    if let Err(err) = catalog
                        .set_reservation(&event.kitty_id, ReservationStatus::Delivered)
                        .await
                    {
                        error!(kitty_id = event.kitty_id, error = %err, "catalog update failed");
                    }
                    info!(
                        kitty_id = event.kitty_id,
                        owner_address = event.owner_address,
                        txid = event.txid,
                        "Box delivered"
                    );
                }
                None => break,
            }
        }
    }
    info!("Delivery update loop stopped");
}
