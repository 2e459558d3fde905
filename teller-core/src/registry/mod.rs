//! Kitty box reservations.
//!
//! The registry mirrors the external catalog into the local store at
//! startup, then tracks which buyer has reserved which box. Reservation
//! state lives in two lock-guarded in-memory maps backed by the
//! `reservations_by_kitty` and `users` buckets; the store is the source of
//! truth across restarts.

mod catalog;
mod store;
mod verifier;

pub use catalog::{Catalog, CatalogEntry, CatalogError, CatalogPage, KittyApiClient, MemoryCatalog};
pub use store::RegistryStore;
pub use verifier::{DummyVerifier, HttpVerifier, Verifier, VerifierError};

use crate::coin::CoinType;
use crate::storage::StoreError;
use redb::WriteTransaction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("user has exceeded the max number of reservations")]
    MaxReservationsExceeded,

    #[error("box already reserved")]
    BoxAlreadyReserved,

    #[error("invalid coin type")]
    InvalidCoinType,

    #[error("reservation not found")]
    ReservationNotFound,

    #[error("invalid reservation state")]
    InvalidReservationState,

    #[error("deposit address not found")]
    DepositAddressNotFound,

    #[error(transparent)]
    Verification(#[from] VerifierError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Global reservation state of a box.
///
/// The wire strings (`NONE`, `reserved`, `delivered`) are shared with the
/// catalog service and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    #[serde(rename = "NONE")]
    Available,
    #[serde(rename = "reserved")]
    Reserved,
    #[serde(rename = "delivered")]
    Delivered,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Available => "NONE",
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Delivered => "delivered",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(ReservationStatus::Available),
            "reserved" => Ok(ReservationStatus::Reserved),
            "delivered" => Ok(ReservationStatus::Delivered),
            _ => Err(RegistryError::InvalidReservationState),
        }
    }
}

/// Query selector for [`ReservationRegistry::get_reservations`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFilter {
    All,
    Status(ReservationStatus),
}

impl FromStr for ReservationFilter {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(ReservationFilter::All),
            other => Ok(ReservationFilter::Status(other.parse()?)),
        }
    }
}

/// A box's reservation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Unique id of the kitty inside the box.
    pub kitty_id: String,
    pub status: ReservationStatus,
    /// Where the buyer pays. Set while reserved.
    #[serde(default)]
    pub deposit_address: Option<String>,
    /// Where the box is delivered. Set while reserved.
    #[serde(default)]
    pub owner_address: Option<String>,
    /// Price in satoshis.
    pub price_btc: i64,
    /// Price in droplets.
    pub price_sky: i64,
    /// Payment coin chosen by the buyer.
    #[serde(default)]
    pub coin_type: Option<CoinType>,
}

impl Reservation {
    pub fn price_of(&self, coin: CoinType) -> i64 {
        match coin {
            CoinType::Btc => self.price_btc,
            CoinType::Sky => self.price_sky,
        }
    }
}

/// A buyer and the reservations they hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub address: String,
    pub reservations: Vec<Reservation>,
}

impl User {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            reservations: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Maps {
    reservations: HashMap<String, Reservation>,
    users: HashMap<String, User>,
}

/// Tracks reservations and per-buyer limits.
pub struct ReservationRegistry {
    store: RegistryStore,
    verifier: Arc<dyn Verifier>,
    max_reservations_per_user: usize,
    maps: RwLock<Maps>,
}

impl ReservationRegistry {
    pub fn new(
        store: RegistryStore,
        verifier: Arc<dyn Verifier>,
        max_reservations_per_user: usize,
    ) -> Self {
        Self {
            store,
            verifier,
            max_reservations_per_user,
            maps: RwLock::new(Maps::default()),
        }
    }

    /// Mirror the catalog into the store, then load the in-memory maps.
    ///
    /// Boxes the store has never seen are inserted with the catalog's
    /// status; for known boxes only the prices are overwritten, since the
    /// catalog is their source of truth. Any failure here is fatal at
    /// startup.
    pub async fn sync_catalog(
        &self,
        catalog: &dyn Catalog,
        page_size: u64,
    ) -> Result<usize, RegistryError> {
        let mut offset = 0u64;
        let mut synced = 0usize;
        loop {
            let page = catalog.entries(offset, page_size).await?;
            if page.entries.is_empty() {
                break;
            }
            offset += page.entries.len() as u64;

            for entry in page.entries {
                match self.store.get_reservation(&entry.kitty_id)? {
                    None => {
                        let reservation = Reservation {
                            kitty_id: entry.kitty_id.clone(),
                            status: entry.status,
                            deposit_address: None,
                            owner_address: None,
                            price_btc: entry.price_btc,
                            price_sky: entry.price_sky,
                            coin_type: None,
                        };
                        self.store.put_reservation(&reservation)?;
                    }
                    Some(mut existing) => {
                        existing.price_btc = entry.price_btc;
                        existing.price_sky = entry.price_sky;
                        self.store.put_reservation(&existing)?;
                    }
                }
                synced += 1;
            }

            if offset >= page.total_count {
                break;
            }
        }

        self.load()?;
        info!(boxes = synced, "Catalog synchronized");
        Ok(synced)
    }

    /// Load the in-memory maps from the store.
    pub fn load(&self) -> Result<(), RegistryError> {
        let reservations = self.store.all_reservations()?;
        let users = self.store.all_users()?;
        let mut maps = write_lock(&self.maps);
        maps.reservations = reservations
            .into_iter()
            .map(|r| (r.kitty_id.clone(), r))
            .collect();
        maps.users = users.into_iter().map(|u| (u.address.clone(), u)).collect();
        Ok(())
    }

    /// Check a reservation code with the verification service.
    ///
    /// The first step of the reservation ladder; callers run it before
    /// opening the storage transaction for [`make_reservation`].
    ///
    /// [`make_reservation`]: ReservationRegistry::make_reservation
    pub async fn verify_code(&self, verification_code: &str) -> Result<(), RegistryError> {
        Ok(self.verifier.verify_code(verification_code).await?)
    }

    /// Validation-only pass over the reservation ladder, run before a
    /// deposit address is allocated so a rejected request consumes none.
    pub fn can_reserve(&self, owner_address: &str, kitty_id: &str) -> Result<(), RegistryError> {
        let maps = read_lock(&self.maps);
        let reservation = maps
            .reservations
            .get(kitty_id)
            .ok_or(RegistryError::ReservationNotFound)?;
        match reservation.status {
            ReservationStatus::Available => {}
            ReservationStatus::Reserved => return Err(RegistryError::BoxAlreadyReserved),
            ReservationStatus::Delivered => return Err(RegistryError::InvalidReservationState),
        }
        if let Some(user) = maps.users.get(owner_address) {
            if user.reservations.len() >= self.max_reservations_per_user {
                return Err(RegistryError::MaxReservationsExceeded);
            }
        }
        Ok(())
    }

    /// Reserve a box for a buyer whose code has been verified.
    ///
    /// Runs the rest of the validation ladder: box existence, box
    /// availability, buyer reservation limit. All persisted writes go
    /// through `wtx`; the caller commits or rolls back the combined effect.
    pub fn make_reservation(
        &self,
        wtx: &WriteTransaction,
        deposit_address: &str,
        owner_address: &str,
        kitty_id: &str,
        coin: CoinType,
    ) -> Result<Reservation, RegistryError> {
        let mut maps = write_lock(&self.maps);

        let reservation = maps
            .reservations
            .get(kitty_id)
            .ok_or(RegistryError::ReservationNotFound)?;
        match reservation.status {
            ReservationStatus::Available => {}
            ReservationStatus::Reserved => return Err(RegistryError::BoxAlreadyReserved),
            ReservationStatus::Delivered => return Err(RegistryError::InvalidReservationState),
        }

        let mut user = maps
            .users
            .get(owner_address)
            .cloned()
            .unwrap_or_else(|| User::new(owner_address));
        if user.reservations.len() >= self.max_reservations_per_user {
            return Err(RegistryError::MaxReservationsExceeded);
        }

        let mut updated = reservation.clone();
        updated.status = ReservationStatus::Reserved;
        updated.deposit_address = Some(deposit_address.to_string());
        updated.owner_address = Some(owner_address.to_string());
        updated.coin_type = Some(coin);
        user.reservations.push(updated.clone());

        self.store.put_reservation_tx(wtx, &updated)?;
        self.store.put_user_tx(wtx, &user)?;

        maps.reservations
            .insert(kitty_id.to_string(), updated.clone());
        maps.users.insert(owner_address.to_string(), user);

        info!(
            kitty_id,
            owner_address,
            deposit_address,
            coin = %coin,
            "Box reserved"
        );
        Ok(updated)
    }

    /// Move a reservation to a new status; used by the delivery path.
    pub fn change_status(
        &self,
        kitty_id: &str,
        status: ReservationStatus,
    ) -> Result<Reservation, RegistryError> {
        let mut maps = write_lock(&self.maps);
        let reservation = maps
            .reservations
            .get_mut(kitty_id)
            .ok_or(RegistryError::ReservationNotFound)?;
        reservation.status = status;
        let updated = reservation.clone();
        drop(maps);

        self.store.put_reservation(&updated)?;
        Ok(updated)
    }

    pub fn get_reservation_by_kitty_id(
        &self,
        kitty_id: &str,
    ) -> Result<Reservation, RegistryError> {
        read_lock(&self.maps)
            .reservations
            .get(kitty_id)
            .cloned()
            .ok_or(RegistryError::ReservationNotFound)
    }

    pub fn get_reservations(&self, filter: ReservationFilter) -> Vec<Reservation> {
        let maps = read_lock(&self.maps);
        maps.reservations
            .values()
            .filter(|r| match filter {
                ReservationFilter::All => true,
                ReservationFilter::Status(status) => r.status == status,
            })
            .cloned()
            .collect()
    }

    /// Deposit address of a reserved box.
    pub fn get_kitty_deposit_address(&self, kitty_id: &str) -> Result<String, RegistryError> {
        let reservation = self.get_reservation_by_kitty_id(kitty_id)?;
        reservation
            .deposit_address
            .ok_or(RegistryError::DepositAddressNotFound)
    }

    pub fn get_user(&self, address: &str) -> Option<User> {
        read_lock(&self.maps).users.get(address).cloned()
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
