//! Persistence for reservations and users.

use super::{Reservation, User};
use crate::storage::{self, StoreError};
use redb::{Database, ReadableDatabase, WriteTransaction};
use std::sync::Arc;

const RESERVATIONS_BUCKET: &str = "reservations_by_kitty";
const USERS_BUCKET: &str = "users";

#[derive(Clone)]
pub struct RegistryStore {
    db: Arc<Database>,
}

impl RegistryStore {
    pub fn new(db: Arc<Database>) -> Result<Self, StoreError> {
        storage::ensure_buckets(&db, &[RESERVATIONS_BUCKET, USERS_BUCKET])?;
        Ok(Self { db })
    }

    pub fn get_reservation(&self, kitty_id: &str) -> Result<Option<Reservation>, StoreError> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(storage::bucket(RESERVATIONS_BUCKET))?;
        storage::get_json(&table, kitty_id)
    }

    pub fn all_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(storage::bucket(RESERVATIONS_BUCKET))?;
        let mut reservations = Vec::new();
        storage::for_each_json::<Reservation, _, _>(&table, |_, r| {
            reservations.push(r);
            Ok(())
        })?;
        Ok(reservations)
    }

    /// Read a reservation through an open write transaction, so callers
    /// composing multi-bucket updates see their own writes.
    pub fn get_reservation_tx(
        &self,
        wtx: &WriteTransaction,
        kitty_id: &str,
    ) -> Result<Option<Reservation>, StoreError> {
        let table = wtx.open_table(storage::bucket(RESERVATIONS_BUCKET))?;
        storage::get_json(&table, kitty_id)
    }

    /// Persist a reservation inside the caller's transaction.
    pub fn put_reservation_tx(
        &self,
        wtx: &WriteTransaction,
        reservation: &Reservation,
    ) -> Result<(), StoreError> {
        let mut table = wtx.open_table(storage::bucket(RESERVATIONS_BUCKET))?;
        storage::put_json(&mut table, &reservation.kitty_id, reservation)
    }

    /// Persist a reservation in its own transaction.
    pub fn put_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        let wtx = self.db.begin_write()?;
        self.put_reservation_tx(&wtx, reservation)?;
        wtx.commit()?;
        Ok(())
    }

    pub fn get_user(&self, address: &str) -> Result<Option<User>, StoreError> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(storage::bucket(USERS_BUCKET))?;
        storage::get_json(&table, address)
    }

    pub fn all_users(&self) -> Result<Vec<User>, StoreError> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(storage::bucket(USERS_BUCKET))?;
        let mut users = Vec::new();
        storage::for_each_json::<User, _, _>(&table, |_, u| {
            users.push(u);
            Ok(())
        })?;
        Ok(users)
    }

    /// Persist a user inside the caller's transaction.
    pub fn put_user_tx(&self, wtx: &WriteTransaction, user: &User) -> Result<(), StoreError> {
        let mut table = wtx.open_table(storage::bucket(USERS_BUCKET))?;
        storage::put_json(&mut table, &user.address, user)
    }
}
