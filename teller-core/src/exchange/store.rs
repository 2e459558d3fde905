//! Persistence for the deposit tracker.

use super::deposit::{BoundAddress, DepositInfo, DepositStats, DepositTrack, Status};
use super::ExchangeError;
use crate::coin::CoinType;
use crate::registry::RegistryStore;
use crate::scanner::Deposit;
use crate::storage::{self, StoreError};
use redb::{Database, ReadableDatabase, WriteTransaction};
use std::sync::Arc;
use tracing::info;

const DEPOSIT_INFO_BUCKET: &str = "deposit_info";
const TXS_BUCKET: &str = "deposit_txs";
const DEPOSIT_TRACK_BUCKET: &str = "deposit_track";
const META_BUCKET: &str = "meta";
const DEPOSIT_INFO_SEQ_KEY: &str = "deposit_info_seq";

/// Bind bucket name for a coin. Every supported coin must have an arm here;
/// `new()` walks all coin types at startup so a missing mapping cannot ship.
fn bind_bucket(coin: CoinType) -> &'static str {
    match coin {
        CoinType::Btc => "bind_address_btc",
        CoinType::Sky => "bind_address_sky",
    }
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Storage for bindings, deposit rows, and payment tracking.
#[derive(Clone)]
pub struct ExchangeStore {
    db: Arc<Database>,
    registry: RegistryStore,
}

impl ExchangeStore {
    pub fn new(db: Arc<Database>) -> Result<Self, ExchangeError> {
        let mut buckets = vec![
            DEPOSIT_INFO_BUCKET.to_string(),
            TXS_BUCKET.to_string(),
            DEPOSIT_TRACK_BUCKET.to_string(),
            META_BUCKET.to_string(),
        ];
        for coin in CoinType::ALL {
            buckets.push(bind_bucket(coin).to_string());
        }
        let names: Vec<&str> = buckets.iter().map(String::as_str).collect();
        storage::ensure_buckets(&db, &names)?;

        let registry = RegistryStore::new(db.clone())?;
        Ok(Self { db, registry })
    }

    // -- Address binding ----------------------------------------------------

    pub fn get_bind_address(
        &self,
        deposit_address: &str,
        coin: CoinType,
    ) -> Result<Option<BoundAddress>, StoreError> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(storage::bucket(bind_bucket(coin)))?;
        storage::get_json(&table, deposit_address)
    }

    /// Bind a deposit address to a box inside the caller's transaction.
    ///
    /// Creates the box's [`DepositTrack`] with `amount_required` taken from
    /// the reservation's price in the bound coin.
    pub fn bind_address(
        &self,
        wtx: &WriteTransaction,
        kitty_id: &str,
        deposit_address: &str,
        coin: CoinType,
    ) -> Result<BoundAddress, ExchangeError> {
        let bound = BoundAddress {
            kitty_id: kitty_id.to_string(),
            address: deposit_address.to_string(),
            coin_type: coin,
        };

        {
            let mut table = wtx.open_table(storage::bucket(bind_bucket(coin)))?;
            if storage::has_key(&table, deposit_address)? {
                return Err(ExchangeError::AddressAlreadyBound);
            }
            storage::put_json(&mut table, deposit_address, &bound)?;
        }

        let reservation = self
            .registry
            .get_reservation_tx(wtx, kitty_id)?
            .ok_or_else(|| ExchangeError::KittyNotFound(kitty_id.to_string()))?;

        let mut track_table = wtx.open_table(storage::bucket(DEPOSIT_TRACK_BUCKET))?;
        if !storage::has_key(&track_table, deposit_address)? {
            let track = DepositTrack {
                kitty_id: kitty_id.to_string(),
                amount_deposited: 0,
                amount_required: reservation.price_of(coin),
            };
            storage::put_json(&mut track_table, deposit_address, &track)?;
        }

        Ok(bound)
    }

    /// Whether the box already has a bound deposit address.
    pub fn is_bound(&self, kitty_id: &str) -> Result<bool, StoreError> {
        Ok(self.kitty_bind_address(kitty_id)?.is_some())
    }

    /// Find the binding for a box, if any.
    pub fn kitty_bind_address(&self, kitty_id: &str) -> Result<Option<BoundAddress>, StoreError> {
        let rtx = self.db.begin_read()?;
        for coin in CoinType::ALL {
            let table = rtx.open_table(storage::bucket(bind_bucket(coin)))?;
            let mut found = None;
            storage::for_each_json::<BoundAddress, _, _>(&table, |_, bound| {
                if bound.kitty_id == kitty_id && found.is_none() {
                    found = Some(bound);
                }
                Ok(())
            })?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    // -- Deposit info -------------------------------------------------------

    /// Record a scanner deposit, or return the existing row for its id.
    ///
    /// New rows start in `WaitDecide` with the next dense sequence number,
    /// and the deposit id is appended to the address's transaction list, all
    /// in one transaction.
    pub fn get_or_create_deposit_info(
        &self,
        deposit: &Deposit,
    ) -> Result<DepositInfo, ExchangeError> {
        let deposit_id = deposit.deposit_id();
        let wtx = self.db.begin_write()?;

        let existing = {
            let table = wtx.open_table(storage::bucket(DEPOSIT_INFO_BUCKET))?;
            storage::get_json::<DepositInfo, _>(&table, &deposit_id)?
        };
        if let Some(info) = existing {
            return Ok(info);
        }

        let bound = {
            let table = wtx.open_table(storage::bucket(bind_bucket(deposit.coin)))?;
            storage::get_json::<BoundAddress, _>(&table, &deposit.address)?
                .ok_or(ExchangeError::NoBoundAddress)?
        };

        if bound.coin_type != deposit.coin {
            return Err(ExchangeError::Integrity(format!(
                "bound address coin type {} does not match deposit coin type {}",
                bound.coin_type, deposit.coin
            )));
        }

        let owner_address = self
            .registry
            .get_reservation_tx(&wtx, &bound.kitty_id)?
            .and_then(|r| r.owner_address)
            .unwrap_or_default();

        let info = {
            let mut meta = wtx.open_table(storage::bucket(META_BUCKET))?;
            let seq = storage::next_sequence(&mut meta, DEPOSIT_INFO_SEQ_KEY)?;
            DepositInfo {
                seq,
                updated_at: now_unix(),
                status: Status::WaitDecide,
                coin_type: deposit.coin,
                kitty_id: bound.kitty_id.clone(),
                deposit_address: deposit.address.clone(),
                owner_address,
                deposit_id: deposit_id.clone(),
                txid: String::new(),
                deposit_value: deposit.value,
                error: String::new(),
                deposit: deposit.clone(),
            }
        };
        info.validate_for_status()?;

        {
            let mut table = wtx.open_table(storage::bucket(DEPOSIT_INFO_BUCKET))?;
            storage::put_json(&mut table, &deposit_id, &info)?;
        }
        {
            let mut txs = wtx.open_table(storage::bucket(TXS_BUCKET))?;
            let mut ids: Vec<String> =
                storage::get_json(&txs, &deposit.address)?.unwrap_or_default();
            ids.push(deposit_id.clone());
            storage::put_json(&mut txs, &deposit.address, &ids)?;
        }
        wtx.commit().map_err(StoreError::from)?;

        info!(deposit_id, kitty_id = info.kitty_id, "Saved new deposit info");
        Ok(info)
    }

    /// Read-modify-write a deposit row in one transaction.
    pub fn update_deposit_info<F>(
        &self,
        deposit_id: &str,
        update: F,
    ) -> Result<DepositInfo, ExchangeError>
    where
        F: FnOnce(DepositInfo) -> DepositInfo,
    {
        let wtx = self.db.begin_write()?;
        let updated = {
            let mut table = wtx.open_table(storage::bucket(DEPOSIT_INFO_BUCKET))?;
            let info = storage::get_json::<DepositInfo, _>(&table, deposit_id)?
                .ok_or_else(|| ExchangeError::DepositInfoNotFound(deposit_id.to_string()))?;
            if info.deposit_id != deposit_id {
                return Err(ExchangeError::Integrity(format!(
                    "deposit info {} saved under different key {}",
                    info.deposit_id, deposit_id
                )));
            }
            let mut updated = update(info);
            updated.updated_at = now_unix();
            storage::put_json(&mut table, deposit_id, &updated)?;
            updated
        };
        wtx.commit().map_err(StoreError::from)?;
        Ok(updated)
    }

    /// The `WaitDecide -> WaitPartial | WaitSend` step.
    ///
    /// Atomically folds the deposit's value into the address's payment
    /// track. The row advances to `WaitSend` once the accumulated amount
    /// covers the price, `WaitPartial` otherwise. Calling it again for an
    /// already-decided row is a no-op, so a replay cannot double-count.
    pub fn process_deposit(&self, deposit_id: &str) -> Result<DepositInfo, ExchangeError> {
        let wtx = self.db.begin_write()?;
        let updated = {
            let mut info_table = wtx.open_table(storage::bucket(DEPOSIT_INFO_BUCKET))?;
            let mut info = storage::get_json::<DepositInfo, _>(&info_table, deposit_id)?
                .ok_or_else(|| ExchangeError::DepositInfoNotFound(deposit_id.to_string()))?;

            if info.status != Status::WaitDecide {
                return Ok(info);
            }

            let mut track_table = wtx.open_table(storage::bucket(DEPOSIT_TRACK_BUCKET))?;
            let mut track =
                storage::get_json::<DepositTrack, _>(&track_table, &info.deposit_address)?
                    .ok_or_else(|| ExchangeError::NoDepositTrack(info.deposit_address.clone()))?;

            track.amount_deposited += info.deposit_value;
            storage::put_json(&mut track_table, &info.deposit_address, &track)?;

            info.status = if track.amount_deposited >= track.amount_required {
                Status::WaitSend
            } else {
                Status::WaitPartial
            };
            info.updated_at = now_unix();
            storage::put_json(&mut info_table, deposit_id, &info)?;
            info
        };
        wtx.commit().map_err(StoreError::from)?;
        Ok(updated)
    }

    pub fn get_deposit_track(
        &self,
        deposit_address: &str,
    ) -> Result<Option<DepositTrack>, StoreError> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(storage::bucket(DEPOSIT_TRACK_BUCKET))?;
        storage::get_json(&table, deposit_address)
    }

    // -- Queries ------------------------------------------------------------

    pub fn get_deposit_info(&self, deposit_id: &str) -> Result<Option<DepositInfo>, StoreError> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(storage::bucket(DEPOSIT_INFO_BUCKET))?;
        storage::get_json(&table, deposit_id)
    }

    /// All deposit rows matching `filter`, in sequence order.
    pub fn get_deposit_info_array<F>(&self, filter: F) -> Result<Vec<DepositInfo>, StoreError>
    where
        F: Fn(&DepositInfo) -> bool,
    {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(storage::bucket(DEPOSIT_INFO_BUCKET))?;
        let mut rows = Vec::new();
        storage::for_each_json::<DepositInfo, _, _>(&table, |_, info| {
            if filter(&info) {
                rows.push(info);
            }
            Ok(())
        })?;
        rows.sort_by_key(|info| info.seq);
        Ok(rows)
    }

    /// Deposit rows for a box, sorted by update time.
    ///
    /// A bound box with no transactions yet gets one synthetic
    /// `WaitDeposit` row so callers can distinguish "no payment yet" from
    /// "unknown box".
    pub fn get_deposit_info_of_kitty(
        &self,
        kitty_id: &str,
    ) -> Result<Vec<DepositInfo>, ExchangeError> {
        let bound = self
            .kitty_bind_address(kitty_id)?
            .ok_or_else(|| ExchangeError::KittyNotFound(kitty_id.to_string()))?;

        let ids: Vec<String> = {
            let rtx = self.db.begin_read()?;
            let txs = rtx.open_table(storage::bucket(TXS_BUCKET))?;
            storage::get_json(&txs, &bound.address)
                .map_err(ExchangeError::from)?
                .unwrap_or_default()
        };

        if ids.is_empty() {
            return Ok(vec![DepositInfo {
                seq: 0,
                updated_at: now_unix(),
                status: Status::WaitDeposit,
                coin_type: bound.coin_type,
                kitty_id: kitty_id.to_string(),
                deposit_address: bound.address,
                owner_address: String::new(),
                deposit_id: String::new(),
                txid: String::new(),
                deposit_value: 0,
                error: String::new(),
                deposit: Deposit {
                    coin: bound.coin_type,
                    address: String::new(),
                    value: 0,
                    height: 0,
                    tx: String::new(),
                    n: 0,
                    processed: false,
                },
            }]);
        }

        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(storage::bucket(DEPOSIT_INFO_BUCKET))?;
        let mut rows = Vec::new();
        for id in &ids {
            if let Some(info) = storage::get_json::<DepositInfo, _>(&table, id)? {
                rows.push(info);
            }
        }
        rows.sort_by_key(|info| info.updated_at);
        Ok(rows)
    }

    /// Totals folded over the whole deposit table.
    pub fn get_deposit_stats(&self) -> Result<DepositStats, StoreError> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(storage::bucket(DEPOSIT_INFO_BUCKET))?;
        let mut stats = DepositStats::default();
        storage::for_each_json::<DepositInfo, _, _>(&table, |_, info| {
            match info.coin_type {
                CoinType::Btc => stats.total_btc_received += info.deposit_value,
                CoinType::Sky => stats.total_sky_received += info.deposit_value,
            }
            if info.status == Status::Done {
                stats.total_boxes_sent += 1;
            }
            Ok(())
        })?;
        Ok(stats)
    }

    /// Begin a write transaction for callers composing multi-store updates.
    pub fn begin_write(&self) -> Result<WriteTransaction, StoreError> {
        Ok(self.db.begin_write()?)
    }

    /// Whether the database answers a read transaction; used by readiness
    /// probes.
    pub fn is_ready(&self) -> bool {
        self.db.begin_read().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Reservation, ReservationStatus};
    use crate::storage::open_db;

    fn temp_store() -> (tempfile::TempDir, ExchangeStore, Arc<Database>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(open_db(dir.path().join("test.db")).unwrap());
        let store = ExchangeStore::new(db.clone()).unwrap();
        (dir, store, db)
    }

    fn seed_reservation(store: &ExchangeStore, kitty_id: &str, price_btc: i64, owner: &str) {
        store
            .registry
            .put_reservation(&Reservation {
                kitty_id: kitty_id.to_string(),
                status: ReservationStatus::Reserved,
                deposit_address: Some("A1".to_string()),
                owner_address: Some(owner.to_string()),
                price_btc,
                price_sky: 5_000_000,
                coin_type: Some(CoinType::Btc),
            })
            .unwrap();
    }

    fn bind(store: &ExchangeStore, kitty_id: &str, address: &str, coin: CoinType) {
        let wtx = store.begin_write().unwrap();
        store.bind_address(&wtx, kitty_id, address, coin).unwrap();
        wtx.commit().unwrap();
    }

    fn deposit(address: &str, value: i64, tx: &str, n: u32) -> Deposit {
        Deposit {
            coin: CoinType::Btc,
            address: address.to_string(),
            value,
            height: 500,
            tx: tx.to_string(),
            n,
            processed: false,
        }
    }

    #[test]
    fn test_bind_address_rejects_rebinding() {
        let (_dir, store, _db) = temp_store();
        seed_reservation(&store, "42", 100_000, "B1");
        seed_reservation(&store, "43", 100_000, "B1");
        bind(&store, "42", "A1", CoinType::Btc);

        let wtx = store.begin_write().unwrap();
        let err = store
            .bind_address(&wtx, "43", "A1", CoinType::Btc)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::AddressAlreadyBound));
        drop(wtx);

        // The same address string may be bound independently per coin.
        let wtx = store.begin_write().unwrap();
        store.bind_address(&wtx, "43", "A1", CoinType::Sky).unwrap();
        wtx.commit().unwrap();
    }

    #[test]
    fn test_bind_address_creates_track_at_price() {
        let (_dir, store, _db) = temp_store();
        seed_reservation(&store, "42", 100_000, "B1");
        bind(&store, "42", "A1", CoinType::Btc);

        let track = store.get_deposit_track("A1").unwrap().unwrap();
        assert_eq!(track.kitty_id, "42");
        assert_eq!(track.amount_required, 100_000);
        assert_eq!(track.amount_deposited, 0);
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let (_dir, store, _db) = temp_store();
        seed_reservation(&store, "42", 100_000, "B1");
        bind(&store, "42", "A1", CoinType::Btc);

        let created = store
            .get_or_create_deposit_info(&deposit("A1", 100_000, "t", 0))
            .unwrap();
        assert_eq!(created.seq, 1);
        assert_eq!(created.status, Status::WaitDecide);
        assert_eq!(created.kitty_id, "42");
        assert_eq!(created.owner_address, "B1");

        // Replaying the same {txid, n} returns the existing row untouched.
        let again = store
            .get_or_create_deposit_info(&deposit("A1", 100_000, "t", 0))
            .unwrap();
        assert_eq!(again, created);

        let all = store.get_deposit_info_array(|_| true).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_get_or_create_requires_bound_address() {
        let (_dir, store, _db) = temp_store();
        let err = store
            .get_or_create_deposit_info(&deposit("A9", 100_000, "t", 0))
            .unwrap_err();
        assert!(matches!(err, ExchangeError::NoBoundAddress));
    }

    #[test]
    fn test_sequence_is_dense_across_deposits() {
        let (_dir, store, _db) = temp_store();
        seed_reservation(&store, "42", 500_000, "B1");
        bind(&store, "42", "A1", CoinType::Btc);

        for (i, tx) in ["t1", "t2", "t3"].iter().enumerate() {
            let info = store
                .get_or_create_deposit_info(&deposit("A1", 1_000, tx, 0))
                .unwrap();
            assert_eq!(info.seq, i as u64 + 1);
        }
    }

    #[test]
    fn test_process_deposit_partial_then_send() {
        let (_dir, store, _db) = temp_store();
        seed_reservation(&store, "42", 100_000, "B1");
        bind(&store, "42", "A1", CoinType::Btc);

        store
            .get_or_create_deposit_info(&deposit("A1", 60_000, "t1", 0))
            .unwrap();
        let first = store.process_deposit("t1:0").unwrap();
        assert_eq!(first.status, Status::WaitPartial);

        store
            .get_or_create_deposit_info(&deposit("A1", 40_000, "t2", 0))
            .unwrap();
        let second = store.process_deposit("t2:0").unwrap();
        assert_eq!(second.status, Status::WaitSend);

        let track = store.get_deposit_track("A1").unwrap().unwrap();
        assert_eq!(track.amount_deposited, 100_000);
    }

    #[test]
    fn test_process_deposit_exact_amount_skips_partial() {
        let (_dir, store, _db) = temp_store();
        seed_reservation(&store, "42", 100_000, "B1");
        bind(&store, "42", "A1", CoinType::Btc);

        store
            .get_or_create_deposit_info(&deposit("A1", 100_000, "t", 0))
            .unwrap();
        let info = store.process_deposit("t:0").unwrap();
        assert_eq!(info.status, Status::WaitSend);
    }

    #[test]
    fn test_process_deposit_replay_does_not_double_count() {
        let (_dir, store, _db) = temp_store();
        seed_reservation(&store, "42", 100_000, "B1");
        bind(&store, "42", "A1", CoinType::Btc);

        store
            .get_or_create_deposit_info(&deposit("A1", 60_000, "t", 0))
            .unwrap();
        store.process_deposit("t:0").unwrap();
        store.process_deposit("t:0").unwrap();

        let track = store.get_deposit_track("A1").unwrap().unwrap();
        assert_eq!(track.amount_deposited, 60_000);
    }

    #[test]
    fn test_synthetic_wait_deposit_row() {
        let (_dir, store, _db) = temp_store();
        seed_reservation(&store, "42", 100_000, "B1");
        bind(&store, "42", "A1", CoinType::Btc);

        let rows = store.get_deposit_info_of_kitty("42").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, Status::WaitDeposit);
        assert_eq!(rows[0].deposit_address, "A1");

        assert!(matches!(
            store.get_deposit_info_of_kitty("unknown").unwrap_err(),
            ExchangeError::KittyNotFound(_)
        ));
    }

    #[test]
    fn test_deposit_stats() {
        let (_dir, store, _db) = temp_store();
        seed_reservation(&store, "42", 100_000, "B1");
        bind(&store, "42", "A1", CoinType::Btc);

        store
            .get_or_create_deposit_info(&deposit("A1", 100_000, "t", 0))
            .unwrap();
        store.process_deposit("t:0").unwrap();
        store
            .update_deposit_info("t:0", |mut info| {
                info.txid = "deadbeef".to_string();
                info.status = Status::Done;
                info
            })
            .unwrap();

        let stats = store.get_deposit_stats().unwrap();
        assert_eq!(stats.total_btc_received, 100_000);
        assert_eq!(stats.total_sky_received, 0);
        assert_eq!(stats.total_boxes_sent, 1);
    }
}
