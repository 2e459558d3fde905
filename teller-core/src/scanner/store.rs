//! Persisted scanner state: watch sets, seen deposits, block cursors.

use super::{Deposit, ScanAddressRegistrar, ScannerError};
use crate::coin::CoinType;
use crate::storage::{self, StoreError};
use redb::{Database, ReadableDatabase};
use std::collections::HashSet;
use std::sync::Arc;

const CURSOR_KEY: &str = "height";

fn deposit_bucket(coin: CoinType) -> String {
    format!("scan_deposit_{}", coin.bucket_suffix())
}

fn address_bucket(coin: CoinType) -> String {
    format!("scan_address_{}", coin.bucket_suffix())
}

fn height_bucket(coin: CoinType) -> String {
    format!("scan_block_height_{}", coin.bucket_suffix())
}

/// Storage for all per-coin scanners.
#[derive(Clone)]
pub struct ScanStore {
    db: Arc<Database>,
}

impl ScanStore {
    pub fn new(db: Arc<Database>) -> Result<Self, StoreError> {
        let mut buckets = Vec::new();
        for coin in CoinType::ALL {
            buckets.push(deposit_bucket(coin));
            buckets.push(address_bucket(coin));
            buckets.push(height_bucket(coin));
        }
        let names: Vec<&str> = buckets.iter().map(String::as_str).collect();
        storage::ensure_buckets(&db, &names)?;
        Ok(Self { db })
    }

    /// Add an address to the scan set for `coin`. Idempotent.
    pub fn add_scan_address(&self, coin: CoinType, address: &str) -> Result<(), StoreError> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(storage::bucket(&address_bucket(coin)))?;
            storage::put_json(&mut table, address, &serde_json::json!({}))?;
        }
        wtx.commit()?;
        Ok(())
    }

    pub fn scan_addresses(&self, coin: CoinType) -> Result<Vec<String>, StoreError> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(storage::bucket(&address_bucket(coin)))?;
        let mut addrs = Vec::new();
        storage::for_each_json::<serde_json::Value, _, _>(&table, |key, _| {
            addrs.push(key.to_string());
            Ok(())
        })?;
        Ok(addrs)
    }

    pub fn scan_address_set(&self, coin: CoinType) -> Result<HashSet<String>, StoreError> {
        Ok(self.scan_addresses(coin)?.into_iter().collect())
    }

    /// Next block height to scan, if a cursor has been persisted.
    pub fn scan_cursor(&self, coin: CoinType) -> Result<Option<i64>, StoreError> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(storage::bucket(&height_bucket(coin)))?;
        storage::get_json(&table, CURSOR_KEY)
    }

    /// Persist the cursor. The stored value never decreases.
    pub fn set_scan_cursor(&self, coin: CoinType, height: i64) -> Result<(), StoreError> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(storage::bucket(&height_bucket(coin)))?;
            let current: Option<i64> = storage::get_json(&table, CURSOR_KEY)?;
            if current.map_or(true, |c| height > c) {
                storage::put_json(&mut table, CURSOR_KEY, &height)?;
            }
        }
        wtx.commit()?;
        Ok(())
    }

    /// Record a deposit if unseen, returning the stored row.
    ///
    /// An already-present deposit keeps its `processed` flag, so replaying a
    /// block cannot un-process a deposit.
    pub fn upsert_deposit(&self, deposit: &Deposit) -> Result<Deposit, StoreError> {
        let id = deposit.deposit_id();
        let wtx = self.db.begin_write()?;
        let stored = {
            let mut table = wtx.open_table(storage::bucket(&deposit_bucket(deposit.coin)))?;
            match storage::get_json::<Deposit, _>(&table, &id)? {
                Some(existing) => existing,
                None => {
                    storage::put_json(&mut table, &id, deposit)?;
                    deposit.clone()
                }
            }
        };
        wtx.commit()?;
        Ok(stored)
    }

    pub fn get_deposit(
        &self,
        coin: CoinType,
        deposit_id: &str,
    ) -> Result<Option<Deposit>, StoreError> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(storage::bucket(&deposit_bucket(coin)))?;
        storage::get_json(&table, deposit_id)
    }

    /// Flag a deposit as durably handled by the exchange.
    pub fn set_deposit_processed(
        &self,
        coin: CoinType,
        deposit_id: &str,
    ) -> Result<(), StoreError> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(storage::bucket(&deposit_bucket(coin)))?;
            if let Some(mut deposit) = storage::get_json::<Deposit, _>(&table, deposit_id)? {
                deposit.processed = true;
                storage::put_json(&mut table, deposit_id, &deposit)?;
            }
        }
        wtx.commit()?;
        Ok(())
    }

    /// All deposits for `coin` still awaiting an acknowledged delivery.
    pub fn unprocessed_deposits(&self, coin: CoinType) -> Result<Vec<Deposit>, StoreError> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(storage::bucket(&deposit_bucket(coin)))?;
        let mut deposits = Vec::new();
        storage::for_each_json::<Deposit, _, _>(&table, |_, deposit| {
            if !deposit.processed {
                deposits.push(deposit);
            }
            Ok(())
        })?;
        deposits.sort_by_key(|d| (d.height, d.n));
        Ok(deposits)
    }
}

/// The scan set of one coin, exposed to the multiplexer.
#[derive(Clone)]
pub struct ScanSetHandle {
    store: ScanStore,
    coin: CoinType,
}

impl ScanSetHandle {
    pub fn new(store: ScanStore, coin: CoinType) -> Self {
        Self { store, coin }
    }
}

impl ScanAddressRegistrar for ScanSetHandle {
    fn add_scan_address(&self, address: &str) -> Result<(), ScannerError> {
        self.store.add_scan_address(self.coin, address)?;
        Ok(())
    }

    fn scan_addresses(&self) -> Result<Vec<String>, ScannerError> {
        Ok(self.store.scan_addresses(self.coin)?)
    }
}
