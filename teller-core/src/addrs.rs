//! Deposit address pools.
//!
//! Each coin has a fixed list of teller-owned deposit addresses loaded from
//! a JSON file at startup. An address is handed out at most once, ever: the
//! moment it is allocated it is flagged in the used-address bucket, and on
//! every later start the pool filters flagged addresses out of the list.

use crate::coin::CoinType;
use crate::storage::{self, StoreError};
use redb::{Database, ReadableDatabase};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum AddrsError {
    /// All addresses in the pool have been allocated.
    #[error("deposit address pool is empty")]
    DepositAddressEmpty,

    #[error("no address pool registered for coin type {0}")]
    CoinTypeNotExists(CoinType),

    #[error("address pool for coin type {0} already registered")]
    PoolAlreadyRegistered(CoinType),

    #[error("address pool lock poisoned")]
    Poisoned,

    #[error("malformed address file: {0}")]
    MalformedFile(#[from] serde_json::Error),

    #[error("address file unreadable: {0}")]
    FileUnreadable(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// On-disk shape of an address file.
#[derive(Debug, Deserialize)]
struct AddressFile {
    addresses: Vec<String>,
}

/// Load the deposit address list for one coin from a JSON file.
pub fn load_address_file<P: AsRef<Path>>(path: P) -> Result<Vec<String>, AddrsError> {
    let raw = std::fs::read(path)?;
    let file: AddressFile = serde_json::from_slice(&raw)?;
    Ok(file.addresses)
}

/// A pool of one-shot deposit addresses for a single coin.
pub struct AddressPool {
    db: Arc<Database>,
    bucket_name: String,
    addresses: Mutex<Vec<String>>,
}

impl AddressPool {
    /// Build a pool from an address list.
    ///
    /// Duplicates in the list are dropped, and addresses recorded as used in
    /// the `bucket_name` bucket by a previous process are filtered out.
    pub fn new(
        db: Arc<Database>,
        addresses: &[String],
        bucket_name: &str,
    ) -> Result<Self, AddrsError> {
        storage::ensure_buckets(&db, &[bucket_name])?;

        let used = {
            let rtx = db.begin_read().map_err(StoreError::from)?;
            let table = rtx
                .open_table(storage::bucket(bucket_name))
                .map_err(StoreError::from)?;
            let mut used = HashSet::new();
            storage::for_each_json::<bool, _, _>(&table, |key, _| {
                used.insert(key.to_string());
                Ok(())
            })?;
            used
        };

        let mut seen = HashSet::new();
        let mut available = Vec::new();
        for addr in addresses {
            if !seen.insert(addr.clone()) {
                continue;
            }
            if used.contains(addr) {
                continue;
            }
            available.push(addr.clone());
        }

        info!(
            bucket = bucket_name,
            loaded = addresses.len(),
            available = available.len(),
            "Loaded deposit address pool"
        );

        Ok(Self {
            db,
            bucket_name: bucket_name.to_string(),
            addresses: Mutex::new(available),
        })
    }

    /// Hand out the next unused address and durably flag it as used.
    pub fn allocate(&self) -> Result<String, AddrsError> {
        let mut addresses = self.addresses.lock().map_err(|_| AddrsError::Poisoned)?;
        if addresses.is_empty() {
            return Err(AddrsError::DepositAddressEmpty);
        }
        let addr = addresses.remove(0);

        if let Err(err) = self.mark_used(&addr) {
            // Put the address back so a storage hiccup does not leak it.
            addresses.insert(0, addr);
            return Err(err.into());
        }

        Ok(addr)
    }

    fn mark_used(&self, addr: &str) -> Result<(), StoreError> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(storage::bucket(&self.bucket_name))?;
            storage::put_json(&mut table, addr, &true)?;
        }
        wtx.commit()?;
        Ok(())
    }

    /// Number of addresses still available in this process.
    pub fn remaining(&self) -> usize {
        self.addresses.lock().map(|a| a.len()).unwrap_or(0)
    }
}

/// Dispatches address allocation to the pool of the requested coin.
pub struct AddrManager {
    pools: HashMap<CoinType, AddressPool>,
}

impl AddrManager {
    pub fn new() -> Self {
        Self {
            pools: HashMap::new(),
        }
    }

    /// Register the pool serving `coin`.
    pub fn push_pool(&mut self, coin: CoinType, pool: AddressPool) -> Result<(), AddrsError> {
        if self.pools.contains_key(&coin) {
            return Err(AddrsError::PoolAlreadyRegistered(coin));
        }
        self.pools.insert(coin, pool);
        Ok(())
    }

    /// Allocate a fresh deposit address for `coin`.
    pub fn new_address(&self, coin: CoinType) -> Result<String, AddrsError> {
        self.pools
            .get(&coin)
            .ok_or(AddrsError::CoinTypeNotExists(coin))?
            .allocate()
    }

    /// Remaining unallocated addresses for `coin`.
    pub fn remaining(&self, coin: CoinType) -> Result<usize, AddrsError> {
        Ok(self
            .pools
            .get(&coin)
            .ok_or(AddrsError::CoinTypeNotExists(coin))?
            .remaining())
    }
}

impl Default for AddrManager {
    fn default() -> Self {
        Self::new()
    }
}
