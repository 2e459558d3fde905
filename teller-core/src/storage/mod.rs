//! Shared persistence plumbing on top of redb.
//!
//! Every component store (scan sets, reservations, deposit tracking) keeps
//! its state in named buckets of one redb database file. Values are stored
//! as JSON so that round-trips are byte-stable and the database can be
//! inspected with ordinary tooling.

use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// All buckets hold string keys and JSON-encoded byte values.
pub type Bucket<'a> = TableDefinition<'a, &'static str, &'static [u8]>;

/// Build a bucket definition from a runtime name.
pub fn bucket(name: &str) -> Bucket<'_> {
    TableDefinition::new(name)
}

/// Open (or create) the teller database file.
pub fn open_db<P: AsRef<Path>>(path: P) -> Result<Database, StoreError> {
    Ok(Database::create(path)?)
}

/// Create the named buckets if they do not exist yet.
pub fn ensure_buckets(db: &Database, names: &[&str]) -> Result<(), StoreError> {
    let wtx = db.begin_write()?;
    for name in names {
        wtx.open_table(bucket(name))?;
    }
    wtx.commit()?;
    Ok(())
}

/// Fetch and JSON-decode a value from a bucket.
pub fn get_json<T, Tbl>(table: &Tbl, key: &str) -> Result<Option<T>, StoreError>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

/// JSON-encode and store a value in a bucket.
pub fn put_json<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)?;
    table.insert(key, bytes.as_slice())?;
    Ok(())
}

/// Whether a bucket contains a key.
pub fn has_key<Tbl>(table: &Tbl, key: &str) -> Result<bool, StoreError>
where
    Tbl: ReadableTable<&'static str, &'static [u8]>,
{
    Ok(table.get(key)?.is_some())
}

/// Visit every JSON-decoded value in a bucket.
pub fn for_each_json<T, Tbl, F>(table: &Tbl, mut f: F) -> Result<(), StoreError>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<&'static str, &'static [u8]>,
    F: FnMut(&str, T) -> Result<(), StoreError>,
{
    for row in table.iter()? {
        let (key, value) = row?;
        let decoded = serde_json::from_slice(value.value())?;
        f(key.value(), decoded)?;
    }
    Ok(())
}

/// Advance and return a dense monotonic counter stored under `key`.
///
/// The first call returns 1. Must be called inside the write transaction
/// whose effects the sequence number is assigned to.
pub fn next_sequence(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
) -> Result<u64, StoreError> {
    let current: u64 = get_json(table, key)?.unwrap_or(0);
    let next = current + 1;
    put_json(table, key, &next)?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb::ReadableDatabase;

    fn temp_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_put_get_round_trip() {
        let (_dir, db) = temp_db();
        ensure_buckets(&db, &["things"]).unwrap();

        let wtx = db.begin_write().unwrap();
        {
            let mut table = wtx.open_table(bucket("things")).unwrap();
            put_json(&mut table, "a", &vec!["x".to_string(), "y".to_string()]).unwrap();
        }
        wtx.commit().unwrap();

        let rtx = db.begin_read().unwrap();
        let table = rtx.open_table(bucket("things")).unwrap();
        let got: Option<Vec<String>> = get_json(&table, "a").unwrap();
        assert_eq!(got, Some(vec!["x".to_string(), "y".to_string()]));
        let missing: Option<Vec<String>> = get_json(&table, "b").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_next_sequence_is_dense() {
        let (_dir, db) = temp_db();
        ensure_buckets(&db, &["meta"]).unwrap();

        for expected in 1u64..=5 {
            let wtx = db.begin_write().unwrap();
            let got = {
                let mut table = wtx.open_table(bucket("meta")).unwrap();
                next_sequence(&mut table, "seq").unwrap()
            };
            wtx.commit().unwrap();
            assert_eq!(got, expected);
        }
    }
}
