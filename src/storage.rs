//! Durable key/value namespace backed by redb.
//!
//! Plays the role a browser's local storage plays for the phone UI: string
//! keys, opaque byte values, one table.

use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use tracing::{debug, instrument};

use crate::error::StoreError;

// ── Table definitions ─────────────────────────────────────────────────

/// key (utf-8) → raw value bytes
const LOCAL_STORAGE: TableDefinition<&str, &[u8]> = TableDefinition::new("local_storage");

const DB_FILE: &str = "phone.redb";

// ── LocalStorage ──────────────────────────────────────────────────────

pub struct LocalStorage {
    db: Database,
}

impl LocalStorage {
    /// Open (or create) the database at `dir/phone.redb`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join(DB_FILE))?;

        // Ensure the table exists so read transactions can open it.
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(LOCAL_STORAGE)?;
        }
        txn.commit()?;

        Ok(Self { db })
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LOCAL_STORAGE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    #[instrument(skip(self, value), fields(len = value.len()))]
    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LOCAL_STORAGE)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        debug!(key, "value stored");
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let txn = self.db.begin_write()?;
        let existed;
        {
            let mut table = txn.open_table(LOCAL_STORAGE)?;
            existed = table.remove(key)?.is_some();
        }
        txn.commit()?;
        Ok(existed)
    }

    /// All keys starting with `prefix`, in key order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LOCAL_STORAGE)?;
        let mut keys = Vec::new();
        for entry in table.iter()? {
            let (k, _v) = entry?;
            let key = k.value();
            if key.starts_with(prefix) {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }

    /// Write `key = value` and delete every key in `remove`, atomically.
    #[instrument(skip(self, value, remove), fields(removed = remove.len()))]
    pub fn replace(&self, key: &str, value: &[u8], remove: &[String]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LOCAL_STORAGE)?;
            table.insert(key, value)?;
            for old in remove {
                table.remove(old.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::open(dir.path()).unwrap();
        assert_eq!(storage.get("a").unwrap(), None);
        storage.put("a", b"1").unwrap();
        assert_eq!(storage.get("a").unwrap().as_deref(), Some(&b"1"[..]));
        assert!(storage.remove("a").unwrap());
        assert!(!storage.remove("a").unwrap());
    }

    #[test]
    fn test_prefix_scan_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::open(dir.path()).unwrap();
        storage.put("sms_history_a", b"x").unwrap();
        storage.put("sms_history_b", b"y").unwrap();
        storage.put("other", b"z").unwrap();

        let keys = storage.keys_with_prefix("sms_history_").unwrap();
        assert_eq!(keys, vec!["sms_history_a", "sms_history_b"]);

        storage.replace("merged", b"xy", &keys).unwrap();
        assert!(storage.keys_with_prefix("sms_history_").unwrap().is_empty());
        assert_eq!(storage.get("merged").unwrap().as_deref(), Some(&b"xy"[..]));
        assert!(storage.get("other").unwrap().is_some());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = LocalStorage::open(dir.path()).unwrap();
            storage.put("k", b"v").unwrap();
        }
        let storage = LocalStorage::open(dir.path()).unwrap();
        assert_eq!(storage.get("k").unwrap().as_deref(), Some(&b"v"[..]));
    }
}
