use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::StoreError;

fn table(bucket: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(bucket)
}

/// KvStore is a bucketed key-value store backed by redb, a pure-Rust
/// embedded database. Each bucket maps to one redb table; tables are
/// created lazily on first write.
#[derive(Debug, Clone)]
pub struct KvStore {
    db: Arc<Database>,
}

impl KvStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Run several writes in a single transaction.
    pub fn update<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&KvTxn<'_>) -> Result<(), StoreError>,
    {
        let txn = self.db.begin_write()?;
        f(&KvTxn { txn: &txn })?;
        txn.commit()?;
        Ok(())
    }

    /// Put a value into a bucket. An empty value deletes the key instead.
    pub fn put_or_delete(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.update(|tx| tx.put_or_delete(bucket, key, value))
    }

    /// Put a string value into a bucket. An empty string deletes the key.
    pub fn put_or_delete_str(&self, bucket: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.put_or_delete(bucket, key, value.as_bytes())
    }

    /// Put an integer value into a bucket. Zero deletes the key.
    pub fn put_or_delete_int(&self, bucket: &str, key: &str, value: i64) -> Result<(), StoreError> {
        self.update(|tx| tx.put_or_delete_int(bucket, key, value))
    }

    /// Retrieve a value from a bucket, or `None` when the key (or the
    /// whole bucket) does not exist.
    pub fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read()?;
        let t = match txn.open_table(table(bucket)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(t.get(key)?.map(|v| v.value().to_vec()))
    }

    /// Retrieve a string value from a bucket, or `""` when absent.
    pub fn get_string(&self, bucket: &str, key: &str) -> Result<String, StoreError> {
        Ok(self
            .get(bucket, key)?
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .unwrap_or_default())
    }

    /// Retrieve an integer value from a bucket, or `0` when absent or
    /// unparsable.
    pub fn get_int(&self, bucket: &str, key: &str) -> Result<i64, StoreError> {
        Ok(self
            .get_string(bucket, key)?
            .parse::<i64>()
            .unwrap_or_default())
    }

    /// List keys in a bucket that share a prefix, optionally with the
    /// prefix stripped from each returned key.
    pub fn keys_with_prefix(
        &self,
        bucket: &str,
        prefix: &str,
        strip_prefix: bool,
    ) -> Result<Vec<String>, StoreError> {
        let txn = self.db.begin_read()?;
        let t = match txn.open_table(table(bucket)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut results = Vec::new();
        for entry in t.range(prefix..)? {
            let (key, _) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            if strip_prefix {
                results.push(key[prefix.len()..].to_string());
            } else {
                results.push(key.to_string());
            }
        }
        Ok(results)
    }
}

/// An open write transaction. All writes made through it commit together.
pub struct KvTxn<'t> {
    txn: &'t redb::WriteTransaction,
}

impl KvTxn<'_> {
    /// Put a value into a bucket. An empty value deletes the key instead.
    pub fn put_or_delete(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut t = self.txn.open_table(table(bucket))?;
        if value.is_empty() {
            t.remove(key)?;
        } else {
            t.insert(key, value)?;
        }
        Ok(())
    }

    /// Put a string value into a bucket. An empty string deletes the key.
    pub fn put_or_delete_str(&self, bucket: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.put_or_delete(bucket, key, value.as_bytes())
    }

    /// Put an integer value into a bucket. Zero deletes the key.
    pub fn put_or_delete_int(&self, bucket: &str, key: &str, value: i64) -> Result<(), StoreError> {
        if value == 0 {
            self.put_or_delete(bucket, key, &[])
        } else {
            self.put_or_delete(bucket, key, value.to_string().as_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, KvStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, store) = open_temp();

        store.put_or_delete("b", "k", b"value").unwrap();
        assert_eq!(store.get("b", "k").unwrap().as_deref(), Some(&b"value"[..]));
    }

    #[test]
    fn test_empty_value_deletes() {
        let (_dir, store) = open_temp();

        store.put_or_delete("b", "k", b"value").unwrap();
        store.put_or_delete("b", "k", b"").unwrap();
        assert!(store.get("b", "k").unwrap().is_none());
    }

    #[test]
    fn test_missing_bucket_reads_empty() {
        let (_dir, store) = open_temp();

        assert!(store.get("nope", "k").unwrap().is_none());
        assert_eq!(store.get_string("nope", "k").unwrap(), "");
        assert_eq!(store.get_int("nope", "k").unwrap(), 0);
        assert!(store.keys_with_prefix("nope", "", false).unwrap().is_empty());
    }

    #[test]
    fn test_int_helpers() {
        let (_dir, store) = open_temp();

        store.put_or_delete_int("b", "k", 3).unwrap();
        assert_eq!(store.get_int("b", "k").unwrap(), 3);

        // zero deletes the row entirely
        store.put_or_delete_int("b", "k", 0).unwrap();
        assert!(store.get("b", "k").unwrap().is_none());
    }

    #[test]
    fn test_keys_with_prefix() {
        let (_dir, store) = open_temp();

        store.put_or_delete("b", "dev1_a", b"1").unwrap();
        store.put_or_delete("b", "dev1_b", b"2").unwrap();
        store.put_or_delete("b", "dev2_c", b"3").unwrap();

        let keys = store.keys_with_prefix("b", "dev1_", true).unwrap();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        let keys = store.keys_with_prefix("b", "dev1_", false).unwrap();
        assert_eq!(keys, vec!["dev1_a".to_string(), "dev1_b".to_string()]);
    }

    #[test]
    fn test_update_commits_together() {
        let (_dir, store) = open_temp();

        store
            .update(|tx| {
                tx.put_or_delete("one", "k", b"a")?;
                tx.put_or_delete_int("two", "k", 2)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.get("one", "k").unwrap().as_deref(), Some(&b"a"[..]));
        assert_eq!(store.get_int("two", "k").unwrap(), 2);
    }
}
