use sled::Db;
use std::path::Path;
use tracing::info;

use crate::error::Result;

const USED_BYTES_KEY: &[u8] = b"__meta:used_bytes";
const SLICE_PREFIX: &str = "s:";
const REMOTE_FILE_PREFIX: &str = "r:";

/// Byte-level slice storage the engine reads from and writes to.
pub trait SliceStore: Send + Sync {
    /// Stores a slice's wire bytes. Returns `false` when the allocation is exhausted.
    fn save_slice(&self, slice_hash: &str, data: &[u8]) -> Result<bool>;
    fn get_slice(&self, slice_hash: &str) -> Result<Option<Vec<u8>>>;
    fn has_slice(&self, slice_hash: &str) -> Result<bool>;
    fn delete_slice(&self, slice_hash: &str) -> Result<bool>;
    fn used_bytes(&self) -> u64;
    fn capacity_bytes(&self) -> u64;
    /// Remembers which file a download request id resolved to.
    fn save_remote_file_hash(&self, req_id: &str, file_hash: &str) -> Result<()>;
    fn remote_file(&self, req_id: &str) -> Result<Option<String>>;
}

pub struct SledSliceStore {
    db: Db,
    max_bytes: u64,
}

impl SledSliceStore {
    pub fn open(storage_path: &str, max_gb: u64) -> Result<Self> {
        let db = sled::open(Path::new(storage_path).join("slices"))?;
        let max_bytes = max_gb
            .saturating_mul(1024)
            .saturating_mul(1024)
            .saturating_mul(1024);
        let store = Self { db, max_bytes };
        info!(
            path = %storage_path,
            max_gb,
            used_bytes = store.used_bytes(),
            "Slice store opened"
        );
        Ok(store)
    }

    /// In-memory store removed on drop.
    pub fn temporary(max_bytes: u64) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db, max_bytes })
    }
}

impl SliceStore for SledSliceStore {
    fn save_slice(&self, slice_hash: &str, data: &[u8]) -> Result<bool> {
        let key = slice_key(slice_hash);
        let existing_len = self.db.get(&key)?.map(|v| v.len() as u64).unwrap_or(0);
        let used_bytes = read_used_bytes(&self.db)?;
        let projected = used_bytes
            .saturating_sub(existing_len)
            .saturating_add(data.len() as u64);
        if projected > self.max_bytes {
            return Ok(false);
        }
        self.db.insert(key, data)?;
        write_used_bytes(&self.db, projected)?;
        Ok(true)
    }

    fn get_slice(&self, slice_hash: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(slice_key(slice_hash))?.map(|v| v.to_vec()))
    }

    fn has_slice(&self, slice_hash: &str) -> Result<bool> {
        Ok(self.db.contains_key(slice_key(slice_hash))?)
    }

    fn delete_slice(&self, slice_hash: &str) -> Result<bool> {
        let Some(v) = self.db.remove(slice_key(slice_hash))? else {
            return Ok(false);
        };
        let used_bytes = read_used_bytes(&self.db)?;
        write_used_bytes(&self.db, used_bytes.saturating_sub(v.len() as u64))?;
        Ok(true)
    }

    fn used_bytes(&self) -> u64 {
        read_used_bytes(&self.db).unwrap_or(0)
    }

    fn capacity_bytes(&self) -> u64 {
        self.max_bytes
    }

    fn save_remote_file_hash(&self, req_id: &str, file_hash: &str) -> Result<()> {
        self.db
            .insert(format!("{REMOTE_FILE_PREFIX}{req_id}"), file_hash.as_bytes())?;
        Ok(())
    }

    fn remote_file(&self, req_id: &str) -> Result<Option<String>> {
        Ok(self
            .db
            .get(format!("{REMOTE_FILE_PREFIX}{req_id}"))?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }
}

fn slice_key(slice_hash: &str) -> String {
    format!("{SLICE_PREFIX}{slice_hash}")
}

fn read_used_bytes(db: &Db) -> Result<u64> {
    let Some(v) = db.get(USED_BYTES_KEY)? else {
        return Ok(0);
    };
    if v.len() != 8 {
        return Ok(0);
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&v);
    Ok(u64::from_le_bytes(arr))
}

fn write_used_bytes(db: &Db, bytes: u64) -> Result<()> {
    db.insert(USED_BYTES_KEY, bytes.to_le_bytes().to_vec())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounting_follows_saves_and_deletes() {
        let store = SledSliceStore::temporary(1024).unwrap();
        assert!(store.save_slice("a", &[1; 100]).unwrap());
        assert!(store.save_slice("b", &[2; 50]).unwrap());
        assert_eq!(store.used_bytes(), 150);
        // overwrite replaces, not adds
        assert!(store.save_slice("a", &[3; 10]).unwrap());
        assert_eq!(store.used_bytes(), 60);
        assert!(store.delete_slice("b").unwrap());
        assert!(!store.delete_slice("b").unwrap());
        assert_eq!(store.used_bytes(), 10);
        assert_eq!(store.get_slice("a").unwrap().unwrap(), vec![3; 10]);
        assert!(!store.has_slice("b").unwrap());
    }

    #[test]
    fn refuses_past_capacity() {
        let store = SledSliceStore::temporary(100).unwrap();
        assert!(store.save_slice("a", &[0; 80]).unwrap());
        assert!(!store.save_slice("b", &[0; 21]).unwrap());
        assert!(store.save_slice("b", &[0; 20]).unwrap());
        assert_eq!(store.used_bytes(), 100);
    }

    #[test]
    fn remote_file_bookkeeping() {
        let store = SledSliceStore::temporary(0).unwrap();
        store.save_remote_file_hash("req-1", "filehash").unwrap();
        assert_eq!(store.remote_file("req-1").unwrap().as_deref(), Some("filehash"));
        assert_eq!(store.remote_file("req-2").unwrap(), None);
    }
}
