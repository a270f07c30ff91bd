//! Durable store wrapper, exposing the narrow `open/get/put/iterate/destroy`
//! contract spec.md §6 names. Backed by `sled`, the same way
//! `project-3`'s `kvsled.rs` wraps it for the single-node KvsEngine.

use crate::error::Result;
use std::path::{Path, PathBuf};

/// Reserved key holding the MemCache's sequence watermark as ASCII decimal.
pub const SEQUENCENUMBER: &str = "SEQUENCENUMBER";

/// A durable `{key -> value}` mirror for one MemCache partition.
pub struct DurableStore {
    path: PathBuf,
    db: sled::Db,
}

impl DurableStore {
    /// Open (creating if absent) the durable store rooted at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::Config::new().path(path.as_ref()).open()?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            db,
        })
    }

    /// Store `value` under `key`, overwriting any prior value.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db.insert(key, value)?;
        self.db.flush()?;
        Ok(())
    }

    /// Fetch the value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|ivec| ivec.to_vec()))
    }

    /// Remove the value stored under `key`.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.db.remove(key)?;
        self.db.flush()?;
        Ok(())
    }

    /// Iterate over every `(key, value)` pair currently in the store,
    /// including the reserved `SEQUENCENUMBER` entry.
    pub fn iterate(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for entry in self.db.iter() {
            let (k, v) = entry?;
            out.push((String::from_utf8_lossy(&k).into_owned(), v.to_vec()));
        }
        Ok(out)
    }

    /// Write the reserved `SEQUENCENUMBER` entry.
    pub fn put_sequence(&self, sequence: u64) -> Result<()> {
        self.put(SEQUENCENUMBER, sequence.to_string().as_bytes())
    }

    /// Read the reserved `SEQUENCENUMBER` entry, if present.
    pub fn get_sequence(&self) -> Result<Option<u64>> {
        match self.get(SEQUENCENUMBER)? {
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                Ok(text.trim().parse::<u64>().ok())
            }
            None => Ok(None),
        }
    }

    /// Drop this store's in-memory handle and delete its files on disk, so
    /// a subsequent `open` of the same path starts empty. Used when a
    /// server transitions active -> passive (spec.md §4.2 lifecycle).
    pub fn destroy(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.db);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_and_sequence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();

        store.put("alpha", b"1").unwrap();
        assert_eq!(store.get("alpha").unwrap(), Some(b"1".to_vec()));

        store.put_sequence(7).unwrap();
        assert_eq!(store.get_sequence().unwrap(), Some(7));

        store.remove("alpha").unwrap();
        assert_eq!(store.get("alpha").unwrap(), None);
    }

    #[test]
    fn iterate_sees_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        store.put("a", b"1").unwrap();
        store.put("b", b"2").unwrap();
        store.put_sequence(2).unwrap();

        let mut entries = store.iterate().unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                ("SEQUENCENUMBER".to_string(), b"2".to_vec()),
                ("a".to_string(), b"1".to_vec()),
                ("b".to_string(), b"2".to_vec()),
            ]
        );
    }
}
