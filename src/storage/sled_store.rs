use std::path::Path;

use super::{BatchOp, KvStore};
use crate::error::RaftError;

/// The real persistent backend: a `sled` database. Keys live directly in
/// the default tree; the fencing token lives in a dedicated `meta` tree so
/// it can never collide with an opaque client key.
pub struct SledStore {
    db: sled::Db,
    meta: sled::Tree,
}

const FENCE_KEY: &[u8] = b"last_applied_index";

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RaftError> {
        let db = sled::open(path)?;
        let meta = db.open_tree("meta")?;
        Ok(SledStore { db, meta })
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, RaftError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), RaftError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), RaftError> {
        self.db.remove(key)?;
        Ok(())
    }

    fn apply_batch(&self, ops: &[BatchOp]) -> Result<(), RaftError> {
        let mut batch = sled::Batch::default();
        for op in ops {
            match op {
                BatchOp::Put(k, v) => batch.insert(k.as_slice(), v.as_slice()),
                BatchOp::Delete(k) => batch.remove(k.as_slice()),
            }
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), RaftError> {
        self.db.flush()?;
        Ok(())
    }

    fn last_applied_index(&self) -> Result<u64, RaftError> {
        Ok(self
            .meta
            .get(FENCE_KEY)?
            .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap_or([0; 8])))
            .unwrap_or(0))
    }

    fn set_last_applied_index(&self, index: u64) -> Result<(), RaftError> {
        self.meta.insert(FENCE_KEY, &index.to_be_bytes())?;
        Ok(())
    }

    fn snapshot_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, RaftError> {
        let mut out = Vec::new();
        for item in self.db.iter() {
            let (k, v) = item?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn restore_all(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), RaftError> {
        self.db.clear()?;
        let mut batch = sled::Batch::default();
        for (k, v) in entries {
            batch.insert(k, v);
        }
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let s = SledStore::open(dir.path()).unwrap();
        s.put(b"a", b"1").unwrap();
        assert_eq!(s.get(b"a").unwrap(), Some(b"1".to_vec()));
        s.delete(b"a").unwrap();
        assert_eq!(s.get(b"a").unwrap(), None);
    }

    #[test]
    fn fencing_token_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = SledStore::open(dir.path()).unwrap();
            s.set_last_applied_index(7).unwrap();
            s.flush().unwrap();
        }
        let s = SledStore::open(dir.path()).unwrap();
        assert_eq!(s.last_applied_index().unwrap(), 7);
    }

    #[test]
    fn snapshot_and_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let s = SledStore::open(dir.path()).unwrap();
        s.put(b"a", b"1").unwrap();
        s.put(b"b", b"2").unwrap();
        let snap = s.snapshot_all().unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        let s2 = SledStore::open(dir2.path()).unwrap();
        s2.restore_all(snap).unwrap();
        assert_eq!(s2.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(s2.get(b"b").unwrap(), Some(b"2".to_vec()));
    }
}
