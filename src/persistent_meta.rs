//! Durable `(currentTerm, votedFor)` (spec section: "Data Model" — the pair
//! a node must persist before it can safely reply to a `RequestVote` or
//! step up as leader). Backed by a dedicated `sled` tree when the node
//! persists at all; held purely in memory otherwise, matching `Log`'s
//! volatile/persistent split.

use crate::address::Address;
use crate::error::RaftError;

pub struct PersistentMeta {
    tree: Option<sled::Tree>,
    current_term: u64,
    voted_for: Option<Address>,
}

impl PersistentMeta {
    pub fn new_volatile() -> Self {
        PersistentMeta {
            tree: None,
            current_term: 0,
            voted_for: None,
        }
    }

    pub fn open_persistent(db: &sled::Db) -> Result<Self, RaftError> {
        let tree = db.open_tree("node_meta")?;
        let current_term = tree
            .get(b"current_term")?
            .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap_or([0; 8])))
            .unwrap_or(0);
        let voted_for = tree
            .get(b"voted_for")?
            .and_then(|v| String::from_utf8(v.to_vec()).ok())
            .and_then(|s| s.parse().ok());
        Ok(PersistentMeta {
            tree: Some(tree),
            current_term,
            voted_for,
        })
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&Address> {
        self.voted_for.as_ref()
    }

    /// Persists `term`/`voted_for` and flushes to disk before returning, so
    /// a crash right after can never lose a vote already cast (spec
    /// section: "Error Handling Design" — durability ordering around
    /// outgoing RPCs).
    pub fn persist(&mut self, term: u64, voted_for: Option<Address>) -> Result<(), RaftError> {
        self.current_term = term;
        self.voted_for = voted_for.clone();
        if let Some(tree) = &self.tree {
            tree.insert(b"current_term", &term.to_be_bytes())?;
            match &voted_for {
                Some(addr) => {
                    tree.insert(b"voted_for", addr.id().as_bytes())?;
                }
                None => {
                    tree.remove(b"voted_for")?;
                }
            }
            tree.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volatile_starts_at_term_zero() {
        let meta = PersistentMeta::new_volatile();
        assert_eq!(meta.current_term(), 0);
        assert!(meta.voted_for().is_none());
    }

    #[test]
    fn persists_and_reloads_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let addr: Address = "/ip4/127.0.0.1/tcp/9090".parse().unwrap();
        {
            let mut meta = PersistentMeta::open_persistent(&db).unwrap();
            meta.persist(4, Some(addr.clone())).unwrap();
        }
        let reloaded = PersistentMeta::open_persistent(&db).unwrap();
        assert_eq!(reloaded.current_term(), 4);
        assert_eq!(reloaded.voted_for(), Some(&addr));
    }

    #[test]
    fn clearing_vote_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let addr: Address = "/ip4/127.0.0.1/tcp/9090".parse().unwrap();
        let mut meta = PersistentMeta::open_persistent(&db).unwrap();
        meta.persist(1, Some(addr)).unwrap();
        meta.persist(2, None).unwrap();
        assert!(meta.voted_for().is_none());
    }
}
