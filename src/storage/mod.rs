//! The embedded, sorted-by-key persistent storage engine is explicitly out
//! of scope (spec section: "Purpose & Scope") — it is an external
//! collaborator, accessed only through the `KvStore` trait below. The real
//! backend is `sled`; `MemoryStore` exists for tests and the `db=memory`
//! config option.

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use crate::error::RaftError;

/// One write inside a `batch` command (spec section: "Data Model").
#[derive(Clone, Debug)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// The opaque byte-string keyed store the applier mutates and reads
/// against. Implementations must be safe to share across threads: the
/// applier loop is the only writer, but reads can come from any thread
/// serving a `get` RPC after read-index confirmation.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, RaftError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), RaftError>;
    fn delete(&self, key: &[u8]) -> Result<(), RaftError>;
    fn apply_batch(&self, ops: &[BatchOp]) -> Result<(), RaftError>;
    fn flush(&self) -> Result<(), RaftError>;

    /// Idempotency fencing token: the index of the last log entry applied
    /// to this store (spec section: "Database Applier" — re-applying the
    /// same index after a crash must not change state).
    fn last_applied_index(&self) -> Result<u64, RaftError>;
    fn set_last_applied_index(&self, index: u64) -> Result<(), RaftError>;

    /// Copy of everything currently in the store, used to build a
    /// snapshot (spec section: "Log and Compaction").
    fn snapshot_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, RaftError>;

    /// Replace the entire contents of the store with `entries`, used when
    /// restoring from an `InstallSnapshot` (spec section: "Log and
    /// Compaction").
    fn restore_all(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), RaftError>;
}

/// Reserved key the fencing token is stored under; chosen so it can never
/// collide with a client key, since client keys are opaque but this one
/// carries a NUL byte a client key could in principle also contain — stores
/// that need a guaranteed-reserved namespace (as `sled_store` does) keep the
/// fencing token in a second keyspace entirely instead of relying on this.
pub const FENCE_KEY: &[u8] = b"\0__raft_last_applied__";
