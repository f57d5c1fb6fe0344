//! Client-submitted commands (spec section: "Data Model", "Command
//! Pipeline"). A `Command` is either persisted into the log (writes,
//! topology changes, consensus no-ops) or served as a volatile read
//! straight from the applied database after read-index confirmation.

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// One write inside a `batch` command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// `kind ∈ {put, get, delete, batch, join, leave, consensus}` from spec
/// section "Data Model".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Batch(Vec<WriteOp>),
    /// Volatile read; never appended to the log (see `requires_log_entry`).
    Get { key: Vec<u8> },
    Join(Address),
    Leave(Address),
    /// A committed no-op confirming that `also_wait_for` is part of the
    /// satisfying quorum (spec section: "Design Notes", open question on
    /// `alsoWaitFor`).
    Consensus { also_wait_for: Vec<Address> },
}

impl Command {
    /// Topology changes are `flags.topology` commands (spec: "Data Model").
    pub fn is_topology(&self) -> bool {
        matches!(self, Command::Join(_) | Command::Leave(_))
    }

    /// Commands that mutate or read the applied database (`flags.database`).
    pub fn is_database(&self) -> bool {
        matches!(
            self,
            Command::Put { .. } | Command::Delete { .. } | Command::Batch(_) | Command::Get { .. }
        )
    }

    /// Commands requiring only a read-index confirmation, never a log
    /// append (`flags.volatile`).
    pub fn is_volatile(&self) -> bool {
        matches!(self, Command::Get { .. } | Command::Consensus { .. })
    }

    /// True if processing this command means appending a log entry. Only
    /// `get` is handled without ever touching the log.
    pub fn requires_log_entry(&self) -> bool {
        !matches!(self, Command::Get { .. })
    }

    /// True if this command may only be originated/processed by the leader
    /// (every kind except a plain `get`, which is still leader-only in this
    /// implementation because read-index requires leadership, but is
    /// distinguished here because it never touches the log).
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::Put { .. } | Command::Delete { .. } | Command::Batch(_)
        )
    }
}

/// The outcome of applying a committed entry, returned to the submitting
/// client future.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CommandResult {
    Ok,
    Value(Option<Vec<u8>>),
    Deleted(bool),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_kinds() {
        assert!(Command::Put {
            key: vec![],
            value: vec![]
        }
        .is_database());
        assert!(Command::Get { key: vec![] }.is_volatile());
        assert!(!Command::Get { key: vec![] }.requires_log_entry());
        assert!(Command::Join("/ip4/127.0.0.1/tcp/9090".parse().unwrap()).is_topology());
        assert!(Command::Put {
            key: vec![],
            value: vec![]
        }
        .is_write());
        assert!(!Command::Get { key: vec![] }.is_write());
    }
}
