//! A replicated, strongly-consistent key-value store built on a Raft-style
//! consensus core (spec section: "Purpose & Scope"). Each node runs a
//! role-based state machine (follower/candidate/leader/weakened) over a
//! replicated append-only command log, applying committed entries to a
//! local `KvStore`.

pub mod address;
pub mod applier;
pub mod command;
pub mod config;
pub mod error;
pub mod log_store;
pub mod peer_set;
pub mod persistent_meta;
pub mod role;
pub mod rpc;
pub mod server;
pub mod storage;

pub use address::Address;
pub use command::{Command, CommandResult, WriteOp};
pub use config::{Config, ConfigFile, DbBackend};
pub use error::RaftError;
pub use server::{bootstrap, NodeHandle, NodeStatus};
