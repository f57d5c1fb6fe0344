//! The four-state role state machine (spec section: "Role State Machine").
//!
//! ```text
//!  follower ──election timeout──► candidate
//!  candidate ──majority votes──► leader
//!  candidate ──higher term seen──► follower
//!  leader ──higher term seen──► follower
//!  any ──weaken(d)──► weakened (for duration d) ──timeout──► follower
//! ```
//!
//! Roles are expressed as a tagged enum, not a trait hierarchy (spec
//! section: "Design Notes" — "Dispatch is by tag; no virtual
//! inheritance."). Behavior lives in the sibling `follower`/`candidate`/
//! `leader`/`weakened` modules as free functions taking `&mut
//! crate::server::Node`, since the role's data is owned by the `Node` that
//! also owns the log, peer set, and transport it needs to act on.

pub mod candidate;
pub mod follower;
pub mod leader;
pub mod weakened;

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use crate::address::Address;
use crate::command::CommandResult;
use crate::error::RaftError;

/// An outstanding client submission the leader is waiting to resolve once
/// its log entry commits and applies.
pub struct PendingClient {
    pub reply_tx: std::sync::mpsc::Sender<Result<CommandResult, RaftError>>,
}

/// A single outstanding `RequestVote`/`AppendEntries`/`InstallSnapshot`
/// the leader is waiting on from a specific peer, used only for
/// diagnostics/backoff bookkeeping — the actual reply arrives
/// asynchronously as a `MainThreadMessage`.
#[derive(Clone, Copy, Debug)]
pub struct Inflight {
    pub sent_at: Instant,
}

pub struct FollowerState {
    pub election_deadline: Instant,
}

pub struct CandidateState {
    pub election_deadline: Instant,
    pub votes_received: BTreeSet<Address>,
}

/// A membership change the leader has appended but not yet seen commit
/// (spec section: "Design Notes" — reject concurrent topology changes).
pub struct PendingTopology {
    pub entry_index: u64,
    pub is_join: bool,
    pub peer: Address,
}

pub struct LeaderState {
    pub next_index: HashMap<Address, u64>,
    pub match_index: HashMap<Address, u64>,
    pub inflight: HashMap<Address, Inflight>,
    pub last_heartbeat: Instant,
    pub pending_topology: Option<PendingTopology>,
    /// Submissions awaiting their entry's commit+apply, keyed by log index.
    pub pending_clients: HashMap<u64, PendingClient>,
    /// Read-index reads waiting for the leader to reconfirm leadership via
    /// a quorum heartbeat round (spec section: "Design Notes" — read-index
    /// protocol).
    pub read_index_waiters: Vec<ReadIndexWaiter>,
}

/// One read-index read in flight: it unblocks once a majority of peers
/// have acknowledged a heartbeat sent at or after `requested_at_commit`
/// AND `last_applied >= requested_at_commit`.
pub struct ReadIndexWaiter {
    pub requested_commit_index: u64,
    pub acked: BTreeSet<Address>,
    pub round_started: Instant,
    pub reply_tx: std::sync::mpsc::Sender<Result<CommandResult, RaftError>>,
    pub key: Option<Vec<u8>>,
    pub also_wait_for: Vec<Address>,
}

pub struct WeakenedState {
    pub resume_at: Instant,
}

/// The tagged role enum. `Node` owns exactly one of these at a time;
/// transitions replace the tag atomically and cancel whatever timers the
/// outgoing state owned (spec section: "Design Notes" — "Encode this as
/// an arena where the node holds a tagged role value").
pub enum Role {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
    Weakened(WeakenedState),
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Follower(_) => "follower",
            Role::Candidate(_) => "candidate",
            Role::Leader(_) => "leader",
            Role::Weakened(_) => "weakened",
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader(_))
    }

    pub fn as_leader_mut(&mut self) -> Option<&mut LeaderState> {
        match self {
            Role::Leader(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_leader(&self) -> Option<&LeaderState> {
        match self {
            Role::Leader(s) => Some(s),
            _ => None,
        }
    }
}
