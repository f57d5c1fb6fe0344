//! The Raft actor (spec section: "Concurrency & Resource Model" — "a single
//! thread owns the state machine; every other thread only ever posts a
//! message to it and, where it needs an answer, blocks on a private reply
//! channel"). `Node` owns the log, peer set, persistent meta, and role tag;
//! peer threads (`server::peer`), the applier thread (`applier`), and every
//! inbound RPC handler talk to it only through `MainThreadMessage`.

pub mod peer;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::address::Address;
use crate::applier::ApplierHandle;
use crate::command::{Command, CommandResult};
use crate::config::{Config, DbBackend};
use crate::error::RaftError;
use crate::log_store::Log;
use crate::peer_set::PeerSet;
use crate::persistent_meta::PersistentMeta;
use crate::role::{candidate, follower, leader, weakened, FollowerState, Role};
use crate::rpc::client::{reply_to_error, RpcClient};
use crate::rpc::server::{RpcHandler, RpcOutcome, RpcServer};
use crate::rpc::{
    AppendEntriesParams, AppendEntriesResult, CommandParams, CommandReplyResult,
    InstallSnapshotParams, InstallSnapshotResult, RequestVoteParams, RequestVoteResult, RpcParams,
    RpcResult,
};
use crate::storage::{KvStore, MemoryStore, SledStore};

use peer::{PeerHandle, PeerThreadMessage};

/// Everything posted back onto the actor's own channel: peer RPC replies,
/// inbound requests from `NodeHandle`, client submissions, and applier
/// completions.
pub enum MainThreadMessage {
    AppendEntriesReply {
        peer: Address,
        term: u64,
        success: bool,
        conflict_hint: Option<u64>,
        sent_prev_index: u64,
        sent_count: u64,
        sent_at: Instant,
    },
    RequestVoteReply {
        peer: Address,
        term: u64,
        vote_granted: bool,
        election_term: u64,
    },
    InstallSnapshotReply {
        peer: Address,
        term: u64,
        last_included_index: u64,
    },
    IncomingRpc {
        from: Address,
        params: RpcParams,
        reply_tx: Sender<RpcOutcome>,
    },
    ClientCommand {
        command: Command,
        reply_tx: Sender<Result<CommandResult, RaftError>>,
    },
    EntriesApplied {
        to_index: u64,
        results: Vec<(u64, Result<CommandResult, RaftError>)>,
    },
    /// Administrative: weaken this node for `duration` (spec section: "Role
    /// State Machine", Weakened — "entered by explicit request", used for
    /// graceful hand-off and preferred-leader testing). Not part of the
    /// replicated command pipeline; takes effect locally only.
    Weaken {
        duration: Duration,
    },
}

/// Cheap snapshot of node state any thread can read without touching the
/// actor (spec section: "External Interfaces" — node status reporting).
#[derive(Clone)]
pub struct NodeStatus {
    pub role: &'static str,
    pub term: u64,
    pub leader_hint: Option<Address>,
    pub commit_index: u64,
    pub last_applied: u64,
}

/// The actor. Lives on exactly one thread for its entire life; every field
/// below is touched only from `run` and the free functions in `role::*`
/// that take `&mut Node`.
pub struct Node {
    pub(crate) config: Config,
    meta: PersistentMeta,
    pub(crate) log: Log,
    pub(crate) peer_set: PeerSet,
    pub(crate) role: Role,
    pub(crate) commit_index: u64,
    pub(crate) last_applied: u64,
    applied_requested: u64,
    /// Watermark for `apply_committed_topology`, distinct from
    /// `applied_requested` since topology bookkeeping (`peer_set`,
    /// peer threads) must update synchronously as `commit_index`
    /// advances, not wait on a round trip through the applier thread.
    topology_applied_through: u64,
    known_leader: Option<Address>,
    pub(crate) db: Arc<dyn KvStore>,
    rpc: Arc<RpcClient>,
    peers: HashMap<Address, PeerHandle>,
    applier: ApplierHandle,
    to_main: Sender<MainThreadMessage>,
    status: Arc<Mutex<NodeStatus>>,
}

impl Node {
    pub fn self_addr(&self) -> &Address {
        &self.config.id
    }

    pub fn current_term(&self) -> u64 {
        self.meta.current_term()
    }

    pub fn persist_term_and_vote(&mut self, term: u64, voted_for: Option<Address>) -> Result<(), RaftError> {
        self.meta.persist(term, voted_for)
    }

    /// If `term` is higher than ours, adopts and persists it and steps
    /// down, preserving the `Weakened` role's refusal to rejoin elections
    /// early (spec section: "Role State Machine" — "a node seeing a higher
    /// term always steps down"). Returns true if a term change occurred.
    pub fn maybe_adopt_term(&mut self, term: u64) -> bool {
        if term <= self.current_term() {
            return false;
        }
        match &self.role {
            Role::Leader(_) => leader::step_down(self, term),
            Role::Weakened(_) => {
                if let Err(e) = self.persist_term_and_vote(term, None) {
                    log::warn!("failed to persist adopted term {}: {}", term, e);
                }
            }
            Role::Follower(_) | Role::Candidate(_) => {
                if let Err(e) = self.persist_term_and_vote(term, None) {
                    log::warn!("failed to persist adopted term {}: {}", term, e);
                }
                follower::enter(self);
            }
        }
        true
    }

    pub fn send_to_peer(&mut self, peer: &Address, msg: PeerThreadMessage) {
        if let Some(handle) = self.peers.get(peer) {
            handle.send(msg);
        }
    }

    pub fn ensure_peer_thread(&mut self, peer: Address) {
        if peer == *self.self_addr() || self.peers.contains_key(&peer) {
            return;
        }
        let handle = PeerHandle::start(peer.clone(), self.rpc.clone(), self.to_main.clone());
        self.peers.insert(peer, handle);
    }

    pub fn remove_peer_thread(&mut self, peer: &Address) {
        self.peers.remove(peer);
        self.rpc.disconnect(peer);
    }

    /// Leader-only: recomputes `commit_index` from `match_index` against
    /// the current (possibly joint) peer set. Only an entry from the
    /// current term is ever committed by counting replicas directly (spec
    /// section: "Role State Machine" — the "only commit current-term
    /// entries" safety rule); older entries ride along once a later entry
    /// in the same term commits.
    pub fn advance_commit_index(&mut self) {
        let current_term = self.current_term();
        let self_addr = self.self_addr().clone();
        let mut candidates: Vec<u64> = match self.role.as_leader() {
            Some(state) => state.match_index.values().copied().collect(),
            None => return,
        };
        candidates.push(self.log.last_index());
        candidates.sort_unstable_by(|a, b| b.cmp(a));
        candidates.dedup();

        for idx in candidates {
            if idx <= self.commit_index {
                break;
            }
            if self.log.term_at(idx) != Some(current_term) {
                continue;
            }
            let acked: std::collections::BTreeSet<Address> = self
                .role
                .as_leader()
                .map(|state| {
                    state
                        .match_index
                        .iter()
                        .filter(|(_, &m)| m >= idx)
                        .map(|(p, _)| p.clone())
                        .chain(std::iter::once(self_addr.clone()))
                        .collect()
                })
                .unwrap_or_default();
            if self.peer_set.quorum_satisfied(&acked) {
                self.advance_commit_to(idx);
                return;
            }
        }
    }

    fn advance_commit_to(&mut self, new_commit: u64) {
        if new_commit <= self.commit_index {
            return;
        }
        self.commit_index = new_commit;
        self.apply_committed_topology();
        self.dispatch_to_applier();
        self.try_resolve_read_index_waiters();
        self.publish_status();
    }

    /// Brings `peer_set` up to date with any `join`/`leave` entries that
    /// just committed. The leader already called `begin_joint` at
    /// submission time (`leader::submit_topology`), so for it this only
    /// collapses joint consensus; a follower learns of the change for the
    /// first time here and runs both steps back to back (spec section:
    /// "Command Pipeline" — membership changes are effective the moment
    /// they are appended; this implementation treats that as "the moment
    /// they commit" for a follower's own view, since only the leader's
    /// view of quorum is safety-critical).
    fn apply_committed_topology(&mut self) {
        while self.topology_applied_through < self.commit_index {
            let idx = self.topology_applied_through + 1;
            let entry = match self.log.entry(idx) {
                Some(e) => e,
                None => break,
            };
            match entry.command {
                Command::Join(addr) => {
                    if !self.peer_set.is_joint() {
                        let mut updated = self.peer_set.stable_members().clone();
                        updated.insert(addr.clone());
                        let _ = self.peer_set.begin_joint(updated);
                        self.ensure_peer_thread(addr);
                    }
                    self.peer_set.commit_joint();
                }
                Command::Leave(addr) => {
                    if !self.peer_set.is_joint() {
                        let mut updated = self.peer_set.stable_members().clone();
                        updated.remove(&addr);
                        let _ = self.peer_set.begin_joint(updated);
                    }
                    self.peer_set.commit_joint();
                    if addr != *self.self_addr() {
                        self.remove_peer_thread(&addr);
                    }
                }
                _ => {}
            }
            self.topology_applied_through = idx;
        }
    }

    /// Hands newly-committed entries to the applier thread, tracked by a
    /// separate `applied_requested` watermark so a `commit_index` advance
    /// arriving before the previous batch's `EntriesApplied` confirmation
    /// never re-sends an index range already in flight.
    fn dispatch_to_applier(&mut self) {
        if self.applied_requested >= self.commit_index {
            return;
        }
        let from = self.applied_requested + 1;
        let mut batch = Vec::new();
        for idx in from..=self.commit_index {
            match self.log.entry(idx) {
                Some(e) => batch.push(e),
                None => break,
            }
        }
        if let Some(last) = batch.last() {
            self.applied_requested = last.index;
            self.applier.apply(batch);
        }
    }

    /// Records that `peer` has acknowledged a heartbeat round. Approximates
    /// the read-index protocol's "ack must be from a round started after
    /// the read was requested" rule by simply recording any ack while the
    /// waiter is outstanding; in practice a read's own `replicate_to_all`
    /// call at submission time means the first ack seen afterward is
    /// already from a fresh round.
    pub fn record_read_index_ack(&mut self, peer: &Address) {
        let self_addr = self.self_addr().clone();
        if let Role::Leader(state) = &mut self.role {
            for w in &mut state.read_index_waiters {
                w.acked.insert(peer.clone());
                w.acked.insert(self_addr.clone());
            }
        }
    }

    pub fn try_resolve_read_index_waiters(&mut self) {
        let last_applied = self.last_applied;
        let peer_set = self.peer_set.clone();
        let ready: Vec<usize> = match &self.role {
            Role::Leader(state) => state
                .read_index_waiters
                .iter()
                .enumerate()
                .filter(|(_, w)| {
                    peer_set.quorum_satisfied(&w.acked)
                        && w.also_wait_for.iter().all(|p| w.acked.contains(p))
                        && last_applied >= w.requested_commit_index
                })
                .map(|(i, _)| i)
                .collect(),
            _ => return,
        };
        if ready.is_empty() {
            return;
        }
        let mut to_resolve = Vec::new();
        if let Role::Leader(state) = &mut self.role {
            for i in ready.into_iter().rev() {
                to_resolve.push(state.read_index_waiters.remove(i));
            }
        }
        for w in to_resolve {
            let result = match w.key {
                Some(key) => self.db.get(&key).map(CommandResult::Value),
                None => Ok(CommandResult::Ok),
            };
            let _ = w.reply_tx.send(result);
        }
    }

    fn next_wakeup(&self) -> Instant {
        match &self.role {
            Role::Follower(s) => s.election_deadline,
            Role::Candidate(s) => s.election_deadline,
            Role::Leader(s) => s.last_heartbeat + self.config.heartbeat_interval,
            Role::Weakened(s) => s.resume_at,
        }
    }

    fn on_timer(&mut self) {
        match &self.role {
            Role::Follower(_) => follower::on_election_timeout(self),
            Role::Candidate(_) => candidate::on_election_timeout(self),
            Role::Leader(_) => leader::on_heartbeat_tick(self),
            Role::Weakened(_) => weakened::on_timer(self),
        }
    }

    /// The actor's entire life: wait for either the next message or the
    /// current role's next timer, whichever comes first.
    pub fn run(mut self, from_main: Receiver<MainThreadMessage>) {
        loop {
            let wait = self.next_wakeup().saturating_duration_since(Instant::now());
            match from_main.recv_timeout(wait) {
                Ok(msg) => self.handle_message(msg),
                Err(RecvTimeoutError::Timeout) => self.on_timer(),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn handle_message(&mut self, msg: MainThreadMessage) {
        match msg {
            MainThreadMessage::AppendEntriesReply {
                peer,
                term,
                success,
                conflict_hint,
                sent_prev_index,
                sent_count,
                sent_at: _,
            } => {
                if self.role.is_leader() {
                    leader::handle_append_entries_reply(
                        self,
                        peer,
                        term,
                        success,
                        conflict_hint,
                        sent_prev_index,
                        sent_count,
                    );
                } else {
                    self.maybe_adopt_term(term);
                }
            }
            MainThreadMessage::RequestVoteReply {
                peer,
                term,
                vote_granted,
                election_term,
            } => {
                if matches!(self.role, Role::Candidate(_)) {
                    candidate::handle_vote_reply(self, peer, term, vote_granted, election_term);
                } else {
                    self.maybe_adopt_term(term);
                }
            }
            MainThreadMessage::InstallSnapshotReply {
                peer,
                term,
                last_included_index,
            } => {
                if self.role.is_leader() {
                    leader::handle_install_snapshot_reply(self, peer, term, last_included_index);
                } else {
                    self.maybe_adopt_term(term);
                }
            }
            MainThreadMessage::IncomingRpc { from, params, reply_tx } => {
                self.handle_incoming_rpc(from, params, reply_tx);
            }
            MainThreadMessage::ClientCommand { command, reply_tx } => {
                self.handle_client_command(command, reply_tx);
            }
            MainThreadMessage::EntriesApplied { to_index, results } => {
                self.handle_entries_applied(to_index, results);
            }
            MainThreadMessage::Weaken { duration } => {
                log::info!("{} weakened for {:?}", self.self_addr(), duration);
                if self.role.is_leader() {
                    leader::step_down(self, self.current_term());
                }
                weakened::enter(self, duration);
            }
        }
    }

    fn handle_incoming_rpc(&mut self, from: Address, params: RpcParams, reply_tx: Sender<RpcOutcome>) {
        let outcome = match params {
            RpcParams::AppendEntries(p) => {
                RpcOutcome::Ok(RpcResult::AppendEntries(self.on_append_entries(from, p)))
            }
            RpcParams::RequestVote(p) => {
                RpcOutcome::Ok(RpcResult::RequestVote(self.on_request_vote(from, p)))
            }
            RpcParams::InstallSnapshot(p) => {
                RpcOutcome::Ok(RpcResult::InstallSnapshot(self.on_install_snapshot(from, p)))
            }
            RpcParams::Command(p) => {
                // Never let the actor itself block on a command's eventual
                // commit: register it (fast) and let a short-lived relay
                // thread wait on a private channel for the outcome (spec
                // section: "Concurrency & Resource Model").
                let (inner_tx, inner_rx) = std::sync::mpsc::channel();
                self.handle_client_command(p.command, inner_tx);
                let deadline = Duration::from_millis(p.deadline_ms);
                thread::spawn(move || {
                    let outcome = match inner_rx.recv_timeout(deadline) {
                        Ok(Ok(result)) => {
                            RpcOutcome::Ok(RpcResult::Command(CommandReplyResult { result }))
                        }
                        Ok(Err(e)) => command_error_outcome(e),
                        Err(_) => RpcOutcome::Err {
                            message: "timed out waiting for command to commit".into(),
                            code: "ETIMEDOUT",
                            term: None,
                            leader: None,
                        },
                    };
                    let _ = reply_tx.send(outcome);
                });
                return;
            }
        };
        let _ = reply_tx.send(outcome);
    }

    /// Role-agnostic `AppendEntries` handling (spec section: "Role State
    /// Machine"): valid for Follower, Candidate (stands down), Leader
    /// (already stepped down by `maybe_adopt_term` if the term is newer),
    /// and Weakened (adopts the term but keeps refusing to act as though
    /// it has a leader of its own until its timer expires).
    fn on_append_entries(&mut self, from: Address, params: AppendEntriesParams) -> AppendEntriesResult {
        let current_term = self.current_term();
        if params.term < current_term {
            return AppendEntriesResult {
                term: current_term,
                success: false,
                conflict_hint: None,
            };
        }
        self.maybe_adopt_term(params.term);
        if matches!(self.role, Role::Candidate(_)) && params.term == self.current_term() {
            // Another candidate won this term's election; stand down.
            follower::enter(self);
        }
        if !matches!(self.role, Role::Weakened(_)) {
            follower::reset_election_timer(self);
        }
        self.known_leader = Some(from);

        match self
            .log
            .append_after(params.prev_log_index, params.prev_log_term, params.entries)
        {
            Ok(()) => {
                let new_commit = params.leader_commit.min(self.log.last_index());
                self.advance_commit_to(new_commit);
                AppendEntriesResult {
                    term: self.current_term(),
                    success: true,
                    conflict_hint: None,
                }
            }
            Err(hint) => AppendEntriesResult {
                term: self.current_term(),
                success: false,
                conflict_hint: Some(hint.index),
            },
        }
    }

    fn on_request_vote(&mut self, from: Address, params: RequestVoteParams) -> RequestVoteResult {
        let current_term = self.current_term();
        if params.term < current_term {
            return RequestVoteResult {
                term: current_term,
                vote_granted: false,
            };
        }
        self.maybe_adopt_term(params.term);
        let current_term = self.current_term();

        // A weakened node never campaigns for itself (see `Role::Weakened`
        // timer handling), but it still grants votes to others: refusing
        // to vote at all here would make a weakened minority incapable of
        // ever handing off leadership to the one unweakened peer.
        let already_voted_for_other = self.meta.voted_for().is_some_and(|v| v != &from);
        let up_to_date = self
            .log
            .is_candidate_up_to_date(params.last_log_term, params.last_log_index);
        if already_voted_for_other || !up_to_date {
            return RequestVoteResult {
                term: current_term,
                vote_granted: false,
            };
        }

        if let Err(e) = self.persist_term_and_vote(current_term, Some(from)) {
            log::warn!("failed to persist vote: {}", e);
        }
        follower::reset_election_timer(self);
        RequestVoteResult {
            term: current_term,
            vote_granted: true,
        }
    }

    /// Single-shot only: the leader side (`leader::send_install_snapshot`)
    /// always sets `done: true` and never chunks, so a resumable
    /// offset-based install is not implemented here either.
    fn on_install_snapshot(&mut self, from: Address, params: InstallSnapshotParams) -> InstallSnapshotResult {
        let current_term = self.current_term();
        if params.term < current_term {
            return InstallSnapshotResult { term: current_term };
        }
        self.maybe_adopt_term(params.term);
        if !matches!(self.role, Role::Weakened(_)) {
            follower::reset_election_timer(self);
        }
        self.known_leader = Some(from);

        if params.done {
            match rmp_serde::from_slice::<Vec<(Vec<u8>, Vec<u8>)>>(&params.data) {
                Ok(entries) => {
                    if let Err(e) = self.db.restore_all(entries) {
                        log::warn!("failed to restore snapshot: {}", e);
                        return InstallSnapshotResult { term: self.current_term() };
                    }
                    if let Err(e) = self.db.set_last_applied_index(params.last_included_index) {
                        log::warn!("failed to persist applied index after snapshot install: {}", e);
                    }
                    if let Err(e) = self
                        .log
                        .install_snapshot_boundary(params.last_included_index, params.last_included_term)
                    {
                        log::warn!("failed to re-anchor log after snapshot install: {}", e);
                    }
                    self.commit_index = self.commit_index.max(params.last_included_index);
                    self.last_applied = self.last_applied.max(params.last_included_index);
                    self.applied_requested = self.applied_requested.max(params.last_included_index);
                    self.topology_applied_through =
                        self.topology_applied_through.max(params.last_included_index);
                    self.publish_status();
                }
                Err(e) => log::warn!("failed to decode snapshot payload: {}", e),
            }
        }
        InstallSnapshotResult { term: self.current_term() }
    }

    fn handle_client_command(&mut self, command: Command, reply_tx: Sender<Result<CommandResult, RaftError>>) {
        if !self.role.is_leader() {
            self.forward_or_reject(command, reply_tx);
            return;
        }
        match command {
            Command::Get { key } => leader::submit_read_index(self, key, reply_tx),
            Command::Consensus { also_wait_for } => leader::submit_consensus(self, also_wait_for, reply_tx),
            Command::Join(_) | Command::Leave(_) => leader::submit_topology(self, command, reply_tx),
            Command::Put { .. } | Command::Delete { .. } | Command::Batch(_) => {
                leader::submit_for_log(self, command, reply_tx)
            }
        }
    }

    /// Follower-side command handling: forward to the known leader on our
    /// own short-lived thread so a slow forward never blocks the actor
    /// (spec section: "Error Handling Design" — clients see `ENOTLEADER`
    /// with a leader hint when there is no known leader to forward to).
    fn forward_or_reject(&mut self, command: Command, reply_tx: Sender<Result<CommandResult, RaftError>>) {
        let leader_addr = match self.known_leader.clone() {
            Some(l) => l,
            None => {
                let _ = reply_tx.send(Err(RaftError::NotLeader { leader: None }));
                return;
            }
        };
        let rpc = self.rpc.clone();
        let deadline = self.config.rpc_timeout * 2;
        thread::spawn(move || {
            let params = RpcParams::Command(CommandParams {
                command,
                deadline_ms: deadline.as_millis() as u64,
            });
            let result = match rpc.call(&leader_addr, params, Some(deadline)) {
                Ok(reply) => match reply.result {
                    Some(RpcResult::Command(r)) => Ok(r.result),
                    _ => Err(reply_to_error(&reply).unwrap_or(RaftError::Protocol("malformed forwarded reply".into()))),
                },
                Err(e) => Err(e),
            };
            let _ = reply_tx.send(result);
        });
    }

    fn handle_entries_applied(&mut self, to_index: u64, results: Vec<(u64, Result<CommandResult, RaftError>)>) {
        self.last_applied = self.last_applied.max(to_index);
        if let Role::Leader(state) = &mut self.role {
            let clears = state
                .pending_topology
                .as_ref()
                .is_some_and(|p| p.entry_index <= to_index);
            if clears {
                state.pending_topology = None;
            }
        }
        for (index, result) in results {
            if let Role::Leader(state) = &mut self.role {
                if let Some(pending) = state.pending_clients.remove(&index) {
                    let _ = pending.reply_tx.send(result);
                }
            }
        }
        self.try_resolve_read_index_waiters();
        self.maybe_compact();
        self.publish_status();
    }

    /// Compacts the log once its retained length exceeds
    /// `maxLogRetention`, never past what has actually been applied (spec
    /// section: "Log and Compaction").
    fn maybe_compact(&mut self) {
        if (self.log.retained_len() as u64) <= self.config.max_log_retention {
            return;
        }
        let through = self.last_applied.min(self.commit_index);
        if through <= self.log.snapshot_last_index() {
            return;
        }
        if let Err(e) = self.log.compact_through(through) {
            log::warn!("log compaction through {} failed: {}", through, e);
        }
    }

    fn publish_status(&self) {
        let mut status = self.status.lock().unwrap();
        status.role = self.role.name();
        status.term = self.current_term();
        status.leader_hint = if self.role.is_leader() {
            Some(self.self_addr().clone())
        } else {
            self.known_leader.clone()
        };
        status.commit_index = self.commit_index;
        status.last_applied = self.last_applied;
    }
}

fn command_error_outcome(e: RaftError) -> RpcOutcome {
    let term = match &e {
        RaftError::OutdatedTerm { current_term } => Some(*current_term),
        _ => None,
    };
    let leader = match &e {
        RaftError::NotLeader { leader } => leader.clone(),
        _ => None,
    };
    RpcOutcome::Err {
        message: e.to_string(),
        code: e.code(),
        term,
        leader,
    }
}

/// Handle callers outside the actor thread use to submit commands and
/// serve inbound RPCs. Cheap to clone; every clone shares the same
/// underlying channel to the actor.
#[derive(Clone)]
pub struct NodeHandle {
    // Wrapped in `Arc<Mutex<_>>`, not a bare `Sender`, purely so this type
    // satisfies `RpcHandler: Send + Sync` unconditionally.
    to_main: Arc<Mutex<Sender<MainThreadMessage>>>,
    self_addr: Address,
    status: Arc<Mutex<NodeStatus>>,
}

impl NodeHandle {
    pub fn address(&self) -> &Address {
        &self.self_addr
    }

    pub fn status(&self) -> NodeStatus {
        self.status.lock().unwrap().clone()
    }

    /// Weakens this node for `duration` (spec section: "Role State
    /// Machine", Weakened). Fire-and-forget: there is nothing useful for
    /// the caller to wait on since the effect is purely local.
    pub fn weaken(&self, duration: Duration) {
        let sender = self.to_main.lock().unwrap();
        let _ = sender.send(MainThreadMessage::Weaken { duration });
    }

    /// Submits a command for processing and blocks up to `timeout` for an
    /// outcome (spec section: "Command Pipeline").
    pub fn submit(&self, command: Command, timeout: Duration) -> Result<CommandResult, RaftError> {
        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        {
            let sender = self.to_main.lock().unwrap();
            sender
                .send(MainThreadMessage::ClientCommand { command, reply_tx })
                .map_err(|_| RaftError::Io("node actor has shut down".into()))?;
        }
        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => Err(RaftError::TimedOut),
        }
    }
}

impl RpcHandler for NodeHandle {
    fn handle(&self, from: &Address, params: RpcParams) -> RpcOutcome {
        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        let sent = {
            let sender = self.to_main.lock().unwrap();
            sender.send(MainThreadMessage::IncomingRpc {
                from: from.clone(),
                params,
                reply_tx,
            })
        };
        if sent.is_err() {
            return RpcOutcome::Err {
                message: "node actor has shut down".into(),
                code: "EIO",
                term: None,
                leader: None,
            };
        }
        match reply_rx.recv_timeout(Duration::from_secs(30)) {
            Ok(outcome) => outcome,
            Err(_) => RpcOutcome::Err {
                message: "timed out waiting for the actor".into(),
                code: "ETIMEDOUT",
                term: None,
                leader: None,
            },
        }
    }
}

/// Starts a node: opens storage, wires up peer threads, the applier, and
/// the RPC server, then hands the actor off to its own thread.
pub fn bootstrap(config: Config) -> Result<NodeHandle, RaftError> {
    let (to_main, from_main) = channel();

    let (db, meta, log): (Arc<dyn KvStore>, PersistentMeta, Log) = if config.persist {
        // `sled::open` deduplicates handles by path, so this and
        // `SledStore::open` below safely share one underlying database
        // when `config.db` is `Sled`, distinguished only by tree name.
        let sled_db = sled::open(&config.location)?;
        let store: Arc<dyn KvStore> = match config.db {
            DbBackend::Sled => Arc::new(SledStore::open(&config.location)?),
            DbBackend::Memory => Arc::new(MemoryStore::new()),
        };
        let meta = PersistentMeta::open_persistent(&sled_db)?;
        let log = Log::open_persistent(&sled_db)?;
        (store, meta, log)
    } else {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        (store, PersistentMeta::new_volatile(), Log::new_volatile())
    };

    let rpc = Arc::new(RpcClient::new(
        config.id.clone(),
        config.connection_timeout,
        config.rpc_timeout,
        config.session_key.clone(),
    ));

    let applier = ApplierHandle::start(db.clone(), to_main.clone());

    let mut peers = HashMap::new();
    for addr in &config.peers {
        if *addr != config.id {
            peers.insert(addr.clone(), PeerHandle::start(addr.clone(), rpc.clone(), to_main.clone()));
        }
    }
    let peer_set = PeerSet::new(config.peers.clone());

    let bind_addr: SocketAddr = if config.public {
        let wildcard = if config.id.ip().is_ipv6() {
            "::".parse().unwrap()
        } else {
            "0.0.0.0".parse().unwrap()
        };
        SocketAddr::new(wildcard, config.id.port())
    } else {
        config.id.to_socket_addr()
    };

    let status = Arc::new(Mutex::new(NodeStatus {
        role: "follower",
        term: meta.current_term(),
        leader_hint: None,
        commit_index: 0,
        last_applied: 0,
    }));

    let self_addr = config.id.clone();

    let mut node = Node {
        config,
        meta,
        log,
        peer_set,
        role: Role::Follower(FollowerState {
            election_deadline: Instant::now(),
        }),
        commit_index: 0,
        last_applied: 0,
        applied_requested: 0,
        topology_applied_through: 0,
        known_leader: None,
        db,
        rpc,
        peers,
        applier,
        to_main: to_main.clone(),
        status: status.clone(),
    };
    follower::enter(&mut node);

    let handle = NodeHandle {
        to_main: Arc::new(Mutex::new(to_main)),
        self_addr,
        status,
    };

    let rpc_server = RpcServer::bind(bind_addr, Arc::new(handle.clone()), node.config.session_key.clone())?;
    let _accept_thread = rpc_server.serve();

    thread::spawn(move || node.run(from_main));

    Ok(handle)
}
