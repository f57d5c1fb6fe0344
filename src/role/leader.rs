//! Leader behavior (spec section: "Role State Machine", Leader; "Command
//! Pipeline"): replication fan-out, commit-index advancement, read-index
//! reads, and resolving client submissions once their entries apply.

use std::collections::HashMap;
use std::time::Instant;

use crate::address::Address;
use crate::command::{Command, CommandResult};
use crate::error::RaftError;
use crate::rpc::{AppendEntriesParams, InstallSnapshotParams};
use crate::server::peer::PeerThreadMessage;
use crate::server::Node;

use super::{follower, LeaderState, ReadIndexWaiter, Role};

pub fn enter(node: &mut Node) {
    let last_index = node.log.last_index();
    let self_addr = node.self_addr().clone();
    let mut next_index = HashMap::new();
    let mut match_index = HashMap::new();
    for p in node.peer_set.fanout_members() {
        if p != self_addr {
            next_index.insert(p.clone(), last_index + 1);
            match_index.insert(p, 0);
        }
    }
    log::info!("{} became leader for term {}", self_addr, node.current_term());
    node.role = Role::Leader(LeaderState {
        next_index,
        match_index,
        inflight: HashMap::new(),
        // Force an immediate heartbeat round on the next tick.
        last_heartbeat: Instant::now() - node.config.heartbeat_interval,
        pending_topology: None,
        pending_clients: HashMap::new(),
        read_index_waiters: Vec::new(),
    });
    replicate_to_all(node);
}

pub fn on_heartbeat_tick(node: &mut Node) {
    replicate_to_all(node);
    expire_read_index_waiters(node);
}

pub fn replicate_to_all(node: &mut Node) {
    if !node.role.is_leader() {
        return;
    }
    let term = node.current_term();
    let commit_index = node.commit_index;
    let self_addr = node.self_addr().clone();
    let members: Vec<Address> = node
        .peer_set
        .fanout_members()
        .into_iter()
        .filter(|p| *p != self_addr)
        .collect();
    for peer in members {
        replicate_to_peer(node, &peer, term, commit_index);
    }
    if let Role::Leader(state) = &mut node.role {
        state.last_heartbeat = Instant::now();
    }
}

fn replicate_to_peer(node: &mut Node, peer: &Address, term: u64, commit_index: u64) {
    let next_idx = node
        .role
        .as_leader()
        .and_then(|s| s.next_index.get(peer).copied())
        .unwrap_or(1);

    if next_idx <= node.log.snapshot_last_index() {
        send_install_snapshot(node, peer, term);
        return;
    }

    let prev_index = next_idx - 1;
    let prev_term = node.log.term_at(prev_index).unwrap_or(0);
    let entries = node.log.entries_from(next_idx, 256 * 1024);
    let self_addr = node.self_addr().clone();
    let params = AppendEntriesParams {
        term,
        leader_id: self_addr.id().to_string(),
        prev_log_index: prev_index,
        prev_log_term: prev_term,
        entries,
        leader_commit: commit_index,
    };
    node.send_to_peer(peer, PeerThreadMessage::AppendEntries(params));
}

fn send_install_snapshot(node: &mut Node, peer: &Address, term: u64) {
    let entries = node.db.snapshot_all().unwrap_or_else(|e| {
        log::warn!("failed to snapshot db for {}: {}", peer, e);
        Vec::new()
    });
    let data = rmp_serde::to_vec(&entries).unwrap_or_default();
    let self_addr = node.self_addr().clone();
    // Always send the compaction boundary itself, not anything past it: the
    // DB snapshot already reflects every applied row regardless of index,
    // so re-applying a few already-covered entries afterward is idempotent,
    // but anchoring the follower's log at an index whose term doesn't match
    // `snapshot_last_term` would make every future AppendEntries consistency
    // check against it fail.
    let params = InstallSnapshotParams {
        term,
        leader_id: self_addr.id().to_string(),
        last_included_index: node.log.snapshot_last_index(),
        last_included_term: node.log.snapshot_last_term(),
        offset: 0,
        data,
        done: true,
    };
    node.send_to_peer(peer, PeerThreadMessage::InstallSnapshot(params));
}

pub fn handle_append_entries_reply(
    node: &mut Node,
    peer: Address,
    term: u64,
    success: bool,
    conflict_hint: Option<u64>,
    sent_prev_index: u64,
    sent_count: u64,
) {
    if node.maybe_adopt_term(term) {
        return;
    }
    if !node.role.is_leader() {
        return;
    }

    if success {
        let new_match = sent_prev_index + sent_count;
        if let Role::Leader(state) = &mut node.role {
            let m = state.match_index.entry(peer.clone()).or_insert(0);
            if new_match > *m {
                *m = new_match;
            }
            state.next_index.insert(peer.clone(), new_match + 1);
        }
        node.record_read_index_ack(&peer);
        node.advance_commit_index();

        let needs_more = node
            .role
            .as_leader()
            .and_then(|s| s.next_index.get(&peer).copied())
            .map(|n| n <= node.log.last_index())
            .unwrap_or(false);
        if needs_more {
            let term = node.current_term();
            let commit_index = node.commit_index;
            replicate_to_peer(node, &peer, term, commit_index);
        }
    } else {
        if let Role::Leader(state) = &mut node.role {
            let hint = conflict_hint.unwrap_or(1).max(1);
            state.next_index.insert(peer.clone(), hint);
        }
        let term = node.current_term();
        let commit_index = node.commit_index;
        replicate_to_peer(node, &peer, term, commit_index);
    }
}

pub fn handle_install_snapshot_reply(node: &mut Node, peer: Address, term: u64, last_included_index: u64) {
    if node.maybe_adopt_term(term) {
        return;
    }
    if !node.role.is_leader() {
        return;
    }
    if let Role::Leader(state) = &mut node.role {
        state.match_index.insert(peer.clone(), last_included_index);
        state.next_index.insert(peer.clone(), last_included_index + 1);
    }
    node.record_read_index_ack(&peer);
    node.advance_commit_index();
}

/// Appends a write/topology/no-op command to the log and registers the
/// caller to be resolved once it commits and applies (spec section:
/// "Command Pipeline").
pub fn submit_for_log(
    node: &mut Node,
    command: Command,
    reply_tx: std::sync::mpsc::Sender<Result<CommandResult, RaftError>>,
) {
    let term = node.current_term();
    let entry = match node.log.append(term, command) {
        Ok(e) => e,
        Err(e) => {
            let _ = reply_tx.send(Err(e));
            return;
        }
    };
    if let Role::Leader(state) = &mut node.role {
        state.pending_clients.insert(entry.index, super::PendingClient { reply_tx });
    }
    replicate_to_all(node);
}

/// `join`/`leave`: begins joint consensus immediately (spec section:
/// "Command Pipeline" — topology entries are effective on the owning node
/// the moment they are appended), appends the entry, and registers the
/// caller like any other write. Rejects a second change while one is
/// already in flight.
pub fn submit_topology(node: &mut Node, command: Command, reply_tx: std::sync::mpsc::Sender<Result<CommandResult, RaftError>>) {
    if node.peer_set.is_joint() {
        let _ = reply_tx.send(Err(RaftError::TopologyChangeInFlight));
        return;
    }
    let (is_join, peer) = match &command {
        Command::Join(addr) => (true, addr.clone()),
        Command::Leave(addr) => (false, addr.clone()),
        _ => unreachable!("submit_topology only handles Join/Leave"),
    };
    let mut updated = node.peer_set.stable_members().clone();
    if is_join {
        updated.insert(peer.clone());
    } else {
        updated.remove(&peer);
    }
    if node.peer_set.begin_joint(updated).is_err() {
        let _ = reply_tx.send(Err(RaftError::TopologyChangeInFlight));
        return;
    }
    // A join must start receiving AppendEntries right away so it can catch
    // up before its membership commits.
    if is_join {
        node.ensure_peer_thread(peer.clone());
    }

    let term = node.current_term();
    let entry = match node.log.append(term, command) {
        Ok(e) => e,
        Err(e) => {
            node.peer_set.abort_joint();
            if is_join {
                node.remove_peer_thread(&peer);
            }
            let _ = reply_tx.send(Err(e));
            return;
        }
    };
    if let Role::Leader(state) = &mut node.role {
        state.pending_topology = Some(super::PendingTopology {
            entry_index: entry.index,
            is_join,
            peer,
        });
        state.pending_clients.insert(entry.index, super::PendingClient { reply_tx });
    }
    replicate_to_all(node);
}

/// Starts (or piggybacks on) a read-index confirmation round for a `get`
/// (spec section: "Design Notes" — read-index protocol): never touches
/// the log, resolves once a heartbeat round after `commitIndex` is
/// acknowledged by a majority and `lastApplied` catches up to it.
pub fn submit_read_index(node: &mut Node, key: Vec<u8>, reply_tx: std::sync::mpsc::Sender<Result<CommandResult, RaftError>>) {
    let requested_commit_index = node.commit_index;
    let self_addr = node.self_addr().clone();
    if let Role::Leader(state) = &mut node.role {
        state.read_index_waiters.push(ReadIndexWaiter {
            requested_commit_index,
            acked: std::iter::once(self_addr).collect(),
            round_started: Instant::now(),
            reply_tx,
            key: Some(key),
            also_wait_for: Vec::new(),
        });
    }
    replicate_to_all(node);
    node.try_resolve_read_index_waiters();
}

/// `consensus`: a committed no-op confirming that `also_wait_for` are
/// part of the acknowledging quorum (spec section: "Design Notes", open
/// question on `alsoWaitFor`). Unlike `get` it IS appended to the log, so
/// its ordering relative to other writes is fixed; it additionally
/// requires each named peer to have acknowledged it specifically, beyond
/// plain majority commit.
pub fn submit_consensus(
    node: &mut Node,
    also_wait_for: Vec<Address>,
    reply_tx: std::sync::mpsc::Sender<Result<CommandResult, RaftError>>,
) {
    let term = node.current_term();
    let self_addr = node.self_addr().clone();
    let entry = match node.log.append(term, Command::Consensus { also_wait_for: also_wait_for.clone() }) {
        Ok(e) => e,
        Err(e) => {
            let _ = reply_tx.send(Err(e));
            return;
        }
    };
    if let Role::Leader(state) = &mut node.role {
        state.read_index_waiters.push(ReadIndexWaiter {
            requested_commit_index: entry.index,
            acked: std::iter::once(self_addr).collect(),
            round_started: Instant::now(),
            reply_tx,
            key: None,
            also_wait_for,
        });
    }
    replicate_to_all(node);
    node.try_resolve_read_index_waiters();
}

fn expire_read_index_waiters(node: &mut Node) {
    let timeout = node.config.rpc_timeout * 2;
    let now = Instant::now();
    if let Role::Leader(state) = &mut node.role {
        let mut expired = Vec::new();
        state.read_index_waiters.retain(|w| {
            if now.duration_since(w.round_started) > timeout {
                expired.push(w.reply_tx.clone());
                false
            } else {
                true
            }
        });
        for tx in expired {
            let _ = tx.send(Err(RaftError::NoMajority));
        }
    }
}

/// Called when the leader steps down: every client waiting on a log entry
/// or a read-index round is told to retry elsewhere (spec section: "Error
/// Handling Design" — clients see `ENOTLEADER` and must re-resolve).
pub fn step_down(node: &mut Node, new_term: u64) {
    if let Role::Leader(state) = &mut node.role {
        for (_, pending) in state.pending_clients.drain() {
            let _ = pending.reply_tx.send(Err(RaftError::NotLeader { leader: None }));
        }
        for waiter in state.read_index_waiters.drain(..) {
            let _ = waiter.reply_tx.send(Err(RaftError::NotLeader { leader: None }));
        }
        if let Some(pending) = state.pending_topology.take() {
            node.peer_set.abort_joint();
            if pending.is_join {
                node.remove_peer_thread(&pending.peer);
            }
        }
    }
    follower::enter(node);
    if let Err(e) = node.persist_term_and_vote(new_term, None) {
        log::warn!("failed to persist stepped-down term {}: {}", new_term, e);
    }
}
