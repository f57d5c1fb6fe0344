//! One background thread per remote peer (spec section: "Concurrency &
//! Resource Model" — "goroutine-per-peer style"). Each thread owns a
//! blocking `RpcClient` call; the main actor never performs network I/O
//! itself, it only posts work here and receives results back as
//! `MainThreadMessage`s.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::address::Address;
use crate::rpc::client::{reply_to_error, RpcClient};
use crate::rpc::{AppendEntriesParams, InstallSnapshotParams, RequestVoteParams, RpcParams, RpcResult};

use super::MainThreadMessage;

/// Work items the main actor pushes down to a peer's background thread.
pub enum PeerThreadMessage {
    AppendEntries(AppendEntriesParams),
    RequestVote(RequestVoteParams),
    InstallSnapshot(InstallSnapshotParams),
    Shutdown,
}

/// Handle the main actor keeps for a peer's background thread, plus the
/// replication bookkeeping spec section "Data Model" assigns to
/// `LeaderState` (`nextIndex[peer]`, `matchIndex[peer]`).
pub struct PeerHandle {
    pub to_peer: Sender<PeerThreadMessage>,
    thread: Option<JoinHandle<()>>,
}

impl PeerHandle {
    pub fn start(peer: Address, rpc: Arc<RpcClient>, to_main: Sender<MainThreadMessage>) -> PeerHandle {
        let (to_peer, from_main) = channel();
        let thread = thread::spawn(move || peer_main(peer, rpc, from_main, to_main));
        PeerHandle {
            to_peer,
            thread: Some(thread),
        }
    }

    pub fn send(&self, msg: PeerThreadMessage) {
        // The peer thread only exits on Shutdown, so a send failure means
        // it has already panicked; nothing useful to do but drop the
        // message (mirrors the teacher's unwrap-on-send, made recoverable
        // since a panicking peer thread should not take the node down).
        let _ = self.to_peer.send(msg);
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.send(PeerThreadMessage::Shutdown);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn peer_main(
    peer: Address,
    rpc: Arc<RpcClient>,
    from_main: Receiver<PeerThreadMessage>,
    to_main: Sender<MainThreadMessage>,
) {
    loop {
        let msg = match from_main.recv() {
            Ok(m) => m,
            Err(_) => return,
        };
        match msg {
            PeerThreadMessage::Shutdown => return,
            PeerThreadMessage::AppendEntries(params) => {
                let sent_prev_index = params.prev_log_index;
                let sent_count = params.entries.len() as u64;
                let term_sent = params.term;
                let outcome = rpc.call(&peer, RpcParams::AppendEntries(params), None);
                let (term, success, conflict_hint) = match outcome {
                    Ok(reply) => match reply.result {
                        Some(RpcResult::AppendEntries(r)) => (r.term, r.success, r.conflict_hint),
                        _ => match reply_to_error(&reply) {
                            Some(e) => {
                                log::debug!("append_entries to {} failed: {}", peer, e);
                                (term_sent, false, None)
                            }
                            None => (term_sent, false, None),
                        },
                    },
                    Err(e) => {
                        log::debug!("append_entries to {} failed: {}", peer, e);
                        (term_sent, false, None)
                    }
                };
                let _ = to_main.send(MainThreadMessage::AppendEntriesReply {
                    peer: peer.clone(),
                    term,
                    success,
                    conflict_hint,
                    sent_prev_index,
                    sent_count,
                    sent_at: Instant::now(),
                });
            }
            PeerThreadMessage::RequestVote(params) => {
                let election_term = params.term;
                let outcome = rpc.call(&peer, RpcParams::RequestVote(params), None);
                let (term, vote_granted) = match outcome {
                    Ok(reply) => match reply.result {
                        Some(RpcResult::RequestVote(r)) => (r.term, r.vote_granted),
                        _ => (election_term, false),
                    },
                    Err(e) => {
                        log::debug!("request_vote to {} failed: {}", peer, e);
                        (election_term, false)
                    }
                };
                let _ = to_main.send(MainThreadMessage::RequestVoteReply {
                    peer: peer.clone(),
                    term,
                    vote_granted,
                    election_term,
                });
            }
            PeerThreadMessage::InstallSnapshot(params) => {
                let term_sent = params.term;
                let last_included_index = params.last_included_index;
                let outcome = rpc.call(&peer, RpcParams::InstallSnapshot(params), None);
                let term = match outcome {
                    Ok(reply) => match reply.result {
                        Some(RpcResult::InstallSnapshot(r)) => r.term,
                        _ => term_sent,
                    },
                    Err(e) => {
                        log::debug!("install_snapshot to {} failed: {}", peer, e);
                        term_sent
                    }
                };
                let _ = to_main.send(MainThreadMessage::InstallSnapshotReply {
                    peer: peer.clone(),
                    term,
                    last_included_index,
                });
            }
        }
    }
}
