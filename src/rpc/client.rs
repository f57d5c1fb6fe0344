//! Per-peer duplex connections and the connection pool `Node` draws on to
//! reach other cluster members (spec section: "RPC Transport", "Peer set").
//!
//! At most one outbound TCP connection is kept per remote peer; concurrent
//! callers share it through an id-indexed pending-request table so several
//! `AppendEntries`/`RequestVote` calls can be in flight on the same socket
//! at once, with replies matched back up by id regardless of arrival order.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::{action_name, auth, codec, new_request_id, RpcParams, RpcReply, RpcRequest};
use crate::address::Address;
use crate::error::RaftError;

struct PeerConnection {
    writer: Mutex<TcpStream>,
    pending: Arc<Mutex<HashMap<String, mpsc::Sender<RpcReply>>>>,
    alive: Arc<AtomicBool>,
}

impl PeerConnection {
    fn connect(addr: &Address, connect_timeout: Duration) -> Result<Self, RaftError> {
        let stream = TcpStream::connect_timeout(&addr.to_socket_addr(), connect_timeout)?;
        stream.set_nodelay(true).ok();
        let reader_stream = stream.try_clone()?;
        let pending: Arc<Mutex<HashMap<String, mpsc::Sender<RpcReply>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let pending_for_reader = pending.clone();
        let alive_for_reader = alive.clone();
        thread::spawn(move || reader_loop(reader_stream, pending_for_reader, alive_for_reader));

        Ok(PeerConnection {
            writer: Mutex::new(stream),
            pending,
            alive,
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn call(&self, req: RpcRequest, timeout: Duration) -> Result<RpcReply, RaftError> {
        if !self.is_alive() {
            return Err(RaftError::ConnectionReset);
        }
        let (tx, rx) = mpsc::channel();
        self.pending.lock().unwrap().insert(req.id.clone(), tx);

        let write_result = {
            let mut w = self.writer.lock().unwrap();
            codec::write_frame(&mut *w, &req)
        };
        if let Err(e) = write_result {
            self.pending.lock().unwrap().remove(&req.id);
            self.alive.store(false, Ordering::SeqCst);
            return Err(e);
        }

        match rx.recv_timeout(timeout) {
            Ok(reply) => Ok(reply),
            Err(_) => {
                // Cooperative cancellation (spec section: "Concurrency &
                // Resource Model"): drop the pending entry so a late reply
                // is silently discarded by the reader loop.
                self.pending.lock().unwrap().remove(&req.id);
                Err(RaftError::TimedOut)
            }
        }
    }
}

fn reader_loop(
    mut stream: TcpStream,
    pending: Arc<Mutex<HashMap<String, mpsc::Sender<RpcReply>>>>,
    alive: Arc<AtomicBool>,
) {
    loop {
        match codec::read_frame::<_, RpcReply>(&mut stream) {
            Ok(reply) => {
                if let Some(tx) = pending.lock().unwrap().remove(&reply.id) {
                    let _ = tx.send(reply);
                }
            }
            Err(_) => {
                alive.store(false, Ordering::SeqCst);
                pending.lock().unwrap().clear();
                break;
            }
        }
    }
}

/// Connection pool keyed by peer address. `get_or_connect` is idempotent:
/// it returns the existing managed connection or creates one (spec
/// section: "Concurrency & Resource Model").
struct ConnectionPool {
    connections: Mutex<HashMap<Address, Arc<PeerConnection>>>,
    connect_timeout: Duration,
}

impl ConnectionPool {
    fn new(connect_timeout: Duration) -> Self {
        ConnectionPool {
            connections: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    fn get_or_connect(&self, addr: &Address) -> Result<Arc<PeerConnection>, RaftError> {
        {
            let table = self.connections.lock().unwrap();
            if let Some(conn) = table.get(addr) {
                if conn.is_alive() {
                    return Ok(conn.clone());
                }
            }
        }
        let conn = Arc::new(PeerConnection::connect(addr, self.connect_timeout)?);
        self.connections.lock().unwrap().insert(addr.clone(), conn.clone());
        Ok(conn)
    }

    fn drop_peer(&self, addr: &Address) {
        self.connections.lock().unwrap().remove(addr);
    }
}

/// The client half of the transport: one per node, shared by every
/// outgoing call the role state machine and command pipeline make.
pub struct RpcClient {
    self_addr: Address,
    pool: ConnectionPool,
    rpc_timeout: Duration,
    session_key: Option<Vec<u8>>,
}

impl RpcClient {
    pub fn new(
        self_addr: Address,
        connect_timeout: Duration,
        rpc_timeout: Duration,
        session_key: Option<Vec<u8>>,
    ) -> Self {
        RpcClient {
            self_addr,
            pool: ConnectionPool::new(connect_timeout),
            rpc_timeout,
            session_key,
        }
    }

    /// Calls `to` with `params`, returning the raw reply. Callers
    /// translate `reply.error`/`code`/`term`/`leader` into a `RaftError`
    /// as needed (done centrally in `peer_rpc`/`role` call sites so term
    /// adoption and leader hints stay next to the logic that reacts to
    /// them).
    pub fn call(&self, to: &Address, params: RpcParams, timeout_override: Option<Duration>) -> Result<RpcReply, RaftError> {
        let id = new_request_id();
        let key = self.session_key.as_deref().map(|k| auth::sign(k, &id));
        let req = RpcRequest {
            from: self.self_addr.id().to_string(),
            to: to.id().to_string(),
            id,
            action: action_name(&params).to_string(),
            params,
            key,
        };

        let conn = self.pool.get_or_connect(to)?;
        let timeout = timeout_override.unwrap_or(self.rpc_timeout);
        match conn.call(req, timeout) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                if e.is_connection_fatal() {
                    self.pool.drop_peer(to);
                }
                Err(e)
            }
        }
    }

    /// Drops the connection to a peer, e.g. after revoking a temporary
    /// non-voting member addition that failed to commit (spec section:
    /// "Command Pipeline").
    pub fn disconnect(&self, addr: &Address) {
        self.pool.drop_peer(addr);
    }
}

/// Turns an `RpcReply`'s error channel into a `RaftError`, recovering
/// structured hints (`term`, `leader`) where the code implies them.
pub fn reply_to_error(reply: &RpcReply) -> Option<RaftError> {
    let code = reply.code.as_deref()?;
    Some(match code {
        "ETIMEDOUT" => RaftError::TimedOut,
        "EACCES" => RaftError::Unauthorized,
        "ENOTLEADER" => RaftError::NotLeader {
            leader: reply.leader.as_deref().and_then(|s| s.parse().ok()),
        },
        "EOUTDATEDTERM" => RaftError::OutdatedTerm {
            current_term: reply.term.unwrap_or(0),
        },
        "ENOMAJORITY" => RaftError::NoMajority,
        "ECONNRESET" => RaftError::ConnectionReset,
        "ECONNABORTED" => RaftError::ConnectionAborted,
        "ECONNREFUSED" => RaftError::ConnectionRefused,
        "ETOPOLOGYPENDING" => RaftError::TopologyChangeInFlight,
        _ => RaftError::Protocol(reply.error.clone().unwrap_or_default()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_to_error_recovers_leader_hint() {
        let reply = RpcReply {
            id: "x".into(),
            result: None,
            error: Some("not the leader".into()),
            code: Some("ENOTLEADER".into()),
            term: Some(4),
            leader: Some("/ip4/127.0.0.1/tcp/9091".into()),
        };
        let err = reply_to_error(&reply).unwrap();
        match err {
            RaftError::NotLeader { leader } => {
                assert_eq!(leader.unwrap().id(), "/ip4/127.0.0.1/tcp/9091");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ok_reply_has_no_error() {
        let reply = RpcReply {
            id: "x".into(),
            result: None,
            error: None,
            code: None,
            term: None,
            leader: None,
        };
        assert!(reply_to_error(&reply).is_none());
    }
}
