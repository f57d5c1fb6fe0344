//! Listener side of the transport: accepts inbound peer connections and
//! dispatches requests to a pluggable `RpcHandler` (spec section: "RPC
//! Transport").

use std::collections::HashSet;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use super::{auth, codec, RpcParams, RpcReply, RpcRequest};
use crate::address::Address;
use crate::error::RaftError;

/// What a handler returns for one request. `term`/`leader` let the
/// transport populate the reply's structured hints without the handler
/// needing to know about wire framing.
pub enum RpcOutcome {
    Ok(super::RpcResult),
    Err {
        message: String,
        code: &'static str,
        term: Option<u64>,
        leader: Option<Address>,
    },
}

pub trait RpcHandler: Send + Sync {
    fn handle(&self, from: &Address, params: RpcParams) -> RpcOutcome;
}

pub struct RpcServer {
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
    session_key: Option<Vec<u8>>,
    active_peers: Arc<Mutex<HashSet<Address>>>,
}

impl RpcServer {
    pub fn bind(
        bind_addr: std::net::SocketAddr,
        handler: Arc<dyn RpcHandler>,
        session_key: Option<Vec<u8>>,
    ) -> Result<Self, RaftError> {
        let listener = TcpListener::bind(bind_addr)?;
        Ok(RpcServer {
            listener,
            handler,
            session_key,
            active_peers: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawns the accept loop in a background thread and returns its
    /// handle; the teacher's per-role "one accept loop" shape from spec
    /// section "Concurrency & Resource Model".
    pub fn serve(self) -> JoinHandle<()> {
        thread::spawn(move || {
            for incoming in self.listener.incoming() {
                match incoming {
                    Ok(stream) => {
                        let handler = self.handler.clone();
                        let session_key = self.session_key.clone();
                        let active_peers = self.active_peers.clone();
                        thread::spawn(move || {
                            handle_connection(stream, handler, session_key, active_peers)
                        });
                    }
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                    }
                }
            }
        })
    }
}

fn handle_connection(
    stream: TcpStream,
    handler: Arc<dyn RpcHandler>,
    session_key: Option<Vec<u8>>,
    active_peers: Arc<Mutex<HashSet<Address>>>,
) {
    let mut reader = stream;
    let writer = match reader.try_clone() {
        Ok(w) => Arc::new(Mutex::new(w)),
        Err(e) => {
            log::warn!("failed to clone connection: {}", e);
            return;
        }
    };

    let mut registered_peer: Option<Address> = None;
    let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

    loop {
        let req: RpcRequest = match codec::read_frame(&mut reader) {
            Ok(r) => r,
            Err(_) => break,
        };

        if !auth::authenticate(session_key.as_deref(), &req.id, req.key.as_deref()) {
            let reply = RpcReply::error(req.id.clone(), "authentication failed".into(), "EACCES", None, None);
            let mut w = writer.lock().unwrap();
            let _ = codec::write_frame(&mut *w, &reply);
            continue; // EACCES is fatal to the call, not the connection.
        }

        let from: Address = match req.from.parse() {
            Ok(a) => a,
            Err(_) => {
                let reply = RpcReply::error(req.id.clone(), "malformed from address".into(), "EPROTO", None, None);
                let mut w = writer.lock().unwrap();
                let _ = codec::write_frame(&mut *w, &reply);
                continue;
            }
        };

        if registered_peer.is_none() {
            let mut set = active_peers.lock().unwrap();
            if set.contains(&from) {
                log::warn!("rejecting duplicate connection from {}", from);
                return;
            }
            set.insert(from.clone());
            registered_peer = Some(from.clone());
        }

        let handler = handler.clone();
        let writer = writer.clone();
        let req_id = req.id.clone();
        let params = req.params.clone();
        let from_for_thread = from.clone();
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(thread::spawn(move || {
            let outcome = handler.handle(&from_for_thread, params);
            let reply = match outcome {
                RpcOutcome::Ok(result) => RpcReply::ok(req_id, result),
                RpcOutcome::Err { message, code, term, leader } => {
                    RpcReply::error(req_id, message, code, term, leader.map(|l| l.id().to_string()))
                }
            };
            let mut w = writer.lock().unwrap();
            let _ = codec::write_frame(&mut *w, &reply);
        }));
    }

    // Half-close aware: drain every in-flight handler before closing our
    // side (spec section: "RPC Transport").
    for h in in_flight {
        let _ = h.join();
    }
    if let Some(peer) = registered_peer {
        active_peers.lock().unwrap().remove(&peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::client::RpcClient;
    use crate::rpc::{AppendEntriesParams, RpcResult};
    use std::time::Duration;

    struct EchoHandler;
    impl RpcHandler for EchoHandler {
        fn handle(&self, _from: &Address, params: RpcParams) -> RpcOutcome {
            match params {
                RpcParams::AppendEntries(p) => RpcOutcome::Ok(RpcResult::AppendEntries(
                    super::super::AppendEntriesResult {
                        term: p.term,
                        success: true,
                        conflict_hint: None,
                    },
                )),
                _ => RpcOutcome::Err {
                    message: "unsupported".into(),
                    code: "EPROTO",
                    term: None,
                    leader: None,
                },
            }
        }
    }

    #[test]
    fn round_trips_a_request_over_loopback() {
        let server = RpcServer::bind("127.0.0.1:0".parse().unwrap(), Arc::new(EchoHandler), None).unwrap();
        let local = server.local_addr().unwrap();
        let _handle = server.serve();

        let client = RpcClient::new(
            "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            None,
        );
        let to: Address = format!("/ip4/127.0.0.1/tcp/{}", local.port()).parse().unwrap();
        let reply = client
            .call(
                &to,
                RpcParams::AppendEntries(AppendEntriesParams {
                    term: 3,
                    leader_id: "leader".into(),
                    prev_log_index: 0,
                    prev_log_term: 0,
                    entries: vec![],
                    leader_commit: 0,
                }),
                None,
            )
            .unwrap();

        match reply.result.unwrap() {
            RpcResult::AppendEntries(r) => {
                assert_eq!(r.term, 3);
                assert!(r.success);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_unkeyed_request_when_server_has_session_key() {
        let server = RpcServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(EchoHandler),
            Some(b"secret".to_vec()),
        )
        .unwrap();
        let local = server.local_addr().unwrap();
        let _handle = server.serve();

        let client = RpcClient::new(
            "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            None,
        );
        let to: Address = format!("/ip4/127.0.0.1/tcp/{}", local.port()).parse().unwrap();
        let reply = client
            .call(
                &to,
                RpcParams::AppendEntries(AppendEntriesParams {
                    term: 1,
                    leader_id: "leader".into(),
                    prev_log_index: 0,
                    prev_log_term: 0,
                    entries: vec![],
                    leader_commit: 0,
                }),
                None,
            )
            .unwrap();
        assert_eq!(reply.code.as_deref(), Some("EACCES"));
    }
}
