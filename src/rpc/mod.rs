//! Peer RPC transport (spec section: "RPC Transport"): length-framed,
//! authenticated, duplex TCP request/response carrying `AppendEntries`,
//! `RequestVote`, `InstallSnapshot`, and forwarded client commands.

pub mod auth;
pub mod client;
mod codec;
pub mod server;

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandResult};
use crate::log_store::LogEntry;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesParams {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    pub term: u64,
    pub success: bool,
    /// First index of the conflicting term, or log length, enabling
    /// O(terms) back-off (spec section: "Role State Machine", Follower).
    pub conflict_hint: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteParams {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteResult {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotParams {
    pub term: u64,
    pub leader_id: String,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResult {
    pub term: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandParams {
    pub command: Command,
    /// Soft upper bound the caller will wait before giving up (spec
    /// section: "Concurrency & Resource Model" — "election timeout times
    /// two"), forwarded so a relay hop doesn't wait longer than the
    /// original client would.
    pub deadline_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandReplyResult {
    pub result: CommandResult,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcParams {
    AppendEntries(AppendEntriesParams),
    RequestVote(RequestVoteParams),
    InstallSnapshot(InstallSnapshotParams),
    Command(CommandParams),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcResult {
    AppendEntries(AppendEntriesResult),
    RequestVote(RequestVoteResult),
    InstallSnapshot(InstallSnapshotResult),
    Command(CommandReplyResult),
}

/// `{from, to, id, action, params, key?}` from spec section "External
/// Interfaces". `action` duplicates the `params` variant tag on the wire,
/// matching the literal field list in the spec.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub from: String,
    pub to: String,
    pub id: String,
    pub action: String,
    pub params: RpcParams,
    pub key: Option<String>,
}

/// `{id, result|error, code?, term?, leader?}` from spec section "External
/// Interfaces".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcReply {
    pub id: String,
    pub result: Option<RpcResult>,
    pub error: Option<String>,
    pub code: Option<String>,
    pub term: Option<u64>,
    pub leader: Option<String>,
}

impl RpcReply {
    pub fn ok(id: String, result: RpcResult) -> Self {
        RpcReply {
            id,
            result: Some(result),
            error: None,
            code: None,
            term: None,
            leader: None,
        }
    }

    pub fn error(id: String, message: String, code: &str, term: Option<u64>, leader: Option<String>) -> Self {
        RpcReply {
            id,
            result: None,
            error: Some(message),
            code: Some(code.to_string()),
            term,
            leader,
        }
    }
}

pub(crate) fn new_request_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn action_name(params: &RpcParams) -> &'static str {
    match params {
        RpcParams::AppendEntries(_) => "AppendEntries",
        RpcParams::RequestVote(_) => "RequestVote",
        RpcParams::InstallSnapshot(_) => "InstallSnapshot",
        RpcParams::Command(_) => "Command",
    }
}
