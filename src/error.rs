//! Crate-wide error taxonomy (spec section: "Error Handling Design").
//!
//! Transport and consensus errors are recovered locally by retry/step-down
//! logic; what reaches a client is always one of these variants, each
//! carrying the wire `code` string used in RPC replies.

use crate::address::Address;

#[derive(thiserror::Error, Debug, Clone)]
pub enum RaftError {
    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection reset")]
    ConnectionReset,

    #[error("connection aborted")]
    ConnectionAborted,

    #[error("operation timed out")]
    TimedOut,

    #[error("authentication failed")]
    Unauthorized,

    #[error("not the leader{}", leader.as_ref().map(|a| format!("; try {}", a)).unwrap_or_default())]
    NotLeader { leader: Option<Address> },

    #[error("outdated term, current term is {current_term}")]
    OutdatedTerm { current_term: u64 },

    #[error("could not assemble a majority before the deadline")]
    NoMajority,

    #[error("a topology change is already in flight")]
    TopologyChangeInFlight,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl RaftError {
    /// The wire `code` string used in RPC error replies (spec section:
    /// "External Interfaces").
    pub fn code(&self) -> &'static str {
        match self {
            RaftError::ConnectionRefused => "ECONNREFUSED",
            RaftError::ConnectionReset => "ECONNRESET",
            RaftError::ConnectionAborted => "ECONNABORTED",
            RaftError::TimedOut => "ETIMEDOUT",
            RaftError::Unauthorized => "EACCES",
            RaftError::NotLeader { .. } => "ENOTLEADER",
            RaftError::OutdatedTerm { .. } => "EOUTDATEDTERM",
            RaftError::NoMajority => "ENOMAJORITY",
            RaftError::TopologyChangeInFlight => "ETOPOLOGYPENDING",
            RaftError::Storage(_) => "ESTORAGE",
            RaftError::Protocol(_) => "EPROTO",
            RaftError::Io(_) => "EIO",
        }
    }

    /// True for errors where the caller should tear down the connection.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            RaftError::ConnectionRefused
                | RaftError::ConnectionReset
                | RaftError::ConnectionAborted
                | RaftError::Protocol(_)
        )
    }
}

impl From<std::io::Error> for RaftError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match e.kind() {
            ConnectionRefused => RaftError::ConnectionRefused,
            ConnectionReset => RaftError::ConnectionReset,
            ConnectionAborted => RaftError::ConnectionAborted,
            TimedOut | WouldBlock => RaftError::TimedOut,
            _ => RaftError::Io(e.to_string()),
        }
    }
}

impl From<rmp_serde::encode::Error> for RaftError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RaftError::Protocol(format!("encode failure: {}", e))
    }
}

impl From<rmp_serde::decode::Error> for RaftError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RaftError::Protocol(format!("decode failure: {}", e))
    }
}

impl From<sled::Error> for RaftError {
    fn from(e: sled::Error) -> Self {
        RaftError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_spec_strings() {
        assert_eq!(RaftError::TimedOut.code(), "ETIMEDOUT");
        assert_eq!(RaftError::Unauthorized.code(), "EACCES");
        assert_eq!(
            RaftError::NotLeader { leader: None }.code(),
            "ENOTLEADER"
        );
        assert_eq!(
            RaftError::OutdatedTerm { current_term: 4 }.code(),
            "EOUTDATEDTERM"
        );
        assert_eq!(RaftError::NoMajority.code(), "ENOMAJORITY");
    }

    #[test]
    fn connection_errors_are_fatal_to_the_connection() {
        assert!(RaftError::ConnectionReset.is_connection_fatal());
        assert!(!RaftError::TimedOut.is_connection_fatal());
        assert!(!RaftError::NoMajority.is_connection_fatal());
    }
}
