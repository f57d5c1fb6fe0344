//! Canonical identity of a cluster member.
//!
//! Addresses are multi-segment strings of the form
//! `/ip4/<A.B.C.D>/tcp/<port>` or `/ip6/<addr>/tcp/<port>`, optionally
//! followed by opaque trailing segments (e.g. a node label). Two addresses
//! are equal iff their normalized string form is equal.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RaftError;

/// A parsed, comparable cluster member address.
///
/// `Address` derives `Ord` so it can be used as a `BTreeMap`/`BTreeSet` key;
/// ordering follows the normalized string form, which keeps iteration order
/// deterministic across nodes (important for majority computations to be
/// reproducible in tests).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Address {
    ip: IpAddr,
    port: u16,
    tail: Vec<String>,
    id: String,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16, tail: Vec<String>) -> Self {
        let id = render(&ip, port, &tail);
        Address { ip, port, tail, id }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Address::new(addr.ip(), addr.port(), Vec::new())
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tail(&self) -> &[String] {
        &self.tail
    }

    /// The full normalized string form, e.g. `/ip4/127.0.0.1/tcp/9090`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

fn render(ip: &IpAddr, port: u16, tail: &[String]) -> String {
    let mut s = match ip {
        IpAddr::V4(v4) => format!("/ip4/{}/tcp/{}", v4, port),
        IpAddr::V6(v6) => format!("/ip6/{}/tcp/{}", v6, port),
    };
    for seg in tail {
        s.push('/');
        s.push_str(seg);
    }
    s
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl FromStr for Address {
    type Err = RaftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segs: Vec<&str> = s.split('/').filter(|p| !p.is_empty()).collect();
        if segs.len() < 4 {
            return Err(RaftError::Protocol(format!("malformed address: {}", s)));
        }
        let proto = segs[0];
        let host = segs[1];
        let tcp_lit = segs[2];
        let port_str = segs[3];
        if tcp_lit != "tcp" {
            return Err(RaftError::Protocol(format!(
                "expected tcp segment in address: {}",
                s
            )));
        }
        let ip: IpAddr = match proto {
            "ip4" | "ip6" => host
                .parse()
                .map_err(|_| RaftError::Protocol(format!("bad host in address: {}", s)))?,
            other => {
                return Err(RaftError::Protocol(format!(
                    "unsupported address family: {}",
                    other
                )))
            }
        };
        let port: u16 = port_str
            .parse()
            .map_err(|_| RaftError::Protocol(format!("bad port in address: {}", s)))?;
        let tail: Vec<String> = segs[4..].iter().map(|s| s.to_string()).collect();
        Ok(Address::new(ip, port, tail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_ipv4() {
        let addr: Address = "/ip4/127.0.0.1/tcp/9090".parse().unwrap();
        assert_eq!(addr.id(), "/ip4/127.0.0.1/tcp/9090");
        assert_eq!(addr.port(), 9090);
    }

    #[test]
    fn keeps_opaque_tail() {
        let addr: Address = "/ip4/127.0.0.1/tcp/9090/node-a".parse().unwrap();
        assert_eq!(addr.tail(), &["node-a".to_string()]);
        assert_eq!(addr.id(), "/ip4/127.0.0.1/tcp/9090/node-a");
    }

    #[test]
    fn equal_addresses_compare_by_normalized_form() {
        let a: Address = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        let b: Address = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_malformed() {
        assert!("not-an-address".parse::<Address>().is_err());
        assert!("/ip4/127.0.0.1/udp/9090".parse::<Address>().is_err());
    }

    #[test]
    fn ipv6_renders_with_ip6_segment() {
        let addr: Address = "/ip6/::1/tcp/9090".parse().unwrap();
        assert_eq!(addr.id(), "/ip6/::1/tcp/9090");
    }
}
