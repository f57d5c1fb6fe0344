//! Optional shared-secret authentication (spec section: "RPC Transport"):
//! each request carries `HMAC-SHA256(sessionKey, id)`; servers with a
//! session key reject requests missing or carrying an invalid one; servers
//! without one reject requests carrying a key at all.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub fn sign(session_key: &[u8], id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(session_key).expect("HMAC accepts keys of any length");
    mac.update(id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn verify_signature(session_key: &[u8], id: &str, key_hex: &str) -> bool {
    let Ok(expected) = hex::decode(key_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(session_key).expect("HMAC accepts keys of any length");
    mac.update(id.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Applies spec's exact authentication contract given the server's
/// configured session key (if any) and the request's carried key (if
/// any).
pub fn authenticate(session_key: Option<&[u8]>, id: &str, carried_key: Option<&str>) -> bool {
    match (session_key, carried_key) {
        (Some(key), Some(key_hex)) => verify_signature(key, id, key_hex),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let key = b"secret";
        let sig = sign(key, "request-1");
        assert!(authenticate(Some(key), "request-1", Some(&sig)));
    }

    #[test]
    fn rejects_wrong_key() {
        let sig = sign(b"secret", "request-1");
        assert!(!authenticate(Some(b"other"), "request-1", Some(&sig)));
    }

    #[test]
    fn both_unkeyed_is_allowed() {
        assert!(authenticate(None, "request-1", None));
    }

    #[test]
    fn keyed_server_rejects_unkeyed_request() {
        assert!(!authenticate(Some(b"secret"), "request-1", None));
    }

    #[test]
    fn unkeyed_server_rejects_keyed_request() {
        let sig = sign(b"secret", "request-1");
        assert!(!authenticate(None, "request-1", Some(&sig)));
    }
}
