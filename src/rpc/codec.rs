//! Frame = 4-byte big-endian length prefix + `rmp-serde`-encoded body
//! (spec section: "Component Design", RPC Transport).

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RaftError;

/// Refuse to allocate more than this for a single frame; guards against a
/// corrupt or malicious length prefix turning into an OOM.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

pub fn write_frame<W: Write, T: Serialize>(w: &mut W, msg: &T) -> Result<(), RaftError> {
    let bytes = rmp_serde::to_vec(msg)?;
    let len = bytes.len() as u32;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&bytes)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T, RaftError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(RaftError::Protocol(format!("frame of {} bytes exceeds limit", len)));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(rmp_serde::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn roundtrips_through_a_buffer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Ping { n: 7 }).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let out: Ping = read_frame(&mut cursor).unwrap();
        assert_eq!(out, Ping { n: 7 });
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let out: Result<Ping, _> = read_frame(&mut cursor);
        assert!(out.is_err());
    }
}
