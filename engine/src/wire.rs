//! Evaluation wire protocol.
//!
//! All frames have fixed sizes derived from the shared configuration, so
//! nothing is length-prefixed:
//!
//! - handshake: each side sends its `u64` weights hash, client first;
//! - request: `input_channels * N` bytes, one 0/1 indicator per feature;
//! - response: `(N + 2)` little-endian `f32` values — the policy vector,
//!   then the pass probability, then the winrate.
//!
//! Little-endian is assumed to be the host order on both peers; there is
//! no byte-order negotiation (both ends must share endianness and float
//! format).

use crate::nn_cache::NetResult;
use bytes::{BufMut, BytesMut};
use std::io::{self, ErrorKind, Read, Write};

pub fn write_hash<W: Write>(writer: &mut W, hash: u64) -> io::Result<()> {
    writer.write_all(&hash.to_le_bytes())
}

pub fn read_hash<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Send one feature block. `features` length must equal the configured
/// `input_channels * N`.
pub fn write_request<W: Write>(writer: &mut W, features: &[bool]) -> io::Result<()> {
    let mut frame = BytesMut::with_capacity(features.len());
    for &plane_bit in features {
        frame.put_u8(u8::from(plane_bit));
    }
    writer.write_all(&frame)?;
    writer.flush()
}

/// Receive one feature block of `len` bytes.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before
/// sending anything; EOF mid-frame is an error.
pub fn read_request<R: Read>(reader: &mut R, len: usize) -> io::Result<Option<Vec<bool>>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0usize;
    while filled < len {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "connection closed mid-request",
                ))
            }
            Ok(read) => filled += read,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Some(buf.into_iter().map(|b| b != 0).collect()))
}

pub fn write_response<W: Write>(writer: &mut W, result: &NetResult) -> io::Result<()> {
    let mut frame = BytesMut::with_capacity((result.policy.len() + 2) * 4);
    for &p in &result.policy {
        frame.put_f32_le(p);
    }
    frame.put_f32_le(result.policy_pass);
    frame.put_f32_le(result.winrate);
    writer.write_all(&frame)?;
    writer.flush()
}

pub fn read_response<R: Read>(reader: &mut R, num_intersections: usize) -> io::Result<NetResult> {
    let mut buf = vec![0u8; (num_intersections + 2) * 4];
    reader.read_exact(&mut buf)?;
    let mut floats = buf
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()));
    let policy: Vec<f32> = floats.by_ref().take(num_intersections).collect();
    let policy_pass = floats.next().unwrap();
    let winrate = floats.next().unwrap();
    Ok(NetResult {
        policy,
        policy_pass,
        winrate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_round_trips() {
        let features = vec![true, false, false, true, true, false];
        let mut buf = Vec::new();
        write_request(&mut buf, &features).unwrap();
        assert_eq!(buf.len(), features.len());

        let back = read_request(&mut Cursor::new(&buf), features.len())
            .unwrap()
            .unwrap();
        assert_eq!(back, features);
    }

    #[test]
    fn empty_stream_is_a_clean_eof() {
        let empty: &[u8] = &[];
        assert!(read_request(&mut Cursor::new(empty), 8).unwrap().is_none());
    }

    #[test]
    fn partial_request_is_an_error() {
        let short = [1u8, 0, 1];
        let err = read_request(&mut Cursor::new(&short[..]), 8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn response_round_trips() {
        let result = NetResult {
            policy: vec![0.0, 0.5, 0.25, 0.125],
            policy_pass: 0.0625,
            winrate: 0.75,
        };
        let mut buf = Vec::new();
        write_response(&mut buf, &result).unwrap();
        assert_eq!(buf.len(), (4 + 2) * 4);

        let back = read_response(&mut Cursor::new(&buf), 4).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn hash_round_trips() {
        let mut buf = Vec::new();
        write_hash(&mut buf, 0xDEAD_BEEF_0123_4567).unwrap();
        assert_eq!(read_hash(&mut Cursor::new(&buf)).unwrap(), 0xDEAD_BEEF_0123_4567);
    }
}
