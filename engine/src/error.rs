//! Error kinds shared by the cache and the distributed evaluation layer.

use crate::policy_codec::CodecError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    /// A `host:port` token that does not parse. Fatal at startup.
    #[error("malformed server address '{0}': expected host:port")]
    Malformed(String),

    /// DNS resolution failed for a server entry.
    #[error("failed to resolve '{0}'")]
    Resolve(String),

    /// TCP connect failed or timed out.
    #[error("connect to {addr} failed")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The peer serves a different set of weights.
    #[error("weights hash mismatch: ours {local:#018x}, peer {remote:#018x}")]
    Handshake { local: u64, remote: u64 },

    /// A remote call missed its deadline. Transient: the socket is dropped
    /// and the caller falls back.
    #[error("remote evaluation timed out")]
    Timeout,

    /// Socket or file I/O failed.
    #[error("i/o error")]
    Io(#[from] io::Error),

    /// Compressed policy or on-disk record failed to parse.
    #[error(transparent)]
    Decode(#[from] CodecError),

    /// No remote slot available and no local evaluator to fall back on.
    #[error("no evaluation backend available")]
    Exhausted,

    /// Entry cannot be represented (oversized compressed policy, reserved
    /// fingerprint).
    #[error("unsupported cache entry: {0}")]
    Unsupported(&'static str),
}

impl EvalError {
    /// Classify a socket error: OS-level read/write deadlines surface as
    /// `WouldBlock` (unix) or `TimedOut` (windows), which for the client
    /// mean the 500 ms RPC budget expired rather than a broken peer.
    pub fn from_socket(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => EvalError::Timeout,
            _ => EvalError::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_kinds_map_to_timeout() {
        let e = EvalError::from_socket(io::Error::new(io::ErrorKind::WouldBlock, "deadline"));
        assert!(matches!(e, EvalError::Timeout));
        let e = EvalError::from_socket(io::Error::new(io::ErrorKind::TimedOut, "deadline"));
        assert!(matches!(e, EvalError::Timeout));
        let e = EvalError::from_socket(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(e, EvalError::Io(_)));
    }
}
