//! Client-side pool of long-lived evaluation connections.
//!
//! Sockets are created by `init_servers`, which spreads the configured
//! thread budget across the server list. Every attempt runs against OS
//! deadlines (connect, read and write are each capped at the RPC budget),
//! performs the weights-hash handshake and proves the slot with one
//! throwaway evaluation before the socket is pooled — a server past its
//! admission cap closes us right away, and the test request is what
//! notices.
//!
//! Checkout pops the front of the idle queue and checkin pushes the back,
//! so reuse is FIFO. The RPC itself always happens with the queue lock
//! released. Connecting also happens outside the lock: the reconnector
//! only takes it to enqueue a finished socket, so evaluations keep
//! flowing while dead servers are being redialed.

use crate::config::EvalConfig;
use crate::error::EvalError;
use crate::wire;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Wall-clock budget for every remote operation: connect, each handshake
/// half, and each RPC read/write.
pub const RPC_DEADLINE: Duration = Duration::from_millis(500);

/// One `host:port` entry from the server list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    /// Parse a server token. Anything without exactly one colon (or with
    /// an unparseable port) is malformed, which is fatal at startup.
    pub fn parse(token: &str) -> Result<Self, EvalError> {
        let mut parts = token.split(':');
        let (host, port) = match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(port), None) if !host.is_empty() => (host, port),
            _ => return Err(EvalError::Malformed(token.to_string())),
        };
        let port: u16 = port
            .parse()
            .map_err(|_| EvalError::Malformed(token.to_string()))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>, EvalError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map(|addrs| addrs.collect())
            .map_err(|_| EvalError::Resolve(self.to_string()))
    }
}

impl std::fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Idle-socket pool shared by the evaluator threads and the reconnector.
pub struct ConnectionPool {
    servers: Vec<ServerAddr>,
    idle: Mutex<VecDeque<TcpStream>>,
    /// Sockets alive in the pool or checked out by an RPC.
    active: AtomicUsize,
    desired: usize,
    model_hash: u64,
    feature_len: usize,
    num_intersections: usize,
    verbose: bool,
}

impl ConnectionPool {
    pub fn new(servers: Vec<ServerAddr>, model_hash: u64, config: &EvalConfig) -> Self {
        Self {
            servers,
            idle: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            desired: config.desired_threads,
            model_hash,
            feature_len: config.feature_len(),
            num_intersections: config.num_intersections(),
            verbose: config.nn_client_verbose,
        }
    }

    pub fn servers(&self) -> &[ServerAddr] {
        &self.servers
    }

    pub fn desired(&self) -> usize {
        self.desired
    }

    /// Sockets currently alive (idle plus checked out).
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }

    /// Top the pool up toward `desired` sockets, spreading the deficit
    /// evenly across the server list. A resolution failure skips that
    /// server's remaining slots; an individual connect/handshake failure
    /// skips just its slot.
    pub fn init_servers(&self) {
        let deficit = self.desired.saturating_sub(self.active());
        if deficit == 0 || self.servers.is_empty() {
            return;
        }
        let per_server = (deficit + self.servers.len() - 1) / self.servers.len();

        for server in &self.servers {
            let addrs = match server.resolve() {
                Ok(addrs) if !addrs.is_empty() => addrs,
                Ok(_) | Err(_) => {
                    warn!("cannot resolve evaluation server {server}");
                    continue;
                }
            };

            for slot in 0..per_server {
                if self.active() >= self.desired {
                    return;
                }
                match self.connect_slot(&addrs) {
                    Ok(socket) => {
                        self.idle.lock().push_back(socket);
                        self.active.fetch_add(1, Ordering::AcqRel);
                        if self.verbose {
                            info!("evaluation client connected to {server} (slot {slot})");
                        }
                    }
                    Err(err) => {
                        if self.verbose {
                            warn!("connection to {server} failed: {err}");
                        }
                    }
                }
            }
        }
    }

    /// Open, handshake and probe one socket.
    fn connect_slot(&self, addrs: &[SocketAddr]) -> Result<TcpStream, EvalError> {
        let mut connected = None;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(addr, RPC_DEADLINE) {
                Ok(s) => {
                    connected = Some(s);
                    break;
                }
                Err(err) => {
                    debug!("connect to {addr} failed: {err}");
                    last_err = Some((addr, err));
                }
            }
        }
        let mut socket = match (connected, last_err) {
            (Some(s), _) => s,
            (None, Some((addr, err))) => {
                return Err(EvalError::Connect {
                    addr: addr.to_string(),
                    source: err,
                })
            }
            (None, None) => unreachable!("addrs is non-empty"),
        };

        socket.set_nodelay(true).ok();
        socket.set_read_timeout(Some(RPC_DEADLINE))?;
        socket.set_write_timeout(Some(RPC_DEADLINE))?;

        wire::write_hash(&mut socket, self.model_hash).map_err(EvalError::from_socket)?;
        let remote = wire::read_hash(&mut socket).map_err(EvalError::from_socket)?;
        if remote != self.model_hash {
            return Err(EvalError::Handshake {
                local: self.model_hash,
                remote,
            });
        }

        // Probe with an empty position; a server at its admission cap has
        // already closed us and this is where it shows.
        let probe = vec![false; self.feature_len];
        wire::write_request(&mut socket, &probe).map_err(EvalError::from_socket)?;
        wire::read_response(&mut socket, self.num_intersections).map_err(EvalError::from_socket)?;

        Ok(socket)
    }

    /// Pop an idle socket. Callers run the RPC with no lock held.
    pub fn checkout(&self) -> Option<TcpStream> {
        self.idle.lock().pop_front()
    }

    /// Return a healthy socket to the tail of the queue.
    pub fn checkin(&self, socket: TcpStream) {
        self.idle.lock().push_back(socket);
    }

    /// Account for a socket dropped after a timeout or I/O error.
    pub fn discard(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_tokens_parse() {
        let addr = ServerAddr::parse("gpu-box:9999").unwrap();
        assert_eq!(addr.host, "gpu-box");
        assert_eq!(addr.port, 9999);
        assert_eq!(addr.to_string(), "gpu-box:9999");
    }

    #[test]
    fn malformed_tokens_rejected() {
        for token in ["localhost", "a:b:c", ":123", "host:", "host:notaport", ""] {
            assert!(
                matches!(ServerAddr::parse(token), Err(EvalError::Malformed(_))),
                "token {:?} should be malformed",
                token
            );
        }
    }

    #[test]
    fn pool_bookkeeping_starts_empty() {
        let cfg = EvalConfig::default();
        let pool = ConnectionPool::new(Vec::new(), 0x1234, &cfg);
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.idle_len(), 0);
        assert!(pool.checkout().is_none());
        // Nothing to connect to; init is a no-op rather than an error.
        pool.init_servers();
        assert_eq!(pool.active(), 0);
    }
}
