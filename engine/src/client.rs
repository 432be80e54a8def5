//! Remote evaluator: shards forward passes across evaluation servers.
//!
//! Wraps the connection pool behind the [`Evaluator`] trait. Every call
//! checks a socket out, runs one request/response exchange under the
//! socket's 500 ms OS deadlines, and returns the socket to the pool tail.
//! A timeout or I/O error discards the socket and the call degrades to
//! the local fallback evaluator when one is configured — a missed
//! deadline costs latency, never correctness.
//!
//! A background reconnector tops the pool back up once a second until
//! shutdown. It dials outside the pool lock, so in-flight evaluations
//! never stall behind a dead server's connect timeout.

use crate::config::EvalConfig;
use crate::error::EvalError;
use crate::evaluator::Evaluator;
use crate::nn_cache::NetResult;
use crate::pool::{ConnectionPool, ServerAddr};
use crate::wire;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sleep before re-probing an exhausted pool with no local fallback.
const POOL_RETRY: Duration = Duration::from_secs(1);

/// Reconnector period.
const RECONNECT_PERIOD: Duration = Duration::from_secs(1);

/// Initial attempts to fill the pool before construction gives up.
const CONNECT_ATTEMPTS: usize = 5;

pub struct RemoteEvaluator {
    pool: Arc<ConnectionPool>,
    fallback: Option<Box<dyn Evaluator>>,
    num_intersections: usize,
    shutdown: Arc<AtomicBool>,
    reconnector: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for RemoteEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEvaluator")
            .field("has_fallback", &self.fallback.is_some())
            .field("num_intersections", &self.num_intersections)
            .field("shutdown", &self.shutdown)
            .field("reconnector", &self.reconnector)
            .finish()
    }
}

impl RemoteEvaluator {
    /// Parse the server list, fill the pool and start the reconnector.
    ///
    /// A malformed server token is fatal. Failing to open a single
    /// connection is fatal only when there is no local fallback to keep
    /// the engine playable.
    pub fn connect(
        model_hash: u64,
        fallback: Option<Box<dyn Evaluator>>,
        config: &EvalConfig,
    ) -> Result<Self, EvalError> {
        let servers = config
            .servers
            .iter()
            .map(|token| ServerAddr::parse(token))
            .collect::<Result<Vec<_>, _>>()?;

        let pool = Arc::new(ConnectionPool::new(servers, model_hash, config));
        for _ in 0..CONNECT_ATTEMPTS {
            if pool.active() >= pool.desired() {
                break;
            }
            pool.init_servers();
        }
        if pool.active() < pool.desired() {
            warn!(
                "evaluation pool filled {}/{} connections",
                pool.active(),
                pool.desired()
            );
        }
        if pool.active() == 0 && fallback.is_none() {
            return Err(EvalError::Exhausted);
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let reconnector = Self::spawn_reconnector(pool.clone(), shutdown.clone())?;

        Ok(Self {
            pool,
            fallback,
            num_intersections: config.num_intersections(),
            shutdown,
            reconnector: Some(reconnector),
        })
    }

    fn spawn_reconnector(
        pool: Arc<ConnectionPool>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>, EvalError> {
        let handle = thread::Builder::new()
            .name("nn-reconnect".into())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    if pool.active() < pool.desired() {
                        pool.init_servers();
                    }
                    thread::sleep(RECONNECT_PERIOD);
                }
                debug!("reconnector stopped");
            })?;
        Ok(handle)
    }

    /// Stop the reconnector. Called automatically on drop.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.reconnector.take() {
            let _ = handle.join();
        }
    }

    /// Live remote connections (idle plus checked out).
    pub fn active_connections(&self) -> usize {
        self.pool.active()
    }

    fn rpc(&self, socket: &mut TcpStream, features: &[bool]) -> Result<NetResult, EvalError> {
        wire::write_request(socket, features).map_err(EvalError::from_socket)?;
        wire::read_response(socket, self.num_intersections).map_err(EvalError::from_socket)
    }
}

impl Evaluator for RemoteEvaluator {
    fn evaluate(&self, features: &[bool]) -> Result<NetResult, EvalError> {
        loop {
            let mut socket = match self.pool.checkout() {
                Some(socket) => socket,
                None => {
                    if let Some(local) = &self.fallback {
                        return local.evaluate(features);
                    }
                    info!("evaluation pool exhausted, retrying");
                    thread::sleep(POOL_RETRY);
                    continue;
                }
            };

            match self.rpc(&mut socket, features) {
                Ok(result) => {
                    self.pool.checkin(socket);
                    return Ok(result);
                }
                Err(err) => {
                    // The socket may have half a response in flight; it is
                    // poisoned either way. Drop it and degrade.
                    self.pool.discard();
                    drop(socket);
                    warn!("remote evaluation failed ({err}), socket dropped");
                    if let Some(local) = &self.fallback {
                        return local.evaluate(features);
                    }
                    thread::sleep(POOL_RETRY);
                }
            }
        }
    }
}

impl Drop for RemoteEvaluator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
