//! Evaluation server: serves forward passes to remote engines.
//!
//! Accept loop with admission control — at most `desired_threads` worker
//! threads, one per connection; a connection past the cap is shut down
//! before the handshake, which the client's connection probe observes as
//! a dropped slot. Workers exchange the weights hash, then loop reading a
//! feature block, delegating to the local evaluator and writing the
//! result block until the peer hangs up.
//!
//! The accept loop polls a shutdown flag between non-blocking accepts, so
//! `shutdown()` stops admissions and `serve` then waits briefly for
//! workers to drain; workers parked on an idle peer exit when that peer
//! disconnects.

use crate::config::EvalConfig;
use crate::evaluator::Evaluator;
use crate::wire;
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Accept-loop poll period while idle.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// How long `serve` waits for workers after shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Decrements the live-worker count when a worker exits, however it exits.
struct WorkerGuard {
    live: Arc<AtomicUsize>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct EvalServer {
    evaluator: Arc<dyn Evaluator>,
    model_hash: u64,
    max_workers: usize,
    feature_len: usize,
    live: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl EvalServer {
    pub fn new(evaluator: Arc<dyn Evaluator>, model_hash: u64, config: &EvalConfig) -> Self {
        Self {
            evaluator,
            model_hash,
            max_workers: config.desired_threads,
            feature_len: config.feature_len(),
            live: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag shared with the accept loop; flip it (or call [`Self::shutdown`])
    /// to stop serving.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Worker threads currently serving connections.
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn bind_and_serve(&self, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .with_context(|| format!("cannot bind evaluation server to port {port}"))?;
        self.serve(listener)
    }

    /// Run the accept loop on an already-bound listener (lets tests bind
    /// port 0 and read the assigned address first).
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        listener
            .set_nonblocking(true)
            .context("cannot poll the eval listener")?;
        info!(
            "evaluation server listening on {} (max {} workers)",
            listener.local_addr()?,
            self.max_workers
        );

        while !self.shutdown.load(Ordering::Acquire) {
            let (socket, peer) = match listener.accept() {
                Ok(conn) => conn,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
                Err(err) => return Err(err).context("accept failed"),
            };

            // Admission control: claim a worker slot before spawning.
            let claimed = self.live.fetch_add(1, Ordering::AcqRel);
            if claimed >= self.max_workers {
                self.live.fetch_sub(1, Ordering::AcqRel);
                warn!("dropping connection from {peer}: worker limit {} reached", self.max_workers);
                let _ = socket.shutdown(Shutdown::Both);
                continue;
            }

            let guard = WorkerGuard {
                live: self.live.clone(),
            };
            let evaluator = self.evaluator.clone();
            let model_hash = self.model_hash;
            let feature_len = self.feature_len;
            let worker_id = claimed;
            thread::Builder::new()
                .name(format!("nn-worker-{worker_id}"))
                .spawn(move || {
                    let _guard = guard;
                    info!("evaluation connection established from {peer} (worker {worker_id})");
                    if let Err(err) = run_worker(socket, evaluator, model_hash, feature_len) {
                        warn!("worker for {peer} exited: {err:#}");
                    }
                    info!("evaluation connection closed from {peer}");
                })
                .context("spawn worker thread")?;
        }

        // Stop admitting and give in-flight workers a moment to finish.
        let deadline = Instant::now() + DRAIN_GRACE;
        while self.live_workers() > 0 && Instant::now() < deadline {
            thread::sleep(ACCEPT_POLL);
        }
        info!("evaluation server stopped ({} workers still parked)", self.live_workers());
        Ok(())
    }
}

fn run_worker(
    mut socket: TcpStream,
    evaluator: Arc<dyn Evaluator>,
    model_hash: u64,
    feature_len: usize,
) -> Result<()> {
    // The listener polls non-blocking; the conversation must not.
    socket.set_nonblocking(false).context("worker socket mode")?;
    socket.set_nodelay(true).ok();

    // Handshake: the client sent its hash first and has already dropped
    // the connection if ours disagrees; answer with ours and trust it.
    let client_hash = wire::read_hash(&mut socket).context("handshake read")?;
    wire::write_hash(&mut socket, model_hash).context("handshake write")?;
    if client_hash != model_hash {
        warn!(
            "client weights hash {client_hash:#018x} differs from ours {model_hash:#018x}; serving anyway"
        );
    }

    loop {
        let features = match wire::read_request(&mut socket, feature_len) {
            Ok(Some(features)) => features,
            Ok(None) => return Ok(()), // peer closed cleanly
            Err(err) => return Err(err).context("request read"),
        };
        let result = evaluator
            .evaluate(&features)
            .context("local evaluation failed")?;
        wire::write_response(&mut socket, &result).context("response write")?;
    }
}
