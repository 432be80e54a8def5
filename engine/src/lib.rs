//! tenuki-engine - Evaluation cache and distributed offload for a
//! Monte-Carlo Go engine.
//!
//! Two subsystems behind one `Evaluator` seam:
//!
//! - **NnCache**: position fingerprint → network result, with an in-memory
//!   tier holding codec-compressed entries and an optional append-only
//!   on-disk tier indexed in memory and resynced through guard markers.
//! - **Distributed evaluation**: a pooled TCP client that shards forward
//!   passes across evaluation servers with per-call deadlines and local
//!   fallback, and the matching thread-per-connection server.
//!
//! The tree search, board logic, feature extraction and weight loading
//! live in the embedding engine; they reach this crate only through
//! [`Evaluator`], [`CachedEvaluator`] and [`NnCache`].

// ===== Core modules =====

// LSB-first packed bit buffer backing the policy codec
pub mod bitstream;

// Variable-length policy compression (V/Z/X alphabet)
pub mod policy_codec;

// Append-only on-disk cache log with guard-based resync
pub mod cache_file;

// Two-tier evaluation cache (memory + file index)
pub mod nn_cache;

// Evaluation capability trait and the cache-fronted facade
pub mod evaluator;

// Fixed-frame request/response protocol and the hash handshake
pub mod wire;

// Idle-socket pool shared by evaluator threads and the reconnector
pub mod pool;

// Remote evaluator: pooled RPCs, deadlines, fallback, reconnection
pub mod client;

// Evaluation server: admission-controlled thread-per-connection loop
pub mod server;

// Configuration record consumed by cache, client and server
pub mod config;

// Error kinds shared across the subsystem
pub mod error;

// ===== Public API =====

pub use bitstream::BitStream;
pub use client::RemoteEvaluator;
pub use config::EvalConfig;
pub use error::EvalError;
pub use evaluator::{CachedEvaluator, Evaluator, UniformEvaluator};
pub use nn_cache::{
    CacheStats, CompressedEntry, NetResult, NnCache, ENTRY_SIZE, MAX_CACHE_COUNT, MIN_CACHE_COUNT,
    RESERVED_FINGERPRINT,
};
pub use policy_codec::{decode_policy, encode_policy, validate_policy, CodecError};
pub use pool::{ConnectionPool, ServerAddr};
pub use server::EvalServer;
