//! Two-tier cache for network evaluation results.
//!
//! The memory tier maps a 64-bit position fingerprint to a compressed
//! entry and evicts in insertion order. The optional file tier is an
//! append-only log ([`crate::cache_file`]) indexed by an in-memory
//! fingerprint → offset map: entries evicted from memory stay reachable
//! through the file until their index slot is reclaimed.
//!
//! Lookups take the lock shared and may open a private read handle on the
//! log; inserts and resizes take it exclusive, which also serializes the
//! log writer. Hit counters are atomics so readers never write under the
//! shared lock.

use crate::bitstream::BitStream;
use crate::cache_file::{self, CacheFileWriter};
use crate::error::EvalError;
use crate::policy_codec::{self, CodecError};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Maximum size of the memory tier in entries.
pub const MAX_CACHE_COUNT: usize = 150_000;

/// Minimum size of the memory tier in entries.
pub const MIN_CACHE_COUNT: usize = 6_000;

/// Budgeted bytes per memory entry; also scales the file-index budget
/// (an index slot costs about 32 bytes).
pub const ENTRY_SIZE: usize = 15_000;

/// All-ones fingerprint. Reserved: a record starting with eight `0xFF`
/// bytes would be indistinguishable from a guard, so this value never
/// reaches the file tier.
pub const RESERVED_FINGERPRINT: u64 = u64::MAX;

/// Cache hits come almost entirely from the last few moves' searches.
const PLAYOUT_CACHE_MOVES: usize = 3;

/// One network evaluation: a per-intersection move distribution plus the
/// pass probability and the winrate.
#[derive(Debug, Clone, PartialEq)]
pub struct NetResult {
    pub policy: Vec<f32>,
    pub policy_pass: f32,
    pub winrate: f32,
}

impl NetResult {
    pub fn zeroed(num_intersections: usize) -> Self {
        Self {
            policy: vec![0.0; num_intersections],
            policy_pass: 0.0,
            winrate: 0.0,
        }
    }
}

/// A [`NetResult`] with the policy vector run through the variable-length
/// codec. Scalars stay bit-exact; the policy quantizes to 1/2048 steps.
#[derive(Debug, Clone)]
pub struct CompressedEntry {
    policy_pass: f32,
    winrate: f32,
    policy_bits: BitStream,
}

impl CompressedEntry {
    pub fn compress(result: &NetResult) -> Self {
        Self {
            policy_pass: result.policy_pass,
            winrate: result.winrate,
            policy_bits: policy_codec::encode_policy(&result.policy),
        }
    }

    pub fn decompress(&self, num_intersections: usize) -> Result<NetResult, CodecError> {
        let policy = policy_codec::decode_policy(&self.policy_bits, num_intersections)?;
        Ok(NetResult {
            policy,
            policy_pass: self.policy_pass,
            winrate: self.winrate,
        })
    }

    /// Serialized policy length in bytes.
    pub fn compressed_len(&self) -> usize {
        self.policy_bits.byte_len()
    }

    pub(crate) fn from_parts(policy_pass: f32, winrate: f32, policy_bits: BitStream) -> Self {
        Self {
            policy_pass,
            winrate,
            policy_bits,
        }
    }

    pub(crate) fn policy_bits(&self) -> &BitStream {
        &self.policy_bits
    }

    pub(crate) fn policy_pass(&self) -> f32 {
        self.policy_pass
    }

    pub(crate) fn winrate(&self) -> f32 {
        self.winrate
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub file_hits: u64,
    pub lookups: u64,
    pub inserts: u64,
    pub mem_entries: usize,
    pub file_entries: usize,
}

struct CacheInner {
    /// Requested total budget (memory + file index), in entries.
    size: usize,
    max_mem_entries: usize,
    max_file_entries: usize,

    mem: HashMap<u64, CompressedEntry>,
    /// Insertion order of `mem` keys; front is the eviction candidate.
    order: VecDeque<u64>,

    file_index: HashMap<u64, u64>,
    writer: Option<CacheFileWriter>,
    filename: Option<PathBuf>,
}

impl CacheInner {
    /// Recompute the per-tier budgets. With a file tier the first
    /// MIN_CACHE_COUNT entries stay in memory, the band up to
    /// MAX_CACHE_COUNT is split evenly, and everything past that is file
    /// index; the leftover entry budget converts to index slots at
    /// ENTRY_SIZE / 32 slots per entry.
    fn rebudget(&mut self, size: usize, reserve_file: bool) {
        self.size = size;
        let file_tier = reserve_file || self.writer.is_some() || !self.file_index.is_empty();
        let max_mem = if file_tier {
            let clamped = size.max(MIN_CACHE_COUNT);
            (MIN_CACHE_COUNT + (clamped - MIN_CACHE_COUNT) / 2).min(MAX_CACHE_COUNT)
        } else {
            size
        };
        self.max_mem_entries = max_mem;
        self.max_file_entries = self.size.saturating_sub(max_mem) * ENTRY_SIZE / 32;
    }

    fn evict_to_budget(&mut self) {
        while self.order.len() > self.max_mem_entries {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.mem.remove(&oldest);
                }
                None => break,
            }
        }
        // Index eviction only unlinks the entry; the record stays on disk.
        while self.file_index.len() > self.max_file_entries {
            match self.file_index.keys().next().copied() {
                Some(key) => {
                    self.file_index.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// Fingerprint-keyed evaluation cache with an optional disk tier.
pub struct NnCache {
    num_intersections: usize,
    hits: AtomicU64,
    file_hits: AtomicU64,
    lookups: AtomicU64,
    inserts: AtomicU64,
    inner: RwLock<CacheInner>,
}

impl NnCache {
    /// `size` is the total entry budget across both tiers; the split is
    /// recomputed whenever the file tier comes or goes.
    pub fn new(num_intersections: usize, size: usize) -> Self {
        let mut inner = CacheInner {
            size,
            max_mem_entries: 0,
            max_file_entries: 0,
            mem: HashMap::new(),
            order: VecDeque::new(),
            file_index: HashMap::new(),
            writer: None,
            filename: None,
        };
        inner.rebudget(size, false);
        Self {
            num_intersections,
            hits: AtomicU64::new(0),
            file_hits: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            inner: RwLock::new(inner),
        }
    }

    /// Size the cache from the configured playout budget.
    pub fn set_size_from_playouts(&self, max_playouts: usize) {
        let size = max_playouts
            .saturating_mul(PLAYOUT_CACHE_MOVES)
            .clamp(MIN_CACHE_COUNT, MAX_CACHE_COUNT);
        self.resize(size, false);
    }

    pub fn resize(&self, size: usize, reserve_file: bool) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.rebudget(size, reserve_file);
        inner.evict_to_budget();
        debug!(
            "cache budgeting: {} memory entries, {} file-index entries",
            inner.max_mem_entries, inner.max_file_entries
        );
    }

    /// Find an entry. Memory first, then the on-disk log through a private
    /// read handle. Any record or codec failure is reported as a miss.
    pub fn lookup(&self, fingerprint: u64) -> Option<NetResult> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.read();

        if let Some(entry) = inner.mem.get(&fingerprint) {
            return match entry.decompress(self.num_intersections) {
                Ok(result) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(result)
                }
                Err(err) => {
                    warn!("cached entry for {fingerprint:#018x} failed to decode: {err}");
                    None
                }
            };
        }

        let offset = *inner.file_index.get(&fingerprint)?;
        let path = inner.filename.as_deref()?;
        match cache_file::read_record_at(path, offset, fingerprint, self.num_intersections)
            .and_then(|entry| Ok(entry.decompress(self.num_intersections)?))
        {
            Ok(result) => {
                self.file_hits.fetch_add(1, Ordering::Relaxed);
                Some(result)
            }
            Err(err) => {
                debug!("file record for {fingerprint:#018x} at {offset} unreadable: {err:#}");
                None
            }
        }
    }

    /// Insert an evaluation. Re-inserting a fingerprint already in memory
    /// leaves the stored value untouched (same position, same network).
    ///
    /// The record also goes to the file tier when one is open. Entries the
    /// file format cannot represent (compressed policy too large for the
    /// one-byte length field, reserved all-ones fingerprint) come back as
    /// `Unsupported` and stay memory-only. An I/O failure disables the
    /// file tier for the rest of the session; memory inserts continue.
    pub fn insert(&self, fingerprint: u64, result: &NetResult) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        if inner.mem.contains_key(&fingerprint) {
            return;
        }

        let entry = CompressedEntry::compress(result);

        if let Some(writer) = inner.writer.as_mut() {
            match writer.append(fingerprint, &entry) {
                Ok(offset) => {
                    inner.file_index.insert(fingerprint, offset);
                }
                Err(EvalError::Unsupported(reason)) => {
                    debug!("entry {fingerprint:#018x} kept memory-only: {reason}");
                }
                Err(err) => {
                    warn!("cache file append failed, disabling file tier: {err}");
                    inner.writer = None;
                }
            }
        }

        inner.mem.insert(fingerprint, entry);
        inner.order.push_back(fingerprint);
        inner.evict_to_budget();
    }

    /// Attach (or create) an on-disk cache file and rebuild its index.
    ///
    /// Returns false and detaches the file on any of: missing or
    /// unreadable file in read-only mode, bad magic, an empty index in
    /// read-only mode, or a failure to open the append side.
    pub fn load_cachefile(&self, path: impl AsRef<Path>, read_only: bool) -> bool {
        let path = path.as_ref();
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        inner.writer = None;
        inner.file_index.clear();
        inner.filename = Some(path.to_path_buf());

        let existed = path.exists();
        if !existed && read_only {
            inner.filename = None;
            return false;
        }

        // Budget for the file tier before the index fills up.
        let size = inner.size;
        inner.rebudget(size, true);
        inner.evict_to_budget();

        if existed {
            match cache_file::scan_index(path, self.num_intersections) {
                Ok(index) => {
                    inner.file_index = index;
                    inner.evict_to_budget();
                }
                Err(err) => {
                    warn!("failed to load cache file '{}': {err:#}", path.display());
                    inner.filename = None;
                    return false;
                }
            }
        }

        if !inner.file_index.is_empty() {
            info!(
                "loaded {} entries from disk cache '{}'",
                inner.file_index.len(),
                path.display()
            );
        } else if read_only {
            inner.filename = None;
            return false;
        }

        if !read_only {
            match CacheFileWriter::open_append(path, !existed) {
                Ok(writer) => {
                    if !existed {
                        info!("created disk cache '{}'", path.display());
                    }
                    inner.writer = Some(writer);
                }
                Err(err) => {
                    warn!(
                        "cannot open cache file '{}' for append: {err}",
                        path.display()
                    );
                    inner.filename = None;
                    return false;
                }
            }
        }

        true
    }

    /// `(hits, lookups)` for the memory tier.
    pub fn hit_rate(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.lookups.load(Ordering::Relaxed),
        )
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            file_hits: self.file_hits.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            mem_entries: inner.mem.len(),
            file_entries: inner.file_index.len(),
        }
    }

    /// Current `(memory, file-index)` entry budgets.
    pub fn budget(&self) -> (usize, usize) {
        let inner = self.inner.read();
        (inner.max_mem_entries, inner.max_file_entries)
    }

    /// Path of the attached cache file, if one survived loading.
    pub fn cachefile(&self) -> Option<PathBuf> {
        self.inner.read().filename.clone()
    }

    /// Rough memory footprint of both tiers, in bytes.
    pub fn estimated_size(&self) -> usize {
        let inner = self.inner.read();
        inner.order.len() * ENTRY_SIZE + inner.file_index.len() * 32
    }

    pub fn dump_stats(&self) {
        let stats = self.stats();
        let denom = (stats.lookups + 1) as f64;
        info!(
            "NNCache memory: {}/{} hits/lookups = {:.1}% hitrate, {} inserts, {} entries",
            stats.hits,
            stats.lookups,
            100.0 * stats.hits as f64 / denom,
            stats.inserts,
            stats.mem_entries
        );
        info!(
            "NNCache file: {}/{} hits/lookups = {:.1}% hitrate, {} inserts, {} entries",
            stats.file_hits,
            stats.lookups,
            100.0 * stats.file_hits as f64 / denom,
            stats.inserts,
            stats.file_entries
        );
    }
}
