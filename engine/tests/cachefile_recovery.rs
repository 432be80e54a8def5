//! On-disk cache round-trip and corruption recovery.

use tenuki_engine::policy_codec::QUANT_STEPS;
use tenuki_engine::{NetResult, NnCache};
use tempfile::TempDir;

const N: usize = 9;
const CACHE_SIZE: usize = 10_000;

/// Codec-exact result so reloads compare bit-for-bit.
fn quantized(seed: u64) -> NetResult {
    let mut policy = vec![0.0f32; N];
    policy[(seed as usize) % N] = ((seed * 37 % 2048) as f32) / QUANT_STEPS;
    NetResult {
        policy,
        policy_pass: (seed % 7) as f32 / 8.0,
        winrate: (seed % 100) as f32 / 100.0,
    }
}

/// All-zero policy: every record serializes to the same 18 bytes, which
/// the corruption tests rely on to compute offsets.
fn zero_policy(seed: u64) -> NetResult {
    NetResult {
        policy: vec![0.0f32; N],
        policy_pass: 0.5,
        winrate: (seed % 100) as f32 / 100.0,
    }
}

const ZERO_RECORD_LEN: u64 = 17 + 1;
const DATA_START: u64 = 4 + 16; // magic + opening guard

#[test]
fn reloaded_cache_serves_original_results() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nncache.bin");

    let cache = NnCache::new(N, CACHE_SIZE);
    assert!(cache.load_cachefile(&path, false));
    for seed in 1..=200u64 {
        cache.insert(seed, &quantized(seed));
    }
    drop(cache);

    let reloaded = NnCache::new(N, CACHE_SIZE);
    assert!(reloaded.load_cachefile(&path, true));
    for seed in 1..=200u64 {
        let found = reloaded
            .lookup(seed)
            .unwrap_or_else(|| panic!("entry {} lost across reload", seed));
        assert_eq!(found, quantized(seed));
    }
    let stats = reloaded.stats();
    assert_eq!(stats.file_hits, 200);
    assert_eq!(stats.hits, 0);
}

#[test]
fn read_only_reload_of_empty_file_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nncache.bin");

    // Create the file but never insert.
    let cache = NnCache::new(N, CACHE_SIZE);
    assert!(cache.load_cachefile(&path, false));
    drop(cache);

    let reloaded = NnCache::new(N, CACHE_SIZE);
    assert!(!reloaded.load_cachefile(&path, true));
    assert!(reloaded.cachefile().is_none());
}

#[test]
fn truncated_tail_loses_only_the_tail() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nncache.bin");

    let cache = NnCache::new(N, CACHE_SIZE);
    assert!(cache.load_cachefile(&path, false));
    for seed in 1..=300u64 {
        cache.insert(seed, &zero_policy(seed));
    }
    drop(cache);

    let full_len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(full_len, DATA_START + 300 * ZERO_RECORD_LEN);
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(full_len - 100).unwrap();
    drop(file);

    let reloaded = NnCache::new(N, CACHE_SIZE);
    assert!(reloaded.load_cachefile(&path, true));
    // 100 bytes cover the last five full records plus a partial sixth.
    for seed in 1..=294u64 {
        assert!(
            reloaded.lookup(seed).is_some(),
            "entry {} before the truncation point was lost",
            seed
        );
    }
    for seed in 295..=300u64 {
        assert!(reloaded.lookup(seed).is_none());
    }
}

#[test]
fn corruption_mid_block_resyncs_at_next_guard() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nncache.bin");

    // 1100 appends put one guard at open and one after append 1024.
    let cache = NnCache::new(N, CACHE_SIZE);
    assert!(cache.load_cachefile(&path, false));
    for seed in 1..=1100u64 {
        cache.insert(seed, &zero_policy(seed));
    }
    drop(cache);

    // Smash the length byte of record 500 (0-based): the parser swallows
    // the following records as payload and fails validation.
    let corrupt_at = DATA_START + 500 * ZERO_RECORD_LEN + 16;
    let mut data = std::fs::read(&path).unwrap();
    data[corrupt_at as usize] = 0xF0;
    std::fs::write(&path, &data).unwrap();

    let reloaded = NnCache::new(N, CACHE_SIZE);
    assert!(reloaded.load_cachefile(&path, true));

    // Records before the corruption survive.
    for seed in 1..=500u64 {
        assert!(reloaded.lookup(seed).is_some(), "entry {} lost", seed);
    }
    // The corrupt record and the rest of its block are gone.
    for seed in 501..=1024u64 {
        assert!(reloaded.lookup(seed).is_none(), "entry {} should be lost", seed);
    }
    // Everything after the mid-file guard is recovered.
    for seed in 1025..=1100u64 {
        assert!(reloaded.lookup(seed).is_some(), "entry {} not resynced", seed);
    }
}

#[test]
fn append_resumes_after_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nncache.bin");

    let cache = NnCache::new(N, CACHE_SIZE);
    assert!(cache.load_cachefile(&path, false));
    for seed in 1..=50u64 {
        cache.insert(seed, &quantized(seed));
    }
    drop(cache);

    // Reopen writable and keep appending.
    let cache = NnCache::new(N, CACHE_SIZE);
    assert!(cache.load_cachefile(&path, false));
    for seed in 51..=100u64 {
        cache.insert(seed, &quantized(seed));
    }
    drop(cache);

    let reloaded = NnCache::new(N, CACHE_SIZE);
    assert!(reloaded.load_cachefile(&path, true));
    for seed in 1..=100u64 {
        assert_eq!(reloaded.lookup(seed).unwrap(), quantized(seed));
    }
}
