//! On-disk evaluation cache: append-only record log with guard resync.
//!
//! Layout: a 4-byte magic, then guard-prefixed blocks. A guard is sixteen
//! `0xFF` bytes; between guards sit contiguous records:
//!
//! ```text
//! u64 fingerprint | f32 policy_pass | f32 winrate | u8 n | n payload bytes
//! ```
//!
//! Integers and floats are little-endian. The payload is the compressed
//! policy bitstream, byte `k` holding stream bits `[8k, 8k+8)`.
//!
//! There are no checksums; recovery relies on the guards instead. A loader
//! reads records until one fails to parse, rewinds to the failure offset
//! and scans forward for the next guard, losing at most the remainder of
//! one block. Guards are recognized by sixteen consecutive `0xFF` bytes,
//! which no record can open with: the all-ones fingerprint is reserved and
//! the writer refuses it.

use crate::bitstream::BitStream;
use crate::error::EvalError;
use crate::nn_cache::{CompressedEntry, RESERVED_FINGERPRINT};
use crate::policy_codec::validate_policy;
use anyhow::{bail, Context, Result};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::trace;

/// File magic: `\xFE L N C`.
pub const MAGIC: [u8; 4] = [0xFE, b'L', b'N', b'C'];

/// Resync marker between record blocks.
pub const GUARD: [u8; 16] = [0xFF; 16];

/// A fresh guard is emitted every this many appended records.
pub const GUARD_INTERVAL: u64 = 1024;

/// Compressed policies must fit the one-byte record length field;
/// payloads of this many bytes or more stay memory-only.
pub const MAX_COMPRESSED_LEN: usize = 256;

/// Append side of the log. One instance per cache; the cache's exclusive
/// lock serializes all writes.
pub struct CacheFileWriter {
    file: BufWriter<File>,
    /// Absolute offset of the next byte to be written.
    offset: u64,
    appends: u64,
}

impl CacheFileWriter {
    /// Open `path` for appending. `fresh` means the file did not exist:
    /// the magic goes first. Either way a guard is written so records
    /// appended by this session start resyncable.
    pub fn open_append(path: &Path, fresh: bool) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut offset = file.metadata()?.len();
        let mut writer = BufWriter::new(file);
        if fresh {
            writer.write_all(&MAGIC)?;
            offset += MAGIC.len() as u64;
        }
        writer.write_all(&GUARD)?;
        offset += GUARD.len() as u64;
        writer.flush()?;
        Ok(Self {
            file: writer,
            offset,
            appends: 0,
        })
    }

    /// Append one record, returning its absolute offset. Periodically
    /// follows the record with a guard.
    ///
    /// Entries the format cannot represent come back as
    /// [`EvalError::Unsupported`]; the caller keeps those memory-only.
    pub fn append(&mut self, fingerprint: u64, entry: &CompressedEntry) -> Result<u64, EvalError> {
        let len = entry.compressed_len();
        if len >= MAX_COMPRESSED_LEN {
            return Err(EvalError::Unsupported(
                "compressed policy exceeds the one-byte length field",
            ));
        }
        if fingerprint == RESERVED_FINGERPRINT {
            return Err(EvalError::Unsupported("reserved all-ones fingerprint"));
        }

        let pos = self.offset;
        let mut frame = BytesMut::with_capacity(17 + len);
        frame.put_u64_le(fingerprint);
        frame.put_f32_le(entry.policy_pass());
        frame.put_f32_le(entry.winrate());
        frame.put_u8(len as u8);
        for byte in entry.policy_bits().bytes() {
            frame.put_u8(byte);
        }
        debug_assert_eq!(frame.len(), 17 + len);

        self.file.write_all(&frame)?;
        self.offset += frame.len() as u64;
        self.appends += 1;
        if self.appends % GUARD_INTERVAL == 0 {
            self.file.write_all(&GUARD)?;
            self.offset += GUARD.len() as u64;
        }
        self.file.flush()?;
        Ok(pos)
    }
}

/// Parse one record. `expected` is checked against the stored fingerprint
/// when this is an indexed lookup rather than a recovery scan.
fn read_record<R: Read>(
    reader: &mut R,
    expected: Option<u64>,
) -> Result<(u64, CompressedEntry)> {
    let mut header = [0u8; 17];
    reader.read_exact(&mut header)?;

    let fingerprint = u64::from_le_bytes(header[0..8].try_into().unwrap());
    if fingerprint == RESERVED_FINGERPRINT {
        // Eight 0xFF bytes: we ran into a guard (or trailing corruption).
        bail!("record begins with guard bytes");
    }
    if let Some(want) = expected {
        if fingerprint != want {
            bail!(
                "fingerprint mismatch: record holds {:#018x}, index expected {:#018x}",
                fingerprint,
                want
            );
        }
    }

    let policy_pass = f32::from_le_bytes(header[8..12].try_into().unwrap());
    let winrate = f32::from_le_bytes(header[12..16].try_into().unwrap());
    let len = header[16] as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let bits = BitStream::from_bytes(&payload);
    Ok((
        fingerprint,
        CompressedEntry::from_parts(policy_pass, winrate, bits),
    ))
}

/// Read the record for `fingerprint` at `offset` using a private read
/// handle, so concurrent lookups never contend on a shared cursor.
pub fn read_record_at(
    path: &Path,
    offset: u64,
    fingerprint: u64,
    num_intersections: usize,
) -> Result<CompressedEntry> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut reader = BufReader::new(file);
    let (_, entry) = read_record(&mut reader, Some(fingerprint))?;
    validate_policy(entry.policy_bits(), num_intersections)?;
    Ok(entry)
}

/// Consume bytes until sixteen consecutive `0xFF` have been seen.
/// `Ok(false)` means EOF before a full guard.
fn skip_guard<R: Read>(reader: &mut R) -> std::io::Result<bool> {
    let mut run = 0usize;
    let mut byte = [0u8; 1];
    while run < GUARD.len() {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(false),
            Ok(_) => run = if byte[0] == 0xFF { run + 1 } else { 0 },
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Rebuild the fingerprint → offset index by scanning the whole log.
///
/// Each block is read record-by-record; the first parse failure rewinds
/// to the failing offset and resumes scanning for the next guard, so a
/// corrupt region costs only the tail of its own block.
pub fn scan_index(path: &Path, num_intersections: usize) -> Result<HashMap<u64, u64>> {
    let file = File::open(path)
        .with_context(|| format!("cannot open cache file '{}'", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .context("cache file shorter than its magic")?;
    if magic != MAGIC {
        bail!("'{}' is not an evaluation cache file", path.display());
    }

    let mut index = HashMap::new();
    loop {
        if !skip_guard(&mut reader)? {
            break;
        }
        loop {
            let pos = reader.stream_position()?;
            let parsed = read_record(&mut reader, None).and_then(|(fingerprint, entry)| {
                validate_policy(entry.policy_bits(), num_intersections)?;
                Ok(fingerprint)
            });
            match parsed {
                Ok(fingerprint) => {
                    index.insert(fingerprint, pos);
                }
                Err(err) => {
                    trace!(offset = pos, "record scan stopped: {err:#}");
                    reader.seek(SeekFrom::Start(pos))?;
                    break;
                }
            }
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn_cache::NetResult;
    use crate::policy_codec::QUANT_STEPS;
    use tempfile::TempDir;

    const N: usize = 9;

    fn sample(seed: u64) -> NetResult {
        let mut policy = vec![0.0f32; N];
        policy[(seed as usize) % N] = ((seed % 1024) as f32) / QUANT_STEPS;
        NetResult {
            policy,
            policy_pass: 0.25,
            winrate: seed as f32 / 100.0,
        }
    }

    fn write_file(path: &Path, count: u64) -> Vec<u64> {
        let mut writer = CacheFileWriter::open_append(path, true).unwrap();
        (0..count)
            .map(|i| {
                let entry = CompressedEntry::compress(&sample(i));
                writer.append(i + 1, &entry).unwrap()
            })
            .collect()
    }

    #[test]
    fn appended_records_scan_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nncache.bin");
        let offsets = write_file(&path, 20);

        let index = scan_index(&path, N).unwrap();
        assert_eq!(index.len(), 20);
        for (i, &off) in offsets.iter().enumerate() {
            assert_eq!(index[&(i as u64 + 1)], off);
        }
    }

    #[test]
    fn indexed_offsets_read_back_the_right_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nncache.bin");
        let offsets = write_file(&path, 8);

        let entry = read_record_at(&path, offsets[3], 4, N).unwrap();
        let result = entry.decompress(N).unwrap();
        assert_eq!(result.winrate, sample(3).winrate);

        // Wrong expected fingerprint is a parse error, not a wrong answer.
        assert!(read_record_at(&path, offsets[3], 5, N).is_err());
    }

    #[test]
    fn payload_size_boundary_is_one_byte_exact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nncache.bin");
        let mut writer = CacheFileWriter::open_append(&path, true).unwrap();

        // 255 bytes still fits the length field and must be written.
        let mut fitting = BitStream::new();
        for _ in 0..MAX_COMPRESSED_LEN - 1 {
            fitting.push_bits(8, 0xAB);
        }
        let entry = CompressedEntry::from_parts(0.0, 0.0, fitting);
        assert!(writer.append(1, &entry).is_ok());

        // One byte more no longer does.
        let mut oversized = BitStream::new();
        for _ in 0..MAX_COMPRESSED_LEN {
            oversized.push_bits(8, 0xAB);
        }
        let entry = CompressedEntry::from_parts(0.0, 0.0, oversized);
        assert!(matches!(
            writer.append(2, &entry),
            Err(EvalError::Unsupported(_))
        ));
    }

    #[test]
    fn reserved_fingerprint_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nncache.bin");
        let mut writer = CacheFileWriter::open_append(&path, true).unwrap();
        let entry = CompressedEntry::compress(&sample(1));
        assert!(matches!(
            writer.append(RESERVED_FINGERPRINT, &entry),
            Err(EvalError::Unsupported(_))
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not-a-cache");
        std::fs::write(&path, b"PK\x03\x04 something else entirely").unwrap();
        assert!(scan_index(&path, N).is_err());
    }

    #[test]
    fn guard_interval_inserts_resync_points() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nncache.bin");
        write_file(&path, GUARD_INTERVAL + 4);

        let data = std::fs::read(&path).unwrap();
        let guard_count = data
            .windows(GUARD.len())
            .filter(|w| w.iter().all(|&b| b == 0xFF))
            .count();
        // One at open plus one after the 1024th append (windows over the
        // 16-byte run count it once per alignment; require at least two
        // disjoint guards).
        assert!(guard_count >= 2, "expected >= 2 guards, saw {}", guard_count);

        let index = scan_index(&path, N).unwrap();
        assert_eq!(index.len() as u64, GUARD_INTERVAL + 4);
    }
}
