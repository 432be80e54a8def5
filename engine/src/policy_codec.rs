//! Variable-length codec for network policy vectors.
//!
//! A policy is a per-intersection probability in `[0, 1]`, quantized to
//! 1/2048 steps. Most entries are zero and the nonzero ones cluster near
//! small values, so the codec spends short codes on small quanta and on
//! zero runs:
//!
//! - `V0..V63` emits one quantum equal to the symbol index,
//! - `Z0..Z15` emits `index + 2` consecutive zero quanta,
//! - `X0..X31` extends the previous symbol: after a `V` it adds
//!   `64 * (index + 1)` to the value just emitted, after a `Z` it appends
//!   `(index + 1) * 16` further zeros.
//!
//! Symbols are written with a canonical prefix code (3 to 6 bit prefixes
//! plus up to 5 index bits), packed LSB-first via [`BitStream`].

use crate::bitstream::BitStream;
use thiserror::Error;

/// Quantization steps per unit probability.
pub const QUANT_STEPS: f32 = 2048.0;

const V_BASE: usize = 0;
const Z_BASE: usize = 64;
const X_BASE: usize = 80;
const SYMBOL_COUNT: usize = 112;

/// Widest prefix (6 bits) plus widest index field (4 bits) fits in a
/// 10-bit peek window.
const PEEK_BITS: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// An `X` symbol appeared with no `V` or `Z` immediately before it.
    #[error("extension symbol without a preceding value or zero-run")]
    UnexpectedExtension,
    /// The stream tried to emit more quanta than the policy holds.
    #[error("compressed policy overruns {0} intersections")]
    BufferOverflow(usize),
    /// Consumed bits disagree with the stream length beyond byte padding.
    #[error("compressed policy length mismatch (consumed {consumed} of {len} bits)")]
    LengthMismatch { consumed: usize, len: usize },
}

/// One slice of the code table: `count` consecutive symbols share `code`
/// (low `width` bits) and are told apart by `log2(count)` index bits
/// packed immediately above the prefix.
struct CodeSlice {
    code: u16,
    width: u16,
    count: u16,
}

#[rustfmt::skip]
static CODE_TABLE: [CodeSlice; 18] = [
    CodeSlice { code: 0x04, width: 4, count: 1 },  // V0
    CodeSlice { code: 0x00, width: 3, count: 1 },  // V1
    CodeSlice { code: 0x0c, width: 4, count: 2 },  // V2..V3
    CodeSlice { code: 0x02, width: 4, count: 4 },  // V4..V7
    CodeSlice { code: 0x0a, width: 4, count: 8 },  // V8..V15
    CodeSlice { code: 0x06, width: 4, count: 16 }, // V16..V31
    CodeSlice { code: 0x0e, width: 4, count: 32 }, // V32..V63
    CodeSlice { code: 0x01, width: 4, count: 1 },  // Z0
    CodeSlice { code: 0x09, width: 4, count: 1 },  // Z1
    CodeSlice { code: 0x05, width: 4, count: 2 },  // Z2..Z3
    CodeSlice { code: 0x0d, width: 4, count: 4 },  // Z4..Z7
    CodeSlice { code: 0x03, width: 4, count: 8 },  // Z8..Z15
    CodeSlice { code: 0x0b, width: 4, count: 1 },  // X0
    CodeSlice { code: 0x07, width: 5, count: 1 },  // X1
    CodeSlice { code: 0x17, width: 5, count: 2 },  // X2..X3
    CodeSlice { code: 0x0f, width: 5, count: 4 },  // X4..X7
    CodeSlice { code: 0x1f, width: 6, count: 8 },  // X8..X15
    CodeSlice { code: 0x3f, width: 6, count: 16 }, // X16..X31
];

fn index_bits(count: u16) -> usize {
    count.trailing_zeros() as usize
}

fn push_symbol(bits: &mut BitStream, symbol: usize) {
    debug_assert!(symbol < SYMBOL_COUNT);
    let mut base = 0usize;
    for slice in &CODE_TABLE {
        let count = slice.count as usize;
        if symbol < base + count {
            let code = u64::from(slice.code) | (((symbol - base) as u64) << slice.width);
            bits.push_bits(slice.width as usize + index_bits(slice.count), code);
            return;
        }
        base += count;
    }
    unreachable!("symbol {} outside the code alphabet", symbol);
}

/// Decode one symbol at bit position `at`. The table is a complete prefix
/// code over the low bits, so a slice always matches. Returns the symbol
/// and the new bit position.
fn read_symbol(bits: &BitStream, at: usize) -> (usize, usize) {
    let window = bits.read_bits(at, PEEK_BITS);
    let mut base = 0usize;
    for slice in &CODE_TABLE {
        let prefix_mask = (1u64 << slice.width) - 1;
        if u64::from(slice.code) == window & prefix_mask {
            let index = (window >> slice.width) as usize % slice.count as usize;
            return (base + index, at + slice.width as usize + index_bits(slice.count));
        }
        base += slice.count as usize;
    }
    unreachable!("prefix code table is exhaustive");
}

fn quantize(p: f32) -> u32 {
    (p * QUANT_STEPS) as u32
}

/// Compress a policy vector. Probabilities outside `[0, 1]` are the
/// caller's bug; `1.0` itself encodes exactly (`V0` plus the top
/// extension).
pub fn encode_policy(policy: &[f32]) -> BitStream {
    let mut bits = BitStream::new();
    let n = policy.len();
    let mut i = 0usize;
    while i < n {
        let q = quantize(policy[i]) as usize;
        if q == 0 {
            let mut run = 0usize;
            while i < n && quantize(policy[i]) == 0 {
                i += 1;
                run += 1;
            }
            if run == 1 {
                push_symbol(&mut bits, V_BASE);
            } else {
                let offset = (run - 2) % 16;
                let bias = (run - 2) / 16;
                push_symbol(&mut bits, Z_BASE + offset);
                if bias != 0 {
                    push_symbol(&mut bits, X_BASE + bias - 1);
                }
            }
        } else {
            let offset = q % 64;
            let bias = q / 64;
            push_symbol(&mut bits, V_BASE + offset);
            if bias != 0 {
                push_symbol(&mut bits, X_BASE + bias - 1);
            }
            i += 1;
        }
    }
    bits
}

#[derive(Clone, Copy, PartialEq)]
enum PrevSymbol {
    None,
    Value,
    ZeroRun,
}

/// Shared walker behind decode and validation. Emits quanta into `out`
/// when present, tracks the output cursor either way, and enforces the
/// trailing-slack rule: serialization pads to a whole byte, so up to 8
/// unread bits at the tail are legal and anything else is corruption.
fn walk(bits: &BitStream, n: usize, mut out: Option<&mut [f32]>) -> Result<(), CodecError> {
    let mut at = 0usize;
    let mut emitted = 0usize;
    let mut prev = PrevSymbol::None;

    let emit = |cursor: usize, quantum: u32, out: &mut Option<&mut [f32]>| {
        if let Some(policy) = out {
            policy[cursor] = quantum as f32 / QUANT_STEPS;
        }
    };

    while emitted < n {
        let (symbol, next) = read_symbol(bits, at);
        at = next;

        if symbol < Z_BASE {
            emit(emitted, symbol as u32, &mut out);
            emitted += 1;
            prev = PrevSymbol::Value;
        } else if symbol < X_BASE {
            let run = symbol - Z_BASE + 2;
            if emitted + run > n {
                return Err(CodecError::BufferOverflow(n));
            }
            for _ in 0..run {
                emit(emitted, 0, &mut out);
                emitted += 1;
            }
            prev = PrevSymbol::ZeroRun;
        } else {
            let bias = (symbol - X_BASE + 1) as u32;
            match prev {
                PrevSymbol::Value => {
                    if let Some(policy) = out.as_deref_mut() {
                        policy[emitted - 1] += 64.0 * bias as f32 / QUANT_STEPS;
                    }
                }
                PrevSymbol::ZeroRun => {
                    let run = bias as usize * 16;
                    if emitted + run > n {
                        return Err(CodecError::BufferOverflow(n));
                    }
                    for _ in 0..run {
                        emit(emitted, 0, &mut out);
                        emitted += 1;
                    }
                }
                PrevSymbol::None => return Err(CodecError::UnexpectedExtension),
            }
            prev = PrevSymbol::None;
        }
    }

    let len = bits.len();
    if at > len || at + 8 < len {
        return Err(CodecError::LengthMismatch { consumed: at, len });
    }
    Ok(())
}

/// Decompress into a fresh length-`n` policy vector.
pub fn decode_policy(bits: &BitStream, n: usize) -> Result<Vec<f32>, CodecError> {
    let mut policy = vec![0.0f32; n];
    walk(bits, n, Some(&mut policy))?;
    Ok(policy)
}

/// Structural check without materializing the policy. Used when indexing
/// on-disk records, where a parse failure means "resync to the next guard"
/// rather than "return this entry".
pub fn validate_policy(bits: &BitStream, n: usize) -> Result<(), CodecError> {
    walk(bits, n, None)
}
