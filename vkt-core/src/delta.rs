//! Delta Encoding Between Related Payloads
//!
//! A delta rebuilds a target payload from a base payload using two
//! operations: copy a range of the base, or insert literal bytes.
//!
//! # Wire format
//!
//! ```text
//! magic 'D' | varint base_len | varint target_len | op*
//! op := 0x00 varint offset varint len      (copy from base)
//!     | 0x01 varint len bytes[len]          (insert literal)
//! ```
//!
//! Matching is greedy over fixed-size windows of the base, which finds
//! shared runs at any offset (edits, insertions, moved sections).

use std::collections::HashMap;
use thiserror::Error;

const DELTA_MAGIC: u8 = b'D';
const OP_COPY: u8 = 0x00;
const OP_INSERT: u8 = 0x01;

/// Shortest run worth a copy op; also the window indexed in the base.
const MIN_MATCH: usize = 8;
/// Candidate positions remembered per window, bounding work on repetitive input.
const MAX_CANDIDATES: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeltaError {
    #[error("Delta is truncated")]
    Truncated,

    #[error("Not a delta (bad magic byte {0:#04x})")]
    BadMagic(u8),

    #[error("Unknown delta op {0:#04x}")]
    UnknownOp(u8),

    #[error("Base length mismatch: delta expects {expected}, got {actual}")]
    BaseLengthMismatch { expected: u64, actual: u64 },

    #[error("Copy range {offset}+{len} exceeds base length {base_len}")]
    CopyOutOfRange { offset: u64, len: u64, base_len: u64 },

    #[error("Reconstructed length {actual} does not match declared {expected}")]
    TargetLengthMismatch { expected: u64, actual: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOp {
    Copy { offset: usize, len: usize },
    Insert(Vec<u8>),
}

/// Compute the op sequence that turns `base` into `target`.
pub fn diff_ops(base: &[u8], target: &[u8]) -> Vec<DeltaOp> {
    let mut ops = Vec::new();
    if base.len() < MIN_MATCH || target.len() < MIN_MATCH {
        if !target.is_empty() {
            ops.push(DeltaOp::Insert(target.to_vec()));
        }
        return ops;
    }

    let mut windows: HashMap<&[u8], Vec<usize>> = HashMap::new();
    for offset in 0..=base.len() - MIN_MATCH {
        let slot = windows.entry(&base[offset..offset + MIN_MATCH]).or_default();
        if slot.len() < MAX_CANDIDATES {
            slot.push(offset);
        }
    }

    let mut literal = Vec::new();
    let mut pos = 0;
    while pos < target.len() {
        let best = if pos + MIN_MATCH <= target.len() {
            windows.get(&target[pos..pos + MIN_MATCH]).and_then(|candidates| {
                candidates
                    .iter()
                    .map(|&start| (start, match_len(&base[start..], &target[pos..])))
                    .max_by_key(|&(start, len)| (len, std::cmp::Reverse(start)))
            })
        } else {
            None
        };

        match best {
            Some((offset, len)) if len >= MIN_MATCH => {
                if !literal.is_empty() {
                    ops.push(DeltaOp::Insert(std::mem::take(&mut literal)));
                }
                ops.push(DeltaOp::Copy { offset, len });
                pos += len;
            }
            _ => {
                literal.push(target[pos]);
                pos += 1;
            }
        }
    }
    if !literal.is_empty() {
        ops.push(DeltaOp::Insert(literal));
    }
    ops
}

fn match_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Encode a delta from `base` to `target`.
pub fn encode(base: &[u8], target: &[u8]) -> Vec<u8> {
    let ops = diff_ops(base, target);
    let mut buf = Vec::with_capacity(16 + target.len() / 4);
    buf.push(DELTA_MAGIC);
    write_varint(&mut buf, base.len() as u64);
    write_varint(&mut buf, target.len() as u64);
    for op in ops {
        match op {
            DeltaOp::Copy { offset, len } => {
                buf.push(OP_COPY);
                write_varint(&mut buf, offset as u64);
                write_varint(&mut buf, len as u64);
            }
            DeltaOp::Insert(bytes) => {
                buf.push(OP_INSERT);
                write_varint(&mut buf, bytes.len() as u64);
                buf.extend_from_slice(&bytes);
            }
        }
    }
    buf
}

/// Rebuild the target from `base` and an encoded delta.
pub fn apply(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let (&magic, mut rest) = delta.split_first().ok_or(DeltaError::Truncated)?;
    if magic != DELTA_MAGIC {
        return Err(DeltaError::BadMagic(magic));
    }

    let base_len = read_varint(&mut rest)?;
    if base_len != base.len() as u64 {
        return Err(DeltaError::BaseLengthMismatch {
            expected: base_len,
            actual: base.len() as u64,
        });
    }
    let target_len = read_varint(&mut rest)?;

    // The declared length is untrusted; size the buffer from what is on hand.
    let hint = target_len.min(base_len.saturating_add(rest.len() as u64));
    let mut out = Vec::with_capacity(usize::try_from(hint).unwrap_or(0));
    while let Some((&op, tail)) = rest.split_first() {
        rest = tail;
        match op {
            OP_COPY => {
                let offset = read_varint(&mut rest)?;
                let len = read_varint(&mut rest)?;
                let end = offset.checked_add(len).filter(|&end| end <= base_len).ok_or(
                    DeltaError::CopyOutOfRange { offset, len, base_len },
                )?;
                out.extend_from_slice(&base[offset as usize..end as usize]);
            }
            OP_INSERT => {
                let len = read_varint(&mut rest)? as usize;
                if rest.len() < len {
                    return Err(DeltaError::Truncated);
                }
                let (bytes, tail) = rest.split_at(len);
                out.extend_from_slice(bytes);
                rest = tail;
            }
            other => return Err(DeltaError::UnknownOp(other)),
        }
        if out.len() as u64 > target_len {
            break;
        }
    }

    if out.len() as u64 != target_len {
        return Err(DeltaError::TargetLengthMismatch {
            expected: target_len,
            actual: out.len() as u64,
        });
    }
    Ok(out)
}

fn write_varint(buf: &mut Vec<u8>, mut n: u64) {
    while n > 127 {
        buf.push((n as u8 & 0x7F) | 0x80);
        n >>= 7;
    }
    buf.push(n as u8 & 0x7F);
}

fn read_varint(data: &mut &[u8]) -> Result<u64, DeltaError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let (&byte, rest) = data.split_first().ok_or(DeltaError::Truncated)?;
        *data = rest;
        // The tenth byte may only carry the top bit of a u64.
        if shift > 63 || (shift == 63 && byte & 0x7F > 1) {
            return Err(DeltaError::Truncated);
        }
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // xorshift32; non-periodic at these lengths so every window is distinct
    fn sample(len: usize, seed: u32) -> Vec<u8> {
        let mut x = seed.wrapping_mul(2_654_435_761) | 1;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                (x >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn test_small_edit_is_compact() {
        let base = b"The quick brown fox jumps over the lazy dog, again and again and again.".to_vec();
        let mut target = base.clone();
        target[10..15].copy_from_slice(b"black");

        let delta = encode(&base, &target);
        assert!(delta.len() < target.len() / 2, "delta {} bytes", delta.len());
        assert_eq!(apply(&base, &delta).unwrap(), target);
    }

    #[test]
    fn test_insertions_and_moves() {
        let base = sample(4096, 7);
        let mut target = Vec::new();
        target.extend_from_slice(&base[2048..]);
        target.extend_from_slice(b"inserted header bytes");
        target.extend_from_slice(&base[..2048]);

        let ops = diff_ops(&base, &target);
        assert!(ops.iter().any(|op| matches!(op, DeltaOp::Copy { offset: 2048, .. })));
        assert_eq!(apply(&base, &encode(&base, &target)).unwrap(), target);
    }

    #[test]
    fn test_unrelated_and_tiny_inputs() {
        for (base, target) in [
            (Vec::new(), b"fresh".to_vec()),
            (b"abc".to_vec(), Vec::new()),
            (sample(300, 1), b"nothing in common here at all!".to_vec()),
        ] {
            assert_eq!(apply(&base, &encode(&base, &target)).unwrap(), target);
        }
    }

    #[test]
    fn test_wrong_base_is_rejected() {
        let base = sample(100, 3);
        let delta = encode(&base, &sample(100, 4));
        assert_eq!(
            apply(&base[..50], &delta),
            Err(DeltaError::BaseLengthMismatch { expected: 100, actual: 50 })
        );
    }

    #[test]
    fn test_malformed_deltas() {
        assert_eq!(apply(b"", b""), Err(DeltaError::Truncated));
        assert_eq!(apply(b"", b"X"), Err(DeltaError::BadMagic(b'X')));
        // base_len 4, target_len 4, copy 2+8
        assert_eq!(
            apply(b"abcd", &[DELTA_MAGIC, 4, 4, OP_COPY, 2, 8]),
            Err(DeltaError::CopyOutOfRange { offset: 2, len: 8, base_len: 4 })
        );
        assert_eq!(apply(b"abcd", &[DELTA_MAGIC, 4, 4, 0x09]), Err(DeltaError::UnknownOp(0x09)));
        assert_eq!(
            apply(b"abcd", &[DELTA_MAGIC, 4, 4, OP_COPY, 0, 2]),
            Err(DeltaError::TargetLengthMismatch { expected: 4, actual: 2 })
        );
    }

    #[test]
    fn test_huge_declared_length_is_an_error() {
        let mut delta = vec![DELTA_MAGIC, 0];
        write_varint(&mut delta, u64::MAX);
        assert_eq!(
            apply(b"", &delta),
            Err(DeltaError::TargetLengthMismatch { expected: u64::MAX, actual: 0 })
        );

        // Insert op claiming more bytes than follow.
        let mut delta = vec![DELTA_MAGIC, 0];
        write_varint(&mut delta, u64::MAX);
        delta.push(OP_INSERT);
        write_varint(&mut delta, u64::MAX);
        assert_eq!(apply(b"", &delta), Err(DeltaError::Truncated));
    }

    #[test]
    fn test_overlong_varint_is_rejected() {
        let mut overflowing = vec![0xFF; 9];
        overflowing.push(0x7F);
        let mut slice = overflowing.as_slice();
        assert_eq!(read_varint(&mut slice), Err(DeltaError::Truncated));
        let mut slice: &[u8] = &[0x80; 11];
        assert_eq!(read_varint(&mut slice), Err(DeltaError::Truncated));
    }

    #[test]
    fn test_varint_boundaries() {
        for n in [0u64, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, n);
            let mut slice = buf.as_slice();
            assert_eq!(read_varint(&mut slice).unwrap(), n);
            assert!(slice.is_empty());
        }
    }
}
