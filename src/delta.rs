//! Binary delta application.
//!
//! A delta stream opens with two base-128 varints (declared base length and
//! declared result length) followed by a sequence of instructions: copy
//! commands (high bit set) pull a base range into the output, insert
//! commands (high bit clear, non-zero) carry literal bytes, and a zero
//! command byte is reserved and rejected as corrupt.
//!
//! `apply` is a pure function over in-memory buffers; chain walking, base
//! resolution, and caching live in the loader layer.

use std::fmt;

/// Maximum varint encoding bytes for a 64-bit value.
const MAX_VARINT_BYTES: usize = 10;

/// Delta apply error taxonomy.
#[derive(Debug, PartialEq, Eq)]
pub enum DeltaError {
    /// Stream ended inside a header or instruction.
    Truncated,
    /// Size varint would exceed 64 bits.
    VarintOverflow,
    /// Declared base length disagrees with the supplied base buffer.
    BaseSizeMismatch { declared: u64, actual: u64 },
    /// Output length at completion disagrees with the declared result length.
    ResultSizeMismatch { declared: u64, actual: u64 },
    /// Reserved zero command byte.
    BadCommandZero,
    /// Copy instruction reaches outside the base buffer.
    CopyOutOfRange,
    /// Output would exceed the declared result length or the safety cap.
    OutputOverrun,
}

impl fmt::Display for DeltaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "delta truncated"),
            Self::VarintOverflow => write!(f, "delta varint overflow"),
            Self::BaseSizeMismatch { declared, actual } => {
                write!(f, "delta base size mismatch: declared {declared}, base is {actual}")
            }
            Self::ResultSizeMismatch { declared, actual } => {
                write!(f, "delta result size mismatch: declared {declared}, produced {actual}")
            }
            Self::BadCommandZero => write!(f, "delta command byte zero"),
            Self::CopyOutOfRange => write!(f, "delta copy out of range"),
            Self::OutputOverrun => write!(f, "delta output overrun"),
        }
    }
}

impl std::error::Error for DeltaError {}

/// Reads a base-128 varint (7 bits per byte, continuation in the high bit).
fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64, DeltaError> {
    let mut shift: u32 = 0;
    let mut result: u64 = 0;

    for _ in 0..MAX_VARINT_BYTES {
        let b = *data.get(*pos).ok_or(DeltaError::Truncated)?;
        *pos += 1;

        result |= ((b & 0x7f) as u64) << shift;
        if (b & 0x80) == 0 {
            return Ok(result);
        }
        shift = shift.saturating_add(7);
        if shift > 63 {
            return Err(DeltaError::VarintOverflow);
        }
    }
    Err(DeltaError::VarintOverflow)
}

/// Parses the declared (base length, result length) header of a delta stream.
///
/// Only the leading varints are read; the instruction tail is not validated.
pub fn delta_header(delta: &[u8]) -> Result<(u64, u64), DeltaError> {
    let mut pos = 0usize;
    let base_len = read_varint(delta, &mut pos)?;
    let result_len = read_varint(delta, &mut pos)?;
    Ok((base_len, result_len))
}

/// Applies a delta stream to `base`, producing the reconstructed bytes.
///
/// `max_out` is a hard safety cap so a corrupt declared result length can
/// never drive an unbounded allocation. The declared base length must equal
/// `base.len()` and the produced output must equal the declared result
/// length; either disagreement is a corruption error.
pub fn apply(base: &[u8], delta: &[u8], max_out: usize) -> Result<Vec<u8>, DeltaError> {
    let mut pos = 0usize;
    let base_len = read_varint(delta, &mut pos)?;
    let result_len = read_varint(delta, &mut pos)?;

    if base_len != base.len() as u64 {
        return Err(DeltaError::BaseSizeMismatch {
            declared: base_len,
            actual: base.len() as u64,
        });
    }
    if result_len > max_out as u64 {
        return Err(DeltaError::OutputOverrun);
    }
    let result_len = result_len as usize;

    let mut out = Vec::with_capacity(result_len);
    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;

        if (cmd & 0x80) != 0 {
            let (off, size) = decode_copy_params(delta, &mut pos, cmd)?;
            let src_end = off.checked_add(size).ok_or(DeltaError::CopyOutOfRange)?;
            if src_end > base.len() {
                return Err(DeltaError::CopyOutOfRange);
            }
            if out.len() + size > result_len {
                return Err(DeltaError::OutputOverrun);
            }
            out.extend_from_slice(&base[off..src_end]);
        } else if cmd != 0 {
            let size = cmd as usize;
            if pos + size > delta.len() {
                return Err(DeltaError::Truncated);
            }
            if out.len() + size > result_len {
                return Err(DeltaError::OutputOverrun);
            }
            out.extend_from_slice(&delta[pos..pos + size]);
            pos += size;
        } else {
            return Err(DeltaError::BadCommandZero);
        }
    }

    if out.len() != result_len {
        return Err(DeltaError::ResultSizeMismatch {
            declared: result_len as u64,
            actual: out.len() as u64,
        });
    }

    Ok(out)
}

/// Decodes the copy offset and size selected by a copy command byte.
///
/// The low four bits select which little-endian offset bytes follow; the
/// next three bits select size bytes. A decoded size of zero means 65536.
fn decode_copy_params(
    delta: &[u8],
    pos: &mut usize,
    cmd: u8,
) -> Result<(usize, usize), DeltaError> {
    let mut off: usize = 0;
    let mut size: usize = 0;

    for (bit, shift) in [(0x01u8, 0u32), (0x02, 8), (0x04, 16), (0x08, 24)] {
        if (cmd & bit) != 0 {
            let b = *delta.get(*pos).ok_or(DeltaError::Truncated)?;
            *pos += 1;
            off |= (b as usize) << shift;
        }
    }
    for (bit, shift) in [(0x10u8, 0u32), (0x20, 8), (0x40, 16)] {
        if (cmd & bit) != 0 {
            let b = *delta.get(*pos).ok_or(DeltaError::Truncated)?;
            *pos += 1;
            size |= (b as usize) << shift;
        }
    }

    if size == 0 {
        size = 0x10000;
    }

    Ok((off, size))
}
