//! Pack entry headers.
//!
//! Every object record in a pack opens with a variable-length header: bits
//! 4-6 of the first byte carry the type code, the remaining bits build the
//! inflated size varint low-to-high with the top bit as continuation. Delta
//! entries follow the header with a base reference (backward-offset varint
//! for ofs-delta, raw 20-byte ID for ref-delta) before the deflated
//! payload.
//!
//! Parsing here is over a small in-memory prefix the caller has already
//! pulled through the window cache; no I/O happens in this module.

use std::fmt;

use crate::object_id::{ObjectId, OBJECT_ID_LEN};

/// Maximum bytes of an ofs-delta backward-offset varint.
const MAX_OFS_BYTES: usize = 10;

/// Kind of a non-delta packed object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectKind {
    /// Canonical lowercase name, as used in loose object headers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from pack header and entry parsing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PackParseError {
    /// Pack data file is smaller than its fixed header.
    TooSmall,
    /// Pack magic signature is not `PACK`.
    BadSignature,
    /// Pack format version is not 2 or 3.
    UnsupportedVersion(u32),
    /// Declared object counts disagree between index and pack.
    ObjectCountMismatch { index: u64, pack: u64 },
    /// Entry header exceeded the configured safety bound.
    HeaderTooLong,
    /// Entry data ended inside the header.
    Truncated,
    /// Reserved or unknown object type code.
    BadObjType(u8),
    /// ofs-delta base would sit at or before offset zero.
    OfsUnderflow,
}

impl fmt::Display for PackParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall => write!(f, "pack too small"),
            Self::BadSignature => write!(f, "bad pack signature"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported pack version {v}"),
            Self::ObjectCountMismatch { index, pack } => {
                write!(f, "object count mismatch: index has {index}, pack declares {pack}")
            }
            Self::HeaderTooLong => write!(f, "entry header exceeded safety bound"),
            Self::Truncated => write!(f, "truncated pack entry"),
            Self::BadObjType(t) => write!(f, "bad object type {t}"),
            Self::OfsUnderflow => write!(f, "ofs-delta base offset underflow"),
        }
    }
}

impl std::error::Error for PackParseError {}

/// Base reference and type of one pack entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Whole (non-delta) object.
    Whole { kind: ObjectKind },
    /// Delta whose base starts `base_offset` bytes into the same pack.
    OfsDelta { base_offset: u64 },
    /// Delta whose base is identified by content hash.
    RefDelta { base_id: ObjectId },
}

/// Parsed pack entry header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    /// Inflated payload size (for deltas: the delta stream, not the result).
    pub size: u64,
    /// Absolute pack position where the zlib stream begins.
    pub data_start: u64,
    /// Entry kind with its base reference, if any.
    pub kind: EntryKind,
}

/// Parses the entry header found in `prefix`, which holds pack bytes
/// starting at absolute position `offset`.
///
/// `max_header_bytes` bounds runaway parsing on corrupt size varints; the
/// base reference bytes of delta entries do not count against it.
pub fn parse_entry_header(
    prefix: &[u8],
    offset: u64,
    max_header_bytes: usize,
) -> Result<EntryHeader, PackParseError> {
    let mut pos = 0usize;

    let first = *prefix.first().ok_or(PackParseError::Truncated)?;
    pos += 1;

    let type_code = (first >> 4) & 0x07;
    let mut size: u64 = (first & 0x0f) as u64;
    let mut shift: u32 = 4;

    let mut byte = first;
    while (byte & 0x80) != 0 {
        if pos >= max_header_bytes || shift > 57 {
            return Err(PackParseError::HeaderTooLong);
        }
        byte = *prefix.get(pos).ok_or(PackParseError::Truncated)?;
        pos += 1;
        size |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }

    let kind = match type_code {
        1 => EntryKind::Whole {
            kind: ObjectKind::Commit,
        },
        2 => EntryKind::Whole {
            kind: ObjectKind::Tree,
        },
        3 => EntryKind::Whole {
            kind: ObjectKind::Blob,
        },
        4 => EntryKind::Whole {
            kind: ObjectKind::Tag,
        },
        6 => {
            let base_offset = parse_ofs_base(prefix, &mut pos, offset)?;
            EntryKind::OfsDelta { base_offset }
        }
        7 => {
            let end = pos + OBJECT_ID_LEN;
            let raw = prefix.get(pos..end).ok_or(PackParseError::Truncated)?;
            pos = end;
            EntryKind::RefDelta {
                base_id: ObjectId::from_slice(raw),
            }
        }
        t => return Err(PackParseError::BadObjType(t)),
    };

    Ok(EntryHeader {
        size,
        data_start: offset + pos as u64,
        kind,
    })
}

/// Parses the ofs-delta backward-offset encoding and resolves it against
/// the delta's own offset.
///
/// The encoding is a big-endian base-128 number with an off-by-one bias on
/// continuation, per `gitformat-pack(5)`.
fn parse_ofs_base(
    prefix: &[u8],
    pos: &mut usize,
    delta_offset: u64,
) -> Result<u64, PackParseError> {
    let mut c = *prefix.get(*pos).ok_or(PackParseError::Truncated)?;
    *pos += 1;

    let mut val: u64 = (c & 0x7f) as u64;
    let mut bytes_read = 1usize;

    while (c & 0x80) != 0 {
        if bytes_read >= MAX_OFS_BYTES {
            return Err(PackParseError::HeaderTooLong);
        }
        c = *prefix.get(*pos).ok_or(PackParseError::Truncated)?;
        *pos += 1;
        bytes_read += 1;
        val = (val + 1) << 7;
        val |= (c & 0x7f) as u64;
    }

    if val >= delta_offset {
        return Err(PackParseError::OfsUnderflow);
    }
    Ok(delta_offset - val)
}
