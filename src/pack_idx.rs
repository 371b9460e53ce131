//! Pack index (`.idx`) v2 parsing and lookup.
//!
//! The index maps object IDs to byte offsets inside one pack file through a
//! 256-entry fan-out table over a hash-sorted OID array. It is parsed once
//! when a pack is opened and is immutable for the pack's lifetime.
//!
//! # Scope
//! - Supports index version 2 only (the first version carrying CRC32s).
//! - Validates header, fanout monotonicity, and table sizes.
//! - Resolves the large-offset extension table for packs beyond 2 GiB.
//! - Does **not** validate the trailing checksums.
//!
//! # Complexity
//! - `find_offset` is O(log bucket) via fanout-bounded binary search.
//! - `entries()` is O(N) sequential iteration in hash order.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use crate::object_id::{MutableObjectId, ObjectId, OBJECT_ID_LEN};

/// Pack index magic bytes for the versioned format.
const IDX_MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];
/// Supported index version.
const IDX_VERSION: u32 = 2;
/// Header size (4 magic + 4 version).
const IDX_HEADER_SIZE: usize = 8;
/// Fanout table entries.
const FANOUT_ENTRIES: usize = 256;
/// Fanout table size in bytes.
const FANOUT_SIZE: usize = FANOUT_ENTRIES * 4;
/// MSB flag marking a large-offset indirection.
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;
/// Conservative index file size limit (2 GiB).
const MAX_IDX_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Errors from pack index parsing and lookup.
#[derive(Debug)]
#[non_exhaustive]
pub enum IdxError {
    /// Index file is corrupt or malformed.
    Corrupt { detail: &'static str },
    /// Index version is not supported.
    UnsupportedVersion { version: u32 },
    /// Index file exceeds the size limit.
    TooLarge { size: u64, max: u64 },
    /// Index format predates per-entry CRC32 support.
    CrcUnsupported,
    /// Large offset indirection points outside the extension table.
    LargeOffsetOutOfBounds { index: u32, count: u32 },
    /// Reading the index file failed.
    Io(io::Error),
}

impl IdxError {
    /// Constructs a corruption error with a static detail string.
    #[inline]
    pub const fn corrupt(detail: &'static str) -> Self {
        Self::Corrupt { detail }
    }
}

impl fmt::Display for IdxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt { detail } => write!(f, "corrupt pack index: {detail}"),
            Self::UnsupportedVersion { version } => {
                write!(f, "unsupported pack index version {version} (expected 2)")
            }
            Self::TooLarge { size, max } => {
                write!(f, "pack index too large: {size} bytes (max {max})")
            }
            Self::CrcUnsupported => write!(f, "pack index version predates CRC32 support"),
            Self::LargeOffsetOutOfBounds { index, count } => {
                write!(f, "large offset index out of bounds: {index} >= {count}")
            }
            Self::Io(err) => write!(f, "pack index read failed: {err}"),
        }
    }
}

impl std::error::Error for IdxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for IdxError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Read-only pack index parsed from a `.idx` v2 file.
///
/// # Layout (v2 format)
/// ```text
/// +----------------+
/// | Magic (4B)     |  0xff 't' 'O' 'c'
/// | Version (4B)   |  Big-endian 2
/// +----------------+
/// | Fanout (1024B) |  256 * u32 BE cumulative counts
/// +----------------+
/// | OID Table      |  N * 20 bytes (sorted)
/// +----------------+
/// | CRC Table      |  N * 4 bytes
/// +----------------+
/// | Offset Table   |  N * 4 bytes (MSB=1 -> large offset)
/// +----------------+
/// | Large Offsets  |  M * 8 bytes (optional)
/// +----------------+
/// | Pack Checksum  |  20 bytes
/// | Idx Checksum   |  20 bytes
/// +----------------+
/// ```
///
/// # Invariants
/// - `object_count == fanout[255]` and fanout values are non-decreasing.
/// - OIDs are strictly ascending within every fanout bucket.
#[derive(Debug)]
pub struct PackIndex {
    object_count: u32,
    fanout: [u32; FANOUT_ENTRIES],
    oids: Vec<u8>,
    crc32: Vec<u32>,
    offsets: Vec<u32>,
    large_offsets: Vec<u64>,
    pack_checksum: [u8; OBJECT_ID_LEN],
}

impl PackIndex {
    /// Reads and parses a `.idx` file from disk.
    pub fn open(path: &Path) -> Result<Self, IdxError> {
        let meta = fs::metadata(path)?;
        if meta.len() > MAX_IDX_SIZE {
            return Err(IdxError::TooLarge {
                size: meta.len(),
                max: MAX_IDX_SIZE,
            });
        }
        let data = fs::read(path)?;
        Self::parse(&data)
    }

    /// Parses a pack index v2 file from raw bytes.
    ///
    /// # Errors
    /// Returns `IdxError` if the file is malformed or has an unsupported
    /// version.
    pub fn parse(data: &[u8]) -> Result<Self, IdxError> {
        if data.len() as u64 > MAX_IDX_SIZE {
            return Err(IdxError::TooLarge {
                size: data.len() as u64,
                max: MAX_IDX_SIZE,
            });
        }

        // Minimum size: header + fanout + two trailing checksums.
        if data.len() < IDX_HEADER_SIZE + FANOUT_SIZE + 2 * OBJECT_ID_LEN {
            return Err(IdxError::corrupt("file too small"));
        }
        if data[0..4] != IDX_MAGIC {
            return Err(IdxError::corrupt("invalid magic"));
        }
        let version = read_u32(data, 4);
        if version != IDX_VERSION {
            return Err(IdxError::UnsupportedVersion { version });
        }

        let mut fanout = [0u32; FANOUT_ENTRIES];
        let mut prev = 0u32;
        for (i, slot) in fanout.iter_mut().enumerate() {
            let val = read_u32(data, IDX_HEADER_SIZE + i * 4);
            if val < prev {
                return Err(IdxError::corrupt("fanout not monotonic"));
            }
            prev = val;
            *slot = val;
        }
        let object_count = prev;
        let count = object_count as usize;

        let oid_start = IDX_HEADER_SIZE + FANOUT_SIZE;
        let crc_start = oid_start + count * OBJECT_ID_LEN;
        let offset_start = crc_start + count * 4;
        let large_start = offset_start + count * 4;
        let trailer_size = 2 * OBJECT_ID_LEN;

        if data.len() < large_start + trailer_size {
            return Err(IdxError::corrupt("truncated tables"));
        }

        let oids = data[oid_start..crc_start].to_vec();
        let crc32 = (0..count).map(|i| read_u32(data, crc_start + i * 4)).collect();
        let offsets: Vec<u32> = (0..count)
            .map(|i| read_u32(data, offset_start + i * 4))
            .collect();

        let large_end = data.len() - trailer_size;
        let large_bytes = &data[large_start..large_end];
        if large_bytes.len() % 8 != 0 {
            return Err(IdxError::corrupt("large offset table not multiple of 8"));
        }
        let large_offsets: Vec<u64> = large_bytes
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();

        // Every indirection must land inside the table; checking here keeps
        // per-lookup offset resolution infallible.
        let large_count = large_offsets.len() as u32;
        for &raw in &offsets {
            if raw & LARGE_OFFSET_FLAG != 0 {
                let index = raw & !LARGE_OFFSET_FLAG;
                if index >= large_count {
                    return Err(IdxError::LargeOffsetOutOfBounds {
                        index,
                        count: large_count,
                    });
                }
            }
        }

        let mut pack_checksum = [0u8; OBJECT_ID_LEN];
        pack_checksum.copy_from_slice(&data[large_end..large_end + OBJECT_ID_LEN]);

        Ok(Self {
            object_count,
            fanout,
            oids,
            crc32,
            offsets,
            large_offsets,
            pack_checksum,
        })
    }

    /// Returns the number of objects indexed.
    #[inline]
    #[must_use]
    pub fn object_count(&self) -> u64 {
        self.object_count as u64
    }

    /// Returns the pack checksum recorded in the index trailer.
    ///
    /// This ties an index to its data file; the pair must agree.
    #[inline]
    #[must_use]
    pub fn pack_checksum(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.pack_checksum
    }

    /// Finds the pack offset for an object ID.
    ///
    /// A missing ID is `None`, not an error.
    #[must_use]
    pub fn find_offset(&self, id: &ObjectId) -> Option<u64> {
        self.find_position(id).map(|pos| self.offset_at(pos))
    }

    /// Finds the recorded CRC32 for an object ID.
    ///
    /// `Ok(None)` means the ID is absent. `Err(CrcUnsupported)` is reserved
    /// for index formats without a CRC table.
    pub fn find_crc32(&self, id: &ObjectId) -> Result<Option<u32>, IdxError> {
        if self.crc32.len() != self.object_count as usize {
            return Err(IdxError::CrcUnsupported);
        }
        Ok(self
            .find_position(id)
            .map(|pos| self.crc32[pos as usize]))
    }

    /// Returns true if the index carries per-entry CRC32 values.
    #[inline]
    #[must_use]
    pub fn has_crc32(&self) -> bool {
        self.crc32.len() == self.object_count as usize
    }

    /// Binary-searches the fanout bucket for an exact ID match.
    ///
    /// Returns the position in hash order.
    #[must_use]
    pub fn find_position(&self, id: &ObjectId) -> Option<u32> {
        let bucket = id.first_byte() as usize;
        let mut lo = if bucket == 0 {
            0
        } else {
            self.fanout[bucket - 1] as usize
        };
        let mut hi = self.fanout[bucket] as usize;
        let target = id.as_slice();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.oid_slice(mid).cmp(target) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid as u32),
            }
        }
        None
    }

    /// Returns the object ID at a hash-order position.
    ///
    /// # Panics
    /// Panics in debug builds if `pos` is out of range.
    #[must_use]
    pub fn oid_at(&self, pos: u32) -> ObjectId {
        ObjectId::from_slice(self.oid_slice(pos as usize))
    }

    /// Returns the pack offset at a hash-order position.
    ///
    /// Large-offset indirections are validated at parse time, so resolution
    /// never fails.
    #[must_use]
    pub fn offset_at(&self, pos: u32) -> u64 {
        debug_assert!(pos < self.object_count, "offset position out of bounds");
        let raw = self.offsets[pos as usize];
        if raw & LARGE_OFFSET_FLAG != 0 {
            self.large_offsets[(raw & !LARGE_OFFSET_FLAG) as usize]
        } else {
            raw as u64
        }
    }

    /// Iterates entries in hash order, yielding `(ObjectId, offset)` pairs.
    #[must_use]
    pub fn entries(&self) -> Entries<'_> {
        Entries {
            index: self,
            pos: 0,
            scratch: MutableObjectId::new(),
        }
    }

    #[inline]
    fn oid_slice(&self, pos: usize) -> &[u8] {
        let start = pos * OBJECT_ID_LEN;
        &self.oids[start..start + OBJECT_ID_LEN]
    }
}

/// Hash-order iterator over index entries.
pub struct Entries<'a> {
    index: &'a PackIndex,
    pos: u32,
    scratch: MutableObjectId,
}

impl Iterator for Entries<'_> {
    type Item = (ObjectId, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.index.object_count {
            return None;
        }
        let pos = self.pos;
        self.pos += 1;

        self.scratch
            .set_from_slice(self.index.oid_slice(pos as usize));
        let offset = self.index.offset_at(pos);
        Some((self.scratch.to_object_id(), offset))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.index.object_count - self.pos) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Entries<'_> {}

#[inline]
fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}
