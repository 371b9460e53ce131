//! Object ID types for the pack storage engine.
//!
//! `ObjectId` is the immutable 20-byte SHA-1 content hash used as the index
//! lookup key, delta-base reference, and cache key component. It is a plain
//! value type with byte-wise equality and total ordering, so sorted OID
//! tables can be binary-searched directly over raw bytes.
//!
//! `MutableObjectId` exists for hot decode loops that refill one buffer per
//! entry instead of allocating; it is converted to an `ObjectId` before the
//! value is shared or cached.

use std::fmt;

/// Byte length of an object ID.
pub const OBJECT_ID_LEN: usize = 20;

/// Hex string length of an object ID.
pub const OBJECT_ID_HEX_LEN: usize = OBJECT_ID_LEN * 2;

/// Errors from object ID parsing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseIdError {
    /// Input length is not 20 bytes (raw) or 40 chars (hex).
    BadLength { len: usize },
    /// Input contains a non-hex character.
    BadHexDigit { byte: u8 },
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadLength { len } => write!(f, "invalid object id length {len}"),
            Self::BadHexDigit { byte } => write!(f, "invalid hex digit {byte:#04x}"),
        }
    }
}

impl std::error::Error for ParseIdError {}

/// Immutable 20-byte object ID.
///
/// # Invariants
/// - The full 20 bytes are always significant.
/// - Ordering and equality are byte-lexicographic, matching the sort order
///   of pack index OID tables.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// The all-zero ("null") object ID.
    pub const NULL: Self = Self([0u8; OBJECT_ID_LEN]);

    /// Wraps raw bytes as an object ID.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Creates an object ID from a slice, returning `None` on bad length.
    #[must_use]
    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; OBJECT_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Creates an object ID from a slice.
    ///
    /// This is intended for trusted inputs where an invalid length indicates
    /// a programming error.
    ///
    /// # Panics
    /// Panics if `bytes.len()` is not 20.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::try_from_slice(bytes).expect("object id must be 20 bytes")
    }

    /// Parses a 40-character lowercase or uppercase hex string.
    pub fn from_hex(hex: &[u8]) -> Result<Self, ParseIdError> {
        if hex.len() != OBJECT_ID_HEX_LEN {
            return Err(ParseIdError::BadLength { len: hex.len() });
        }
        let mut out = [0u8; OBJECT_ID_LEN];
        for (i, pair) in hex.chunks_exact(2).enumerate() {
            out[i] = (hex_value(pair[0])? << 4) | hex_value(pair[1])?;
        }
        Ok(Self(out))
    }

    /// Returns the ID bytes as a slice.
    #[inline]
    #[must_use]
    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Returns the first byte, which selects the fan-out bucket.
    #[inline]
    #[must_use]
    pub const fn first_byte(&self) -> u8 {
        self.0[0]
    }

    /// Returns true if this is the all-zero ID.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Writes the lowercase hex form into a fixed buffer.
    #[must_use]
    pub fn to_hex(&self) -> [u8; OBJECT_ID_HEX_LEN] {
        let mut out = [0u8; OBJECT_ID_HEX_LEN];
        for (i, &b) in self.0.iter().enumerate() {
            out[i * 2] = hex_digit(b >> 4);
            out[i * 2 + 1] = hex_digit(b & 0x0f);
        }
        out
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Lowercase hex, the canonical rendering.
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

impl AsRef<[u8]> for ObjectId {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reusable object ID buffer for allocation-free decode loops.
///
/// Index iteration and ref-delta parsing refill one of these per entry and
/// promote it with [`MutableObjectId::to_object_id`] only when the value
/// escapes the loop.
#[derive(Clone, Copy, Default)]
pub struct MutableObjectId {
    bytes: [u8; OBJECT_ID_LEN],
}

impl MutableObjectId {
    /// Creates a zeroed buffer.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: [0u8; OBJECT_ID_LEN],
        }
    }

    /// Overwrites the buffer from a 20-byte slice.
    ///
    /// # Panics
    /// Panics if `bytes.len()` is not 20.
    #[inline]
    pub fn set_from_slice(&mut self, bytes: &[u8]) {
        self.bytes.copy_from_slice(bytes);
    }

    /// Returns the current bytes.
    #[inline]
    #[must_use]
    pub const fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Promotes the buffer to an immutable `ObjectId`.
    #[inline]
    #[must_use]
    pub const fn to_object_id(&self) -> ObjectId {
        ObjectId(self.bytes)
    }
}

impl fmt::Debug for MutableObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MutableObjectId({})", self.to_object_id())
    }
}

#[inline]
fn hex_value(byte: u8) -> Result<u8, ParseIdError> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => Err(ParseIdError::BadHexDigit { byte }),
    }
}

#[inline]
const fn hex_digit(val: u8) -> u8 {
    if val < 10 {
        b'0' + val
    } else {
        b'a' + (val - 10)
    }
}
