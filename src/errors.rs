//! Store-level error taxonomy.
//!
//! Each low-level module keeps its own error enum; this module folds them
//! into one type for the resolution layer and classifies every failure
//! along the axis callers actually branch on: is the repository data bad,
//! is the object simply absent, or did a concurrent repack move the files
//! out from under us.

use std::fmt;
use std::io;

use crate::delta::DeltaError;
use crate::entry::PackParseError;
use crate::inflate::InflateError;
use crate::object_id::ObjectId;
use crate::pack_idx::IdxError;
use crate::rev_index::RevIndexError;
use crate::window_cache::WindowError;

/// Broad failure classes with distinct remediation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// The pack or index violates the on-disk format; the pack is unusable
    /// until reopened successfully.
    Format,
    /// A specific object or read is damaged; other objects in the same
    /// pack may still be fine.
    Corrupt,
    /// The object does not exist where it was looked for.
    Missing,
    /// The failure is plausibly a concurrent repack or handle churn and is
    /// worth one invalidate-and-rescan retry.
    Transient,
}

/// Errors surfaced by object resolution.
#[derive(Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// Pack index parsing or lookup failed.
    Idx(IdxError),
    /// Pack header or entry header parsing failed.
    Parse(PackParseError),
    /// Window cache read failed.
    Window(WindowError),
    /// Zlib stream was corrupt or exceeded its limit.
    Inflate(InflateError),
    /// Delta application failed.
    Delta(DeltaError),
    /// Reverse index lookup failed.
    RevIndex(RevIndexError),
    /// Raw copy CRC did not match the value recorded in the index.
    CrcMismatch {
        offset: u64,
        expected: u32,
        actual: u32,
    },
    /// Delta chain exceeded the configured depth bound.
    DeltaDepthExceeded { max: u32 },
    /// A ref-delta base was not found in any pack or in loose storage.
    MissingBase { id: ObjectId },
    /// The requested object is in no known pack.
    NotFound { id: ObjectId },
    /// Filesystem operation outside the window cache failed.
    Io(io::Error),
}

impl StoreError {
    /// Classifies this error per the remediation taxonomy.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Idx(IdxError::Io(_)) => ErrorClass::Transient,
            Self::Idx(_) => ErrorClass::Format,
            Self::Parse(_) => ErrorClass::Format,
            Self::Window(err) => {
                if err.is_stale_file() {
                    ErrorClass::Transient
                } else {
                    match err {
                        WindowError::Inflate(_) => ErrorClass::Corrupt,
                        _ => ErrorClass::Transient,
                    }
                }
            }
            Self::Inflate(_) | Self::Delta(_) | Self::RevIndex(_) => ErrorClass::Corrupt,
            Self::CrcMismatch { .. } | Self::DeltaDepthExceeded { .. } => ErrorClass::Corrupt,
            Self::MissingBase { .. } | Self::NotFound { .. } => ErrorClass::Missing,
            Self::Io(_) => ErrorClass::Transient,
        }
    }

    /// Returns true when the failure pattern matches a pack whose files
    /// were replaced or removed, i.e. the one case where invalidating the
    /// pack and rescanning the directory can succeed.
    #[must_use]
    pub fn is_stale_pack(&self) -> bool {
        match self {
            Self::Window(err) => err.is_stale_file(),
            Self::Io(err) | Self::Idx(IdxError::Io(err)) => {
                err.kind() == io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idx(err) => write!(f, "{err}"),
            Self::Parse(err) => write!(f, "{err}"),
            Self::Window(err) => write!(f, "{err}"),
            Self::Inflate(err) => write!(f, "{err}"),
            Self::Delta(err) => write!(f, "{err}"),
            Self::RevIndex(err) => write!(f, "{err}"),
            Self::CrcMismatch {
                offset,
                expected,
                actual,
            } => write!(
                f,
                "crc32 mismatch for entry at offset {offset}: \
                 expected {expected:#010x}, got {actual:#010x}"
            ),
            Self::DeltaDepthExceeded { max } => {
                write!(f, "delta chain exceeds depth bound {max}")
            }
            Self::MissingBase { id } => write!(f, "delta base {id} not found"),
            Self::NotFound { id } => write!(f, "object {id} not found"),
            Self::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Idx(err) => Some(err),
            Self::Parse(err) => Some(err),
            Self::Window(err) => Some(err),
            Self::Inflate(err) => Some(err),
            Self::Delta(err) => Some(err),
            Self::RevIndex(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<IdxError> for StoreError {
    fn from(err: IdxError) -> Self {
        Self::Idx(err)
    }
}
impl From<PackParseError> for StoreError {
    fn from(err: PackParseError) -> Self {
        Self::Parse(err)
    }
}
impl From<WindowError> for StoreError {
    fn from(err: WindowError) -> Self {
        Self::Window(err)
    }
}
impl From<InflateError> for StoreError {
    fn from(err: InflateError) -> Self {
        Self::Inflate(err)
    }
}
impl From<DeltaError> for StoreError {
    fn from(err: DeltaError) -> Self {
        Self::Delta(err)
    }
}
impl From<RevIndexError> for StoreError {
    fn from(err: RevIndexError) -> Self {
        Self::RevIndex(err)
    }
}
impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_and_corrupt_are_distinguished() {
        let missing = StoreError::NotFound {
            id: ObjectId::NULL,
        };
        assert_eq!(missing.class(), ErrorClass::Missing);
        assert!(!missing.is_stale_pack());

        let corrupt = StoreError::CrcMismatch {
            offset: 12,
            expected: 1,
            actual: 2,
        };
        assert_eq!(corrupt.class(), ErrorClass::Corrupt);
        assert!(!corrupt.is_stale_pack());
    }

    #[test]
    fn vanished_file_reads_are_stale() {
        let err = StoreError::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.is_stale_pack());
    }

    #[test]
    fn format_errors_condemn_the_pack() {
        let err = StoreError::Parse(PackParseError::BadSignature);
        assert_eq!(err.class(), ErrorClass::Format);
    }
}
