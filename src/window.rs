//! Windows: the unit of pack I/O admission and eviction.
//!
//! A window is one power-of-two-aligned byte range from one pack file,
//! either copied into an owned buffer or memory-mapped. Windows are owned
//! by the window cache and handed to readers only as `Arc` clones, so an
//! in-flight read keeps its window alive even if the cache evicts or the
//! pack is invalidated underneath it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::Mmap;

/// Monotonic source of pack identity tokens.
static NEXT_PACK_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identity of one pack file *generation*.
///
/// A reopened pack (after a repack race) gets a fresh token, so windows and
/// unpacked-cache entries belonging to the replaced bytes can never be
/// served against the new file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PackToken(u64);

impl PackToken {
    /// Allocates a fresh, process-unique token.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_PACK_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pack#{}", self.0)
    }
}

/// One pack data file as seen by the window cache.
///
/// The cache opens and closes the underlying OS handle on demand; this
/// value only carries identity and location.
#[derive(Debug)]
pub struct PackSource {
    token: PackToken,
    path: PathBuf,
}

impl PackSource {
    /// Creates a source for a pack data file with a fresh identity token.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            token: PackToken::next(),
            path,
        }
    }

    /// Returns the identity token for this pack generation.
    #[inline]
    #[must_use]
    pub const fn token(&self) -> PackToken {
        self.token
    }

    /// Returns the on-disk path of the pack data file.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Backing storage for one window.
enum WindowBytes {
    Copied(Vec<u8>),
    Mapped(Mmap),
}

impl WindowBytes {
    #[inline]
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Copied(buf) => buf,
            Self::Mapped(map) => map,
        }
    }
}

/// A cached byte range of one pack file.
pub struct Window {
    pack: PackToken,
    start: u64,
    bytes: WindowBytes,
}

impl Window {
    /// Wraps copied bytes as a window.
    #[must_use]
    pub(crate) fn copied(pack: PackToken, start: u64, bytes: Vec<u8>) -> Self {
        Self {
            pack,
            start,
            bytes: WindowBytes::Copied(bytes),
        }
    }

    /// Wraps a memory mapping as a window.
    #[must_use]
    pub(crate) fn mapped(pack: PackToken, start: u64, map: Mmap) -> Self {
        Self {
            pack,
            start,
            bytes: WindowBytes::Mapped(map),
        }
    }

    /// Returns the owning pack generation.
    #[inline]
    #[must_use]
    pub fn pack(&self) -> PackToken {
        self.pack
    }

    /// Returns the file position of the first byte.
    #[inline]
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Returns the file position one past the last byte.
    #[inline]
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start + self.bytes.as_slice().len() as u64
    }

    /// Returns true if `position` falls inside this window.
    #[inline]
    #[must_use]
    pub fn contains(&self, pack: PackToken, position: u64) -> bool {
        self.pack == pack && position >= self.start && position < self.end()
    }

    /// Returns the window bytes.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    /// Returns the window bytes from `position` to the window end.
    ///
    /// # Panics
    /// Panics in debug builds if `position` is outside the window.
    #[inline]
    #[must_use]
    pub fn tail_from(&self, position: u64) -> &[u8] {
        debug_assert!(
            position >= self.start && position <= self.end(),
            "position outside window"
        );
        &self.bytes.as_slice()[(position - self.start) as usize..]
    }
}

impl fmt::Debug for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Window")
            .field("pack", &self.pack)
            .field("start", &self.start)
            .field("len", &self.bytes.as_slice().len())
            .field(
                "backing",
                &match self.bytes {
                    WindowBytes::Copied(_) => "copied",
                    WindowBytes::Mapped(_) => "mapped",
                },
            )
            .finish()
    }
}
