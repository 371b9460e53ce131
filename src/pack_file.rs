//! One open pack: an index/data file pair under a shared window cache.
//!
//! A `PackFile` is immutable once opened. It owns the parsed [`PackIndex`],
//! a lazily built [`ReverseIndex`], and the [`PackSource`] identity token
//! its windows and cached objects are keyed by. When the store detects the
//! files were replaced by a repack it drops the whole `PackFile` and opens
//! a fresh one with a new token; nothing here is ever patched in place.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::DecodeLimits;
use crate::entry::{parse_entry_header, EntryHeader, PackParseError};
use crate::errors::StoreError;
use crate::loader::ObjectLoader;
use crate::object_id::{ObjectId, OBJECT_ID_LEN};
use crate::pack_idx::PackIndex;
use crate::rev_index::ReverseIndex;
use crate::window::{PackSource, PackToken};
use crate::window_cache::{WindowCache, WindowCursor};

/// Pack data file magic.
const PACK_MAGIC: [u8; 4] = *b"PACK";
/// Fixed pack header size (magic + version + object count).
const PACK_HEADER_SIZE: u64 = 12;
/// Chunk size for streaming raw entry bytes.
const RAW_COPY_CHUNK: usize = 8 * 1024;

/// An open, validated pack.
#[derive(Debug)]
pub struct PackFile {
    source: PackSource,
    idx_path: PathBuf,
    index: PackIndex,
    rev: OnceLock<ReverseIndex>,
    limits: DecodeLimits,
    /// Data file length recorded at open; reads past it mean the file was
    /// truncated under us.
    length: u64,
    /// Data file mtime recorded at open, part of the on-disk identity.
    mtime: SystemTime,
}

impl PackFile {
    /// Opens and cross-validates an index/data pair.
    ///
    /// Parses the `.idx`, reads the pack header through the window cache,
    /// and checks magic, version, and object-count agreement.
    pub fn open(
        idx_path: &Path,
        pack_path: &Path,
        windows: &Arc<WindowCache>,
        limits: DecodeLimits,
    ) -> Result<Self, StoreError> {
        let index = PackIndex::open(idx_path)?;
        let source = PackSource::new(pack_path.to_path_buf());

        let mtime = fs::metadata(pack_path)?
            .modified()
            .unwrap_or(UNIX_EPOCH);
        let length = windows.file_length(&source)?;
        if length < PACK_HEADER_SIZE + OBJECT_ID_LEN as u64 {
            return Err(PackParseError::TooSmall.into());
        }

        let mut header = [0u8; PACK_HEADER_SIZE as usize];
        let mut cursor = windows.cursor();
        cursor.read_fully(&source, 0, &mut header)?;
        if header[0..4] != PACK_MAGIC {
            return Err(PackParseError::BadSignature.into());
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != 2 && version != 3 {
            return Err(PackParseError::UnsupportedVersion(version).into());
        }
        let declared = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as u64;
        if declared != index.object_count() {
            return Err(PackParseError::ObjectCountMismatch {
                index: index.object_count(),
                pack: declared,
            }
            .into());
        }

        Ok(Self {
            source,
            idx_path: idx_path.to_path_buf(),
            index,
            rev: OnceLock::new(),
            limits,
            length,
            mtime,
        })
    }

    /// True while the data file on disk still has the length and mtime
    /// recorded at open. A repack that reuses the same path changes both.
    #[must_use]
    pub fn same_on_disk(&self) -> bool {
        fs::metadata(self.source.path()).is_ok_and(|meta| {
            meta.len() == self.length && meta.modified().unwrap_or(UNIX_EPOCH) == self.mtime
        })
    }

    /// The pack's identity token for this open generation.
    #[inline]
    #[must_use]
    pub fn token(&self) -> PackToken {
        self.source.token()
    }

    /// The pack data file's source handle for windowed reads.
    #[inline]
    #[must_use]
    pub fn source(&self) -> &PackSource {
        &self.source
    }

    /// Path of the index file this pack was opened from.
    #[must_use]
    pub fn idx_path(&self) -> &Path {
        &self.idx_path
    }

    /// Parsed pack index.
    #[inline]
    #[must_use]
    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    /// Decode caps this pack was opened with.
    #[inline]
    #[must_use]
    pub fn limits(&self) -> &DecodeLimits {
        &self.limits
    }

    /// Data file length at open time.
    #[inline]
    #[must_use]
    pub fn data_length(&self) -> u64 {
        self.length
    }

    /// Offset one past the last object record (start of the trailer).
    #[inline]
    #[must_use]
    pub fn trailer_offset(&self) -> u64 {
        self.length - OBJECT_ID_LEN as u64
    }

    /// True if the index lists this object.
    #[must_use]
    pub fn has_object(&self, id: &ObjectId) -> bool {
        self.index.find_offset(id).is_some()
    }

    /// Pack offset of an object, if present.
    #[must_use]
    pub fn find_offset(&self, id: &ObjectId) -> Option<u64> {
        self.index.find_offset(id)
    }

    /// Builds a loader for `id` if this pack holds it.
    ///
    /// Resolves the offset through the index and parses the entry header
    /// through the window cache; the returned loader carries the storage
    /// form found on disk (whole or delta).
    pub fn get(
        self: &Arc<Self>,
        cursor: &mut WindowCursor,
        id: &ObjectId,
    ) -> Result<Option<ObjectLoader>, StoreError> {
        match self.find_offset(id) {
            Some(offset) => ObjectLoader::open(Arc::clone(self), cursor, offset).map(Some),
            None => Ok(None),
        }
    }

    /// Offset-ordered view over the index, built on first use.
    #[must_use]
    pub fn reverse_index(&self) -> &ReverseIndex {
        self.rev.get_or_init(|| ReverseIndex::build(&self.index))
    }

    /// Parses the entry header starting at `offset`.
    pub fn entry_header(
        &self,
        cursor: &mut WindowCursor,
        offset: u64,
    ) -> Result<EntryHeader, StoreError> {
        // Header varint plus the largest base reference (20-byte ID).
        let mut prefix = vec![0u8; self.limits.max_header_bytes + OBJECT_ID_LEN];
        let filled = self.read_prefix(cursor, offset, &mut prefix)?;
        Ok(parse_entry_header(
            &prefix[..filled],
            offset,
            self.limits.max_header_bytes,
        )?)
    }

    /// Copies one object's raw (still-deflated) record bytes into `out`,
    /// verifying them against the CRC32 recorded in the index.
    ///
    /// The record spans `[offset, next_offset)` per the reverse index; the
    /// trailer bounds the last record.
    pub fn copy_raw_data(
        &self,
        cursor: &mut WindowCursor,
        id: &ObjectId,
        out: &mut Vec<u8>,
    ) -> Result<(), StoreError> {
        let offset = self
            .index
            .find_offset(id)
            .ok_or(StoreError::NotFound { id: *id })?;
        let end = self
            .reverse_index()
            .find_next_offset(offset, self.trailer_offset())?;

        let mut hasher = crc32fast::Hasher::new();
        let mut buf = [0u8; RAW_COPY_CHUNK];
        let mut pos = offset;
        while pos < end {
            let take = ((end - pos) as usize).min(RAW_COPY_CHUNK);
            cursor.read_fully(self.source(), pos, &mut buf[..take])?;
            hasher.update(&buf[..take]);
            out.extend_from_slice(&buf[..take]);
            pos += take as u64;
        }

        if let Some(expected) = self.index.find_crc32(id)? {
            let actual = hasher.finalize();
            if actual != expected {
                return Err(StoreError::CrcMismatch {
                    offset,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Fills `prefix` from `offset`, stopping early at end of file.
    fn read_prefix(
        &self,
        cursor: &mut WindowCursor,
        offset: u64,
        prefix: &mut [u8],
    ) -> Result<usize, StoreError> {
        let mut filled = 0usize;
        while filled < prefix.len() {
            let n = cursor.read(self.source(), offset + filled as u64, &mut prefix[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}
