//! Byte-budgeted window cache mediating all pack file I/O.
//!
//! Every read of pack data goes through here: callers obtain a private
//! [`WindowCursor`] and ask it to read, fill, or inflate at a pack
//! position. The cache keeps fixed-size aligned windows under a strict LRU
//! byte budget and bounds the number of simultaneously open pack handles;
//! exceeding either limit evicts the least-recently-used entry.
//!
//! # Concurrency
//! Shared state sits behind one mutex with short critical sections. Windows
//! leave the cache only as `Arc` clones, so eviction or [`reconfigure`]
//! never invalidates a window an in-flight read is holding; it merely drops
//! the cache's own reference.
//!
//! [`reconfigure`]: WindowCache::reconfigure

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use memmap2::MmapOptions;

use crate::config::WindowCacheConfig;
use crate::inflate::{InflateError, Inflater};
use crate::window::{PackSource, PackToken, Window};

/// Errors from windowed pack reads.
#[derive(Debug)]
pub enum WindowError {
    /// Opening or reading the pack file failed.
    ///
    /// File-absence failures here are the repack-race signal; the store
    /// reacts by invalidating the pack and rescanning once.
    Io { path: PathBuf, source: io::Error },
    /// A read asked for bytes past the end of the file.
    OutOfRange {
        path: PathBuf,
        position: u64,
        length: u64,
    },
    /// Fewer bytes were available than the caller required.
    UnexpectedEof {
        path: PathBuf,
        position: u64,
        wanted: usize,
    },
    /// Inflation of pack data failed.
    Inflate(InflateError),
}

impl WindowError {
    /// True if the failure indicates the file vanished or shrank, which is
    /// how a concurrent repack manifests to a stale reader.
    #[must_use]
    pub fn is_stale_file(&self) -> bool {
        match self {
            Self::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            Self::OutOfRange { .. } | Self::UnexpectedEof { .. } => true,
            Self::Inflate(_) => false,
        }
    }
}

impl fmt::Display for WindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "pack read failed ({}): {source}", path.display())
            }
            Self::OutOfRange {
                path,
                position,
                length,
            } => write!(
                f,
                "position {position} past end of pack ({}, length {length})",
                path.display()
            ),
            Self::UnexpectedEof {
                path,
                position,
                wanted,
            } => write!(
                f,
                "unexpected end of pack ({}) at {position}, wanted {wanted} bytes",
                path.display()
            ),
            Self::Inflate(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for WindowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Inflate(err) => Some(err),
            _ => None,
        }
    }
}

impl From<InflateError> for WindowError {
    fn from(err: InflateError) -> Self {
        Self::Inflate(err)
    }
}

/// An open pack file handle tracked by the cache.
struct Handle {
    file: File,
    length: u64,
    last_used: u64,
}

/// One resident window plus its recency stamp.
struct Slot {
    window: Arc<Window>,
    last_used: u64,
}

struct Inner {
    cfg: WindowCacheConfig,
    tick: u64,
    handles: HashMap<PackToken, Handle>,
    windows: HashMap<(PackToken, u64), Slot>,
    window_bytes: usize,
}

impl Inner {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Returns the open handle for `pack`, opening it if needed and closing
    /// the least-recently-used pack first when at the handle limit.
    fn handle(&mut self, pack: &PackSource) -> Result<&mut Handle, WindowError> {
        let token = pack.token();
        if !self.handles.contains_key(&token) {
            while self.handles.len() >= self.cfg.max_open_files.max(1) {
                let victim = self
                    .handles
                    .iter()
                    .min_by_key(|(_, h)| h.last_used)
                    .map(|(&t, _)| t);
                match victim {
                    Some(t) => self.drop_pack(t),
                    None => break,
                }
            }

            let file = File::open(pack.path()).map_err(|source| WindowError::Io {
                path: pack.path().to_path_buf(),
                source,
            })?;
            let length = file
                .metadata()
                .map_err(|source| WindowError::Io {
                    path: pack.path().to_path_buf(),
                    source,
                })?
                .len();
            self.handles.insert(
                token,
                Handle {
                    file,
                    length,
                    last_used: 0,
                },
            );
        }

        let tick = self.touch();
        let handle = self.handles.get_mut(&token).expect("handle just ensured");
        handle.last_used = tick;
        Ok(handle)
    }

    /// Closes a pack's handle and drops all of its windows.
    fn drop_pack(&mut self, token: PackToken) {
        self.handles.remove(&token);
        let removed: Vec<(PackToken, u64)> = self
            .windows
            .keys()
            .filter(|(t, _)| *t == token)
            .copied()
            .collect();
        for key in removed {
            if let Some(slot) = self.windows.remove(&key) {
                self.window_bytes -= slot.window.as_slice().len();
            }
        }
    }

    /// Evicts least-recently-used windows until `incoming` bytes fit the
    /// budget. Windows pinned by readers stay alive through their `Arc`s.
    fn make_room(&mut self, incoming: usize) {
        let budget = self.cfg.cache_bytes.max(incoming);
        while self.window_bytes + incoming > budget && !self.windows.is_empty() {
            let victim = self
                .windows
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(&key, _)| key);
            match victim {
                Some(key) => {
                    if let Some(slot) = self.windows.remove(&key) {
                        self.window_bytes -= slot.window.as_slice().len();
                    }
                }
                None => break,
            }
        }
    }
}

/// Shared, size-bounded cache of pack file windows.
pub struct WindowCache {
    inner: Mutex<Inner>,
}

impl WindowCache {
    /// Creates a cache with the given limits.
    #[must_use]
    pub fn new(cfg: WindowCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                cfg,
                tick: 0,
                handles: HashMap::new(),
                windows: HashMap::new(),
                window_bytes: 0,
            }),
        })
    }

    /// Creates a cache with default limits.
    #[must_use]
    pub fn with_default_config() -> Arc<Self> {
        Self::new(WindowCacheConfig::default())
    }

    /// Atomically replaces the limits, dropping all windows and handles.
    ///
    /// In-flight reads keep the windows they have already pinned; the next
    /// access repopulates the cache under the new limits.
    pub fn reconfigure(&self, cfg: WindowCacheConfig) {
        let mut inner = self.lock();
        inner.cfg = cfg;
        inner.windows.clear();
        inner.handles.clear();
        inner.window_bytes = 0;
    }

    /// Drops all state belonging to one pack generation.
    ///
    /// Called when a pack is closed or found stale; a later read through a
    /// fresh `PackSource` reopens the file under its new token.
    pub fn purge(&self, token: PackToken) {
        self.lock().drop_pack(token);
    }

    /// Returns the length of the pack data file, opening its handle if
    /// necessary.
    pub fn file_length(&self, pack: &PackSource) -> Result<u64, WindowError> {
        let mut inner = self.lock();
        Ok(inner.handle(pack)?.length)
    }

    /// Creates a private access cursor over this cache.
    #[must_use]
    pub fn cursor(self: &Arc<Self>) -> WindowCursor {
        WindowCursor {
            cache: Arc::clone(self),
            window: None,
            inflater: Inflater::new(),
        }
    }

    /// Number of currently open pack file handles (for tests/diagnostics).
    #[must_use]
    pub fn open_handle_count(&self) -> usize {
        self.lock().handles.len()
    }

    /// Total bytes held by resident windows (for tests/diagnostics).
    #[must_use]
    pub fn resident_window_bytes(&self) -> usize {
        self.lock().window_bytes
    }

    /// Returns the window covering `position`, filling it on a miss.
    fn window(&self, pack: &PackSource, position: u64) -> Result<Arc<Window>, WindowError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let window_size = inner.cfg.window_size() as u64;
        let aligned = position & !(window_size - 1);
        let key = (pack.token(), aligned);

        inner.tick += 1;
        let tick = inner.tick;
        if let Some(slot) = inner.windows.get_mut(&key) {
            // A short window (file end inside the aligned range) shares the
            // key with positions past the data; those must fall through to
            // the range check below, not serve an empty tail.
            if slot.window.contains(pack.token(), position) {
                slot.last_used = tick;
                if let Some(handle) = inner.handles.get_mut(&pack.token()) {
                    handle.last_used = tick;
                }
                return Ok(Arc::clone(&slot.window));
            }
        }

        let mmap = inner.cfg.mmap;
        let handle = inner.handle(pack)?;
        let length = handle.length;
        if position >= length {
            return Err(WindowError::OutOfRange {
                path: pack.path().to_path_buf(),
                position,
                length,
            });
        }

        let take = (length - aligned).min(window_size) as usize;
        let window = if mmap {
            // SAFETY: packs are replaced by rename, never rewritten in
            // place; a vanished file keeps the old mapping valid.
            let map = unsafe { MmapOptions::new().offset(aligned).len(take).map(&handle.file) }
                .map_err(|source| WindowError::Io {
                    path: pack.path().to_path_buf(),
                    source,
                })?;
            advise_random(&map);
            Window::mapped(pack.token(), aligned, map)
        } else {
            let mut buf = vec![0u8; take];
            read_exact_at(&handle.file, &mut buf, aligned).map_err(|source| WindowError::Io {
                path: pack.path().to_path_buf(),
                source,
            })?;
            Window::copied(pack.token(), aligned, buf)
        };

        inner.make_room(take);
        let window = Arc::new(window);
        let tick = inner.touch();
        inner.windows.insert(
            key,
            Slot {
                window: Arc::clone(&window),
                last_used: tick,
            },
        );
        inner.window_bytes += take;

        Ok(window)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for WindowCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("WindowCache")
            .field("cfg", &inner.cfg)
            .field("handles", &inner.handles.len())
            .field("windows", &inner.windows.len())
            .field("window_bytes", &inner.window_bytes)
            .finish()
    }
}

/// Private per-call access token for windowed reads.
///
/// The cursor pins the most recently used window for locality, so
/// sequential parsing of one entry usually takes the cache mutex once per
/// window rather than once per read.
pub struct WindowCursor {
    cache: Arc<WindowCache>,
    window: Option<Arc<Window>>,
    inflater: Inflater,
}

impl WindowCursor {
    /// Reads up to `dst.len()` bytes at `position`, bounded by the window
    /// holding that position.
    ///
    /// Returns 0 at end of file.
    pub fn read(
        &mut self,
        pack: &PackSource,
        position: u64,
        dst: &mut [u8],
    ) -> Result<usize, WindowError> {
        let window = match self.pin(pack, position) {
            Ok(window) => window,
            Err(WindowError::OutOfRange { .. }) => return Ok(0),
            Err(err) => return Err(err),
        };
        let avail = window.tail_from(position);
        let take = avail.len().min(dst.len());
        dst[..take].copy_from_slice(&avail[..take]);
        Ok(take)
    }

    /// Fills `dst` completely from `position`.
    ///
    /// # Errors
    /// Returns `UnexpectedEof` if the pack ends before `dst` is full.
    pub fn read_fully(
        &mut self,
        pack: &PackSource,
        mut position: u64,
        dst: &mut [u8],
    ) -> Result<(), WindowError> {
        let mut filled = 0usize;
        while filled < dst.len() {
            let n = self.read(pack, position, &mut dst[filled..])?;
            if n == 0 {
                return Err(WindowError::UnexpectedEof {
                    path: pack.path().to_path_buf(),
                    position,
                    wanted: dst.len() - filled,
                });
            }
            filled += n;
            position += n as u64;
        }
        Ok(())
    }

    /// Inflates a zlib stream starting at `position`, appending to `out`
    /// under a hard cap. The stream may span any number of windows.
    ///
    /// Returns the file position one past the stream's final compressed
    /// byte.
    pub fn inflate(
        &mut self,
        pack: &PackSource,
        mut position: u64,
        out: &mut Vec<u8>,
        max_out: usize,
    ) -> Result<u64, WindowError> {
        self.inflater.reset();

        loop {
            let window = match self.pin(pack, position) {
                Ok(window) => window,
                Err(WindowError::OutOfRange { .. }) => {
                    return Err(WindowError::Inflate(InflateError::TruncatedInput))
                }
                Err(err) => return Err(err),
            };
            let input = window.tail_from(position);
            if input.is_empty() {
                return Err(WindowError::Inflate(InflateError::TruncatedInput));
            }
            let step = self.inflater.step(input, out, max_out)?;
            position += step.consumed as u64;
            if step.finished {
                return Ok(position);
            }
            if step.consumed < input.len() {
                // No progress without more output room or input; with the
                // cap already enforced this is a corrupt stream.
                return Err(WindowError::Inflate(InflateError::Stalled));
            }
        }
    }

    /// Inflates a stream expected to produce exactly `expected` bytes.
    pub fn inflate_exact(
        &mut self,
        pack: &PackSource,
        position: u64,
        out: &mut Vec<u8>,
        expected: usize,
    ) -> Result<u64, WindowError> {
        let start_len = out.len();
        let end = self.inflate(pack, position, out, start_len + expected)?;
        if out.len() - start_len != expected {
            return Err(WindowError::Inflate(InflateError::TruncatedInput));
        }
        Ok(end)
    }

    /// Drops the pinned window, releasing its bytes back to cache control.
    pub fn release(&mut self) {
        self.window = None;
    }

    fn pin(&mut self, pack: &PackSource, position: u64) -> Result<Arc<Window>, WindowError> {
        let hit = self
            .window
            .as_ref()
            .is_some_and(|w| w.contains(pack.token(), position));
        if !hit {
            self.window = Some(self.cache.window(pack, position)?);
        }
        Ok(Arc::clone(self.window.as_ref().expect("window pinned")))
    }
}

impl fmt::Debug for WindowCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowCursor")
            .field("window", &self.window)
            .finish()
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pack shorter than expected",
            ));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn advise_random(map: &memmap2::Mmap) {
    // SAFETY: the mapping pointer and length are valid for the call; the
    // advice is best-effort and failures are ignored.
    unsafe {
        let _ = libc::madvise(map.as_ptr() as *mut libc::c_void, map.len(), libc::MADV_RANDOM);
    }
}

#[cfg(not(unix))]
fn advise_random(_map: &memmap2::Mmap) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_pack_bytes(dir: &std::path::Path, name: &str, len: usize) -> (PackSource, Vec<u8>) {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = dir.join(name);
        fs::write(&path, &bytes).unwrap();
        (PackSource::new(path), bytes)
    }

    fn small_cache(window_size_log2: u32, cache_bytes: usize, open_files: usize) -> Arc<WindowCache> {
        WindowCache::new(WindowCacheConfig::new(
            window_size_log2,
            cache_bytes,
            open_files,
            false,
        ))
    }

    #[test]
    fn read_fully_spans_windows() {
        let dir = tempdir().unwrap();
        let (pack, bytes) = write_pack_bytes(dir.path(), "a.pack", 4096);
        let cache = small_cache(8, 4096, 4); // 256-byte windows

        let mut cursor = cache.cursor();
        let mut dst = vec![0u8; 1000];
        cursor.read_fully(&pack, 100, &mut dst).unwrap();
        assert_eq!(dst, &bytes[100..1100]);
    }

    #[test]
    fn read_past_eof_returns_zero_and_read_fully_errors() {
        let dir = tempdir().unwrap();
        let (pack, _) = write_pack_bytes(dir.path(), "a.pack", 512);
        let cache = small_cache(8, 4096, 4);

        let mut cursor = cache.cursor();
        let mut dst = [0u8; 16];
        assert_eq!(cursor.read(&pack, 512, &mut dst).unwrap(), 0);

        let err = cursor.read_fully(&pack, 508, &mut dst).unwrap_err();
        assert!(matches!(err, WindowError::UnexpectedEof { wanted: 12, .. }));
        assert!(err.is_stale_file());
    }

    #[test]
    fn short_window_never_serves_positions_past_the_data() {
        let dir = tempdir().unwrap();
        let (pack, bytes) = write_pack_bytes(dir.path(), "s.pack", 100);
        let cache = small_cache(8, 4096, 4); // 256-byte windows, 100-byte file

        let mut cursor = cache.cursor();
        let mut dst = [0u8; 32];
        cursor.read(&pack, 0, &mut dst).unwrap();
        assert_eq!(dst[..], bytes[..32]);

        // Position 100 shares the aligned slot with the resident [0, 100)
        // window but holds no data; both the pinned-window and cache-hit
        // paths must report end of file, not an empty slice.
        assert_eq!(cursor.read(&pack, 100, &mut dst).unwrap(), 0);
        cursor.release();
        assert_eq!(cursor.read(&pack, 100, &mut dst).unwrap(), 0);
    }

    #[test]
    fn byte_budget_evicts_least_recently_used() {
        let dir = tempdir().unwrap();
        let (pack, bytes) = write_pack_bytes(dir.path(), "a.pack", 2048);
        // Budget of exactly two 256-byte windows.
        let cache = small_cache(8, 512, 4);

        let mut cursor = cache.cursor();
        let mut dst = [0u8; 8];
        cursor.read(&pack, 0, &mut dst).unwrap();
        cursor.read(&pack, 256, &mut dst).unwrap();
        cursor.read(&pack, 512, &mut dst).unwrap();
        assert!(cache.resident_window_bytes() <= 512);

        // Every read still sees correct bytes after eviction churn.
        cursor.read_fully(&pack, 0, &mut dst).unwrap();
        assert_eq!(dst, bytes[0..8]);
    }

    #[test]
    fn handle_limit_closes_least_recently_used_pack() {
        let dir = tempdir().unwrap();
        let (pack_a, bytes_a) = write_pack_bytes(dir.path(), "a.pack", 512);
        let (pack_b, _) = write_pack_bytes(dir.path(), "b.pack", 512);
        let cache = small_cache(8, 4096, 1);

        let mut cursor = cache.cursor();
        let mut dst = [0u8; 8];
        cursor.read(&pack_a, 0, &mut dst).unwrap();
        cursor.read(&pack_b, 0, &mut dst).unwrap();
        assert_eq!(cache.open_handle_count(), 1);

        // Reading pack A again transparently reopens it.
        cursor.release();
        cursor.read_fully(&pack_a, 0, &mut dst).unwrap();
        assert_eq!(dst, bytes_a[0..8]);
    }

    #[test]
    fn reconfigure_drops_windows_but_not_pinned_reads() {
        let dir = tempdir().unwrap();
        let (pack, bytes) = write_pack_bytes(dir.path(), "a.pack", 512);
        let cache = small_cache(8, 4096, 4);

        let mut cursor = cache.cursor();
        let mut dst = [0u8; 8];
        cursor.read(&pack, 0, &mut dst).unwrap();
        assert!(cache.resident_window_bytes() > 0);

        cache.reconfigure(WindowCacheConfig::new(8, 1024, 1, false));
        assert_eq!(cache.resident_window_bytes(), 0);
        assert_eq!(cache.open_handle_count(), 0);

        // The cursor still holds its pinned window and reads from it.
        let mut again = [0u8; 8];
        cursor.read(&pack, 0, &mut again).unwrap();
        assert_eq!(again, bytes[0..8]);
    }

    #[test]
    fn purge_retires_a_pack_generation() {
        let dir = tempdir().unwrap();
        let (pack, _) = write_pack_bytes(dir.path(), "a.pack", 512);
        let cache = small_cache(8, 4096, 4);

        let mut cursor = cache.cursor();
        let mut dst = [0u8; 8];
        cursor.read(&pack, 0, &mut dst).unwrap();
        assert_eq!(cache.open_handle_count(), 1);

        cache.purge(pack.token());
        assert_eq!(cache.open_handle_count(), 0);
        assert_eq!(cache.resident_window_bytes(), 0);
    }

    #[test]
    fn missing_file_is_reported_as_stale() {
        let dir = tempdir().unwrap();
        let pack = PackSource::new(dir.path().join("gone.pack"));
        let cache = small_cache(8, 4096, 4);

        let mut cursor = cache.cursor();
        let mut dst = [0u8; 8];
        let err = cursor.read(&pack, 0, &mut dst).unwrap_err();
        assert!(err.is_stale_file());
    }

    #[test]
    fn mmap_mode_reads_identical_bytes() {
        let dir = tempdir().unwrap();
        let (pack, bytes) = write_pack_bytes(dir.path(), "a.pack", 4096);
        let cache = WindowCache::new(WindowCacheConfig::new(8, 4096, 4, true));

        let mut cursor = cache.cursor();
        let mut dst = vec![0u8; 1000];
        cursor.read_fully(&pack, 37, &mut dst).unwrap();
        assert_eq!(dst, &bytes[37..1037]);
    }

    #[test]
    fn inflate_spans_windows() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write;

        let payload: Vec<u8> = (0..8192u32).map(|i| (i % 239) as u8).collect();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload).unwrap();
        let compressed = encoder.finish().unwrap();

        let dir = tempdir().unwrap();
        let mut file_bytes = vec![0xeeu8; 100]; // leading junk before the stream
        file_bytes.extend_from_slice(&compressed);
        let path = dir.path().join("z.pack");
        fs::write(&path, &file_bytes).unwrap();
        let pack = PackSource::new(path);

        let cache = small_cache(8, 1024, 4);
        let mut cursor = cache.cursor();
        let mut out = Vec::with_capacity(payload.len());
        let end = cursor
            .inflate_exact(&pack, 100, &mut out, payload.len())
            .unwrap();
        assert_eq!(out, payload);
        assert_eq!(end, 100 + compressed.len() as u64);
    }

    #[test]
    fn truncated_stream_is_truncated_input() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[0x55u8; 4096]).unwrap();
        let mut compressed = encoder.finish().unwrap();
        compressed.truncate(compressed.len() / 2);

        let dir = tempdir().unwrap();
        let path = dir.path().join("t.pack");
        fs::write(&path, &compressed).unwrap();
        let pack = PackSource::new(path);

        let cache = small_cache(8, 4096, 4);
        let mut cursor = cache.cursor();
        let mut out = Vec::new();
        let err = cursor.inflate(&pack, 0, &mut out, 8192).unwrap_err();
        assert!(matches!(
            err,
            WindowError::Inflate(InflateError::TruncatedInput)
        ));
    }
}
