//! Engine configuration.
//!
//! These values are consumed from an external configuration collaborator;
//! the engine never parses config files itself. Every cap is explicit so
//! corrupt input can only cost bounded work.

/// Window cache sizing and handle limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowCacheConfig {
    /// Window size as a power of two (window bytes = `1 << window_size_log2`).
    pub window_size_log2: u32,
    /// Total byte budget across all live windows.
    pub cache_bytes: usize,
    /// Maximum simultaneously open pack file handles.
    pub max_open_files: usize,
    /// Map windows with `mmap` instead of buffered positional reads.
    pub mmap: bool,
}

impl WindowCacheConfig {
    /// Constructs a window cache configuration.
    #[must_use]
    pub const fn new(
        window_size_log2: u32,
        cache_bytes: usize,
        max_open_files: usize,
        mmap: bool,
    ) -> Self {
        Self {
            window_size_log2,
            cache_bytes,
            max_open_files,
            mmap,
        }
    }

    /// Window length in bytes.
    #[inline]
    #[must_use]
    pub const fn window_size(&self) -> usize {
        1usize << self.window_size_log2
    }
}

impl Default for WindowCacheConfig {
    fn default() -> Self {
        // 64 KiB windows under a 10 MiB budget, 128 open packs, buffered I/O.
        Self::new(16, 10 * 1024 * 1024, 128, false)
    }
}

/// Caps applied while decoding individual pack entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Maximum entry header bytes to parse before declaring corruption.
    pub max_header_bytes: usize,
    /// Maximum inflated size for any whole object.
    pub max_object_bytes: usize,
    /// Maximum inflated size for a delta instruction stream.
    pub max_delta_bytes: usize,
}

impl DecodeLimits {
    /// Constructs decode limits.
    #[must_use]
    pub const fn new(
        max_header_bytes: usize,
        max_object_bytes: usize,
        max_delta_bytes: usize,
    ) -> Self {
        Self {
            max_header_bytes,
            max_object_bytes,
            max_delta_bytes,
        }
    }
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self::new(32, 256 * 1024 * 1024, 64 * 1024 * 1024)
    }
}

/// Full engine configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    /// Window cache sizing.
    pub window: WindowCacheConfig,
    /// Byte budget for the unpacked (materialized) object cache.
    pub unpacked_cache_bytes: usize,
    /// Maximum delta chain depth, counted in delta edges.
    pub max_delta_depth: u8,
    /// Per-entry decode caps.
    pub decode: DecodeLimits,
}

impl StoreConfig {
    /// Constructs a store configuration.
    #[must_use]
    pub const fn new(
        window: WindowCacheConfig,
        unpacked_cache_bytes: usize,
        max_delta_depth: u8,
        decode: DecodeLimits,
    ) -> Self {
        Self {
            window,
            unpacked_cache_bytes,
            max_delta_depth,
            decode,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(
            WindowCacheConfig::default(),
            10 * 1024 * 1024,
            64,
            DecodeLimits::default(),
        )
    }
}
