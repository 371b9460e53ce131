//! Content-addressed pack storage: `.pack`/`.idx` reading with bounded
//! caches and repack-safe object resolution.
//!
//! ## Scope
//! This crate reads git-format pack files: index lookup, windowed pack
//! I/O, delta-chain reconstruction, and raw record copying, all behind a
//! directory-level [`PackStore`].
//!
//! ## Key invariants
//! - All pack data flows through the window cache; budgets on resident
//!   window bytes and open file handles are strict LRU, never advisory.
//! - Pack identity is a generation token, not a path: a repacked file gets
//!   a fresh token, so stale windows and cached objects cannot leak into
//!   the replacement.
//! - Decoding is bounded everywhere: header length, inflated size, delta
//!   stream size, and delta chain depth all have explicit caps.
//! - Delta chains are walked iteratively with a work-list; chain length
//!   costs heap, never stack.
//!
//! ## Read flow (one object)
//! 1) Binary-search the fan-out index for the entry offset.
//! 2) Parse the entry header through a window cursor.
//! 3) Whole objects inflate directly; deltas walk down to a whole base,
//!    then apply payloads back up, consulting the unpacked-object cache
//!    at every link.
//! 4) A read failing like a vanished file invalidates the pack, rescans
//!    the directory once, and re-resolves by ID.
//!
//! ## Notable entry points
//! - [`PackStore`]: open a pack directory, look up and materialize objects.
//! - [`ObjectLoader`]: handle to one object; keeps its bytes once loaded.
//! - [`WindowCache`] / [`UnpackedObjectCache`]: shared, byte-budgeted caches.
//! - [`StoreConfig`]: every cap and budget in one place.

pub mod config;
pub mod delta;
pub mod entry;
pub mod errors;
pub mod inflate;
pub mod loader;
pub mod object_cache;
pub mod object_id;
pub mod pack_file;
pub mod pack_idx;
pub mod rev_index;
pub mod store;
pub mod window;
pub mod window_cache;

#[cfg(test)]
mod test_util;

pub use config::{DecodeLimits, StoreConfig, WindowCacheConfig};
pub use entry::{EntryHeader, EntryKind, ObjectKind, PackParseError};
pub use errors::{ErrorClass, StoreError};
pub use loader::{BaseResolver, LoadContext, LoaderKind, NoFallback, ObjectLoader};
pub use object_cache::UnpackedObjectCache;
pub use object_id::{ObjectId, MutableObjectId, ParseIdError, OBJECT_ID_HEX_LEN, OBJECT_ID_LEN};
pub use pack_file::PackFile;
pub use pack_idx::{IdxError, PackIndex};
pub use rev_index::{RevIndexError, ReverseIndex};
pub use store::{LooseObjects, NoLooseObjects, PackStore};
pub use window::{PackSource, PackToken, Window};
pub use window_cache::{WindowCache, WindowCursor, WindowError};
