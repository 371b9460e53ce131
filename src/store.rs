//! The pack store: every `.idx`/`.pack` pair in one directory, plus the
//! shared caches and the repack-race recovery path.
//!
//! Lookup order is newest pack first, because a repack writes the most
//! complete pack last. When a read fails in the pattern of a vanished or
//! truncated file, the failing pack is invalidated (its windows and
//! cached objects dropped, its identity token retired), the directory is
//! rescanned exactly once, and the request is re-resolved. A second
//! failure surfaces to the caller.
//!
//! Loose objects are an external collaborator behind [`LooseObjects`];
//! the store never parses loose storage itself.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{StoreConfig, WindowCacheConfig};
use crate::entry::ObjectKind;
use crate::errors::StoreError;
use crate::loader::{BaseResolver, LoadContext, ObjectLoader};
use crate::object_cache::UnpackedObjectCache;
use crate::object_id::ObjectId;
use crate::pack_file::PackFile;
use crate::window::PackToken;
use crate::window_cache::WindowCache;

/// External loose-object storage consulted after every pack misses.
pub trait LooseObjects: Send + Sync {
    /// True if loose storage holds `id`.
    fn contains(&self, id: &ObjectId) -> bool;

    /// Loads the kind and inflated bytes of a loose object.
    fn load(&self, id: &ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>, StoreError>;
}

/// A repository with no loose storage at all.
pub struct NoLooseObjects;

impl LooseObjects for NoLooseObjects {
    fn contains(&self, _id: &ObjectId) -> bool {
        false
    }

    fn load(&self, _id: &ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>, StoreError> {
        Ok(None)
    }
}

/// All packs under one directory, with shared window and object caches.
pub struct PackStore {
    pack_dir: PathBuf,
    config: StoreConfig,
    windows: Arc<WindowCache>,
    unpacked: Arc<UnpackedObjectCache>,
    loose: Box<dyn LooseObjects>,
    /// Open packs, newest first. Guard held only for list edits, never
    /// across I/O.
    packs: Mutex<Vec<Arc<PackFile>>>,
}

impl PackStore {
    /// Opens the store over a pack directory with no loose storage.
    pub fn open(pack_dir: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        Self::open_with(pack_dir, config, Box::new(NoLooseObjects))
    }

    /// Opens the store with an external loose-object collaborator.
    pub fn open_with(
        pack_dir: &Path,
        config: StoreConfig,
        loose: Box<dyn LooseObjects>,
    ) -> Result<Self, StoreError> {
        let store = Self {
            pack_dir: pack_dir.to_path_buf(),
            config,
            windows: WindowCache::new(config.window),
            unpacked: UnpackedObjectCache::new(config.unpacked_cache_bytes),
            loose,
            packs: Mutex::new(Vec::new()),
        };
        store.rescan()?;
        Ok(store)
    }

    /// The shared window cache.
    #[must_use]
    pub fn window_cache(&self) -> &Arc<WindowCache> {
        &self.windows
    }

    /// The shared unpacked-object cache.
    #[must_use]
    pub fn unpacked_cache(&self) -> &Arc<UnpackedObjectCache> {
        &self.unpacked
    }

    /// Replaces the window cache limits; see [`WindowCache::reconfigure`].
    pub fn reconfigure_windows(&self, cfg: WindowCacheConfig) {
        self.windows.reconfigure(cfg);
    }

    /// Number of currently open packs.
    #[must_use]
    pub fn pack_count(&self) -> usize {
        self.lock_packs().len()
    }

    /// True if any pack or loose storage holds `id`.
    #[must_use]
    pub fn has_object(&self, id: &ObjectId) -> bool {
        self.snapshot().iter().any(|pack| pack.has_object(id)) || self.loose.contains(id)
    }

    /// Finds a loader for `id`, trying packs newest first and then loose
    /// storage.
    ///
    /// Stale-pack failures trigger one invalidate-and-rescan retry.
    pub fn open_object(&self, id: &ObjectId) -> Result<Option<ObjectLoader>, StoreError> {
        match self.resolve_loader(id) {
            Err(err) if err.is_stale_pack() => {
                self.rescan()?;
                self.resolve_loader(id)
            }
            other => other,
        }
    }

    /// Finds a loader in every open pack holding `id`. Diagnostic use:
    /// duplicates across packs come back as separate loaders.
    pub fn open_object_in_all_packs(
        &self,
        id: &ObjectId,
    ) -> Result<Vec<ObjectLoader>, StoreError> {
        let mut loaders = Vec::new();
        let mut cursor = self.windows.cursor();
        for pack in self.snapshot() {
            match pack.get(&mut cursor, id) {
                Ok(Some(loader)) => loaders.push(loader),
                Ok(None) => {}
                Err(err) if err.is_stale_pack() => self.invalidate(&pack),
                Err(err) => return Err(err),
            }
        }
        Ok(loaders)
    }

    /// Materializes a loader's bytes, resolving delta chains through this
    /// store's packs and loose storage.
    ///
    /// If the backing pack went stale since the loader was opened, the
    /// object is re-resolved once by ID against the rescanned directory.
    pub fn load_bytes(
        &self,
        loader: &ObjectLoader,
    ) -> Result<(ObjectKind, Arc<[u8]>), StoreError> {
        match self.load_bytes_once(loader) {
            Err(err) if err.is_stale_pack() => {
                let id = loader.object_id();
                if let Some(pack) = loader.pack() {
                    self.invalidate(pack);
                }
                self.rescan()?;
                let Some(id) = id else { return Err(err) };
                let Some(fresh) = self.open_object(&id)? else {
                    return Err(err);
                };
                self.load_bytes_once(&fresh)
            }
            other => other,
        }
    }

    /// Copies an object's raw record bytes (CRC-verified) into `out`, with
    /// the usual one-shot stale retry.
    pub fn copy_raw_data(&self, id: &ObjectId, out: &mut Vec<u8>) -> Result<(), StoreError> {
        match self.copy_raw_once(id, out) {
            Err(err) if err.is_stale_pack() => {
                self.rescan()?;
                out.clear();
                self.copy_raw_once(id, out)
            }
            other => other,
        }
    }

    /// One resolution pass over the current pack list.
    fn resolve_loader(&self, id: &ObjectId) -> Result<Option<ObjectLoader>, StoreError> {
        let mut cursor = self.windows.cursor();
        for pack in self.snapshot() {
            match pack.get(&mut cursor, id) {
                Ok(Some(loader)) => return Ok(Some(loader)),
                Ok(None) => {}
                Err(err) if err.is_stale_pack() => {
                    self.invalidate(&pack);
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
        match self.loose.load(id)? {
            Some((kind, bytes)) => Ok(Some(ObjectLoader::loose(*id, kind, bytes))),
            None => Ok(None),
        }
    }

    fn load_bytes_once(
        &self,
        loader: &ObjectLoader,
    ) -> Result<(ObjectKind, Arc<[u8]>), StoreError> {
        let mut cursor = self.windows.cursor();
        let mut ctx = LoadContext {
            cursor: &mut cursor,
            resolver: self,
            unpacked: &self.unpacked,
            max_delta_depth: self.config.max_delta_depth,
        };
        let result = loader.cached_bytes(&mut ctx);
        if let Err(err) = &result {
            if err.is_stale_pack() {
                if let Some(pack) = loader.pack() {
                    self.invalidate(pack);
                }
            }
        }
        result
    }

    fn copy_raw_once(&self, id: &ObjectId, out: &mut Vec<u8>) -> Result<(), StoreError> {
        let mut cursor = self.windows.cursor();
        for pack in self.snapshot() {
            if !pack.has_object(id) {
                continue;
            }
            return match pack.copy_raw_data(&mut cursor, id, out) {
                Err(err) if err.is_stale_pack() => {
                    self.invalidate(&pack);
                    Err(err)
                }
                other => other,
            };
        }
        Err(StoreError::NotFound { id: *id })
    }

    /// Retires one pack generation: windows, unpacked entries, list slot.
    fn invalidate(&self, pack: &Arc<PackFile>) {
        self.windows.purge(pack.token());
        self.unpacked.purge(pack.token());
        self.lock_packs().retain(|p| p.token() != pack.token());
    }

    /// Re-lists the pack directory, picking up packs added or replaced
    /// since the last scan and retiring the rest.
    pub fn refresh(&self) -> Result<(), StoreError> {
        self.rescan()
    }

    /// Re-lists the pack directory, keeping already-open packs whose data
    /// file is unchanged on disk and retiring the rest.
    ///
    /// A repack that reuses the same path fails the length/mtime identity
    /// check and gets reopened under a fresh token. Unopenable pairs
    /// (mid-rename, corrupt) are skipped; they get another chance on the
    /// next rescan.
    fn rescan(&self) -> Result<(), StoreError> {
        let found = self.scan_dir()?;
        let mut packs = self.lock_packs();

        let mut next: Vec<Arc<PackFile>> = Vec::with_capacity(found.len());
        for (idx_path, pack_path) in &found {
            if let Some(existing) = packs.iter().find(|p| p.idx_path() == idx_path) {
                if existing.same_on_disk() {
                    next.push(Arc::clone(existing));
                    continue;
                }
            }
            match PackFile::open(idx_path, pack_path, &self.windows, self.config.decode) {
                Ok(pack) => next.push(Arc::new(pack)),
                Err(_) => continue,
            }
        }

        for old in packs.iter() {
            if !next.iter().any(|p| p.token() == old.token()) {
                self.windows.purge(old.token());
                self.unpacked.purge(old.token());
            }
        }
        *packs = next;
        Ok(())
    }

    /// Lists `.idx` files with a sibling `.pack`, newest data file first.
    fn scan_dir(&self) -> Result<Vec<(PathBuf, PathBuf)>, StoreError> {
        let entries = match fs::read_dir(&self.pack_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut found: Vec<(PathBuf, PathBuf, SystemTime)> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let idx_path = entry.path();
            if idx_path.extension().and_then(|e| e.to_str()) != Some("idx") {
                continue;
            }
            let pack_path = idx_path.with_extension("pack");
            let Ok(meta) = fs::metadata(&pack_path) else {
                continue;
            };
            let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
            found.push((idx_path, pack_path, mtime));
        }
        found.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| b.0.cmp(&a.0)));
        Ok(found
            .into_iter()
            .map(|(idx, pack, _)| (idx, pack))
            .collect())
    }

    fn snapshot(&self) -> Vec<Arc<PackFile>> {
        self.lock_packs().clone()
    }

    fn lock_packs(&self) -> MutexGuard<'_, Vec<Arc<PackFile>>> {
        self.packs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BaseResolver for PackStore {
    fn find_base_pack(&self, id: &ObjectId, excluding: PackToken) -> Option<Arc<PackFile>> {
        self.snapshot()
            .into_iter()
            .find(|pack| pack.token() != excluding && pack.has_object(id))
    }

    fn load_loose(&self, id: &ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>, StoreError> {
        self.loose.load(id)
    }
}

impl std::fmt::Debug for PackStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackStore")
            .field("pack_dir", &self.pack_dir)
            .field("packs", &self.pack_count())
            .finish()
    }
}
