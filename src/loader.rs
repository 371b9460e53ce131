//! Object loaders: materializing packed objects, delta chains included.
//!
//! A loader is a tagged handle to one pack entry. Whole entries inflate
//! directly. Delta entries walk their base chain with an explicit work
//! list: down to a whole base collecting delta payloads, then back up
//! applying them. Nothing recurses, so chain length costs heap frames
//! instead of stack.
//!
//! Once materialized, the bytes live in the loader itself. A loader
//! obtained before a repack keeps answering from its own buffer even
//! after the backing files are gone.

use std::sync::{Arc, OnceLock};

use crate::entry::{EntryKind, ObjectKind};
use crate::errors::StoreError;
use crate::inflate::InflateError;
use crate::object_cache::UnpackedObjectCache;
use crate::object_id::ObjectId;
use crate::pack_file::PackFile;
use crate::delta;
use crate::window::PackToken;
use crate::window_cache::{WindowCursor, WindowError};

/// Collaborators a delta-base search may consult beyond the owning pack.
pub trait BaseResolver {
    /// Finds another open pack containing `id`, skipping `excluding`.
    fn find_base_pack(&self, id: &ObjectId, excluding: PackToken) -> Option<Arc<PackFile>>;

    /// Loads `id` from loose storage, if it exists there.
    fn load_loose(&self, id: &ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>, StoreError>;
}

/// A resolver with no packs and no loose storage.
///
/// Sufficient whenever every base lives in the owning pack.
pub struct NoFallback;

impl BaseResolver for NoFallback {
    fn find_base_pack(&self, _id: &ObjectId, _excluding: PackToken) -> Option<Arc<PackFile>> {
        None
    }

    fn load_loose(&self, _id: &ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>, StoreError> {
        Ok(None)
    }
}

/// Everything a materialization pass needs besides the loader itself.
pub struct LoadContext<'a> {
    /// Windowed read access.
    pub cursor: &'a mut WindowCursor,
    /// Cross-pack and loose-object base lookup.
    pub resolver: &'a dyn BaseResolver,
    /// Cache of already-inflated entries, shared across loaders.
    pub unpacked: &'a UnpackedObjectCache,
    /// Hard bound on delta chain length.
    pub max_delta_depth: u8,
}

/// How this loader's entry is encoded in its pack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoaderKind {
    /// Plain deflated object.
    Whole { kind: ObjectKind },
    /// Delta against an earlier entry in the same pack.
    DeltaByOffset { base_offset: u64 },
    /// Delta against an object named by ID, possibly in another pack.
    DeltaById { base_id: ObjectId },
}

/// Where a loader's bytes come from.
enum LoaderOrigin {
    /// An entry in an open pack.
    Packed {
        pack: Arc<PackFile>,
        offset: u64,
        kind: LoaderKind,
    },
    /// A loose object; always constructed materialized.
    Loose { id: ObjectId },
}

/// Handle to one stored object.
pub struct ObjectLoader {
    origin: LoaderOrigin,
    materialized: OnceLock<(ObjectKind, Arc<[u8]>)>,
}

/// One pending delta application while walking down a chain.
struct Frame {
    pack: Arc<PackFile>,
    offset: u64,
    delta: Vec<u8>,
}

impl ObjectLoader {
    /// Creates a loader by parsing the entry header at `offset`.
    pub fn open(
        pack: Arc<PackFile>,
        cursor: &mut WindowCursor,
        offset: u64,
    ) -> Result<Self, StoreError> {
        let header = pack.entry_header(cursor, offset)?;
        let kind = match header.kind {
            EntryKind::Whole { kind } => LoaderKind::Whole { kind },
            EntryKind::OfsDelta { base_offset } => LoaderKind::DeltaByOffset { base_offset },
            EntryKind::RefDelta { base_id } => LoaderKind::DeltaById { base_id },
        };
        Ok(Self {
            origin: LoaderOrigin::Packed { pack, offset, kind },
            materialized: OnceLock::new(),
        })
    }

    /// Creates an already-materialized loader for a loose object.
    #[must_use]
    pub fn loose(id: ObjectId, kind: ObjectKind, bytes: Vec<u8>) -> Self {
        let materialized = OnceLock::new();
        let _ = materialized.set((kind, Arc::from(bytes.into_boxed_slice())));
        Self {
            origin: LoaderOrigin::Loose { id },
            materialized,
        }
    }

    /// The pack generation this loader reads from, if it is pack-backed.
    #[must_use]
    pub fn pack_token(&self) -> Option<PackToken> {
        match &self.origin {
            LoaderOrigin::Packed { pack, .. } => Some(pack.token()),
            LoaderOrigin::Loose { .. } => None,
        }
    }

    /// Entry offset inside the pack, if pack-backed.
    #[must_use]
    pub fn offset(&self) -> Option<u64> {
        match &self.origin {
            LoaderOrigin::Packed { offset, .. } => Some(*offset),
            LoaderOrigin::Loose { .. } => None,
        }
    }

    /// The entry's storage form, if pack-backed.
    #[must_use]
    pub fn storage(&self) -> Option<LoaderKind> {
        match &self.origin {
            LoaderOrigin::Packed { kind, .. } => Some(*kind),
            LoaderOrigin::Loose { .. } => None,
        }
    }

    /// The pack this loader reads from, if pack-backed.
    pub(crate) fn pack(&self) -> Option<&Arc<PackFile>> {
        match &self.origin {
            LoaderOrigin::Packed { pack, .. } => Some(pack),
            LoaderOrigin::Loose { .. } => None,
        }
    }

    /// ID of the object this loader serves, when it can be named: loose
    /// loaders know it directly, packed ones recover it through the
    /// reverse index.
    #[must_use]
    pub fn object_id(&self) -> Option<ObjectId> {
        match &self.origin {
            LoaderOrigin::Loose { id } => Some(*id),
            LoaderOrigin::Packed { pack, offset, .. } => {
                pack.reverse_index().find_object(*offset, pack.index())
            }
        }
    }

    /// True if the entry is delta-encoded.
    #[must_use]
    pub fn is_delta(&self) -> bool {
        matches!(
            &self.origin,
            LoaderOrigin::Packed { kind, .. } if !matches!(kind, LoaderKind::Whole { .. })
        )
    }

    /// ID of the delta base, when the entry is a delta and the base is
    /// identifiable. Ofs-delta bases are named through the reverse index.
    #[must_use]
    pub fn delta_base(&self) -> Option<ObjectId> {
        let LoaderOrigin::Packed { pack, kind, .. } = &self.origin else {
            return None;
        };
        match kind {
            LoaderKind::Whole { .. } => None,
            LoaderKind::DeltaById { base_id } => Some(*base_id),
            LoaderKind::DeltaByOffset { base_offset } => pack
                .reverse_index()
                .find_object(*base_offset, pack.index()),
        }
    }

    /// Materializes the object, resolving any delta chain, and returns its
    /// kind and bytes.
    ///
    /// The first successful call pins the result inside the loader;
    /// repeated calls are lookups.
    pub fn cached_bytes(
        &self,
        ctx: &mut LoadContext<'_>,
    ) -> Result<(ObjectKind, Arc<[u8]>), StoreError> {
        if let Some((kind, bytes)) = self.materialized.get() {
            return Ok((*kind, Arc::clone(bytes)));
        }
        let resolved = match &self.origin {
            LoaderOrigin::Packed { pack, offset, .. } => {
                resolve_chain(Arc::clone(pack), *offset, ctx)?
            }
            // Loose loaders are born materialized; the lookup above serves
            // them, so reaching here means the object is simply gone.
            LoaderOrigin::Loose { id } => return Err(StoreError::NotFound { id: *id }),
        };
        let entry = self.materialized.get_or_init(|| resolved);
        Ok((entry.0, Arc::clone(&entry.1)))
    }
}

/// Walks a delta chain starting at `(pack, offset)` and reconstructs the
/// object at its head.
fn resolve_chain(
    mut pack: Arc<PackFile>,
    mut offset: u64,
    ctx: &mut LoadContext<'_>,
) -> Result<(ObjectKind, Arc<[u8]>), StoreError> {
    let mut frames: Vec<Frame> = Vec::new();

    // Down: collect delta payloads until a whole base, a cache hit, or
    // the loose fallback terminates the chain.
    let (kind, mut bytes): (ObjectKind, Arc<[u8]>) = loop {
        if let Some((bytes, kind)) = ctx.unpacked.get(pack.token(), offset) {
            break (kind, bytes);
        }

        if frames.len() >= usize::from(ctx.max_delta_depth) {
            return Err(StoreError::DeltaDepthExceeded {
                max: u32::from(ctx.max_delta_depth),
            });
        }

        let header = pack.entry_header(ctx.cursor, offset)?;
        match header.kind {
            EntryKind::Whole { kind } => {
                let bytes =
                    inflate_entry(&pack, ctx.cursor, header.data_start, header.size, false)?;
                let bytes: Arc<[u8]> = Arc::from(bytes.into_boxed_slice());
                ctx.unpacked
                    .store(pack.token(), offset, Arc::clone(&bytes), kind);
                break (kind, bytes);
            }
            EntryKind::OfsDelta { base_offset } => {
                let delta =
                    inflate_entry(&pack, ctx.cursor, header.data_start, header.size, true)?;
                frames.push(Frame {
                    pack: Arc::clone(&pack),
                    offset,
                    delta,
                });
                offset = base_offset;
            }
            EntryKind::RefDelta { base_id } => {
                let delta =
                    inflate_entry(&pack, ctx.cursor, header.data_start, header.size, true)?;
                frames.push(Frame {
                    pack: Arc::clone(&pack),
                    offset,
                    delta,
                });

                if let Some(base_offset) = pack.find_offset(&base_id) {
                    offset = base_offset;
                } else if let Some(other) = ctx.resolver.find_base_pack(&base_id, pack.token()) {
                    offset = other
                        .find_offset(&base_id)
                        .ok_or(StoreError::MissingBase { id: base_id })?;
                    pack = other;
                } else if let Some((kind, loose)) = ctx.resolver.load_loose(&base_id)? {
                    break (kind, Arc::from(loose.into_boxed_slice()));
                } else {
                    return Err(StoreError::MissingBase { id: base_id });
                }
            }
        }
    };

    // Up: apply each collected delta against the growing result,
    // caching intermediates under their own (pack, offset) keys.
    while let Some(frame) = frames.pop() {
        let max_out = frame.pack.limits().max_object_bytes;
        let result = delta::apply(&bytes, &frame.delta, max_out)?;
        bytes = Arc::from(result.into_boxed_slice());
        ctx.unpacked
            .store(frame.pack.token(), frame.offset, Arc::clone(&bytes), kind);
    }

    Ok((kind, bytes))
}

impl std::fmt::Debug for ObjectLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("ObjectLoader");
        match &self.origin {
            LoaderOrigin::Packed { pack, offset, kind } => {
                dbg.field("pack", &pack.token())
                    .field("offset", offset)
                    .field("storage", kind);
            }
            LoaderOrigin::Loose { id } => {
                dbg.field("loose", &format_args!("{id}"));
            }
        }
        dbg.field("materialized", &self.materialized.get().is_some())
            .finish()
    }
}

/// Inflates one entry payload under the pack's decode caps.
fn inflate_entry(
    pack: &PackFile,
    cursor: &mut WindowCursor,
    data_start: u64,
    declared: u64,
    is_delta: bool,
) -> Result<Vec<u8>, StoreError> {
    let cap = if is_delta {
        pack.limits().max_delta_bytes
    } else {
        pack.limits().max_object_bytes
    };
    if declared > cap as u64 {
        return Err(WindowError::Inflate(InflateError::LimitExceeded).into());
    }
    let mut out = Vec::with_capacity(declared as usize);
    cursor.inflate_exact(pack.source(), data_start, &mut out, declared as usize)?;
    Ok(out)
}
