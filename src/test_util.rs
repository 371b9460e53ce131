//! Fixture builders shared by unit tests.
//!
//! These construct byte-accurate `.idx` v2 and `.pack` v2 files in memory
//! so parser and cache tests never depend on checked-in binary fixtures.

use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use std::io::Write;

use crate::entry::ObjectKind;
use crate::object_id::{ObjectId, OBJECT_ID_LEN};

/// Builds a pack index v2 byte image from `(id, offset, crc32)` triples.
///
/// Entries may be added in any order; `build` sorts them into hash order
/// and routes offsets at or above the 31-bit boundary through the
/// large-offset extension table.
pub struct IdxBuilder {
    entries: Vec<(ObjectId, u64, u32)>,
    pack_checksum: [u8; OBJECT_ID_LEN],
}

impl IdxBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            pack_checksum: [0; OBJECT_ID_LEN],
        }
    }

    pub fn add(&mut self, id: ObjectId, offset: u64, crc: u32) {
        self.entries.push((id, offset, crc));
    }

    /// Records the pack checksum to embed in the trailer, tying this index
    /// to a specific pack image.
    pub fn pack_checksum(&mut self, checksum: [u8; OBJECT_ID_LEN]) {
        self.pack_checksum = checksum;
    }

    pub fn build(&self) -> Vec<u8> {
        let mut entries = self.entries.clone();
        entries.sort_by_key(|(id, _, _)| *id);

        let mut out = Vec::new();
        out.extend_from_slice(&[0xff, b't', b'O', b'c']);
        out.extend_from_slice(&2u32.to_be_bytes());

        // Cumulative fanout over the first ID byte.
        let mut fanout = [0u32; 256];
        for (id, _, _) in &entries {
            fanout[id.first_byte() as usize] += 1;
        }
        let mut running = 0u32;
        for slot in &mut fanout {
            running += *slot;
            *slot = running;
        }
        for val in fanout {
            out.extend_from_slice(&val.to_be_bytes());
        }

        for (id, _, _) in &entries {
            out.extend_from_slice(id.as_slice());
        }
        for (_, _, crc) in &entries {
            out.extend_from_slice(&crc.to_be_bytes());
        }

        let mut large = Vec::new();
        for (_, offset, _) in &entries {
            if *offset < 0x8000_0000 {
                out.extend_from_slice(&(*offset as u32).to_be_bytes());
            } else {
                let idx = large.len() as u32;
                out.extend_from_slice(&(0x8000_0000u32 | idx).to_be_bytes());
                large.push(*offset);
            }
        }
        for offset in large {
            out.extend_from_slice(&offset.to_be_bytes());
        }

        out.extend_from_slice(&self.pack_checksum);
        let idx_checksum = Sha1::digest(&out);
        out.extend_from_slice(&idx_checksum);
        out
    }
}

/// Builds a pack v2 byte image entry by entry.
///
/// `add_*` return the absolute offset of the entry just written, which is
/// what the matching [`IdxBuilder`] record needs.
pub struct PackBuilder {
    body: Vec<u8>,
    count: u32,
}

impl PackBuilder {
    pub fn new() -> Self {
        Self {
            body: Vec::new(),
            count: 0,
        }
    }

    fn next_offset(&self) -> u64 {
        12 + self.body.len() as u64
    }

    pub fn add_whole(&mut self, kind: ObjectKind, payload: &[u8]) -> u64 {
        let offset = self.next_offset();
        let code = match kind {
            ObjectKind::Commit => 1,
            ObjectKind::Tree => 2,
            ObjectKind::Blob => 3,
            ObjectKind::Tag => 4,
        };
        self.body
            .extend_from_slice(&encode_entry_header(code, payload.len() as u64));
        self.body.extend_from_slice(&compress(payload));
        self.count += 1;
        offset
    }

    pub fn add_ofs_delta(&mut self, base_offset: u64, delta: &[u8]) -> u64 {
        let offset = self.next_offset();
        self.body
            .extend_from_slice(&encode_entry_header(6, delta.len() as u64));
        self.body
            .extend_from_slice(&encode_ofs_distance(offset - base_offset));
        self.body.extend_from_slice(&compress(delta));
        self.count += 1;
        offset
    }

    pub fn add_ref_delta(&mut self, base_id: ObjectId, delta: &[u8]) -> u64 {
        let offset = self.next_offset();
        self.body
            .extend_from_slice(&encode_entry_header(7, delta.len() as u64));
        self.body.extend_from_slice(base_id.as_slice());
        self.body.extend_from_slice(&compress(delta));
        self.count += 1;
        offset
    }

    /// Finishes the image: `PACK` header, entries, SHA-1 trailer.
    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.body.len() + 20);
        out.extend_from_slice(b"PACK");
        out.extend_from_slice(&2u32.to_be_bytes());
        out.extend_from_slice(&self.count.to_be_bytes());
        out.extend_from_slice(&self.body);
        let checksum = Sha1::digest(&out);
        out.extend_from_slice(&checksum);
        out
    }
}

/// Encodes a pack entry header: type code in bits 4-6 of the first byte,
/// inflated size spread low-to-high across continuation bytes.
pub fn encode_entry_header(type_code: u8, size: u64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = size >> 4;
    let mut byte = (type_code << 4) | (size & 0x0f) as u8;
    while rest != 0 {
        out.push(byte | 0x80);
        byte = (rest & 0x7f) as u8;
        rest >>= 7;
    }
    out.push(byte);
    out
}

/// Encodes the ofs-delta backward distance (big-endian base-128 with the
/// off-by-one continuation bias).
pub fn encode_ofs_distance(distance: u64) -> Vec<u8> {
    let mut bytes = vec![(distance & 0x7f) as u8];
    let mut rest = distance >> 7;
    while rest != 0 {
        rest -= 1;
        bytes.push(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    bytes.reverse();
    bytes
}

/// Zlib-compresses a payload the way pack entries are stored.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Little-endian base-128 varint used by delta stream headers.
pub fn delta_varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// Delta copy command referencing `size` bytes at `offset` in the base.
pub fn delta_copy(offset: u32, size: u32) -> Vec<u8> {
    let mut cmd = 0x80u8;
    let mut args = Vec::new();
    for (bit, shift) in [(0x01u8, 0), (0x02, 8), (0x04, 16), (0x08, 24)] {
        let byte = ((offset >> shift) & 0xff) as u8;
        if byte != 0 {
            cmd |= bit;
            args.push(byte);
        }
    }
    for (bit, shift) in [(0x10u8, 0), (0x20, 8), (0x40, 16)] {
        let byte = ((size >> shift) & 0xff) as u8;
        if byte != 0 {
            cmd |= bit;
            args.push(byte);
        }
    }
    let mut out = vec![cmd];
    out.extend_from_slice(&args);
    out
}

/// Delta insert command carrying literal bytes (at most 127 per command).
pub fn delta_insert(data: &[u8]) -> Vec<u8> {
    assert!(!data.is_empty() && data.len() <= 0x7f);
    let mut out = vec![data.len() as u8];
    out.extend_from_slice(data);
    out
}

/// Assembles a complete delta stream from its two size headers and the
/// concatenated command bytes.
pub fn delta_stream(base_len: u64, result_len: u64, commands: &[u8]) -> Vec<u8> {
    let mut out = delta_varint(base_len);
    out.extend_from_slice(&delta_varint(result_len));
    out.extend_from_slice(commands);
    out
}

/// Computes the content hash an object would have as a loose object:
/// `sha1("<kind> <len>\0" + payload)`.
pub fn object_id_for(kind: ObjectKind, payload: &[u8]) -> ObjectId {
    let mut hasher = Sha1::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(payload.len().to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(payload);
    let digest = hasher.finalize();
    ObjectId::from_slice(&digest)
}

/// Pack trailer checksum of a finished pack image.
pub fn pack_trailer(pack: &[u8]) -> [u8; OBJECT_ID_LEN] {
    let mut checksum = [0u8; OBJECT_ID_LEN];
    checksum.copy_from_slice(&pack[pack.len() - OBJECT_ID_LEN..]);
    checksum
}
