//! Storage manifest: the root of everything persisted in page storage.
//!
//! The manifest is small and rewritten in full on every checkpoint through
//! [`mvdb_storage::FileSystem::write_atomic`], so a crash leaves either the
//! old or the new version, never a mix.
//!
//! Layout: magic `MVMF`, format version (u16 LE), body, CRC32 of magic,
//! version and body (u32 LE).

use crate::error::{CoreError, CoreResult};
use crate::types::{CheckpointMark, ChunkId, LogPosition, PagePos, PageStorageMode, TransactionId};
use mvdb_codec::{Reader, Writer};
use std::collections::BTreeSet;

/// File name of the manifest inside the database directory.
pub const MANIFEST_FILE: &str = "MANIFEST";

/// Magic bytes for manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"MVMF";

/// Current manifest version.
pub const MANIFEST_VERSION: u16 = 1;

const MAX_ENTRIES: u64 = 1 << 24;

/// Persistent description of one map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapMeta {
    /// Map id, unique for the life of the storage.
    pub id: u32,
    /// Map name.
    pub name: String,
    /// Leaf layout.
    pub mode: PageStorageMode,
    /// Root page, `None` for a map that was never saved non-empty.
    pub root: Option<PagePos>,
}

/// Accounting for one chunk file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Chunk id.
    pub id: ChunkId,
    /// File length in bytes.
    pub len: u64,
    /// Pages written into the chunk.
    pub page_count: u64,
    /// Pages still referenced by some map.
    pub live_pages: u64,
    /// Bytes of those live pages.
    pub live_len: u64,
    /// Ids of maps with pages in this chunk.
    pub maps: BTreeSet<u32>,
    /// Transaction counter value when the last live page died.
    pub unused_since: Option<u64>,
}

impl ChunkInfo {
    /// Live bytes as a percentage of page bytes.
    pub fn fill_rate(&self) -> u64 {
        if self.len == 0 {
            return 0;
        }
        self.live_len.saturating_mul(100) / self.len
    }

    /// True once no page in the chunk is referenced.
    pub fn is_unused(&self) -> bool {
        self.live_pages == 0
    }
}

/// Storage manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Highest transaction or commit id handed out before the checkpoint.
    pub last_transaction_id: TransactionId,
    /// Checkpoint mark.
    pub mark: CheckpointMark,
    /// Next chunk id to assign.
    pub next_chunk_id: u32,
    /// Next map id to assign.
    pub next_map_id: u32,
    /// Maps, ordered by name.
    pub maps: Vec<MapMeta>,
    /// Chunks, ordered by id.
    pub chunks: Vec<ChunkInfo>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            last_transaction_id: TransactionId::ZERO,
            mark: CheckpointMark::default(),
            next_chunk_id: 1,
            next_map_id: 1,
            maps: Vec::new(),
            chunks: Vec::new(),
        }
    }
}

impl Manifest {
    /// Encodes the manifest to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(256);
        w.put_raw(&MANIFEST_MAGIC);
        w.put_u16(MANIFEST_VERSION);

        w.put_varint(self.last_transaction_id.as_u64());
        w.put_varint(self.mark.last_gc_meta_id);
        w.put_varint(self.mark.log_position.file);
        w.put_varint(self.mark.log_position.offset);
        w.put_u32(self.next_chunk_id);
        w.put_u32(self.next_map_id);

        w.put_varint(self.maps.len() as u64);
        for map in &self.maps {
            w.put_varint(u64::from(map.id));
            w.put_str(&map.name);
            w.put_u8(map.mode.tag());
            match map.root {
                Some(pos) => {
                    w.put_u8(1);
                    put_pos(&mut w, pos);
                }
                None => w.put_u8(0),
            }
        }

        w.put_varint(self.chunks.len() as u64);
        for chunk in &self.chunks {
            w.put_u32(chunk.id.as_u32());
            w.put_varint(chunk.len);
            w.put_varint(chunk.page_count);
            w.put_varint(chunk.live_pages);
            w.put_varint(chunk.live_len);
            w.put_varint(chunk.maps.len() as u64);
            for id in &chunk.maps {
                w.put_varint(u64::from(*id));
            }
            match chunk.unused_since {
                Some(since) => {
                    w.put_u8(1);
                    w.put_varint(since);
                }
                None => w.put_u8(0),
            }
        }

        let crc = crc32fast::hash(w.as_bytes());
        w.put_u32(crc);
        w.into_bytes()
    }

    /// Decodes a manifest from bytes.
    ///
    /// # Errors
    ///
    /// Returns `ManifestCorruption` for a bad magic, an unsupported version,
    /// a checksum mismatch or a malformed body.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < MANIFEST_MAGIC.len() + 2 + 4 {
            return Err(CoreError::manifest_corruption("manifest too short"));
        }
        if data[0..4] != MANIFEST_MAGIC {
            return Err(CoreError::manifest_corruption("invalid manifest magic"));
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = crc32fast::hash(body);
        if stored != actual {
            return Err(CoreError::manifest_corruption(format!(
                "checksum mismatch: expected {stored:#x}, got {actual:#x}"
            )));
        }
        Self::decode_body(&body[4..]).map_err(|e| match e {
            CoreError::ManifestCorruption { .. } => e,
            other => CoreError::manifest_corruption(other.to_string()),
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn decode_body(data: &[u8]) -> CoreResult<Self> {
        let mut r = Reader::new(data);
        let version = r.u16()?;
        if version > MANIFEST_VERSION {
            return Err(CoreError::manifest_corruption(format!(
                "unsupported manifest version: {version}"
            )));
        }

        let last_transaction_id = TransactionId::new(r.varint()?);
        let mark = CheckpointMark {
            last_gc_meta_id: r.varint()?,
            log_position: LogPosition::new(r.varint()?, r.varint()?),
        };
        let next_chunk_id = r.u32()?;
        let next_map_id = r.u32()?;

        let map_count = r.length(MAX_ENTRIES)?;
        let mut maps = Vec::with_capacity(map_count.min(1024));
        for _ in 0..map_count {
            let id = r.varint()? as u32;
            let name = r.str()?.to_string();
            let tag = r.u8()?;
            let mode = PageStorageMode::from_tag(tag).ok_or_else(|| {
                CoreError::manifest_corruption(format!("unknown storage mode {tag}"))
            })?;
            let root = match r.u8()? {
                0 => None,
                _ => Some(read_pos(&mut r)?),
            };
            maps.push(MapMeta {
                id,
                name,
                mode,
                root,
            });
        }

        let chunk_count = r.length(MAX_ENTRIES)?;
        let mut chunks = Vec::with_capacity(chunk_count.min(1024));
        for _ in 0..chunk_count {
            let id = ChunkId::new(r.u32()?);
            let len = r.varint()?;
            let page_count = r.varint()?;
            let live_pages = r.varint()?;
            let live_len = r.varint()?;
            let map_ids = r.length(MAX_ENTRIES)?;
            let mut chunk_maps = BTreeSet::new();
            for _ in 0..map_ids {
                chunk_maps.insert(r.varint()? as u32);
            }
            let unused_since = match r.u8()? {
                0 => None,
                _ => Some(r.varint()?),
            };
            chunks.push(ChunkInfo {
                id,
                len,
                page_count,
                live_pages,
                live_len,
                maps: chunk_maps,
                unused_since,
            });
        }

        if !r.is_empty() {
            return Err(CoreError::manifest_corruption("trailing bytes in manifest"));
        }

        Ok(Self {
            last_transaction_id,
            mark,
            next_chunk_id,
            next_map_id,
            maps,
            chunks,
        })
    }

    /// Looks up a map by name.
    pub fn map(&self, name: &str) -> Option<&MapMeta> {
        self.maps.iter().find(|m| m.name == name)
    }
}

/// Writes a page position in its fixed 12-byte form.
pub(crate) fn put_pos(w: &mut Writer, pos: PagePos) {
    w.put_u32(pos.chunk.as_u32());
    w.put_u32(pos.offset);
    w.put_u32(pos.len);
}

/// Reads a page position written by [`put_pos`].
pub(crate) fn read_pos(r: &mut Reader<'_>) -> CoreResult<PagePos> {
    Ok(PagePos::new(ChunkId::new(r.u32()?), r.u32()?, r.u32()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        Manifest {
            last_transaction_id: TransactionId::new(41),
            mark: CheckpointMark {
                last_gc_meta_id: 3,
                log_position: LogPosition::new(7, 0),
            },
            next_chunk_id: 5,
            next_map_id: 3,
            maps: vec![
                MapMeta {
                    id: 1,
                    name: "accounts".into(),
                    mode: PageStorageMode::Row,
                    root: Some(PagePos::new(ChunkId::new(4), 16, 120)),
                },
                MapMeta {
                    id: 2,
                    name: "events".into(),
                    mode: PageStorageMode::Column,
                    root: None,
                },
            ],
            chunks: vec![ChunkInfo {
                id: ChunkId::new(4),
                len: 4096,
                page_count: 9,
                live_pages: 9,
                live_len: 4000,
                maps: [1].into_iter().collect(),
                unused_since: None,
            }],
        }
    }

    #[test]
    fn encode_decode_preserves_everything() {
        let manifest = sample();
        let decoded = Manifest::decode(&manifest.encode()).unwrap();
        assert_eq!(decoded, manifest);
        assert_eq!(decoded.map("events").unwrap().id, 2);
    }

    #[test]
    fn empty_manifest_round_trips() {
        let manifest = Manifest::default();
        assert_eq!(Manifest::decode(&manifest.encode()).unwrap(), manifest);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        let err = Manifest::decode(&bytes).unwrap_err();
        assert!(matches!(err, CoreError::ManifestCorruption { .. }));
    }

    #[test]
    fn flipped_byte_rejected() {
        let mut bytes = sample().encode();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x40;
        assert!(Manifest::decode(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn future_version_rejected() {
        let mut manifest_bytes = Manifest::default().encode();
        manifest_bytes.truncate(manifest_bytes.len() - 4);
        manifest_bytes[4..6].copy_from_slice(&(MANIFEST_VERSION + 1).to_le_bytes());
        let crc = crc32fast::hash(&manifest_bytes);
        manifest_bytes.extend_from_slice(&crc.to_le_bytes());
        let err = Manifest::decode(&manifest_bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported manifest version"));
    }

    #[test]
    fn fill_rate_is_percentage_of_live_bytes() {
        let mut chunk = sample().chunks.remove(0);
        chunk.live_len = 1024;
        assert_eq!(chunk.fill_rate(), 25);
        chunk.live_pages = 0;
        assert!(chunk.is_unused());
    }
}
