//! Chunk files and their space accounting.
//!
//! A checkpoint writes all pages it persists into one new chunk file:
//!
//! ```text
//! magic "MVCK" | version u16 | reserved u16 | chunk id u32 | reserved u32 | page frames...
//! ```
//!
//! Chunks are never modified after they are synced. When pages are
//! replaced, the chunk holding the old copy loses live bytes; chunks that
//! fall below the fill-rate threshold are rewritten by compaction and files
//! with no live page left are deleted once no reader can still reach them.

use crate::btree::codec::{self, RawPage};
use crate::btree::page::Page;
use crate::config::StorageConfig;
use crate::context::EngineContext;
use crate::error::{CoreError, CoreResult};
use crate::manifest::ChunkInfo;
use crate::record::MapValue;
use crate::types::{ChunkId, PagePos};
use mvdb_codec::Value;
use mvdb_storage::{FileSystem, StorageBackend};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Magic bytes at the start of every chunk file.
pub const CHUNK_MAGIC: [u8; 4] = *b"MVCK";

/// Current chunk format version.
pub const CHUNK_VERSION: u16 = 1;

/// Chunk header size; the first page starts here.
pub const CHUNK_HEADER_LEN: usize = 16;

/// Collects the pages of one checkpoint before they hit the disk.
pub(crate) struct ChunkWriter {
    id: ChunkId,
    buf: Vec<u8>,
    pages: u64,
    maps: BTreeSet<u32>,
    config: StorageConfig,
}

impl ChunkWriter {
    fn new(id: ChunkId, config: StorageConfig) -> Self {
        let mut buf = Vec::with_capacity(config.page_size * 4);
        buf.extend_from_slice(&CHUNK_MAGIC);
        buf.extend_from_slice(&CHUNK_VERSION.to_le_bytes());
        buf.extend_from_slice(&[0; 2]);
        buf.extend_from_slice(&id.as_u32().to_le_bytes());
        buf.extend_from_slice(&[0; 4]);
        Self {
            id,
            buf,
            pages: 0,
            maps: BTreeSet::new(),
            config,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn page_count(&self) -> u64 {
        self.pages
    }

    /// Appends one page frame for `map` and returns where it will live.
    pub fn add_page(&mut self, map: u32, kind: u8, payload: &[u8]) -> CoreResult<PagePos> {
        let frame = codec::encode_frame(kind, payload, self.config.compression)?;
        let offset = u32::try_from(self.buf.len())
            .map_err(|_| CoreError::invalid_operation("chunk larger than 4 GiB"))?;
        let len = u32::try_from(frame.len())
            .map_err(|_| CoreError::invalid_operation("page larger than 4 GiB"))?;
        self.buf.extend_from_slice(&frame);
        self.pages += 1;
        self.maps.insert(map);
        Ok(PagePos::new(self.id, offset, len))
    }
}

impl fmt::Debug for ChunkWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkWriter")
            .field("id", &self.id)
            .field("len", &self.buf.len())
            .field("pages", &self.pages)
            .finish_non_exhaustive()
    }
}

/// Registry of chunk files plus cached read handles.
///
/// The GC clock orders page retirement against readers: a chunk stamped
/// `unused_since = s` is deleted only once every pinned reader and every
/// active transaction is newer than `s`.
pub(crate) struct ChunkStore {
    fs: Arc<dyn FileSystem>,
    context: Arc<EngineContext>,
    config: StorageConfig,
    chunks: RwLock<BTreeMap<ChunkId, ChunkInfo>>,
    next_id: AtomicU32,
    readers: RwLock<HashMap<ChunkId, Arc<dyn StorageBackend>>>,
    clock: AtomicU64,
    /// Clock values of live cursors, with counts.
    pins: Mutex<BTreeMap<u64, usize>>,
}

impl ChunkStore {
    /// Opens the store with the chunks recorded in the manifest.
    ///
    /// Chunk files the manifest does not know about are leftovers of an
    /// interrupted checkpoint and are deleted, as are chunks without live
    /// pages.
    pub fn open(
        fs: Arc<dyn FileSystem>,
        context: Arc<EngineContext>,
        config: StorageConfig,
        chunks: Vec<ChunkInfo>,
        next_id: u32,
    ) -> CoreResult<Self> {
        let mut known = BTreeMap::new();
        for info in chunks {
            if info.is_unused() {
                tracing::debug!(chunk = %info.id, "dropping chunk without live pages");
                fs.remove(&info.id.file_name())?;
                continue;
            }
            if !fs.exists(&info.id.file_name()) {
                return Err(CoreError::manifest_corruption(format!(
                    "{} is listed in the manifest but its file is missing",
                    info.id
                )));
            }
            known.insert(info.id, info);
        }

        let mut next = next_id.max(1);
        for name in fs.list()? {
            let Some(id) = ChunkId::from_file_name(&name) else {
                continue;
            };
            if !known.contains_key(&id) {
                tracing::info!(chunk = %id, "removing orphaned chunk file");
                fs.remove(&name)?;
            }
            next = next.max(id.as_u32() + 1);
        }

        Ok(Self {
            fs,
            context,
            config,
            chunks: RwLock::new(known),
            next_id: AtomicU32::new(next),
            readers: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            pins: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    /// Starts a new chunk.
    pub fn writer(&self) -> ChunkWriter {
        let id = ChunkId::new(self.next_id.fetch_add(1, Ordering::AcqRel));
        ChunkWriter::new(id, self.config)
    }

    /// Writes and syncs a chunk, then registers it.
    ///
    /// Returns `None` if the writer holds no pages; nothing is written then.
    pub fn commit(&self, writer: ChunkWriter) -> CoreResult<Option<ChunkInfo>> {
        if writer.pages == 0 {
            return Ok(None);
        }
        let name = writer.id.file_name();
        let written = (|| -> CoreResult<()> {
            let mut file = self.fs.open(&name)?;
            file.truncate(0)?;
            file.append(&writer.buf)?;
            file.sync()?;
            Ok(())
        })();
        if let Err(e) = written {
            let _ = self.fs.remove(&name);
            return Err(e);
        }

        let page_len = (writer.buf.len() - CHUNK_HEADER_LEN) as u64;
        let info = ChunkInfo {
            id: writer.id,
            len: page_len,
            page_count: writer.pages,
            live_pages: writer.pages,
            live_len: page_len,
            maps: writer.maps,
            unused_since: None,
        };
        tracing::debug!(chunk = %info.id, pages = info.page_count, bytes = info.len, "chunk written");
        self.chunks.write().insert(info.id, info.clone());
        Ok(Some(info))
    }

    fn reader(&self, id: ChunkId) -> CoreResult<Arc<dyn StorageBackend>> {
        if let Some(reader) = self.readers.read().get(&id) {
            return Ok(Arc::clone(reader));
        }
        let name = id.file_name();
        if !self.fs.exists(&name) {
            return Err(CoreError::page_corruption(format!("{id} file is missing")));
        }
        let reader: Arc<dyn StorageBackend> = Arc::from(self.fs.open(&name)?);
        let mut readers = self.readers.write();
        Ok(Arc::clone(readers.entry(id).or_insert(reader)))
    }

    /// Reads and validates the frame at `pos`.
    pub fn read_frame(&self, pos: PagePos) -> CoreResult<(u8, Vec<u8>)> {
        if (pos.offset as usize) < CHUNK_HEADER_LEN {
            return Err(CoreError::page_corruption(format!(
                "page {pos} overlaps the chunk header"
            )));
        }
        let reader = self.reader(pos.chunk)?;
        let frame = reader
            .read_at(u64::from(pos.offset), pos.len as usize)
            .map_err(|e| CoreError::page_corruption(format!("page {pos} unreadable: {e}")))?;
        codec::decode_frame(&frame, pos)
    }

    /// Reads a typed B-tree page.
    pub fn read_page<V: MapValue>(&self, pos: PagePos) -> CoreResult<Page<V>> {
        let (kind, payload) = self.read_frame(pos)?;
        codec::decode_page(kind, &payload, pos, &self.context)
    }

    /// Reads one column page.
    pub fn read_column(&self, pos: PagePos) -> CoreResult<Vec<Value>> {
        let (kind, payload) = self.read_frame(pos)?;
        codec::decode_column(kind, &payload, pos)
    }

    /// Reads the structure of any page.
    pub fn read_raw(&self, pos: PagePos) -> CoreResult<RawPage> {
        let (kind, payload) = self.read_frame(pos)?;
        codec::decode_raw(kind, &payload, pos)
    }

    /// Every position reachable from `root`, without decoding values.
    pub fn collect_positions(&self, root: PagePos) -> CoreResult<Vec<PagePos>> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(pos) = stack.pop() {
            out.push(pos);
            match self.read_raw(pos)? {
                RawPage::Node { children, .. } => stack.extend(children.iter().map(|(p, _)| *p)),
                RawPage::ColumnLeaf { columns, .. } => out.extend(columns),
                RawPage::Leaf { .. } | RawPage::Column { .. } => {}
            }
        }
        Ok(out)
    }

    /// Advances the GC clock by one step and returns the new value. Used
    /// where no transaction counter drives the clock.
    pub fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Registers a reader of the current roots and returns its pin. Chunks
    /// retired after this call outlive the pin.
    pub fn pin(&self) -> u64 {
        let mut pins = self.pins.lock();
        let clock = self.clock.load(Ordering::Acquire);
        *pins.entry(clock).or_insert(0) += 1;
        clock
    }

    /// Releases a pin returned by [`pin`](Self::pin).
    pub fn unpin(&self, clock: u64) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&clock) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&clock);
            }
        }
    }

    /// Number of live pins.
    pub fn pinned(&self) -> usize {
        self.pins.lock().values().sum()
    }

    /// A pin released when the guard drops, for short reads.
    pub fn read_pin(&self) -> ReadPin<'_> {
        ReadPin {
            store: self,
            clock: self.pin(),
        }
    }

    /// Marks pages as no longer referenced. Chunks whose last live page
    /// dies record the GC clock (at least `gc_clock`) so deletion can wait
    /// for older readers.
    pub fn mark_dead(&self, positions: impl IntoIterator<Item = PagePos>, gc_clock: u64) {
        let since = self.clock.fetch_max(gc_clock, Ordering::AcqRel).max(gc_clock);
        let mut chunks = self.chunks.write();
        for pos in positions {
            let Some(info) = chunks.get_mut(&pos.chunk) else {
                tracing::warn!(%pos, "dead page in unknown chunk");
                continue;
            };
            info.live_pages = info.live_pages.saturating_sub(1);
            info.live_len = info.live_len.saturating_sub(u64::from(pos.len));
            if info.live_pages == 0 && info.unused_since.is_none() {
                info.unused_since = Some(since);
            }
        }
    }

    /// Chunks below the fill-rate threshold whose maps are all in
    /// `open_maps`, so their live pages can be rewritten.
    pub fn chunks_to_compact(&self, open_maps: &HashSet<u32>) -> HashSet<ChunkId> {
        let threshold = u64::from(self.config.min_chunk_fill_rate);
        self.chunks
            .read()
            .values()
            .filter(|c| !c.is_unused() && c.fill_rate() < threshold)
            .filter(|c| c.maps.iter().all(|m| open_maps.contains(m)))
            .map(|c| c.id)
            .collect()
    }

    /// Deletes unused chunk files no active reader can reach.
    ///
    /// A chunk that became unused at `unused_since` may still be read by
    /// transactions and cursors that began before that; it is kept until
    /// the oldest of them is newer. Returns the number of files deleted.
    pub fn delete_reclaimable(&self, oldest_active: Option<u64>) -> CoreResult<usize> {
        let pinned = self.pins.lock().keys().next().copied();
        let oldest_active = match (oldest_active, pinned) {
            (Some(active), Some(pin)) => Some(active.min(pin)),
            (active, pin) => active.or(pin),
        };
        let victims: Vec<ChunkId> = self
            .chunks
            .read()
            .values()
            .filter(|c| match (c.unused_since, oldest_active) {
                (Some(_), None) => true,
                (Some(since), Some(oldest)) => oldest > since,
                (None, _) => false,
            })
            .map(|c| c.id)
            .collect();
        for id in &victims {
            self.readers.write().remove(id);
            self.fs.remove(&id.file_name())?;
            self.chunks.write().remove(id);
            tracing::debug!(chunk = %id, "deleted unused chunk");
        }
        Ok(victims.len())
    }

    /// Current accounting for every chunk.
    pub fn chunk_infos(&self) -> Vec<ChunkInfo> {
        self.chunks.read().values().cloned().collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn next_chunk_id(&self) -> u32 {
        self.next_id.load(Ordering::Acquire)
    }

    /// Deletes every chunk file, for dropping the whole storage.
    pub fn delete_all(&self) -> CoreResult<()> {
        self.readers.write().clear();
        let ids: Vec<ChunkId> = self.chunks.write().keys().copied().collect();
        for id in ids {
            self.fs.remove(&id.file_name())?;
        }
        self.chunks.write().clear();
        Ok(())
    }
}

/// Scoped [`ChunkStore::pin`].
pub(crate) struct ReadPin<'a> {
    store: &'a ChunkStore,
    clock: u64,
}

impl Drop for ReadPin<'_> {
    fn drop(&mut self) {
        self.store.unpin(self.clock);
    }
}

impl fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkStore")
            .field("chunks", &self.chunks.read().len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::codec::{row_leaf_payload, PAGE_ROW_LEAF};
    use mvdb_storage::MemoryFs;

    fn store(fs: &MemoryFs) -> ChunkStore {
        ChunkStore::open(
            Arc::new(fs.clone()),
            Arc::new(EngineContext::new()),
            StorageConfig::default(),
            Vec::new(),
            1,
        )
        .unwrap()
    }

    fn leaf_payload(n: i64) -> Vec<u8> {
        let key = Value::Int(n);
        let value = Value::from("v");
        row_leaf_payload(&[(&key, &value)])
    }

    #[test]
    fn written_pages_read_back() {
        let fs = MemoryFs::new();
        let store = store(&fs);
        let mut writer = store.writer();
        let a = writer.add_page(1, PAGE_ROW_LEAF, &leaf_payload(1)).unwrap();
        let b = writer.add_page(1, PAGE_ROW_LEAF, &leaf_payload(2)).unwrap();
        assert_eq!(a.offset as usize, CHUNK_HEADER_LEN);
        let info = store.commit(writer).unwrap().unwrap();
        assert_eq!(info.page_count, 2);

        let page: Page<Value> = store.read_page(b).unwrap();
        assert_eq!(page.keys(), &[Value::Int(2)]);
    }

    #[test]
    fn empty_writer_writes_nothing() {
        let fs = MemoryFs::new();
        let store = store(&fs);
        let writer = store.writer();
        let name = writer.id().file_name();
        assert!(store.commit(writer).unwrap().is_none());
        assert!(!fs.exists(&name));
    }

    #[test]
    fn dead_chunks_are_deleted_after_readers_leave() {
        let fs = MemoryFs::new();
        let store = store(&fs);
        let mut writer = store.writer();
        let pos = writer.add_page(1, PAGE_ROW_LEAF, &leaf_payload(1)).unwrap();
        let info = store.commit(writer).unwrap().unwrap();

        store.mark_dead([pos], 10);
        assert_eq!(store.delete_reclaimable(Some(10)).unwrap(), 0);
        assert!(fs.exists(&info.id.file_name()));
        assert_eq!(store.delete_reclaimable(Some(11)).unwrap(), 1);
        assert!(!fs.exists(&info.id.file_name()));
        assert_eq!(store.chunk_count(), 0);
    }

    #[test]
    fn pinned_readers_hold_back_deletion() {
        let fs = MemoryFs::new();
        let store = store(&fs);
        let mut writer = store.writer();
        let pos = writer.add_page(1, PAGE_ROW_LEAF, &leaf_payload(1)).unwrap();
        let info = store.commit(writer).unwrap().unwrap();

        let early = store.pin();
        let clock = store.tick();
        store.mark_dead([pos], clock);
        let late = store.pin();
        assert_eq!(store.pinned(), 2);

        assert_eq!(store.delete_reclaimable(None).unwrap(), 0);
        store.unpin(early);
        // A reader pinned at the retirement clock is held back as well.
        assert_eq!(store.delete_reclaimable(None).unwrap(), 0);
        store.unpin(late);
        assert_eq!(store.delete_reclaimable(None).unwrap(), 1);
        assert!(!fs.exists(&info.id.file_name()));
        assert_eq!(store.pinned(), 0);
    }

    #[test]
    fn retirement_never_stamps_below_the_clock() {
        let fs = MemoryFs::new();
        let store = store(&fs);
        let mut writer = store.writer();
        let pos = writer.add_page(1, PAGE_ROW_LEAF, &leaf_payload(1)).unwrap();
        store.commit(writer).unwrap();

        store.mark_dead(Vec::new(), 20);
        store.mark_dead([pos], 5);
        assert_eq!(store.chunk_infos()[0].unused_since, Some(20));
    }

    #[test]
    fn sparse_chunks_are_compaction_candidates() {
        let fs = MemoryFs::new();
        let store = store(&fs);
        let mut writer = store.writer();
        let a = writer.add_page(1, PAGE_ROW_LEAF, &leaf_payload(1)).unwrap();
        writer.add_page(1, PAGE_ROW_LEAF, &leaf_payload(2)).unwrap();
        writer.add_page(1, PAGE_ROW_LEAF, &leaf_payload(3)).unwrap();
        let info = store.commit(writer).unwrap().unwrap();

        let open: HashSet<u32> = [1].into_iter().collect();
        assert!(store.chunks_to_compact(&open).is_empty());
        store.mark_dead([a], 1);
        // Two of three equally sized pages live: 66% is above the default 50%.
        assert!(store.chunks_to_compact(&open).is_empty());

        let b = PagePos::new(info.id, a.offset + a.len, a.len);
        store.mark_dead([b], 1);
        assert!(store.chunks_to_compact(&open).contains(&info.id));
        assert!(store.chunks_to_compact(&HashSet::new()).is_empty());
    }

    #[test]
    fn orphaned_chunk_files_are_removed_on_open() {
        let fs = MemoryFs::new();
        {
            let store = store(&fs);
            let mut writer = store.writer();
            writer.add_page(1, PAGE_ROW_LEAF, &leaf_payload(1)).unwrap();
            store.commit(writer).unwrap();
        }
        assert!(fs.exists(&ChunkId::new(1).file_name()));
        let reopened = store(&fs);
        assert!(!fs.exists(&ChunkId::new(1).file_name()));
        assert_eq!(reopened.next_chunk_id(), 2);
    }

    #[test]
    fn corrupted_page_is_reported() {
        let fs = MemoryFs::new();
        let store = store(&fs);
        let mut writer = store.writer();
        let pos = writer.add_page(1, PAGE_ROW_LEAF, &leaf_payload(1)).unwrap();
        store.commit(writer).unwrap();
        assert!(fs.corrupt_byte(&pos.chunk.file_name(), pos.offset as usize + 12));

        let fresh = ChunkStore::open(
            Arc::new(fs.clone()),
            Arc::new(EngineContext::new()),
            StorageConfig::default(),
            store.chunk_infos(),
            store.next_chunk_id(),
        )
        .unwrap();
        let err = fresh.read_page::<Value>(pos).unwrap_err();
        assert!(err.is_corruption());
    }
}
