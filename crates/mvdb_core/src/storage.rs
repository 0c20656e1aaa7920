//! Page storage: the registry of maps, chunks and the manifest.
//!
//! [`Storage`] can be used on its own as a persistent ordered-map store
//! (`save` makes the current state durable) or underneath the transaction
//! engine, whose checkpoint service drives the capture/persist cycle.

use crate::btree::chunk::ChunkStore;
use crate::btree::codec::RawPage;
use crate::btree::{BTreeMap, MapSnapshot, StoredMap};
use crate::config::{MapConfig, StorageConfig};
use crate::context::EngineContext;
use crate::error::{CoreError, CoreResult};
use crate::manifest::{ChunkInfo, MapMeta, Manifest, MANIFEST_FILE};
use crate::record::MapValue;
use crate::types::{CheckpointMark, ChunkId, PagePos, TransactionId};
use mvdb_codec::Value;
use mvdb_storage::{DirectoryFs, FileSystem, StorageError};
use parking_lot::{Mutex, MutexGuard};
use std::any::Any;
use std::collections::{BTreeMap as OrderedMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct OpenMap {
    typed: Arc<dyn Any + Send + Sync>,
    stored: Arc<dyn StoredMap>,
}

struct MapSlot {
    meta: MapMeta,
    open: Option<OpenMap>,
}

struct Registry {
    maps: OrderedMap<String, MapSlot>,
    next_map_id: u32,
    last_transaction_id: TransactionId,
    mark: CheckpointMark,
}

/// Values a checkpoint records next to the pages it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PersistContext {
    /// Highest id handed out by the transaction engine.
    pub last_transaction_id: TransactionId,
    /// New checkpoint mark; `None` keeps the current one.
    pub mark: Option<CheckpointMark>,
    /// Stamp for chunks that lose their last live page.
    pub gc_clock: u64,
}

/// What one persist cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    /// The chunk written, if any page was unsaved.
    pub chunk: Option<ChunkId>,
    /// Pages written.
    pub pages: u64,
    /// Pages released.
    pub released: usize,
}

/// Roots frozen for one persist cycle. Holds the storage save lock until
/// handed to [`Storage::persist`] or dropped.
pub(crate) struct Capture<'a> {
    _lock: MutexGuard<'a, ()>,
    snapshots: Vec<Box<dyn MapSnapshot>>,
}

impl Capture<'_> {
    /// Returns retired pages to their maps.
    fn abandon(self) {
        for snapshot in self.snapshots {
            snapshot.restore();
        }
    }
}

/// Result of [`Storage::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Maps checked.
    pub maps: usize,
    /// Pages read, column pages included.
    pub pages: u64,
    /// Persisted entries.
    pub entries: u64,
    /// Chunks registered.
    pub chunks: usize,
    /// Problems found; empty for a healthy store.
    pub issues: Vec<String>,
}

impl VerifyReport {
    /// True if no problem was found.
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Persistent store of named B-tree maps.
pub struct Storage {
    fs: Arc<dyn FileSystem>,
    config: StorageConfig,
    store: Arc<ChunkStore>,
    registry: Mutex<Registry>,
    save_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Storage {
    /// Opens storage on a directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// `DatabaseLocked` if another handle owns the directory; corruption
    /// errors if the manifest or chunk registry is damaged.
    pub fn open_dir(path: &Path, config: StorageConfig) -> CoreResult<Self> {
        let fs = DirectoryFs::open(path, true).map_err(lock_error)?;
        Self::open(Arc::new(fs), config)
    }

    /// Opens storage on any file system.
    pub fn open(fs: Arc<dyn FileSystem>, config: StorageConfig) -> CoreResult<Self> {
        Self::open_with_context(fs, config, Arc::new(EngineContext::new()))
    }

    pub(crate) fn open_with_context(
        fs: Arc<dyn FileSystem>,
        config: StorageConfig,
        context: Arc<EngineContext>,
    ) -> CoreResult<Self> {
        let manifest = match fs.read_file(MANIFEST_FILE)? {
            Some(bytes) => Manifest::decode(&bytes)?,
            None => Manifest::default(),
        };
        let store = ChunkStore::open(
            Arc::clone(&fs),
            context,
            config,
            manifest.chunks,
            manifest.next_chunk_id,
        )?;

        let maps = manifest
            .maps
            .into_iter()
            .map(|meta| (meta.name.clone(), MapSlot { meta, open: None }))
            .collect::<OrderedMap<_, _>>();
        tracing::info!(
            maps = maps.len(),
            chunks = store.chunk_count(),
            last_txn = %manifest.last_transaction_id,
            "storage opened"
        );

        Ok(Self {
            fs,
            config,
            store: Arc::new(store),
            registry: Mutex::new(Registry {
                maps,
                next_map_id: manifest.next_map_id.max(1),
                last_transaction_id: manifest.last_transaction_id,
                mark: manifest.mark,
            }),
            save_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::Closed);
        }
        Ok(())
    }

    /// The file system holding the storage files.
    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Storage settings.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// The engine context pages charge their memory to.
    pub fn context(&self) -> &Arc<EngineContext> {
        self.store.context()
    }

    /// Opens or creates the map `name` holding values of type `V`.
    ///
    /// Opening an already open map returns the same instance.
    ///
    /// # Errors
    ///
    /// `MapTypeMismatch` if the map is open with another value type.
    pub fn open_btree_map<V: MapValue>(
        &self,
        name: &str,
        config: MapConfig,
    ) -> CoreResult<Arc<BTreeMap<V>>> {
        self.check_open()?;
        let mut registry = self.registry.lock();
        if !registry.maps.contains_key(name) {
            let id = registry.next_map_id;
            registry.next_map_id += 1;
            let meta = MapMeta {
                id,
                name: name.to_string(),
                mode: config
                    .storage_mode
                    .unwrap_or(self.config.default_storage_mode),
                root: None,
            };
            tracing::debug!(map = name, id, "map created");
            registry
                .maps
                .insert(name.to_string(), MapSlot { meta, open: None });
        }
        let slot = registry
            .maps
            .get_mut(name)
            .ok_or_else(|| CoreError::internal("map slot vanished"))?;

        if let Some(open) = &slot.open {
            return Arc::clone(&open.typed)
                .downcast::<BTreeMap<V>>()
                .map_err(|_| CoreError::MapTypeMismatch {
                    name: name.to_string(),
                });
        }

        let map = Arc::new(BTreeMap::<V>::open(
            slot.meta.id,
            slot.meta.name.clone(),
            slot.meta.mode,
            Arc::clone(&self.store),
            slot.meta.root,
        )?);
        slot.open = Some(OpenMap {
            typed: Arc::clone(&map) as Arc<dyn Any + Send + Sync>,
            stored: Arc::clone(&map) as Arc<dyn StoredMap>,
        });
        Ok(map)
    }

    /// Names of all maps, in order.
    pub fn map_names(&self) -> Vec<String> {
        self.registry.lock().maps.keys().cloned().collect()
    }

    /// True if a map with this name exists.
    pub fn has_map(&self, name: &str) -> bool {
        self.registry.lock().maps.contains_key(name)
    }

    /// Removes a map and releases its pages. Returns whether it existed.
    /// Open handles to the map fail with `MapNotFound` afterwards.
    pub fn drop_map(&self, name: &str) -> CoreResult<bool> {
        self.drop_map_at(name, self.store.tick())
    }

    pub(crate) fn drop_map_at(&self, name: &str, gc_clock: u64) -> CoreResult<bool> {
        self.check_open()?;
        let _lock = self.save_lock.lock();
        let Some(slot) = self.registry.lock().maps.remove(name) else {
            return Ok(false);
        };
        if let Some(open) = &slot.open {
            open.stored.mark_dropped();
        }
        if let Some(root) = slot.meta.root {
            let dead = self.store.collect_positions(root)?;
            self.store.mark_dead(dead, gc_clock);
        }
        tracing::debug!(map = name, "map dropped");
        Ok(true)
    }

    /// Number of chunk files.
    pub fn chunk_count(&self) -> usize {
        self.store.chunk_count()
    }

    /// Current chunk accounting.
    pub fn chunks(&self) -> Vec<ChunkInfo> {
        self.store.chunk_infos()
    }

    /// The manifest as it would be written now.
    pub fn manifest(&self) -> Manifest {
        let registry = self.registry.lock();
        self.build_manifest(&registry)
    }

    fn build_manifest(&self, registry: &Registry) -> Manifest {
        Manifest {
            last_transaction_id: registry.last_transaction_id,
            mark: registry.mark,
            next_chunk_id: self.store.next_chunk_id(),
            next_map_id: registry.next_map_id,
            maps: registry.maps.values().map(|s| s.meta.clone()).collect(),
            chunks: self.store.chunk_infos(),
        }
    }

    pub(crate) fn last_transaction_id(&self) -> TransactionId {
        self.registry.lock().last_transaction_id
    }

    pub(crate) fn checkpoint_mark(&self) -> CheckpointMark {
        self.registry.lock().mark
    }

    /// Ids of maps currently open.
    pub(crate) fn open_map_ids(&self) -> HashSet<u32> {
        self.registry
            .lock()
            .maps
            .values()
            .filter(|s| s.open.is_some())
            .map(|s| s.meta.id)
            .collect()
    }

    /// Rewrites pages of sparse chunks so the next persist moves them.
    pub(crate) fn compact(&self) -> CoreResult<usize> {
        let victims = self.store.chunks_to_compact(&self.open_map_ids());
        if victims.is_empty() {
            return Ok(0);
        }
        let maps: Vec<Arc<dyn StoredMap>> = self
            .registry
            .lock()
            .maps
            .values()
            .filter_map(|s| s.open.as_ref().map(|o| Arc::clone(&o.stored)))
            .collect();
        let mut rewritten = 0;
        for map in maps {
            rewritten += map.rewrite_chunks(&victims)?;
        }
        tracing::debug!(chunks = victims.len(), pages = rewritten, "compaction");
        Ok(rewritten)
    }

    /// Freezes the roots of all open maps.
    pub(crate) fn capture(&self) -> Capture<'_> {
        let lock = self.save_lock.lock();
        let maps: Vec<Arc<dyn StoredMap>> = self
            .registry
            .lock()
            .maps
            .values()
            .filter_map(|s| s.open.as_ref().map(|o| Arc::clone(&o.stored)))
            .collect();
        Capture {
            _lock: lock,
            snapshots: maps.into_iter().map(StoredMap::capture).collect(),
        }
    }

    /// Writes the captured roots into a new chunk and the manifest.
    ///
    /// On failure before the chunk is synced, retired pages go back to
    /// their maps so the next cycle releases them.
    pub(crate) fn persist(
        &self,
        mut capture: Capture<'_>,
        ctx: PersistContext,
    ) -> CoreResult<PersistOutcome> {
        let mut writer = self.store.writer();
        let written: CoreResult<HashMap<u32, Option<PagePos>>> = capture
            .snapshots
            .iter_mut()
            .map(|snapshot| Ok((snapshot.map_id(), snapshot.write(&mut writer)?)))
            .collect();
        let roots = match written {
            Ok(roots) => roots,
            Err(e) => {
                capture.abandon();
                return Err(e);
            }
        };
        let pages = writer.page_count();
        let chunk = match self.store.commit(writer) {
            Ok(info) => info.map(|i| i.id),
            Err(e) => {
                capture.abandon();
                return Err(e);
            }
        };
        for snapshot in &mut capture.snapshots {
            snapshot.publish();
        }

        let retired: CoreResult<Vec<Vec<PagePos>>> = capture
            .snapshots
            .iter()
            .map(|snapshot| snapshot.retired_positions())
            .collect();
        let dead: Vec<PagePos> = match retired {
            Ok(lists) => lists.into_iter().flatten().collect(),
            Err(e) => {
                capture.abandon();
                return Err(e);
            }
        };
        let released = dead.len();
        self.store.mark_dead(dead, ctx.gc_clock);

        let manifest = {
            let mut registry = self.registry.lock();
            for slot in registry.maps.values_mut() {
                if let Some(root) = roots.get(&slot.meta.id) {
                    slot.meta.root = *root;
                }
            }
            registry.last_transaction_id = registry.last_transaction_id.max(ctx.last_transaction_id);
            if let Some(mark) = ctx.mark {
                registry.mark = mark;
            }
            self.build_manifest(&registry)
        };
        let written = self.fs.write_atomic(MANIFEST_FILE, &manifest.encode());
        for snapshot in capture.snapshots {
            snapshot.finish();
        }
        written?;

        tracing::debug!(?chunk, pages, released, "storage persisted");
        Ok(PersistOutcome {
            chunk,
            pages,
            released,
        })
    }

    /// Deletes chunk files no reader can reach any more.
    pub(crate) fn collect_garbage(&self, oldest_active: Option<u64>) -> CoreResult<usize> {
        self.store.delete_reclaimable(oldest_active)
    }

    /// Makes the current state of all maps durable.
    ///
    /// Chunks left without live pages are deleted unless a cursor opened
    /// before this save still reads them; those go on a later save.
    pub fn save(&self) -> CoreResult<PersistOutcome> {
        self.check_open()?;
        let capture = self.capture();
        let ctx = PersistContext {
            last_transaction_id: self.last_transaction_id(),
            mark: None,
            gc_clock: self.store.tick(),
        };
        let outcome = self.persist(capture, ctx)?;
        self.collect_garbage(None)?;
        Ok(outcome)
    }

    /// Saves and closes the storage. Further calls fail with `Closed`.
    pub fn close(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.save()?;
        self.closed.store(true, Ordering::Release);
        tracing::info!("storage closed");
        Ok(())
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Deletes every chunk file and the manifest.
    pub fn drop_storage(self) -> CoreResult<()> {
        let _lock = self.save_lock.lock();
        self.closed.store(true, Ordering::Release);
        for slot in self.registry.lock().maps.values() {
            if let Some(open) = &slot.open {
                open.stored.mark_dropped();
            }
        }
        self.store.delete_all()?;
        self.fs.remove(MANIFEST_FILE)?;
        tracing::info!("storage dropped");
        Ok(())
    }

    /// Reads every persisted page reachable from the manifest roots and
    /// checks checksums, key order, separator bounds and chunk accounting.
    pub fn verify(&self) -> VerifyReport {
        let _lock = self.save_lock.lock();
        let roots: Vec<(String, PagePos)> = self
            .registry
            .lock()
            .maps
            .values()
            .filter_map(|s| s.meta.root.map(|r| (s.meta.name.clone(), r)))
            .collect();
        let chunks = self.store.chunk_infos();

        let mut report = VerifyReport {
            maps: self.registry.lock().maps.len(),
            chunks: chunks.len(),
            ..VerifyReport::default()
        };
        let mut live: HashMap<ChunkId, u64> = HashMap::new();
        for (name, root) in roots {
            self.verify_tree(&name, root, &mut report, &mut live);
        }
        for chunk in &chunks {
            let reachable = live.remove(&chunk.id).unwrap_or(0);
            if reachable != chunk.live_pages {
                report.issues.push(format!(
                    "{} accounts {} live pages but {} are reachable",
                    chunk.id, chunk.live_pages, reachable
                ));
            }
        }
        for (id, count) in live {
            report
                .issues
                .push(format!("{count} reachable pages in unregistered {id}"));
        }
        report
    }

    fn verify_tree(
        &self,
        name: &str,
        root: PagePos,
        report: &mut VerifyReport,
        live: &mut HashMap<ChunkId, u64>,
    ) {
        let mut stack: Vec<(PagePos, Option<Value>, Option<Value>)> = vec![(root, None, None)];
        while let Some((pos, low, high)) = stack.pop() {
            report.pages += 1;
            *live.entry(pos.chunk).or_insert(0) += 1;
            let raw = match self.store.read_raw(pos) {
                Ok(raw) => raw,
                Err(e) => {
                    report.issues.push(format!("map {name}: {e}"));
                    continue;
                }
            };
            let keys = match &raw {
                RawPage::Leaf { keys } | RawPage::Node { keys, .. } | RawPage::ColumnLeaf { keys, .. } => {
                    keys.as_slice()
                }
                RawPage::Column { .. } => {
                    report
                        .issues
                        .push(format!("map {name}: column page {pos} linked as tree page"));
                    continue;
                }
            };
            let below = low.as_ref().map_or(false, |l| keys.first().is_some_and(|k| k < l));
            let above = high.as_ref().map_or(false, |h| keys.last().is_some_and(|k| k >= h));
            if below || above {
                report
                    .issues
                    .push(format!("map {name}: page {pos} has keys outside its range"));
            }
            match raw {
                RawPage::Leaf { keys } => report.entries += keys.len() as u64,
                RawPage::ColumnLeaf { keys, columns } => {
                    report.entries += keys.len() as u64;
                    for column in columns {
                        report.pages += 1;
                        *live.entry(column.chunk).or_insert(0) += 1;
                        match self.store.read_raw(column) {
                            Ok(RawPage::Column { count }) if count == keys.len() => {}
                            Ok(_) => report.issues.push(format!(
                                "map {name}: column page {column} does not match its leaf"
                            )),
                            Err(e) => report.issues.push(format!("map {name}: {e}")),
                        }
                    }
                }
                RawPage::Node { keys, children } => {
                    for (i, (child, _)) in children.iter().enumerate() {
                        let child_low = if i == 0 { low.clone() } else { keys.get(i - 1).cloned() };
                        let child_high = if i < keys.len() { keys.get(i).cloned() } else { high.clone() };
                        stack.push((*child, child_low, child_high));
                    }
                }
                RawPage::Column { .. } => {}
            }
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            tracing::debug!("storage dropped without close; unsaved changes are discarded");
        }
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("fs", &self.fs)
            .field("maps", &self.registry.lock().maps.len())
            .field("chunks", &self.store.chunk_count())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Maps a directory lock failure to `DatabaseLocked`.
pub(crate) fn lock_error(e: StorageError) -> CoreError {
    match e {
        StorageError::Locked(_) => CoreError::DatabaseLocked,
        other => CoreError::Storage(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::VersionedValue;
    use crate::types::PageStorageMode;
    use mvdb_storage::MemoryFs;

    fn open(fs: &MemoryFs) -> Storage {
        let config = StorageConfig {
            page_size: 512,
            ..StorageConfig::default()
        };
        Storage::open(Arc::new(fs.clone()), config).unwrap()
    }

    #[test]
    fn saved_maps_survive_reopen() {
        let fs = MemoryFs::new();
        {
            let storage = open(&fs);
            let map = storage
                .open_btree_map::<Value>("data", MapConfig::new())
                .unwrap();
            for i in 0..1000 {
                map.put(Value::Int(i), Value::from(format!("v{i}"))).unwrap();
            }
            storage.close().unwrap();
        }
        let storage = open(&fs);
        assert_eq!(storage.map_names(), vec!["data".to_string()]);
        let map = storage
            .open_btree_map::<Value>("data", MapConfig::new())
            .unwrap();
        assert_eq!(map.len(), 1000);
        assert_eq!(map.get(&Value::Int(777)).unwrap(), Some(Value::from("v777")));
        assert!(storage.verify().is_ok());
    }

    #[test]
    fn unsaved_changes_are_lost() {
        let fs = MemoryFs::new();
        {
            let storage = open(&fs);
            let map = storage.open_btree_map::<Value>("m", MapConfig::new()).unwrap();
            map.put(Value::Int(1), Value::Int(1)).unwrap();
            storage.save().unwrap();
            map.put(Value::Int(2), Value::Int(2)).unwrap();
        }
        let storage = open(&fs);
        let map = storage.open_btree_map::<Value>("m", MapConfig::new()).unwrap();
        assert!(map.contains_key(&Value::Int(1)).unwrap());
        assert!(!map.contains_key(&Value::Int(2)).unwrap());
    }

    #[test]
    fn same_map_same_instance_and_type_checked() {
        let fs = MemoryFs::new();
        let storage = open(&fs);
        let a = storage.open_btree_map::<Value>("m", MapConfig::new()).unwrap();
        let b = storage.open_btree_map::<Value>("m", MapConfig::new()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let err = storage
            .open_btree_map::<VersionedValue>("m", MapConfig::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::MapTypeMismatch { .. }));
    }

    #[test]
    fn replaced_pages_release_chunks() {
        let fs = MemoryFs::new();
        let storage = open(&fs);
        let map = storage.open_btree_map::<Value>("m", MapConfig::new()).unwrap();
        for i in 0..200 {
            map.put(Value::Int(i), Value::Int(i)).unwrap();
        }
        storage.save().unwrap();
        let first = storage.chunks()[0].id;
        for i in 0..200 {
            map.put(Value::Int(i), Value::Int(-i)).unwrap();
        }
        storage.save().unwrap();
        assert!(storage.chunks().iter().all(|c| c.id != first));
        assert!(!fs.exists(&first.file_name()));
        assert!(storage.verify().is_ok());
    }

    #[test]
    fn open_cursor_keeps_replaced_chunk_until_dropped() {
        let fs = MemoryFs::new();
        {
            let storage = open(&fs);
            let map = storage.open_btree_map::<Value>("m", MapConfig::new()).unwrap();
            for i in 0..500 {
                map.put(Value::Int(i), Value::Int(i)).unwrap();
            }
            storage.close().unwrap();
        }
        let storage = open(&fs);
        let map = storage.open_btree_map::<Value>("m", MapConfig::new()).unwrap();
        let first = storage.chunks()[0].id;

        let cursor = map.cursor(None, None).unwrap();
        for i in 0..500 {
            map.put(Value::Int(i), Value::Int(-i)).unwrap();
        }
        storage.save().unwrap();
        assert!(fs.exists(&first.file_name()));

        let seen: Vec<(Value, Value)> = cursor.map(|e| e.unwrap()).collect();
        assert_eq!(seen.len(), 500);
        assert_eq!(seen[499], (Value::Int(499), Value::Int(499)));

        // Nothing else holds the old chunk now.
        storage.save().unwrap();
        assert!(!fs.exists(&first.file_name()));
        assert_eq!(map.get(&Value::Int(499)).unwrap(), Some(Value::Int(-499)));
        assert!(storage.verify().is_ok());
    }

    #[test]
    fn drop_map_releases_pages() {
        let fs = MemoryFs::new();
        let storage = open(&fs);
        let map = storage.open_btree_map::<Value>("gone", MapConfig::new()).unwrap();
        for i in 0..100 {
            map.put(Value::Int(i), Value::Null).unwrap();
        }
        storage.save().unwrap();
        assert!(storage.chunk_count() > 0);
        assert!(storage.drop_map("gone").unwrap());
        assert!(!storage.has_map("gone"));
        assert!(matches!(
            map.get(&Value::Int(1)),
            Err(CoreError::MapNotFound { .. })
        ));
        storage.save().unwrap();
        assert_eq!(storage.chunk_count(), 0);
        assert!(!storage.drop_map("gone").unwrap());
    }

    #[test]
    fn column_maps_read_projected_columns() {
        let fs = MemoryFs::new();
        {
            let storage = open(&fs);
            let map = storage
                .open_btree_map::<VersionedValue>(
                    "cols",
                    MapConfig::new().storage_mode(PageStorageMode::Column),
                )
                .unwrap();
            for i in 0..50 {
                let row = VersionedValue::initial(vec![
                    Value::Int(i),
                    Value::from(format!("name{i}")),
                    Value::Double(i as f64),
                ]);
                map.put(Value::Int(i), row).unwrap();
            }
            storage.close().unwrap();
        }
        let storage = open(&fs);
        let map = storage
            .open_btree_map::<VersionedValue>("cols", MapConfig::new())
            .unwrap();
        assert_eq!(map.storage_mode(), PageStorageMode::Column);

        let full = map.get(&Value::Int(7)).unwrap().unwrap();
        assert_eq!(full.column(1), Some(&Value::from("name7")));

        let projected: Vec<VersionedValue> = map
            .cursor_with(crate::btree::CursorParameters::new().columns(vec![1]))
            .unwrap()
            .map(|e| e.unwrap().1)
            .collect();
        assert_eq!(projected.len(), 50);
        assert_eq!(projected[3].column(0), Some(&Value::Null));
        assert_eq!(projected[3].column(1), Some(&Value::from("name3")));
        assert!(storage.verify().is_ok());
        assert!(storage.context().memory().used() > 0);
    }

    #[test]
    fn verify_reports_corruption() {
        let fs = MemoryFs::new();
        {
            let storage = open(&fs);
            let map = storage.open_btree_map::<Value>("m", MapConfig::new()).unwrap();
            map.put(Value::Int(1), Value::from("x")).unwrap();
            storage.close().unwrap();
        }
        let name = ChunkId::new(1).file_name();
        assert!(fs.corrupt_byte(&name, 30));
        let storage = open(&fs);
        let report = storage.verify();
        assert!(!report.is_ok());
    }

    #[test]
    fn closed_storage_rejects_use() {
        let fs = MemoryFs::new();
        let storage = open(&fs);
        storage.close().unwrap();
        assert!(matches!(
            storage.open_btree_map::<Value>("m", MapConfig::new()),
            Err(CoreError::Closed)
        ));
    }

    #[test]
    fn drop_storage_removes_files() {
        let fs = MemoryFs::new();
        let storage = open(&fs);
        let map = storage.open_btree_map::<Value>("m", MapConfig::new()).unwrap();
        map.put(Value::Int(1), Value::Null).unwrap();
        storage.save().unwrap();
        storage.drop_storage().unwrap();
        assert!(fs.list().unwrap().is_empty());
    }
}
