//! Copy-on-write B-tree map.

use crate::btree::chunk::{ChunkStore, ChunkWriter};
use crate::btree::codec::{
    column_leaf_payload, column_payload, node_payload, row_leaf_payload, PAGE_COLUMN,
    PAGE_COLUMN_LEAF, PAGE_NODE, PAGE_ROW_LEAF,
};
use crate::btree::cursor::{BTreeCursor, CursorParameters};
use crate::btree::page::{ChildRef, LeafValues, Page, PageBody, Saved};
use crate::error::{CoreError, CoreResult};
use crate::record::MapValue;
use crate::types::{ChunkId, PagePos, PageStorageMode};
use mvdb_codec::{Value, Writer};
use parking_lot::{Mutex, RwLock};
use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NULL: Value = Value::Null;

/// Outcome of an [`BTreeMap::update`] decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation<V> {
    /// Leave the entry as it is.
    Keep,
    /// Store this value under the key.
    Put(V),
    /// Remove the key. Removing an absent key does nothing.
    Remove,
}

/// A page that left the tree and whose disk space must be released once
/// the change is checkpointed.
enum Retired<V> {
    /// Only the page itself.
    Page(Arc<Page<V>>),
    /// The page and everything below it.
    Tree(Arc<Page<V>>),
}

impl<V> Clone for Retired<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Page(p) => Self::Page(Arc::clone(p)),
            Self::Tree(p) => Self::Tree(Arc::clone(p)),
        }
    }
}

struct WriterState<V> {
    retired: Vec<Retired<V>>,
    /// Set while a checkpoint writes a captured root; pages replaced
    /// meanwhile are retired even if they have no position yet.
    saving: bool,
}

/// Result of rebuilding one child slot: zero, one or several pages with
/// separators between them.
struct Replacement<V> {
    pages: Vec<Arc<Page<V>>>,
    separators: Vec<Value>,
}

impl<V> Replacement<V> {
    fn removed() -> Self {
        Self {
            pages: Vec::new(),
            separators: Vec::new(),
        }
    }

    fn single(page: Page<V>) -> Self {
        Self {
            pages: vec![Arc::new(page)],
            separators: Vec::new(),
        }
    }
}

/// An ordered map persisted in chunk pages.
///
/// Readers never lock: they clone the current root and walk immutable
/// pages. Writers are serialized by a per-map mutex and publish a new root
/// when done.
pub struct BTreeMap<V: MapValue> {
    id: u32,
    name: String,
    mode: PageStorageMode,
    store: Arc<ChunkStore>,
    root: RwLock<Arc<Page<V>>>,
    writer: Mutex<WriterState<V>>,
    version: AtomicU64,
    dropped: AtomicBool,
}

impl<V: MapValue> BTreeMap<V> {
    pub(crate) fn open(
        id: u32,
        name: String,
        mode: PageStorageMode,
        store: Arc<ChunkStore>,
        root: Option<PagePos>,
    ) -> CoreResult<Self> {
        let root = match root {
            Some(pos) => store.read_page::<V>(pos)?,
            None => Page::empty(),
        };
        Ok(Self {
            id,
            name,
            mode,
            store,
            root: RwLock::new(Arc::new(root)),
            writer: Mutex::new(WriterState {
                retired: Vec::new(),
                saving: false,
            }),
            version: AtomicU64::new(0),
            dropped: AtomicBool::new(false),
        })
    }

    /// Map id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Map name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Leaf layout used when saving.
    pub fn storage_mode(&self) -> PageStorageMode {
        self.mode
    }

    /// Number of modifications applied since the map was opened.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.dropped.load(Ordering::Acquire) {
            return Err(CoreError::MapNotFound {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::Release);
    }

    /// True once the map was dropped from its storage.
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub(crate) fn root(&self) -> Arc<Page<V>> {
        Arc::clone(&self.root.read())
    }

    fn leaf_for(&self, key: &Value) -> CoreResult<Arc<Page<V>>> {
        let mut page = self.root();
        while !page.is_leaf() {
            let index = page.child_index(key);
            page = page.child(index, &self.store)?;
        }
        Ok(page)
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &Value) -> CoreResult<Option<V>> {
        self.check_open()?;
        let _pin = self.store.read_pin();
        let leaf = self.leaf_for(key)?;
        let value = match leaf.find(key) {
            Ok(i) => Some(leaf.value(i, None, &self.store)?.into_owned()),
            Err(_) => None,
        };
        Ok(value)
    }

    /// True if `key` is present.
    pub fn contains_key(&self, key: &Value) -> CoreResult<bool> {
        self.check_open()?;
        let _pin = self.store.read_pin();
        Ok(self.leaf_for(key)?.find(key).is_ok())
    }

    /// Stores `value` under `key` and returns the previous value.
    pub fn put(&self, key: Value, value: V) -> CoreResult<Option<V>> {
        self.update(&key, |old| Ok((Mutation::Put(value), old.cloned())))
    }

    /// Removes `key` and returns the previous value.
    pub fn remove(&self, key: &Value) -> CoreResult<Option<V>> {
        self.update(key, |old| Ok((Mutation::Remove, old.cloned())))
    }

    /// Atomically reads the current value of `key`, lets `decide` choose a
    /// mutation, and applies it. No other writer can change the map between
    /// the read and the write. An error from `decide` leaves the map
    /// untouched.
    pub fn update<R>(
        &self,
        key: &Value,
        decide: impl FnOnce(Option<&V>) -> CoreResult<(Mutation<V>, R)>,
    ) -> CoreResult<R> {
        self.check_open()?;
        let mut state = self.writer.lock();

        let mut path: Vec<(Arc<Page<V>>, usize)> = Vec::new();
        let mut page = self.root();
        while !page.is_leaf() {
            let index = page.child_index(key);
            let child = page.child(index, &self.store)?;
            path.push((page, index));
            page = child;
        }

        let found = page.find(key);
        let current = match found {
            Ok(i) => Some(page.value(i, None, &self.store)?),
            Err(_) => None,
        };
        let (mutation, result) = decide(current.as_deref())?;
        drop(current);

        let (mut keys, mut values) = match (&mutation, found) {
            (Mutation::Keep, _) | (Mutation::Remove, Err(_)) => return Ok(result),
            _ => page.rows(&self.store)?,
        };
        match (mutation, found) {
            (Mutation::Put(value), Ok(i)) => values[i] = value,
            (Mutation::Put(value), Err(i)) => {
                keys.insert(i, key.clone());
                values.insert(i, value);
            }
            (Mutation::Remove, Ok(i)) => {
                keys.remove(i);
                values.remove(i);
            }
            (Mutation::Keep, _) | (Mutation::Remove, Err(_)) => return Ok(result),
        }

        let mut replacement = self.build_leaf(keys, values);
        let mut replaced = vec![page];
        while let Some((parent, index)) = path.pop() {
            replacement = self.replace_child(&parent, index, replacement)?;
            replaced.push(parent);
        }
        let new_root = self.make_root(replacement, &mut replaced)?;
        self.install(&mut state, new_root, replaced);
        Ok(result)
    }

    fn install(&self, state: &mut WriterState<V>, root: Arc<Page<V>>, replaced: Vec<Arc<Page<V>>>) {
        for page in replaced {
            if page.saved().is_some() || state.saving {
                state.retired.push(Retired::Page(page));
            }
        }
        *self.root.write() = root;
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    fn build_leaf(&self, mut keys: Vec<Value>, mut values: Vec<V>) -> Replacement<V> {
        if keys.is_empty() {
            return Replacement::removed();
        }
        let memory: usize = keys.iter().map(Value::memory).sum::<usize>()
            + values.iter().map(MapValue::memory).sum::<usize>();
        if memory <= self.store.config().page_size || keys.len() < 2 {
            return Replacement::single(Page::leaf(keys, values));
        }
        let mid = keys.len() / 2;
        let right_keys = keys.split_off(mid);
        let right_values = values.split_off(mid);
        let separator = Value::split_key(&keys[mid - 1], &right_keys[0]);
        tracing::trace!(map = %self.name, %separator, "leaf split");
        Replacement {
            pages: vec![
                Arc::new(Page::leaf(keys, values)),
                Arc::new(Page::leaf(right_keys, right_values)),
            ],
            separators: vec![separator],
        }
    }

    fn build_node(
        &self,
        mut keys: Vec<Value>,
        mut children: Vec<ChildRef<V>>,
        mut counts: Vec<u64>,
    ) -> Replacement<V> {
        let page = Page::node(keys.clone(), children.clone(), counts.clone());
        if page.memory() <= self.store.config().page_size || keys.len() < 2 {
            return Replacement::single(page);
        }
        let mid = keys.len() / 2;
        let right_keys = keys.split_off(mid + 1);
        let right_children = children.split_off(mid + 1);
        let right_counts = counts.split_off(mid + 1);
        let separator = keys.pop().unwrap_or(Value::Null);
        tracing::trace!(map = %self.name, %separator, "node split");
        Replacement {
            pages: vec![
                Arc::new(Page::node(keys, children, counts)),
                Arc::new(Page::node(right_keys, right_children, right_counts)),
            ],
            separators: vec![separator],
        }
    }

    fn replace_child(
        &self,
        parent: &Page<V>,
        index: usize,
        replacement: Replacement<V>,
    ) -> CoreResult<Replacement<V>> {
        let (keys, children, counts) = parent.node_parts()?;
        let mut keys = keys.to_vec();
        let mut children = children.to_vec();
        let mut counts = counts.to_vec();

        if replacement.pages.is_empty() {
            children.remove(index);
            counts.remove(index);
            if index < keys.len() {
                keys.remove(index);
            } else if !keys.is_empty() {
                keys.remove(index - 1);
            }
            if children.is_empty() {
                return Ok(Replacement::removed());
            }
        } else {
            counts.splice(index..=index, replacement.pages.iter().map(|p| p.total()));
            children.splice(
                index..=index,
                replacement.pages.into_iter().map(ChildRef::loaded),
            );
            keys.splice(index..index, replacement.separators);
        }
        Ok(self.build_node(keys, children, counts))
    }

    fn make_root(
        &self,
        replacement: Replacement<V>,
        replaced: &mut Vec<Arc<Page<V>>>,
    ) -> CoreResult<Arc<Page<V>>> {
        let Replacement {
            mut pages,
            separators,
        } = replacement;
        match pages.len() {
            0 => Ok(Arc::new(Page::empty())),
            1 => {
                let mut root = pages.remove(0);
                while root.child_count() == 1 {
                    let child = root.child(0, &self.store)?;
                    replaced.push(root);
                    root = child;
                }
                Ok(root)
            }
            _ => {
                let counts = pages.iter().map(|p| p.total()).collect();
                let children = pages.into_iter().map(ChildRef::loaded).collect();
                Ok(Arc::new(Page::node(separators, children, counts)))
            }
        }
    }

    /// Number of entries. For transactional maps this counts pending
    /// writes too and is an estimate.
    pub fn len(&self) -> u64 {
        self.root().total()
    }

    /// True if the map holds no entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest key.
    pub fn first_key(&self) -> CoreResult<Option<Value>> {
        self.check_open()?;
        let _pin = self.store.read_pin();
        self.edge_key(&self.root(), false)
    }

    /// Largest key.
    pub fn last_key(&self) -> CoreResult<Option<Value>> {
        self.check_open()?;
        let _pin = self.store.read_pin();
        self.edge_key(&self.root(), true)
    }

    fn edge_key(&self, page: &Page<V>, last: bool) -> CoreResult<Option<Value>> {
        if page.is_leaf() {
            let keys = page.keys();
            return Ok(if last { keys.last() } else { keys.first() }.cloned());
        }
        let count = page.child_count();
        let order: Box<dyn Iterator<Item = usize>> = if last {
            Box::new((0..count).rev())
        } else {
            Box::new(0..count)
        };
        for i in order {
            // Leaves left empty by pending-only content can sit inside the tree.
            if let Some(key) = self.edge_key(&*page.child(i, &self.store)?, last)? {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    /// Removes every entry.
    pub fn clear(&self) -> CoreResult<()> {
        self.check_open()?;
        let mut state = self.writer.lock();
        let old = self.root();
        if old.saved().is_some() || state.saving || !old.is_leaf() {
            state.retired.push(Retired::Tree(old));
        }
        *self.root.write() = Arc::new(Page::empty());
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Iterates `from ..= to` in key order.
    pub fn cursor(&self, from: Option<&Value>, to: Option<&Value>) -> CoreResult<BTreeCursor<V>> {
        self.cursor_with(CursorParameters {
            from: from.cloned(),
            to: to.cloned(),
            columns: None,
        })
    }

    /// Iterates with explicit parameters.
    pub fn cursor_with(&self, params: CursorParameters) -> CoreResult<BTreeCursor<V>> {
        self.check_open()?;
        let pin = self.store.pin();
        BTreeCursor::new(self.root(), Arc::clone(&self.store), pin, params)
    }

    /// Copies every page stored in `chunks` so the next checkpoint writes
    /// it elsewhere. Returns the number of pages rewritten.
    pub fn rewrite_chunks(&self, chunks: &HashSet<ChunkId>) -> CoreResult<usize> {
        self.check_open()?;
        let mut state = self.writer.lock();
        let root = self.root();
        let mut replaced = Vec::new();
        let Some(new_root) = self.rewrite(&root, chunks, &mut replaced)? else {
            return Ok(0);
        };
        let count = replaced.len();
        for page in replaced {
            state.retired.push(Retired::Page(page));
        }
        *self.root.write() = new_root;
        self.version.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(map = %self.name, pages = count, "rewrote pages for compaction");
        Ok(count)
    }

    fn rewrite(
        &self,
        page: &Arc<Page<V>>,
        chunks: &HashSet<ChunkId>,
        replaced: &mut Vec<Arc<Page<V>>>,
    ) -> CoreResult<Option<Arc<Page<V>>>> {
        let in_chunks = page
            .saved()
            .is_some_and(|s| s.positions().any(|p| chunks.contains(&p.chunk)));

        let copy = match page.body() {
            PageBody::Leaf { .. } => {
                if !in_chunks {
                    return Ok(None);
                }
                let (keys, values) = page.rows(&self.store)?;
                Page::leaf(keys, values)
            }
            PageBody::Node {
                keys,
                children,
                counts,
            } => {
                let mut new_children = children.clone();
                let mut new_counts = counts.clone();
                let mut changed = in_chunks;
                for (i, child) in children.iter().enumerate() {
                    let loaded = child.load(&self.store)?;
                    if let Some(copy) = self.rewrite(&loaded, chunks, replaced)? {
                        new_counts[i] = copy.total();
                        new_children[i] = ChildRef::loaded(copy);
                        changed = true;
                    }
                }
                if !changed {
                    return Ok(None);
                }
                Page::node(keys.clone(), new_children, new_counts)
            }
        };
        replaced.push(Arc::clone(page));
        Ok(Some(Arc::new(copy)))
    }

    fn retired_positions(&self, retired: &[Retired<V>]) -> CoreResult<Vec<PagePos>> {
        let mut out = Vec::new();
        for entry in retired {
            match entry {
                Retired::Page(page) => {
                    if let Some(saved) = page.saved() {
                        out.extend(saved.positions());
                    }
                }
                Retired::Tree(root) => {
                    let mut stack = vec![Arc::clone(root)];
                    while let Some(page) = stack.pop() {
                        if let Some(saved) = page.saved() {
                            out.extend(saved.positions());
                        }
                        if let PageBody::Node { children, .. } = page.body() {
                            for child in children {
                                match child.get() {
                                    Some(loaded) => stack.push(Arc::clone(loaded)),
                                    None => {
                                        if let Some((pos, _)) = child.saved(0) {
                                            out.extend(self.store.collect_positions(pos)?);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

impl<V: MapValue> fmt::Debug for BTreeMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BTreeMap")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Type-erased view of an open map used by storage and checkpoints.
pub(crate) trait StoredMap: Send + Sync + fmt::Debug {
    fn id(&self) -> u32;
    fn name(&self) -> &str;
    fn storage_mode(&self) -> PageStorageMode;
    /// Freezes the current root for a checkpoint.
    fn capture(self: Arc<Self>) -> Box<dyn MapSnapshot>;
    fn rewrite_chunks(&self, chunks: &HashSet<ChunkId>) -> CoreResult<usize>;
    fn mark_dropped(&self);
}

/// A captured map root being written by a checkpoint.
pub(crate) trait MapSnapshot: Send {
    fn map_id(&self) -> u32;
    /// Appends unsaved pages to `writer`; returns the root position.
    fn write(&mut self, writer: &mut ChunkWriter) -> CoreResult<Option<PagePos>>;
    /// Publishes positions into pages once the chunk is synced.
    fn publish(&mut self);
    /// Positions released by pages that left the tree before the capture.
    fn retired_positions(&self) -> CoreResult<Vec<PagePos>>;
    /// Hands retired pages back after a failed checkpoint.
    fn restore(self: Box<Self>);
    /// Ends the checkpoint for this map.
    fn finish(self: Box<Self>);
}

impl<V: MapValue> StoredMap for BTreeMap<V> {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn storage_mode(&self) -> PageStorageMode {
        self.mode
    }

    fn capture(self: Arc<Self>) -> Box<dyn MapSnapshot> {
        let mut state = self.writer.lock();
        state.saving = true;
        let retired = std::mem::take(&mut state.retired);
        let root = self.root();
        drop(state);
        Box::new(Snapshot {
            map: self,
            root,
            retired,
            written: Vec::new(),
        })
    }

    fn rewrite_chunks(&self, chunks: &HashSet<ChunkId>) -> CoreResult<usize> {
        BTreeMap::rewrite_chunks(self, chunks)
    }

    fn mark_dropped(&self) {
        BTreeMap::mark_dropped(self);
    }
}

struct Snapshot<V: MapValue> {
    map: Arc<BTreeMap<V>>,
    root: Arc<Page<V>>,
    retired: Vec<Retired<V>>,
    written: Vec<(Arc<Page<V>>, Saved)>,
}

impl<V: MapValue> Snapshot<V> {
    fn save_page(&mut self, page: &Arc<Page<V>>, writer: &mut ChunkWriter) -> CoreResult<(PagePos, u64)> {
        if let Some(saved) = page.saved() {
            return Ok((saved.pos, saved.count));
        }
        let saved = match page.body() {
            PageBody::Leaf { keys, values } => {
                let rows: Cow<'_, [V]> = match values {
                    LeafValues::Rows(rows) => Cow::Borrowed(rows.as_slice()),
                    LeafValues::Columns(_) => Cow::Owned(page.rows(&self.map.store)?.1),
                };
                self.save_leaf(keys, &rows, writer)?
            }
            PageBody::Node {
                keys,
                children,
                counts,
            } => {
                let mut entries = Vec::with_capacity(children.len());
                for (child, count) in children.iter().zip(counts) {
                    let entry = match child.get() {
                        Some(loaded) => self.save_page(loaded, writer)?,
                        None => child.saved(*count).ok_or_else(|| {
                            CoreError::internal("unloaded child without a position")
                        })?,
                    };
                    entries.push(entry);
                }
                let count = entries.iter().map(|(_, c)| c).sum();
                let pos = writer.add_page(self.map.id, PAGE_NODE, &node_payload(keys, &entries))?;
                Saved {
                    pos,
                    count,
                    columns: Vec::new(),
                }
            }
        };
        let result = (saved.pos, saved.count);
        self.written.push((Arc::clone(page), saved));
        Ok(result)
    }

    fn save_leaf(&self, keys: &[Value], rows: &[V], writer: &mut ChunkWriter) -> CoreResult<Saved> {
        let entries: Vec<(&Value, Cow<'_, V>)> = keys
            .iter()
            .zip(rows)
            .filter_map(|(k, v)| v.persistent().map(|p| (k, p)))
            .collect();
        let count = entries.len() as u64;
        let map_id = self.map.id;

        let columnar = self.map.mode == PageStorageMode::Column
            && !entries.is_empty()
            && entries.iter().all(|(_, v)| v.columns().is_some());
        if columnar {
            let width = entries
                .iter()
                .map(|(_, v)| v.columns().map_or(0, <[Value]>::len))
                .max()
                .unwrap_or(0);
            let mut columns = Vec::with_capacity(width);
            for c in 0..width {
                let payload = column_payload(
                    entries
                        .iter()
                        .map(|(_, v)| v.columns().and_then(|cols| cols.get(c)).unwrap_or(&NULL)),
                );
                columns.push(writer.add_page(map_id, PAGE_COLUMN, &payload)?);
            }
            let heads: Vec<Vec<u8>> = entries
                .iter()
                .map(|(_, v)| {
                    let mut w = Writer::new();
                    v.write_head(&mut w);
                    w.into_bytes()
                })
                .collect();
            let keys: Vec<&Value> = entries.iter().map(|(k, _)| *k).collect();
            let pos = writer.add_page(
                map_id,
                PAGE_COLUMN_LEAF,
                &column_leaf_payload(&keys, &heads, &columns),
            )?;
            return Ok(Saved {
                pos,
                count,
                columns,
            });
        }

        let pairs: Vec<(&Value, &V)> = entries.iter().map(|(k, v)| (*k, &**v)).collect();
        let pos = writer.add_page(map_id, PAGE_ROW_LEAF, &row_leaf_payload(&pairs))?;
        Ok(Saved {
            pos,
            count,
            columns: Vec::new(),
        })
    }
}

impl<V: MapValue> MapSnapshot for Snapshot<V> {
    fn map_id(&self) -> u32 {
        self.map.id
    }

    fn write(&mut self, writer: &mut ChunkWriter) -> CoreResult<Option<PagePos>> {
        let root = Arc::clone(&self.root);
        if root.is_leaf() && root.saved().is_none() {
            let empty = match root.body() {
                PageBody::Leaf {
                    values: LeafValues::Rows(rows),
                    ..
                } => rows.iter().all(|v| v.persistent().is_none()),
                _ => false,
            };
            if empty {
                return Ok(None);
            }
        }
        let (pos, _) = self.save_page(&root, writer)?;
        Ok(Some(pos))
    }

    fn publish(&mut self) {
        for (page, saved) in self.written.drain(..) {
            page.publish(saved);
        }
    }

    fn retired_positions(&self) -> CoreResult<Vec<PagePos>> {
        self.map.retired_positions(&self.retired)
    }

    fn restore(self: Box<Self>) {
        let mut state = self.map.writer.lock();
        state.saving = false;
        let mut retired = self.retired.clone();
        retired.append(&mut state.retired);
        state.retired = retired;
    }

    fn finish(self: Box<Self>) {
        self.map.writer.lock().saving = false;
    }
}
