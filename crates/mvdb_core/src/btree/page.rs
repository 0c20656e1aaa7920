//! In-memory B-tree pages.
//!
//! Pages are immutable once shared. Every modification builds new pages
//! along the path from the changed leaf to the root (copy-on-write), so a
//! reader holding an old root keeps a consistent view for as long as it
//! likes. Persisted positions are published into a page exactly once, after
//! the chunk holding it has been synced.

use crate::btree::chunk::ChunkStore;
use crate::context::EngineContext;
use crate::error::{CoreError, CoreResult};
use crate::record::MapValue;
use crate::types::PagePos;
use mvdb_codec::{Reader, Value};
use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, OnceLock};

const PAGE_OVERHEAD: usize = 48;
const CHILD_OVERHEAD: usize = 32;

/// Where and how a page was persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Saved {
    /// The page frame.
    pub pos: PagePos,
    /// Entry count of the persisted subtree.
    pub count: u64,
    /// Column sub-pages of a column leaf.
    pub columns: Vec<PagePos>,
}

impl Saved {
    /// Every position owned by the page.
    pub fn positions(&self) -> impl Iterator<Item = PagePos> + '_ {
        std::iter::once(self.pos).chain(self.columns.iter().copied())
    }
}

/// A B-tree page.
pub(crate) struct Page<V> {
    body: PageBody<V>,
    saved: OnceLock<Saved>,
    memory: usize,
    total: u64,
}

pub(crate) enum PageBody<V> {
    Leaf {
        keys: Vec<Value>,
        values: LeafValues<V>,
    },
    Node {
        keys: Vec<Value>,
        children: Vec<ChildRef<V>>,
        counts: Vec<u64>,
    },
}

pub(crate) enum LeafValues<V> {
    /// Whole values, one per key.
    Rows(Vec<V>),
    /// A column leaf loaded from disk.
    Columns(ColumnLeaf),
}

/// Leaf whose values are split into per-column pages.
pub(crate) struct ColumnLeaf {
    /// Encoded per-row heads (see [`MapValue::write_head`]).
    pub heads: Vec<Vec<u8>>,
    /// One page per column, loaded on first access.
    pub columns: Vec<ColumnPage>,
}

/// Reference from a node to a child page.
pub(crate) struct ChildRef<V> {
    pos: Option<PagePos>,
    page: OnceLock<Arc<Page<V>>>,
}

impl<V> Clone for ChildRef<V> {
    fn clone(&self) -> Self {
        let page = OnceLock::new();
        if let Some(loaded) = self.page.get() {
            let _ = page.set(Arc::clone(loaded));
        }
        Self {
            pos: self.pos,
            page,
        }
    }
}

impl<V: MapValue> ChildRef<V> {
    /// A reference to an in-memory page.
    pub fn loaded(page: Arc<Page<V>>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(page);
        Self { pos: None, page: cell }
    }

    /// A reference to a persisted page that is read on first access.
    pub fn persisted(pos: PagePos) -> Self {
        Self {
            pos: Some(pos),
            page: OnceLock::new(),
        }
    }

    /// The page, reading it from its chunk if needed.
    pub fn load(&self, store: &ChunkStore) -> CoreResult<Arc<Page<V>>> {
        if let Some(page) = self.page.get() {
            return Ok(Arc::clone(page));
        }
        let pos = self
            .pos
            .ok_or_else(|| CoreError::internal("child has neither page nor position"))?;
        let page = Arc::new(store.read_page::<V>(pos)?);
        // A concurrent reader may have won; everyone uses the stored page.
        let _ = self.page.set(page);
        self.page
            .get()
            .cloned()
            .ok_or_else(|| CoreError::internal("child page not published"))
    }

    /// The loaded page, if already in memory.
    pub fn get(&self) -> Option<&Arc<Page<V>>> {
        self.page.get()
    }

    /// Persisted position and entry count, if the child is on disk.
    pub fn saved(&self, count: u64) -> Option<(PagePos, u64)> {
        match self.page.get() {
            Some(page) => page.saved().map(|s| (s.pos, s.count)),
            None => self.pos.map(|pos| (pos, count)),
        }
    }
}

/// One column of a column leaf.
pub(crate) struct ColumnPage {
    pos: PagePos,
    values: OnceLock<Arc<Vec<Value>>>,
    context: Arc<EngineContext>,
}

impl ColumnPage {
    pub fn new(pos: PagePos, context: Arc<EngineContext>) -> Self {
        Self {
            pos,
            values: OnceLock::new(),
            context,
        }
    }

    pub fn pos(&self) -> PagePos {
        self.pos
    }

    pub fn is_loaded(&self) -> bool {
        self.values.get().is_some()
    }

    /// Column values, read on first access.
    ///
    /// The memory of the decoded values is charged to the engine's pool by
    /// whichever reader publishes them, and released when the page drops.
    pub fn values(&self, store: &ChunkStore) -> CoreResult<Arc<Vec<Value>>> {
        if let Some(values) = self.values.get() {
            return Ok(Arc::clone(values));
        }
        let decoded = Arc::new(store.read_column(self.pos)?);
        let bytes = column_memory(&decoded);
        if self.values.set(decoded).is_ok() {
            self.context.memory().charge(bytes);
        }
        self.values
            .get()
            .cloned()
            .ok_or_else(|| CoreError::internal("column page not published"))
    }
}

impl Drop for ColumnPage {
    fn drop(&mut self) {
        if let Some(values) = self.values.get() {
            self.context.memory().release(column_memory(values));
        }
    }
}

fn column_memory(values: &[Value]) -> usize {
    values.iter().map(Value::memory).sum()
}

impl<V: MapValue> Page<V> {
    /// Creates a row leaf.
    pub fn leaf(keys: Vec<Value>, values: Vec<V>) -> Self {
        let memory = PAGE_OVERHEAD
            + keys.iter().map(Value::memory).sum::<usize>()
            + values.iter().map(MapValue::memory).sum::<usize>();
        let total = keys.len() as u64;
        Self {
            body: PageBody::Leaf {
                keys,
                values: LeafValues::Rows(values),
            },
            saved: OnceLock::new(),
            memory,
            total,
        }
    }

    /// Creates an empty leaf.
    pub fn empty() -> Self {
        Self::leaf(Vec::new(), Vec::new())
    }

    /// Creates a column leaf read from disk.
    pub fn column_leaf(keys: Vec<Value>, columns: ColumnLeaf) -> Self {
        let memory = PAGE_OVERHEAD
            + keys.iter().map(Value::memory).sum::<usize>()
            + columns.heads.iter().map(Vec::len).sum::<usize>()
            + columns.columns.len() * CHILD_OVERHEAD;
        let total = keys.len() as u64;
        Self {
            body: PageBody::Leaf {
                keys,
                values: LeafValues::Columns(columns),
            },
            saved: OnceLock::new(),
            memory,
            total,
        }
    }

    /// Creates an internal node. `children.len()` must be `keys.len() + 1`.
    pub fn node(keys: Vec<Value>, children: Vec<ChildRef<V>>, counts: Vec<u64>) -> Self {
        let memory = PAGE_OVERHEAD
            + keys.iter().map(Value::memory).sum::<usize>()
            + children.len() * CHILD_OVERHEAD;
        let total = counts.iter().sum();
        Self {
            body: PageBody::Node {
                keys,
                children,
                counts,
            },
            saved: OnceLock::new(),
            memory,
            total,
        }
    }

    pub fn body(&self) -> &PageBody<V> {
        &self.body
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.body, PageBody::Leaf { .. })
    }

    pub fn keys(&self) -> &[Value] {
        match &self.body {
            PageBody::Leaf { keys, .. } | PageBody::Node { keys, .. } => keys,
        }
    }

    /// Entries in this subtree.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Estimated in-memory size used for split decisions.
    pub fn memory(&self) -> usize {
        self.memory
    }

    pub fn saved(&self) -> Option<&Saved> {
        self.saved.get()
    }

    /// Publishes the persisted position. Later calls are ignored.
    pub fn publish(&self, saved: Saved) {
        let _ = self.saved.set(saved);
    }

    /// Binary search among the page keys.
    pub fn find(&self, key: &Value) -> Result<usize, usize> {
        self.keys().binary_search(key)
    }

    /// Index of the child whose range holds `key`.
    pub fn child_index(&self, key: &Value) -> usize {
        match self.find(key) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    pub fn child_count(&self) -> usize {
        match &self.body {
            PageBody::Leaf { .. } => 0,
            PageBody::Node { children, .. } => children.len(),
        }
    }

    /// Loads child `index` of a node.
    pub fn child(&self, index: usize, store: &ChunkStore) -> CoreResult<Arc<Page<V>>> {
        match &self.body {
            PageBody::Node { children, .. } => children
                .get(index)
                .ok_or_else(|| CoreError::internal(format!("child index {index} out of range")))?
                .load(store),
            PageBody::Leaf { .. } => Err(CoreError::internal("leaf has no children")),
        }
    }

    /// Value at `index` of a leaf. `columns` restricts which columns of a
    /// column leaf are decoded; the rest come back as nulls.
    pub fn value(
        &self,
        index: usize,
        columns: Option<&[usize]>,
        store: &ChunkStore,
    ) -> CoreResult<Cow<'_, V>> {
        let PageBody::Leaf { values, .. } = &self.body else {
            return Err(CoreError::internal("node has no values"));
        };
        match values {
            LeafValues::Rows(rows) => rows
                .get(index)
                .map(Cow::Borrowed)
                .ok_or_else(|| CoreError::internal(format!("value index {index} out of range"))),
            LeafValues::Columns(leaf) => {
                let head = leaf.heads.get(index).ok_or_else(|| {
                    CoreError::internal(format!("value index {index} out of range"))
                })?;
                let mut row = Vec::with_capacity(leaf.columns.len());
                for (c, column) in leaf.columns.iter().enumerate() {
                    let wanted = columns.map_or(true, |set| set.contains(&c));
                    if wanted {
                        let values = column.values(store)?;
                        let value = values.get(index).cloned().ok_or_else(|| {
                            CoreError::page_corruption(format!(
                                "column page {} shorter than its leaf",
                                column.pos()
                            ))
                        })?;
                        row.push(value);
                    } else {
                        row.push(Value::Null);
                    }
                }
                let value = V::from_columns(&mut Reader::new(head), row)?;
                Ok(Cow::Owned(value))
            }
        }
    }

    /// Returns the leaf contents as rows, decoding a column leaf in full.
    pub fn rows(&self, store: &ChunkStore) -> CoreResult<(Vec<Value>, Vec<V>)> {
        let PageBody::Leaf { keys, values } = &self.body else {
            return Err(CoreError::internal("node has no rows"));
        };
        let rows = match values {
            LeafValues::Rows(rows) => rows.clone(),
            LeafValues::Columns(_) => (0..keys.len())
                .map(|i| self.value(i, None, store).map(Cow::into_owned))
                .collect::<CoreResult<Vec<_>>>()?,
        };
        Ok((keys.clone(), rows))
    }

    /// Node children and per-child counts.
    pub fn node_parts(&self) -> CoreResult<(&[Value], &[ChildRef<V>], &[u64])> {
        match &self.body {
            PageBody::Node {
                keys,
                children,
                counts,
            } => Ok((keys, children, counts)),
            PageBody::Leaf { .. } => Err(CoreError::internal("leaf is not a node")),
        }
    }

    /// True if a column leaf has at least one column in memory.
    pub fn has_loaded_columns(&self) -> bool {
        match &self.body {
            PageBody::Leaf {
                values: LeafValues::Columns(leaf),
                ..
            } => leaf.columns.iter().any(ColumnPage::is_loaded),
            _ => false,
        }
    }
}

impl<V> fmt::Debug for Page<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, keys) = match &self.body {
            PageBody::Leaf {
                keys,
                values: LeafValues::Rows(_),
            } => ("leaf", keys.len()),
            PageBody::Leaf {
                keys,
                values: LeafValues::Columns(_),
            } => ("column-leaf", keys.len()),
            PageBody::Node { keys, .. } => ("node", keys.len()),
        };
        f.debug_struct("Page")
            .field("kind", &kind)
            .field("keys", &keys)
            .field("total", &self.total)
            .field("saved", &self.saved.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(range: std::ops::Range<i64>) -> Vec<Value> {
        range.map(Value::Int).collect()
    }

    #[test]
    fn child_index_sends_equal_keys_right() {
        let leaf: Arc<Page<Value>> = Arc::new(Page::empty());
        let node = Page::node(
            vec![Value::Int(10), Value::Int(20)],
            vec![
                ChildRef::loaded(Arc::clone(&leaf)),
                ChildRef::loaded(Arc::clone(&leaf)),
                ChildRef::loaded(leaf),
            ],
            vec![0, 0, 0],
        );
        assert_eq!(node.child_index(&Value::Int(5)), 0);
        assert_eq!(node.child_index(&Value::Int(10)), 1);
        assert_eq!(node.child_index(&Value::Int(15)), 1);
        assert_eq!(node.child_index(&Value::Int(20)), 2);
        assert_eq!(node.child_index(&Value::Int(99)), 2);
    }

    #[test]
    fn totals_and_memory_follow_content() {
        let leaf = Page::leaf(keys(0..4), keys(0..4));
        assert_eq!(leaf.total(), 4);
        assert!(leaf.memory() > PAGE_OVERHEAD);

        let leaf = Arc::new(leaf);
        let node = Page::node(
            vec![Value::Int(4)],
            vec![ChildRef::loaded(Arc::clone(&leaf)), ChildRef::loaded(leaf)],
            vec![4, 4],
        );
        assert_eq!(node.total(), 8);
        assert!(!node.is_leaf());
    }

    #[test]
    fn publish_is_write_once() {
        let page: Page<Value> = Page::empty();
        let first = Saved {
            pos: PagePos::new(crate::types::ChunkId::new(1), 16, 10),
            count: 0,
            columns: Vec::new(),
        };
        page.publish(first.clone());
        page.publish(Saved {
            pos: PagePos::new(crate::types::ChunkId::new(2), 16, 10),
            count: 0,
            columns: Vec::new(),
        });
        assert_eq!(page.saved(), Some(&first));
    }

    #[test]
    fn saved_positions_include_columns() {
        let chunk = crate::types::ChunkId::new(3);
        let saved = Saved {
            pos: PagePos::new(chunk, 100, 20),
            count: 2,
            columns: vec![PagePos::new(chunk, 16, 40), PagePos::new(chunk, 56, 44)],
        };
        assert_eq!(saved.positions().count(), 3);
    }
}
