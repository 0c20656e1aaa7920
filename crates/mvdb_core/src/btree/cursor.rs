//! Ordered traversal over a B-tree snapshot.

use crate::btree::chunk::ChunkStore;
use crate::btree::page::Page;
use crate::error::CoreResult;
use crate::record::MapValue;
use mvdb_codec::Value;
use std::fmt;
use std::sync::Arc;

/// Bounds and projection for a cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorParameters {
    /// First key to visit (inclusive); `None` starts at the smallest key.
    pub from: Option<Value>,
    /// Last key to visit (inclusive); `None` runs to the end.
    pub to: Option<Value>,
    /// Columns to materialize from column-stored leaves; `None` reads all.
    pub columns: Option<Vec<usize>>,
}

impl CursorParameters {
    /// Unbounded parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lower bound.
    #[must_use]
    pub fn from(mut self, key: impl Into<Value>) -> Self {
        self.from = Some(key.into());
        self
    }

    /// Sets the upper bound.
    #[must_use]
    pub fn to(mut self, key: impl Into<Value>) -> Self {
        self.to = Some(key.into());
        self
    }

    /// Restricts which columns are decoded.
    #[must_use]
    pub fn columns(mut self, columns: Vec<usize>) -> Self {
        self.columns = Some(columns);
        self
    }
}

/// One frame of the cursor stack: a page and the position inside it.
/// The parent of a frame is the frame below it.
struct CursorPos<V> {
    page: Arc<Page<V>>,
    index: usize,
}

/// Ascending iterator over `(key, value)` pairs of a map.
///
/// The cursor works on the root it was created from, so concurrent
/// updates to the map are not observed. Its pin keeps the chunks of that
/// root on disk until the cursor is dropped, even across saves.
pub struct BTreeCursor<V> {
    store: Arc<ChunkStore>,
    pin: u64,
    stack: Vec<CursorPos<V>>,
    to: Option<Value>,
    columns: Option<Vec<usize>>,
    done: bool,
}

impl<V: MapValue> BTreeCursor<V> {
    /// Positions a cursor on `root`. `pin` must have been taken from
    /// `store` before `root` was read; the cursor releases it.
    pub(crate) fn new(
        root: Arc<Page<V>>,
        store: Arc<ChunkStore>,
        pin: u64,
        params: CursorParameters,
    ) -> CoreResult<Self> {
        let CursorParameters { from, to, columns } = params;
        let mut cursor = Self {
            store,
            pin,
            stack: Vec::new(),
            to,
            columns,
            done: false,
        };
        let mut page = root;
        loop {
            if page.is_leaf() {
                let index = match &from {
                    Some(key) => page.find(key).unwrap_or_else(|i| i),
                    None => 0,
                };
                cursor.stack.push(CursorPos { page, index });
                break;
            }
            let index = from.as_ref().map_or(0, |key| page.child_index(key));
            let child = page.child(index, &cursor.store)?;
            cursor.stack.push(CursorPos { page, index });
            page = child;
        }
        Ok(cursor)
    }

    /// Pushes frames down the leftmost path of `page`.
    fn descend_first(&mut self, page: Arc<Page<V>>) -> CoreResult<()> {
        let mut page = page;
        while !page.is_leaf() {
            let child = page.child(0, &self.store)?;
            self.stack.push(CursorPos { page, index: 0 });
            page = child;
        }
        self.stack.push(CursorPos { page, index: 0 });
        Ok(())
    }

    fn advance(&mut self) -> CoreResult<Option<(Value, V)>> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(None);
            };
            if top.page.is_leaf() {
                let index = top.index;
                if index < top.page.keys().len() {
                    top.index += 1;
                    let key = top.page.keys()[index].clone();
                    if self.to.as_ref().is_some_and(|to| &key > to) {
                        self.stack.clear();
                        return Ok(None);
                    }
                    let value = top
                        .page
                        .value(index, self.columns.as_deref(), &self.store)?
                        .into_owned();
                    return Ok(Some((key, value)));
                }
                self.stack.pop();
                continue;
            }

            top.index += 1;
            if top.index < top.page.child_count() {
                let child = top.page.child(top.index, &self.store)?;
                self.descend_first(child)?;
            } else {
                self.stack.pop();
            }
        }
    }
}

impl<V: MapValue> Iterator for BTreeCursor<V> {
    type Item = CoreResult<(Value, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<V> Drop for BTreeCursor<V> {
    fn drop(&mut self) {
        self.store.unpin(self.pin);
    }
}

impl<V> fmt::Debug for BTreeCursor<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BTreeCursor")
            .field("depth", &self.stack.len())
            .field("to", &self.to)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
