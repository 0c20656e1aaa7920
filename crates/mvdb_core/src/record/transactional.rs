//! Multi-version slots stored by transactional maps.

use crate::record::MapValue;
use crate::types::TransactionId;
use mvdb_codec::{CodecError, CodecResult, Reader, Value, Writer};
use std::borrow::Cow;
use std::sync::Arc;

const TAG_COMMITTED: u8 = 0;
const TAG_UNCOMMITTED: u8 = 1;

/// One committed version of a row, linked to the version it replaced.
#[derive(Debug)]
pub struct CommittedVersion<V> {
    commit_id: TransactionId,
    value: Option<V>,
    older: Option<Arc<CommittedVersion<V>>>,
}

impl<V> CommittedVersion<V> {
    /// Commit id of the transaction that produced this version.
    /// [`TransactionId::ZERO`] marks versions recovered from disk or log.
    pub fn commit_id(&self) -> TransactionId {
        self.commit_id
    }

    /// The value, `None` for a committed deletion.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// The version this one replaced, if still retained.
    pub fn older(&self) -> Option<&Arc<CommittedVersion<V>>> {
        self.older.as_ref()
    }

    fn depth(&self) -> usize {
        let mut depth = 1;
        let mut next = self.older.as_deref();
        while let Some(version) = next {
            depth += 1;
            next = version.older.as_deref();
        }
        depth
    }
}

/// What a reading transaction is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadView {
    /// The reading transaction; its own pending writes are always visible.
    pub reader: TransactionId,
    /// For repeatable read, versions committed with an id below this bound
    /// are visible. `None` reads the newest committed version.
    pub snapshot: Option<TransactionId>,
}

impl ReadView {
    /// A read-committed view.
    pub fn read_committed(reader: TransactionId) -> Self {
        Self {
            reader,
            snapshot: None,
        }
    }

    /// A repeatable-read view with the given snapshot bound.
    pub fn repeatable_read(reader: TransactionId, snapshot: TransactionId) -> Self {
        Self {
            reader,
            snapshot: Some(snapshot),
        }
    }

    fn sees(&self, commit_id: TransactionId) -> bool {
        self.snapshot.map_or(true, |bound| commit_id < bound)
    }
}

/// The slot a transactional map stores for one key.
///
/// A slot is either fully committed, or carries exactly one transaction's
/// pending write on top of the committed chain. Pending deletions are
/// represented with `value: None` so the row stays locked until the owner
/// commits or rolls back.
#[derive(Debug)]
pub enum TransactionalValue<V> {
    /// No pending write.
    Committed(Arc<CommittedVersion<V>>),
    /// A pending write by `owner`.
    Uncommitted {
        /// The transaction holding the row.
        owner: TransactionId,
        /// Pending value, `None` for a pending deletion.
        value: Option<V>,
        /// Committed chain underneath the pending write.
        committed: Option<Arc<CommittedVersion<V>>>,
    },
}

impl<V> Clone for TransactionalValue<V>
where
    V: Clone,
{
    fn clone(&self) -> Self {
        match self {
            Self::Committed(head) => Self::Committed(Arc::clone(head)),
            Self::Uncommitted {
                owner,
                value,
                committed,
            } => Self::Uncommitted {
                owner: *owner,
                value: value.clone(),
                committed: committed.clone(),
            },
        }
    }
}

impl<V: MapValue> TransactionalValue<V> {
    /// A committed slot with no history, as produced by recovery.
    pub fn committed(commit_id: TransactionId, value: V) -> Self {
        Self::Committed(Arc::new(CommittedVersion {
            commit_id,
            value: Some(value),
            older: None,
        }))
    }

    /// A pending write by `owner` layered over whatever `previous` holds.
    pub fn uncommitted(owner: TransactionId, value: Option<V>, previous: Option<&Self>) -> Self {
        Self::Uncommitted {
            owner,
            value,
            committed: previous.and_then(|p| p.committed_version().cloned()),
        }
    }

    /// True when no transaction holds the row.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    /// The transaction holding the row, if any.
    pub fn owner(&self) -> Option<TransactionId> {
        match self {
            Self::Committed(_) => None,
            Self::Uncommitted { owner, .. } => Some(*owner),
        }
    }

    /// Newest committed version.
    pub fn committed_version(&self) -> Option<&Arc<CommittedVersion<V>>> {
        match self {
            Self::Committed(head) => Some(head),
            Self::Uncommitted { committed, .. } => committed.as_ref(),
        }
    }

    /// The pending value if `owner` holds the row.
    pub fn pending_value(&self, owner: TransactionId) -> Option<Option<&V>> {
        match self {
            Self::Uncommitted {
                owner: holder,
                value,
                ..
            } if *holder == owner => Some(value.as_ref()),
            _ => None,
        }
    }

    /// The value `view` observes, `None` if the key is absent for it.
    pub fn visible_value(&self, view: &ReadView) -> Option<&V> {
        if let Some(pending) = self.pending_value(view.reader) {
            return pending;
        }
        let mut next = self.committed_version().map(Arc::as_ref);
        while let Some(version) = next {
            if view.sees(version.commit_id) {
                return version.value.as_ref();
            }
            next = version.older.as_deref();
        }
        None
    }

    /// Turns the pending write into the newest committed version.
    ///
    /// Versions older than the first one visible at `retain_floor` (the
    /// oldest repeatable-read snapshot still active) are unlinked; with no
    /// floor only the new head remains.
    ///
    /// Returns `None` for a slot that is not pending.
    pub fn commit(&self, commit_id: TransactionId, retain_floor: Option<TransactionId>) -> Option<Self> {
        match self {
            Self::Committed(_) => None,
            Self::Uncommitted {
                value, committed, ..
            } => {
                let older = match (retain_floor, committed) {
                    (Some(floor), Some(head)) => Some(prune(head, floor)),
                    _ => None,
                };
                Some(Self::Committed(Arc::new(CommittedVersion {
                    commit_id,
                    value: value.clone(),
                    older,
                })))
            }
        }
    }

    /// True for a committed deletion nobody can still observe.
    pub fn is_dead(&self) -> bool {
        match self {
            Self::Committed(head) => head.value.is_none() && head.older.is_none(),
            Self::Uncommitted { .. } => false,
        }
    }

    /// Number of retained committed versions.
    pub fn chain_len(&self) -> usize {
        self.committed_version().map_or(0, |head| head.depth())
    }
}

/// Copies the chain from `head` down to the first version committed below
/// `floor`, dropping everything older.
fn prune<V: Clone>(head: &Arc<CommittedVersion<V>>, floor: TransactionId) -> Arc<CommittedVersion<V>> {
    let mut kept = Vec::new();
    let mut next = Some(head);
    while let Some(version) = next {
        kept.push(version);
        if version.commit_id < floor {
            break;
        }
        next = version.older.as_ref();
    }
    let Some(last) = kept.pop() else {
        return Arc::clone(head);
    };
    if last.older.is_none() {
        // Nothing to cut below the retained suffix.
        return Arc::clone(head);
    }
    let mut chain = Arc::new(CommittedVersion {
        commit_id: last.commit_id,
        value: last.value.clone(),
        older: None,
    });
    while let Some(version) = kept.pop() {
        chain = Arc::new(CommittedVersion {
            commit_id: version.commit_id,
            value: version.value.clone(),
            older: Some(chain),
        });
    }
    chain
}

fn write_version<V: MapValue>(w: &mut Writer, commit_id: TransactionId, value: Option<&V>) {
    w.put_varint(commit_id.as_u64());
    match value {
        Some(v) => {
            w.put_u8(1);
            v.write(w);
        }
        None => w.put_u8(0),
    }
}

fn read_optional<V: MapValue>(r: &mut Reader<'_>) -> CodecResult<Option<V>> {
    match r.u8()? {
        0 => Ok(None),
        1 => Ok(Some(V::read(r)?)),
        tag => Err(CodecError::InvalidTag(tag)),
    }
}

impl<V: MapValue> MapValue for TransactionalValue<V> {
    fn write(&self, w: &mut Writer) {
        match self {
            Self::Committed(head) => {
                w.put_u8(TAG_COMMITTED);
                write_version(w, head.commit_id, head.value.as_ref());
            }
            Self::Uncommitted {
                owner,
                value,
                committed,
            } => {
                w.put_u8(TAG_UNCOMMITTED);
                write_version(w, *owner, value.as_ref());
                match committed {
                    Some(head) => {
                        w.put_u8(1);
                        write_version(w, head.commit_id, head.value.as_ref());
                    }
                    None => w.put_u8(0),
                }
            }
        }
    }

    fn read(r: &mut Reader<'_>) -> CodecResult<Self> {
        match r.u8()? {
            TAG_COMMITTED => {
                let commit_id = TransactionId::new(r.varint()?);
                let value = read_optional(r)?;
                Ok(Self::Committed(Arc::new(CommittedVersion {
                    commit_id,
                    value,
                    older: None,
                })))
            }
            TAG_UNCOMMITTED => {
                let owner = TransactionId::new(r.varint()?);
                let value = read_optional(r)?;
                let committed = match r.u8()? {
                    0 => None,
                    1 => {
                        let commit_id = TransactionId::new(r.varint()?);
                        let value = read_optional(r)?;
                        Some(Arc::new(CommittedVersion {
                            commit_id,
                            value,
                            older: None,
                        }))
                    }
                    tag => return Err(CodecError::InvalidTag(tag)),
                };
                Ok(Self::Uncommitted {
                    owner,
                    value,
                    committed,
                })
            }
            tag => Err(CodecError::InvalidTag(tag)),
        }
    }

    fn memory(&self) -> usize {
        let mut total = 24;
        if let Self::Uncommitted {
            value: Some(v), ..
        } = self
        {
            total += v.memory();
        }
        let mut next = self.committed_version().map(Arc::as_ref);
        while let Some(version) = next {
            total += 24 + version.value.as_ref().map_or(0, |v| v.memory());
            next = version.older.as_deref();
        }
        total
    }

    /// Checkpoints keep only the newest committed value of each row.
    fn persistent(&self) -> Option<Cow<'_, Self>> {
        let head = self.committed_version()?;
        head.value.as_ref()?;
        if self.is_committed() && head.older.is_none() {
            return Some(Cow::Borrowed(self));
        }
        Some(Cow::Owned(Self::Committed(Arc::new(CommittedVersion {
            commit_id: head.commit_id,
            value: head.value.clone(),
            older: None,
        }))))
    }

    fn columns(&self) -> Option<&[Value]> {
        match self {
            Self::Committed(head) => head.value.as_ref()?.columns(),
            Self::Uncommitted { .. } => None,
        }
    }

    fn write_head(&self, w: &mut Writer) {
        if let Self::Committed(head) = self {
            w.put_varint(head.commit_id.as_u64());
            if let Some(value) = &head.value {
                value.write_head(w);
            }
        }
    }

    fn from_columns(head: &mut Reader<'_>, columns: Vec<Value>) -> CodecResult<Self> {
        let commit_id = TransactionId::new(head.varint()?);
        let value = V::from_columns(head, columns)?;
        Ok(Self::committed(commit_id, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Slot = TransactionalValue<Value>;

    fn t(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    fn commit_write(prev: Option<&Slot>, owner: u64, cid: u64, v: Option<i64>, floor: Option<u64>) -> Slot {
        Slot::uncommitted(t(owner), v.map(Value::Int), prev)
            .commit(t(cid), floor.map(t))
            .unwrap()
    }

    #[test]
    fn owner_sees_pending_write_others_see_committed() {
        let base = Slot::committed(t(0), Value::Int(1));
        let pending = Slot::uncommitted(t(5), Some(Value::Int(2)), Some(&base));

        let own = ReadView::read_committed(t(5));
        let other = ReadView::read_committed(t(6));
        assert_eq!(pending.visible_value(&own), Some(&Value::Int(2)));
        assert_eq!(pending.visible_value(&other), Some(&Value::Int(1)));
        assert_eq!(pending.owner(), Some(t(5)));
    }

    #[test]
    fn pending_delete_hides_row_from_owner_only() {
        let base = Slot::committed(t(0), Value::Int(1));
        let pending = Slot::uncommitted(t(5), None, Some(&base));
        assert_eq!(pending.visible_value(&ReadView::read_committed(t(5))), None);
        assert_eq!(
            pending.visible_value(&ReadView::read_committed(t(7))),
            Some(&Value::Int(1))
        );
    }

    #[test]
    fn snapshot_reads_walk_the_chain() {
        let v1 = commit_write(None, 2, 3, Some(10), Some(4));
        let v2 = commit_write(Some(&v1), 5, 6, Some(20), Some(4));
        assert_eq!(v2.chain_len(), 2);

        let old_reader = ReadView::repeatable_read(t(4), t(4));
        let new_reader = ReadView::repeatable_read(t(7), t(7));
        assert_eq!(v2.visible_value(&old_reader), Some(&Value::Int(10)));
        assert_eq!(v2.visible_value(&new_reader), Some(&Value::Int(20)));
        assert_eq!(
            v2.visible_value(&ReadView::read_committed(t(4))),
            Some(&Value::Int(20))
        );
    }

    #[test]
    fn row_created_after_snapshot_is_invisible() {
        let v = commit_write(None, 8, 9, Some(1), Some(4));
        assert_eq!(v.visible_value(&ReadView::repeatable_read(t(4), t(4))), None);
    }

    #[test]
    fn commit_without_floor_drops_history() {
        let v1 = commit_write(None, 1, 2, Some(1), None);
        let v2 = commit_write(Some(&v1), 3, 4, Some(2), None);
        assert_eq!(v2.chain_len(), 1);
    }

    #[test]
    fn prune_keeps_first_version_below_floor() {
        // A reader at snapshot 1 pins the whole chain.
        let mut slot = commit_write(None, 1, 2, Some(1), Some(1));
        for (owner, cid) in [(3, 4), (5, 6), (7, 8)] {
            slot = commit_write(Some(&slot), owner, cid, Some(cid as i64), Some(1));
        }
        assert_eq!(slot.chain_len(), 4);

        // Oldest reader started at 7: it needs cid 6, nothing older.
        let slot = commit_write(Some(&slot), 9, 10, Some(10), Some(7));
        assert_eq!(slot.chain_len(), 3);
        let reader = ReadView::repeatable_read(t(7), t(7));
        assert_eq!(slot.visible_value(&reader), Some(&Value::Int(6)));
    }

    #[test]
    fn committed_delete_without_readers_is_dead() {
        let v1 = commit_write(None, 1, 2, Some(1), None);
        let gone = commit_write(Some(&v1), 3, 4, None, None);
        assert!(gone.is_dead());

        let kept = commit_write(Some(&v1), 3, 4, None, Some(3));
        assert!(!kept.is_dead());
        assert_eq!(
            kept.visible_value(&ReadView::repeatable_read(t(3), t(3))),
            Some(&Value::Int(1))
        );
    }

    #[test]
    fn persistent_form_is_committed_head_only() {
        let v1 = commit_write(None, 1, 2, Some(1), Some(100));
        let v2 = commit_write(Some(&v1), 3, 4, Some(2), Some(100));
        let saved = v2.persistent().unwrap();
        assert_eq!(saved.chain_len(), 1);
        assert_eq!(
            saved.visible_value(&ReadView::read_committed(t(9))),
            Some(&Value::Int(2))
        );

        let pending_insert = Slot::uncommitted(t(5), Some(Value::Int(1)), None);
        assert!(pending_insert.persistent().is_none());

        let pending_update = Slot::uncommitted(t(5), Some(Value::Int(9)), Some(&v2));
        let saved = pending_update.persistent().unwrap();
        assert!(saved.is_committed());
        assert_eq!(
            saved.visible_value(&ReadView::read_committed(t(9))),
            Some(&Value::Int(2))
        );
    }

    #[test]
    fn encoding_keeps_state() {
        let base = Slot::committed(t(3), Value::from("a"));
        let pending = Slot::uncommitted(t(5), None, Some(&base));
        let mut w = Writer::new();
        pending.write(&mut w);
        let bytes = w.into_bytes();
        let back = Slot::read(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(back.owner(), Some(t(5)));
        assert_eq!(back.pending_value(t(5)), Some(None));
        assert_eq!(back.committed_version().unwrap().commit_id(), t(3));
    }

    #[test]
    fn committing_a_committed_slot_is_refused() {
        let base = Slot::committed(t(3), Value::Int(1));
        assert!(base.commit(t(9), None).is_none());
    }
}
