//! Streaming redo record iterator.
//!
//! Records are read through a bounded buffer so replay memory does not grow
//! with the size of the log.

use crate::error::{CoreError, CoreResult};
use crate::redo::record::{RedoRecord, RedoRecordType, CRC_SIZE, HEADER_SIZE, REDO_MAGIC, REDO_VERSION};
use mvdb_storage::StorageBackend;

/// Read buffer size for streaming iteration.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A streaming iterator over the records of one redo file.
///
/// - truncated header or payload at the end: clean end of log
/// - CRC mismatch: `ChecksumMismatch`
/// - bad magic, unknown type, future version: `LogCorruption`
///
/// Yields `(offset, record)` pairs. After an error the iterator is fused.
pub struct RedoRecordIterator<'a> {
    backend: &'a dyn StorageBackend,
    total_size: u64,
    /// File offset of the first byte past `buffer`.
    read_offset: u64,
    buffer: Vec<u8>,
    buffer_pos: usize,
    finished: bool,
}

impl<'a> RedoRecordIterator<'a> {
    /// Creates an iterator starting at `start_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn new(backend: &'a dyn StorageBackend, start_offset: u64) -> CoreResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            read_offset: start_offset.min(total_size),
            buffer: Vec::new(),
            buffer_pos: 0,
            finished: false,
        })
    }

    /// File offset of the next unread record.
    pub fn offset(&self) -> u64 {
        self.read_offset - (self.buffer.len() - self.buffer_pos) as u64
    }

    /// Makes at least `min_bytes` available from `buffer_pos`. Returns
    /// false if the file ends first.
    fn ensure_buffered(&mut self, min_bytes: usize) -> CoreResult<bool> {
        let available = self.buffer.len() - self.buffer_pos;
        if available >= min_bytes {
            return Ok(true);
        }
        let remaining = self.total_size - self.read_offset;
        if (available as u64) + remaining < min_bytes as u64 {
            return Ok(false);
        }

        self.buffer.drain(..self.buffer_pos);
        self.buffer_pos = 0;

        let want = (min_bytes - available).max(READ_BUFFER_SIZE) as u64;
        let len = want.min(remaining) as usize;
        let data = self.backend.read_at(self.read_offset, len)?;
        self.read_offset += data.len() as u64;
        self.buffer.extend_from_slice(&data);
        Ok(self.buffer.len() >= min_bytes)
    }

    fn read_next_record(&mut self) -> CoreResult<Option<(u64, RedoRecord)>> {
        let start = self.offset();

        if !self.ensure_buffered(HEADER_SIZE)? {
            return Ok(None);
        }
        let header = &self.buffer[self.buffer_pos..self.buffer_pos + HEADER_SIZE];

        if header[0..4] != REDO_MAGIC {
            return Err(CoreError::log_corruption(format!(
                "invalid magic at offset {start}"
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > REDO_VERSION {
            return Err(CoreError::log_corruption(format!(
                "unsupported version {version} at offset {start}"
            )));
        }
        let type_byte = header[6];
        let record_type = RedoRecordType::from_byte(type_byte).ok_or_else(|| {
            CoreError::log_corruption(format!(
                "unknown record type {type_byte} at offset {start}"
            ))
        })?;
        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if !self.ensure_buffered(total_len)? {
            return Ok(None);
        }

        let record_start = self.buffer_pos;
        let payload_end = record_start + HEADER_SIZE + payload_len;
        let stored_crc = u32::from_le_bytes([
            self.buffer[payload_end],
            self.buffer[payload_end + 1],
            self.buffer[payload_end + 2],
            self.buffer[payload_end + 3],
        ]);
        let computed_crc = crc32fast::hash(&self.buffer[record_start..payload_end]);
        if stored_crc != computed_crc {
            return Err(CoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let record = RedoRecord::decode_payload(
            record_type,
            &self.buffer[record_start + HEADER_SIZE..payload_end],
        )?;
        self.buffer_pos += total_len;
        Ok(Some((start, record)))
    }
}

impl Iterator for RedoRecordIterator<'_> {
    type Item = CoreResult<(u64, RedoRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next_record() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionId;
    use mvdb_codec::Value;
    use mvdb_storage::InMemoryBackend;

    fn put(txid: u64, key: i64) -> RedoRecord {
        RedoRecord::Put {
            txid: TransactionId::new(txid),
            map: "m".into(),
            key: Value::Int(key),
            value: vec![1, 2, 3],
        }
    }

    fn backend_with(records: &[RedoRecord]) -> InMemoryBackend {
        let mut bytes = Vec::new();
        for record in records {
            record.encode_into(&mut bytes).unwrap();
        }
        InMemoryBackend::with_data(bytes)
    }

    fn read_all(backend: &InMemoryBackend) -> CoreResult<Vec<(u64, RedoRecord)>> {
        RedoRecordIterator::new(backend, 0)?.collect()
    }

    #[test]
    fn empty_log_yields_nothing() {
        let backend = InMemoryBackend::new();
        assert!(read_all(&backend).unwrap().is_empty());
    }

    #[test]
    fn reads_records_in_order_with_offsets() {
        let records = vec![
            put(1, 1),
            put(1, 2),
            RedoRecord::Commit {
                txid: TransactionId::new(1),
                commit_id: TransactionId::new(2),
            },
        ];
        let backend = backend_with(&records);
        let read = read_all(&backend).unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read[0].0, 0);
        assert!(read[1].0 > 0);
        let got: Vec<RedoRecord> = read.into_iter().map(|(_, r)| r).collect();
        assert_eq!(got, records);
    }

    #[test]
    fn many_records_cross_buffer_refills() {
        let records: Vec<RedoRecord> = (0..5000).map(|i| put(i, i as i64)).collect();
        let backend = backend_with(&records);
        let read = read_all(&backend).unwrap();
        assert_eq!(read.len(), 5000);
        assert_eq!(read[4999].1, records[4999]);
    }

    #[test]
    fn large_record_grows_buffer() {
        let record = RedoRecord::Put {
            txid: TransactionId::new(1),
            map: "blob".into(),
            key: Value::Int(1),
            value: vec![7; READ_BUFFER_SIZE * 3],
        };
        let backend = backend_with(&[record.clone()]);
        assert_eq!(read_all(&backend).unwrap()[0].1, record);
    }

    #[test]
    fn truncated_tail_is_clean_end() {
        let backend = backend_with(&[put(1, 1), put(1, 2)]);
        let mut data = backend.data();
        data.truncate(data.len() - 3);
        let truncated = InMemoryBackend::with_data(data);
        let read = read_all(&truncated).unwrap();
        assert_eq!(read.len(), 1);
    }

    #[test]
    fn truncated_header_is_clean_end() {
        let backend = backend_with(&[put(1, 1)]);
        let mut data = backend.data();
        data.extend_from_slice(&REDO_MAGIC);
        let truncated = InMemoryBackend::with_data(data);
        assert_eq!(read_all(&truncated).unwrap().len(), 1);
    }

    #[test]
    fn crc_mismatch_is_fatal() {
        let backend = backend_with(&[put(1, 1)]);
        let mut data = backend.data();
        data[HEADER_SIZE + 2] ^= 0xFF;
        let corrupt = InMemoryBackend::with_data(data);
        let err = read_all(&corrupt).unwrap_err();
        assert!(matches!(err, CoreError::ChecksumMismatch { .. }));
    }

    #[test]
    fn bad_magic_is_fatal() {
        let backend = backend_with(&[put(1, 1)]);
        let mut data = backend.data();
        data[0] = b'X';
        let corrupt = InMemoryBackend::with_data(data);
        assert!(matches!(
            read_all(&corrupt).unwrap_err(),
            CoreError::LogCorruption { .. }
        ));
    }

    #[test]
    fn future_version_is_fatal() {
        let backend = backend_with(&[put(1, 1)]);
        let mut data = backend.data();
        data[4..6].copy_from_slice(&(REDO_VERSION + 1).to_le_bytes());
        let corrupt = InMemoryBackend::with_data(data);
        assert!(matches!(
            read_all(&corrupt).unwrap_err(),
            CoreError::LogCorruption { .. }
        ));
    }

    #[test]
    fn unknown_type_is_fatal() {
        let backend = backend_with(&[put(1, 1)]);
        let mut data = backend.data();
        data[6] = 42;
        let corrupt = InMemoryBackend::with_data(data);
        assert!(matches!(
            read_all(&corrupt).unwrap_err(),
            CoreError::LogCorruption { .. }
        ));
    }

    #[test]
    fn start_offset_skips_earlier_records() {
        let backend = backend_with(&[put(1, 1), put(2, 2)]);
        let first = read_all(&backend).unwrap();
        let second_at = first[1].0;
        let rest: Vec<_> = RedoRecordIterator::new(&backend, second_at)
            .unwrap()
            .collect::<CoreResult<_>>()
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].1, put(2, 2));
    }
}
