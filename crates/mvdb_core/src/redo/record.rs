//! Redo record types and their envelope.

use crate::error::{CoreError, CoreResult};
use crate::types::TransactionId;
use mvdb_codec::{CodecError, Reader, Value, Writer};

/// Magic bytes identifying a redo record.
pub const REDO_MAGIC: [u8; 4] = *b"MVRL";

/// Current redo format version.
pub const REDO_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// Type of redo record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RedoRecordType {
    /// Insert or replace a row.
    Put = 1,
    /// Remove a row.
    Remove = 2,
    /// Drop a whole map.
    DropMap = 3,
    /// Commit marker.
    Commit = 4,
}

impl RedoRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Put),
            2 => Some(Self::Remove),
            3 => Some(Self::DropMap),
            4 => Some(Self::Commit),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One entry of the redo log.
///
/// Values are stored in their map's own encoding; they are decoded only
/// when the map is opened with its value type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoRecord {
    /// Insert or replace a row.
    Put {
        /// Writing transaction.
        txid: TransactionId,
        /// Map name.
        map: String,
        /// Row key.
        key: Value,
        /// Encoded row value.
        value: Vec<u8>,
    },

    /// Remove a row.
    Remove {
        /// Writing transaction.
        txid: TransactionId,
        /// Map name.
        map: String,
        /// Row key.
        key: Value,
    },

    /// Drop a whole map.
    DropMap {
        /// Writing transaction.
        txid: TransactionId,
        /// Map name.
        map: String,
    },

    /// Everything logged by `txid` is committed as `commit_id`.
    Commit {
        /// Committing transaction.
        txid: TransactionId,
        /// Commit id stamped on its values.
        commit_id: TransactionId,
    },
}

impl RedoRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> RedoRecordType {
        match self {
            Self::Put { .. } => RedoRecordType::Put,
            Self::Remove { .. } => RedoRecordType::Remove,
            Self::DropMap { .. } => RedoRecordType::DropMap,
            Self::Commit { .. } => RedoRecordType::Commit,
        }
    }

    /// The transaction that wrote this record.
    #[must_use]
    pub fn txid(&self) -> TransactionId {
        match self {
            Self::Put { txid, .. }
            | Self::Remove { txid, .. }
            | Self::DropMap { txid, .. }
            | Self::Commit { txid, .. } => *txid,
        }
    }

    /// Serializes the record payload (without envelope).
    pub fn encode_payload(&self, w: &mut Writer) {
        match self {
            Self::Put {
                txid,
                map,
                key,
                value,
            } => {
                w.put_u64(txid.as_u64());
                w.put_str(map);
                w.put_value(key);
                w.put_bytes(value);
            }
            Self::Remove { txid, map, key } => {
                w.put_u64(txid.as_u64());
                w.put_str(map);
                w.put_value(key);
            }
            Self::DropMap { txid, map } => {
                w.put_u64(txid.as_u64());
                w.put_str(map);
            }
            Self::Commit { txid, commit_id } => {
                w.put_u64(txid.as_u64());
                w.put_u64(commit_id.as_u64());
            }
        }
    }

    /// Deserializes a record from its type and payload.
    ///
    /// # Errors
    ///
    /// `LogCorruption` if the payload is short, malformed or has trailing
    /// bytes.
    pub fn decode_payload(record_type: RedoRecordType, payload: &[u8]) -> CoreResult<Self> {
        let mut r = Reader::new(payload);
        let record = Self::read(record_type, &mut r)
            .map_err(|e| CoreError::log_corruption(format!("{record_type:?} record: {e}")))?;
        if !r.is_empty() {
            return Err(CoreError::log_corruption(format!(
                "trailing bytes in {record_type:?} record: {} of {}",
                r.remaining(),
                payload.len()
            )));
        }
        Ok(record)
    }

    fn read(record_type: RedoRecordType, r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let txid = TransactionId::new(r.u64()?);
        Ok(match record_type {
            RedoRecordType::Put => Self::Put {
                txid,
                map: r.str()?.to_string(),
                key: r.value()?,
                value: r.bytes()?.to_vec(),
            },
            RedoRecordType::Remove => Self::Remove {
                txid,
                map: r.str()?.to_string(),
                key: r.value()?,
            },
            RedoRecordType::DropMap => Self::DropMap {
                txid,
                map: r.str()?.to_string(),
            },
            RedoRecordType::Commit => Self::Commit {
                txid,
                commit_id: TransactionId::new(r.u64()?),
            },
        })
    }

    /// Appends the enveloped record to `out`:
    /// `magic | version | type | length | payload | crc32`.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the payload exceeds 4 GiB.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> CoreResult<()> {
        let mut payload = Writer::new();
        self.encode_payload(&mut payload);
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_operation("redo record payload too large"))?;

        let start = out.len();
        out.extend_from_slice(&REDO_MAGIC);
        out.extend_from_slice(&REDO_VERSION.to_le_bytes());
        out.push(self.record_type().as_byte());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(payload.as_bytes());
        let crc = crc32fast::hash(&out[start..]);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> RedoRecord {
        let kind = RedoRecordType::from_byte(bytes[6]).unwrap();
        let len = u32::from_le_bytes(bytes[7..11].try_into().unwrap()) as usize;
        RedoRecord::decode_payload(kind, &bytes[HEADER_SIZE..HEADER_SIZE + len]).unwrap()
    }

    #[test]
    fn record_type_from_byte() {
        for t in [
            RedoRecordType::Put,
            RedoRecordType::Remove,
            RedoRecordType::DropMap,
            RedoRecordType::Commit,
        ] {
            assert_eq!(RedoRecordType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(RedoRecordType::from_byte(0), None);
        assert_eq!(RedoRecordType::from_byte(9), None);
    }

    #[test]
    fn put_record_envelope() {
        let record = RedoRecord::Put {
            txid: TransactionId::new(3),
            map: "accounts".into(),
            key: Value::Int(10),
            value: vec![0xCA, 0xFE],
        };
        let mut bytes = Vec::new();
        record.encode_into(&mut bytes).unwrap();
        assert_eq!(&bytes[..4], &REDO_MAGIC);
        assert_eq!(bytes[6], RedoRecordType::Put.as_byte());
        let crc_at = bytes.len() - CRC_SIZE;
        let stored = u32::from_le_bytes(bytes[crc_at..].try_into().unwrap());
        assert_eq!(stored, crc32fast::hash(&bytes[..crc_at]));
        assert_eq!(decode(&bytes), record);
    }

    #[test]
    fn commit_record_is_fixed_size() {
        let record = RedoRecord::Commit {
            txid: TransactionId::new(7),
            commit_id: TransactionId::new(9),
        };
        let mut bytes = Vec::new();
        record.encode_into(&mut bytes).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 16 + CRC_SIZE);
        assert_eq!(decode(&bytes).txid(), TransactionId::new(7));
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let mut w = Writer::new();
        RedoRecord::DropMap {
            txid: TransactionId::new(1),
            map: "m".into(),
        }
        .encode_payload(&mut w);
        let mut payload = w.into_bytes();
        payload.push(0);
        let err = RedoRecord::decode_payload(RedoRecordType::DropMap, &payload).unwrap_err();
        assert!(matches!(err, CoreError::LogCorruption { .. }));
    }

    #[test]
    fn short_payload_is_corruption() {
        let err = RedoRecord::decode_payload(RedoRecordType::Commit, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, CoreError::LogCorruption { .. }));
    }
}
