//! Page frames and page payload layouts.
//!
//! Every page is stored as a frame:
//!
//! ```text
//! len u32 | kind u8 | compression u8 | crc32 u32 | payload
//! ```
//!
//! `len` counts the whole frame. The checksum covers the frame with the
//! checksum field left out, so any flipped bit in header or payload is
//! detected before the payload is decoded.

use crate::btree::page::{ChildRef, ColumnLeaf, ColumnPage, Page};
use crate::config::Compression;
use crate::context::EngineContext;
use crate::error::{CoreError, CoreResult};
use crate::manifest::{put_pos, read_pos};
use crate::record::MapValue;
use crate::types::PagePos;
use mvdb_codec::{Reader, Value, Writer};
use std::sync::Arc;

/// Row leaf: keys and whole values.
pub(crate) const PAGE_ROW_LEAF: u8 = 1;
/// Internal node.
pub(crate) const PAGE_NODE: u8 = 2;
/// Column leaf: keys, row heads and column page positions.
pub(crate) const PAGE_COLUMN_LEAF: u8 = 3;
/// One column of a column leaf.
pub(crate) const PAGE_COLUMN: u8 = 4;

const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_LZ4: u8 = 1;

/// Frame header size.
pub(crate) const FRAME_HEADER_LEN: usize = 10;

const MAX_ENTRIES: u64 = 1 << 24;

/// Wraps a payload into a checksummed frame.
pub(crate) fn encode_frame(kind: u8, payload: &[u8], compression: Compression) -> CoreResult<Vec<u8>> {
    let compressed = match compression {
        Compression::Lz4 => {
            let packed = lz4_flex::compress_prepend_size(payload);
            (packed.len() < payload.len()).then_some(packed)
        }
        Compression::None => None,
    };
    let (tag, body) = match &compressed {
        Some(packed) => (COMPRESSION_LZ4, packed.as_slice()),
        None => (COMPRESSION_NONE, payload),
    };

    let len = u32::try_from(FRAME_HEADER_LEN + body.len())
        .map_err(|_| CoreError::invalid_operation("page larger than 4 GiB"))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.push(kind);
    frame.push(tag);
    frame.extend_from_slice(&[0; 4]);
    frame.extend_from_slice(body);

    let crc = frame_crc(&frame);
    frame[6..10].copy_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

fn frame_crc(frame: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&frame[..6]);
    hasher.update(&frame[FRAME_HEADER_LEN..]);
    hasher.finalize()
}

/// Validates a frame read from `pos` and returns its kind and payload.
pub(crate) fn decode_frame(frame: &[u8], pos: PagePos) -> CoreResult<(u8, Vec<u8>)> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(CoreError::page_corruption(format!("page {pos} truncated")));
    }
    let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    if len as usize != frame.len() || len != pos.len {
        return Err(CoreError::page_corruption(format!(
            "page {pos} length {len} does not match its position"
        )));
    }
    let stored = u32::from_le_bytes([frame[6], frame[7], frame[8], frame[9]]);
    let actual = frame_crc(frame);
    if stored != actual {
        return Err(CoreError::page_corruption(format!(
            "page {pos} checksum mismatch: expected {stored:#x}, got {actual:#x}"
        )));
    }

    let kind = frame[4];
    let body = &frame[FRAME_HEADER_LEN..];
    let payload = match frame[5] {
        COMPRESSION_NONE => body.to_vec(),
        COMPRESSION_LZ4 => lz4_flex::decompress_size_prepended(body).map_err(|e| {
            CoreError::page_corruption(format!("page {pos} failed to decompress: {e}"))
        })?,
        other => {
            return Err(CoreError::page_corruption(format!(
                "page {pos} has unknown compression {other}"
            )))
        }
    };
    Ok((kind, payload))
}

pub(crate) fn row_leaf_payload<V: MapValue>(entries: &[(&Value, &V)]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_varint(entries.len() as u64);
    for (key, _) in entries {
        w.put_value(key);
    }
    for (_, value) in entries {
        value.write(&mut w);
    }
    w.into_bytes()
}

pub(crate) fn node_payload(keys: &[Value], children: &[(PagePos, u64)]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_varint(keys.len() as u64);
    for key in keys {
        w.put_value(key);
    }
    for (pos, count) in children {
        put_pos(&mut w, *pos);
        w.put_varint(*count);
    }
    w.into_bytes()
}

pub(crate) fn column_leaf_payload(keys: &[&Value], heads: &[Vec<u8>], columns: &[PagePos]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_varint(keys.len() as u64);
    for key in keys {
        w.put_value(key);
    }
    for head in heads {
        w.put_bytes(head);
    }
    w.put_varint(columns.len() as u64);
    for pos in columns {
        put_pos(&mut w, *pos);
    }
    w.into_bytes()
}

pub(crate) fn column_payload<'a>(values: impl ExactSizeIterator<Item = &'a Value>) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_varint(values.len() as u64);
    for value in values {
        w.put_value(value);
    }
    w.into_bytes()
}

fn read_keys(r: &mut Reader<'_>) -> CoreResult<Vec<Value>> {
    let count = r.length(MAX_ENTRIES)?;
    let mut keys = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        keys.push(r.value()?);
    }
    Ok(keys)
}

fn check_sorted(keys: &[Value], pos: PagePos) -> CoreResult<()> {
    if keys.windows(2).all(|w| w[0] < w[1]) {
        Ok(())
    } else {
        Err(CoreError::page_corruption(format!(
            "page {pos} keys are not strictly ascending"
        )))
    }
}

fn read_children(r: &mut Reader<'_>, count: usize) -> CoreResult<Vec<(PagePos, u64)>> {
    let mut children = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        let pos = read_pos(r)?;
        children.push((pos, r.varint()?));
    }
    Ok(children)
}

fn read_column_positions(r: &mut Reader<'_>) -> CoreResult<Vec<PagePos>> {
    let count = r.length(MAX_ENTRIES)?;
    (0..count).map(|_| read_pos(r)).collect()
}

fn finish(r: &Reader<'_>, pos: PagePos) -> CoreResult<()> {
    if r.is_empty() {
        Ok(())
    } else {
        Err(CoreError::page_corruption(format!(
            "page {pos} has {} trailing bytes",
            r.remaining()
        )))
    }
}

/// Decodes a typed page. Children and column pages stay on disk until
/// first accessed.
pub(crate) fn decode_page<V: MapValue>(
    kind: u8,
    payload: &[u8],
    pos: PagePos,
    context: &Arc<EngineContext>,
) -> CoreResult<Page<V>> {
    decode_page_inner(kind, payload, pos, context).map_err(|e| match e {
        CoreError::Codec(codec) => {
            CoreError::page_corruption(format!("page {pos} is malformed: {codec}"))
        }
        other => other,
    })
}

fn decode_page_inner<V: MapValue>(
    kind: u8,
    payload: &[u8],
    pos: PagePos,
    context: &Arc<EngineContext>,
) -> CoreResult<Page<V>> {
    let mut r = Reader::new(payload);
    let (page, count, columns) = match kind {
        PAGE_ROW_LEAF => {
            let keys = read_keys(&mut r)?;
            check_sorted(&keys, pos)?;
            let mut values = Vec::with_capacity(keys.len());
            for _ in 0..keys.len() {
                values.push(V::read(&mut r)?);
            }
            let count = keys.len() as u64;
            (Page::leaf(keys, values), count, Vec::new())
        }
        PAGE_NODE => {
            let keys = read_keys(&mut r)?;
            check_sorted(&keys, pos)?;
            let children = read_children(&mut r, keys.len() + 1)?;
            let counts: Vec<u64> = children.iter().map(|(_, c)| *c).collect();
            let refs = children
                .iter()
                .map(|(p, _)| ChildRef::persisted(*p))
                .collect();
            let page = Page::node(keys, refs, counts);
            let count = page.total();
            (page, count, Vec::new())
        }
        PAGE_COLUMN_LEAF => {
            let keys = read_keys(&mut r)?;
            check_sorted(&keys, pos)?;
            let mut heads = Vec::with_capacity(keys.len());
            for _ in 0..keys.len() {
                heads.push(r.bytes()?.to_vec());
            }
            let positions = read_column_positions(&mut r)?;
            let columns = positions
                .iter()
                .map(|p| ColumnPage::new(*p, Arc::clone(context)))
                .collect();
            let count = keys.len() as u64;
            (
                Page::column_leaf(keys, ColumnLeaf { heads, columns }),
                count,
                positions,
            )
        }
        other => {
            return Err(CoreError::page_corruption(format!(
                "page {pos} has unexpected kind {other}"
            )))
        }
    };
    finish(&r, pos)?;
    page.publish(crate::btree::page::Saved {
        pos,
        count,
        columns,
    });
    Ok(page)
}

/// Decodes a column page.
pub(crate) fn decode_column(kind: u8, payload: &[u8], pos: PagePos) -> CoreResult<Vec<Value>> {
    if kind != PAGE_COLUMN {
        return Err(CoreError::page_corruption(format!(
            "page {pos} has kind {kind}, expected a column page"
        )));
    }
    let mut r = Reader::new(payload);
    let values = read_keys(&mut r).map_err(|e| {
        CoreError::page_corruption(format!("column page {pos} is malformed: {e}"))
    })?;
    finish(&r, pos)?;
    Ok(values)
}

/// A page decoded without knowing the value type of its map.
#[derive(Debug)]
pub(crate) enum RawPage {
    Leaf {
        keys: Vec<Value>,
    },
    Node {
        keys: Vec<Value>,
        children: Vec<(PagePos, u64)>,
    },
    ColumnLeaf {
        keys: Vec<Value>,
        columns: Vec<PagePos>,
    },
    Column {
        count: usize,
    },
}

/// Decodes the structure of any page; row values are skipped unread.
pub(crate) fn decode_raw(kind: u8, payload: &[u8], pos: PagePos) -> CoreResult<RawPage> {
    let mut r = Reader::new(payload);
    let raw = match kind {
        PAGE_ROW_LEAF => {
            let keys = read_keys(&mut r)?;
            check_sorted(&keys, pos)?;
            return Ok(RawPage::Leaf { keys });
        }
        PAGE_NODE => {
            let keys = read_keys(&mut r)?;
            check_sorted(&keys, pos)?;
            let children = read_children(&mut r, keys.len() + 1)?;
            RawPage::Node { keys, children }
        }
        PAGE_COLUMN_LEAF => {
            let keys = read_keys(&mut r)?;
            check_sorted(&keys, pos)?;
            for _ in 0..keys.len() {
                r.bytes()?;
            }
            let columns = read_column_positions(&mut r)?;
            RawPage::ColumnLeaf { keys, columns }
        }
        PAGE_COLUMN => {
            let values = read_keys(&mut r)?;
            RawPage::Column {
                count: values.len(),
            }
        }
        other => {
            return Err(CoreError::page_corruption(format!(
                "page {pos} has unknown kind {other}"
            )))
        }
    };
    finish(&r, pos)?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkId;

    fn pos_for(frame: &[u8]) -> PagePos {
        PagePos::new(ChunkId::new(1), 16, frame.len() as u32)
    }

    #[test]
    fn frame_round_trip_uncompressed() {
        let frame = encode_frame(PAGE_COLUMN, b"payload", Compression::None).unwrap();
        let (kind, payload) = decode_frame(&frame, pos_for(&frame)).unwrap();
        assert_eq!(kind, PAGE_COLUMN);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn compressible_payload_is_compressed() {
        let payload = vec![7u8; 4096];
        let frame = encode_frame(PAGE_ROW_LEAF, &payload, Compression::Lz4).unwrap();
        assert!(frame.len() < payload.len());
        assert_eq!(frame[5], COMPRESSION_LZ4);
        let (_, back) = decode_frame(&frame, pos_for(&frame)).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn incompressible_payload_stays_raw() {
        let frame = encode_frame(PAGE_ROW_LEAF, b"ab", Compression::Lz4).unwrap();
        assert_eq!(frame[5], COMPRESSION_NONE);
    }

    #[test]
    fn every_flipped_bit_is_detected() {
        let frame = encode_frame(PAGE_NODE, b"some node payload", Compression::None).unwrap();
        let pos = pos_for(&frame);
        for i in 4..frame.len() {
            let mut bad = frame.clone();
            bad[i] ^= 0x01;
            let err = decode_frame(&bad, pos).unwrap_err();
            assert!(err.is_corruption(), "byte {i} not detected");
        }
    }

    #[test]
    fn length_mismatch_is_corruption() {
        let frame = encode_frame(PAGE_NODE, b"x", Compression::None).unwrap();
        let wrong = PagePos::new(ChunkId::new(1), 16, frame.len() as u32 + 1);
        assert!(decode_frame(&frame, wrong).is_err());
    }

    #[test]
    fn row_leaf_payload_decodes_typed_and_raw() {
        let k1 = Value::Int(1);
        let k2 = Value::Int(2);
        let v1 = Value::from("a");
        let v2 = Value::from("b");
        let payload = row_leaf_payload(&[(&k1, &v1), (&k2, &v2)]);
        let pos = PagePos::new(ChunkId::new(1), 16, 0);
        let context = Arc::new(EngineContext::new());

        let page: Page<Value> = decode_page(PAGE_ROW_LEAF, &payload, pos, &context).unwrap();
        assert_eq!(page.keys(), &[k1, k2]);
        assert_eq!(page.saved().map(|s| s.count), Some(2));

        match decode_raw(PAGE_ROW_LEAF, &payload, pos).unwrap() {
            RawPage::Leaf { keys } => assert_eq!(keys.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unsorted_keys_are_corruption() {
        let k1 = Value::Int(5);
        let k2 = Value::Int(1);
        let v = Value::Null;
        let payload = row_leaf_payload(&[(&k1, &v), (&k2, &v)]);
        let pos = PagePos::new(ChunkId::new(1), 16, 0);
        let context = Arc::new(EngineContext::new());
        let err = decode_page::<Value>(PAGE_ROW_LEAF, &payload, pos, &context).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn node_payload_lists_children() {
        let chunk = ChunkId::new(2);
        let payload = node_payload(
            &[Value::Int(10)],
            &[(PagePos::new(chunk, 16, 30), 4), (PagePos::new(chunk, 46, 30), 6)],
        );
        let pos = PagePos::new(chunk, 76, 0);
        match decode_raw(PAGE_NODE, &payload, pos).unwrap() {
            RawPage::Node { children, .. } => {
                assert_eq!(children.len(), 2);
                assert_eq!(children[1].1, 6);
            }
            other => panic!("unexpected {other:?}"),
        }
        let context = Arc::new(EngineContext::new());
        let page: Page<Value> = decode_page(PAGE_NODE, &payload, pos, &context).unwrap();
        assert_eq!(page.total(), 10);
    }
}
