use std::io::{self, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use super::{IndexRecord, Node, QuadTree};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::source::ByteSource;

const MAGIC: [u8; 4] = *b"TSIX";
const VERSION: u32 = 1;

// Per-node layout: sibling-skip u32, envelope 4xf32, item count u32,
// then the items (offset u64, size u64, envelope 4xf32), child count u32,
// and the child nodes depth-first. Everything little-endian.
const NODE_HEADER: usize = 4 + 16 + 4;
const ITEM_SIZE: usize = 8 + 8 + 16;

// Structural backstop while walking untrusted files.
const MAX_NODE_DEPTH: usize = 64;

impl QuadTree {
    /// Serializes the tree in the sidecar index format.
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        write_node(&self.root, &mut buf);
        buf
    }
}

fn write_envelope(envelope: &Envelope<f32>, buf: &mut Vec<u8>) {
    for v in [
        envelope.min_x,
        envelope.min_y,
        envelope.max_x,
        envelope.max_y,
    ] {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

fn write_node(node: &Node, buf: &mut Vec<u8>) {
    let skip_at = buf.len();
    buf.extend_from_slice(&0u32.to_le_bytes());
    write_envelope(&node.envelope, buf);
    buf.extend_from_slice(&(node.items.len() as u32).to_le_bytes());
    for item in &node.items {
        buf.extend_from_slice(&item.offset.to_le_bytes());
        buf.extend_from_slice(&item.size.to_le_bytes());
        write_envelope(&item.envelope, buf);
    }
    buf.extend_from_slice(&(node.live_children() as u32).to_le_bytes());
    for child in node.children.iter().flatten() {
        write_node(child, buf);
    }
    // The sibling skip counts from just past its own field to the end of
    // this subtree, letting readers hop disjoint branches without parsing.
    let skip = (buf.len() - (skip_at + 4)) as u32;
    buf[skip_at..skip_at + 4].copy_from_slice(&skip.to_le_bytes());
}

/// A serialized quadtree queried in place. Only the nodes whose envelopes
/// intersect the query are ever read, so multi-gigabyte indexes are walked
/// with a bounded working set.
pub struct IndexFile {
    source: ByteSource,
}

impl IndexFile {
    pub fn open(path: &Path) -> Result<Self> {
        let source = ByteSource::open(path).map_err(|err| match err {
            Error::NoSuchFile(p) => Error::NoSuchFile(p),
            other => Error::CorruptIndex(other.to_string()),
        })?;
        IndexFile::from_source(source)
    }

    pub fn from_source(source: ByteSource) -> Result<Self> {
        if source.len() < (8 + NODE_HEADER + 4) as u64 {
            return Err(Error::CorruptIndex("file too short".into()));
        }
        let head = source
            .read(0, 8)
            .map_err(|err| Error::CorruptIndex(err.to_string()))?;
        if head[0..4] != MAGIC {
            return Err(Error::CorruptIndex("bad magic".into()));
        }
        let version = LittleEndian::read_u32(&head[4..8]);
        if version != VERSION {
            return Err(Error::CorruptIndex(format!(
                "unsupported version {version}"
            )));
        }
        // The root's sibling skip spans the whole tree, so a partial tail
        // (or trailing garbage) is detectable before any query runs.
        let root = source
            .read(8, 4)
            .map_err(|err| Error::CorruptIndex(err.to_string()))?;
        let expected = 8 + 4 + LittleEndian::read_u32(&root[0..4]) as u64;
        if expected != source.len() {
            return Err(Error::CorruptIndex(format!(
                "expected {expected} bytes, file has {}",
                source.len()
            )));
        }
        Ok(IndexFile { source })
    }

    /// The root node's envelope, i.e. the extent the index was built over.
    pub fn bounds(&self) -> Result<Envelope<f32>> {
        let bytes = self
            .source
            .read(8 + 4, 16)
            .map_err(|err| Error::CorruptIndex(err.to_string()))?;
        Ok(read_envelope(&bytes))
    }

    pub fn query(&self, bbox: &Envelope<f64>) -> Result<Vec<IndexRecord>> {
        let mut found = Vec::new();
        let end = self.query_node(8, bbox, &mut found, 0)?;
        if end > self.source.len() {
            return Err(Error::CorruptIndex("truncated tail".into()));
        }
        Ok(found)
    }

    fn query_node(
        &self,
        pos: u64,
        bbox: &Envelope<f64>,
        found: &mut Vec<IndexRecord>,
        depth: usize,
    ) -> Result<u64> {
        if depth > MAX_NODE_DEPTH {
            return Err(Error::CorruptIndex("node nesting too deep".into()));
        }
        let header = self
            .source
            .read(pos, NODE_HEADER)
            .map_err(|err| Error::CorruptIndex(err.to_string()))?;
        let skip = LittleEndian::read_u32(&header[0..4]) as u64;
        let subtree_end = pos + 4 + skip;
        if subtree_end > self.source.len() {
            return Err(Error::CorruptIndex("truncated subtree".into()));
        }
        let envelope = read_envelope(&header[4..20]);
        if !envelope.to_f64().intersects(bbox) {
            return Ok(subtree_end);
        }
        let item_count = LittleEndian::read_u32(&header[20..24]) as usize;
        let items_len = item_count * ITEM_SIZE;
        let items = self
            .source
            .read(pos + NODE_HEADER as u64, items_len)
            .map_err(|err| Error::CorruptIndex(err.to_string()))?;
        for chunk in items.chunks_exact(ITEM_SIZE) {
            let record = IndexRecord {
                offset: LittleEndian::read_u64(&chunk[0..8]),
                size: LittleEndian::read_u64(&chunk[8..16]),
                envelope: read_envelope(&chunk[16..32]),
            };
            if record.envelope.to_f64().intersects(bbox) {
                found.push(record);
            }
        }
        let children_at = pos + (NODE_HEADER + items_len) as u64;
        let count_bytes = self
            .source
            .read(children_at, 4)
            .map_err(|err| Error::CorruptIndex(err.to_string()))?;
        let child_count = LittleEndian::read_u32(&count_bytes) as u64;
        let mut child_pos = children_at + 4;
        for _ in 0..child_count {
            if child_pos >= subtree_end {
                return Err(Error::CorruptIndex("child overruns subtree".into()));
            }
            child_pos = self.query_node(child_pos, bbox, found, depth + 1)?;
        }
        if child_pos != subtree_end {
            return Err(Error::CorruptIndex("subtree length mismatch".into()));
        }
        Ok(subtree_end)
    }
}

/// Path of the sidecar index belonging to `path` (`<file>.index`).
pub fn sidecar_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".index");
    std::path::PathBuf::from(name)
}

/// Opens the sidecar index next to a source file, if any. An unreadable
/// index is fatal under strict; otherwise it is logged and the caller falls
/// back to its own scan.
pub fn open_sidecar(path: &Path, strict: bool) -> Result<Option<IndexFile>> {
    let index_path = sidecar_path(path);
    if !index_path.exists() {
        return Ok(None);
    }
    match IndexFile::open(&index_path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if strict => Err(err),
        Err(err) => {
            log::warn!(
                "ignoring unreadable sidecar index {}: {err}",
                index_path.display()
            );
            Ok(None)
        }
    }
}

fn read_envelope(bytes: &[u8]) -> Envelope<f32> {
    Envelope {
        min_x: LittleEndian::read_f32(&bytes[0..4]),
        min_y: LittleEndian::read_f32(&bytes[4..8]),
        max_x: LittleEndian::read_f32(&bytes[8..12]),
        max_y: LittleEndian::read_f32(&bytes[12..16]),
    }
}
