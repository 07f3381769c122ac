pub mod file;

pub use file::IndexFile;

use crate::envelope::Envelope;
use crate::error::Result;

pub const DEFAULT_DEPTH: u32 = 8;
pub const DEFAULT_RATIO: f64 = 0.55;

/// One indexed record: where it lives in the source file and the envelope
/// it covers. Envelopes are stored as `f32` to keep the disk footprint
/// small; queries widen to `f64` before the geometric tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexRecord {
    pub offset: u64,
    pub size: u64,
    pub envelope: Envelope<f32>,
}

#[derive(Debug)]
struct Node {
    envelope: Envelope<f32>,
    items: Vec<IndexRecord>,
    children: [Option<Box<Node>>; 4],
}

impl Node {
    fn new(envelope: Envelope<f32>) -> Self {
        Node {
            envelope,
            items: Vec::new(),
            children: [None, None, None, None],
        }
    }

    fn live_children(&self) -> usize {
        self.children.iter().filter(|c| c.is_some()).count()
    }
}

/// Bulk-loaded quadtree of index records. Each of a node's four children
/// covers `ratio` of the parent per axis, anchored at the parent's corners,
/// so with `ratio > 0.5` the children overlap and records straddling the
/// center still descend instead of piling up near the root. A record lives
/// in the deepest node whose envelope contains it; queries therefore never
/// emit duplicates.
#[derive(Debug)]
pub struct QuadTree {
    root: Node,
    max_depth: u32,
    ratio: f64,
}

impl QuadTree {
    pub fn new(extent: Envelope<f32>) -> Self {
        QuadTree::with_params(extent, DEFAULT_DEPTH, DEFAULT_RATIO)
    }

    pub fn with_params(extent: Envelope<f32>, max_depth: u32, ratio: f64) -> Self {
        QuadTree {
            root: Node::new(extent),
            max_depth,
            ratio,
        }
    }

    pub fn extent(&self) -> Envelope<f32> {
        self.root.envelope
    }

    /// Inserts a record. Records with an invalid envelope are logged and
    /// skipped; they can never satisfy an intersection query.
    pub fn insert(&mut self, record: IndexRecord) {
        if !record.envelope.valid() {
            log::warn!(
                "skipping record at offset {} with invalid envelope",
                record.offset
            );
            return;
        }
        let max_depth = self.max_depth;
        let ratio = self.ratio;
        insert_into(&mut self.root, record, 0, max_depth, ratio);
    }

    /// Every record whose envelope intersects `bbox`, in tree order.
    pub fn query(&self, bbox: &Envelope<f64>) -> Vec<IndexRecord> {
        let mut found = Vec::new();
        query_node(&self.root, bbox, &mut found);
        found
    }

    /// Number of nodes, including empty interior ones.
    pub fn count(&self) -> usize {
        count_nodes(&self.root)
    }

    pub fn count_items(&self) -> usize {
        count_items(&self.root)
    }

    /// Drops subtrees that hold no items, run after bulk load and before
    /// serialization.
    pub fn trim(&mut self) {
        trim_node(&mut self.root);
    }
}

fn child_envelopes(envelope: &Envelope<f32>, ratio: f64) -> [Envelope<f32>; 4] {
    let w = envelope.width() * ratio as f32;
    let h = envelope.height() * ratio as f32;
    let (lox, loy, hix, hiy) = (
        envelope.min_x,
        envelope.min_y,
        envelope.max_x,
        envelope.max_y,
    );
    [
        Envelope::new(lox, loy, lox + w, loy + h),
        Envelope::new(lox, hiy - h, lox + w, hiy),
        Envelope::new(hix - w, loy, hix, loy + h),
        Envelope::new(hix - w, hiy - h, hix, hiy),
    ]
}

fn insert_into(node: &mut Node, record: IndexRecord, depth: u32, max_depth: u32, ratio: f64) {
    if depth < max_depth {
        let quadrants = child_envelopes(&node.envelope, ratio);
        for (i, quadrant) in quadrants.iter().enumerate() {
            if quadrant.contains(&record.envelope) {
                let child = node.children[i].get_or_insert_with(|| Box::new(Node::new(*quadrant)));
                return insert_into(child, record, depth + 1, max_depth, ratio);
            }
        }
    }
    node.items.push(record);
}

fn query_node(node: &Node, bbox: &Envelope<f64>, found: &mut Vec<IndexRecord>) {
    if !node.envelope.to_f64().intersects(bbox) {
        return;
    }
    for item in &node.items {
        if item.envelope.to_f64().intersects(bbox) {
            found.push(*item);
        }
    }
    for child in node.children.iter().flatten() {
        query_node(child, bbox, found);
    }
}

fn count_nodes(node: &Node) -> usize {
    1 + node
        .children
        .iter()
        .flatten()
        .map(|c| count_nodes(c))
        .sum::<usize>()
}

fn count_items(node: &Node) -> usize {
    node.items.len()
        + node
            .children
            .iter()
            .flatten()
            .map(|c| count_items(c))
            .sum::<usize>()
}

/// Post-order prune; returns whether the subtree still holds anything.
fn trim_node(node: &mut Node) -> bool {
    for slot in node.children.iter_mut() {
        if let Some(child) = slot {
            if !trim_node(child) {
                *slot = None;
            }
        }
    }
    !node.items.is_empty() || node.live_children() > 0
}

/// Which on-disk or in-memory index backs a datasource's queries.
pub enum SpatialIndex {
    Memory(QuadTree),
    Disk(IndexFile),
}

impl SpatialIndex {
    /// Candidate records intersecting `bbox`, sorted by ascending offset so
    /// featuresets emit in source order.
    pub fn query(&self, bbox: &Envelope<f64>) -> Result<Vec<IndexRecord>> {
        let mut records = match self {
            SpatialIndex::Memory(tree) => tree.query(bbox),
            SpatialIndex::Disk(file) => file.query(bbox)?,
        };
        records.sort_by_key(|r| r.offset);
        Ok(records)
    }

    pub fn bounds(&self) -> Result<Envelope<f32>> {
        match self {
            SpatialIndex::Memory(tree) => Ok(tree.extent()),
            SpatialIndex::Disk(file) => file.bounds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(offset: u64, env: Envelope<f32>) -> IndexRecord {
        IndexRecord {
            offset,
            size: 1,
            envelope: env,
        }
    }

    fn sample_tree() -> QuadTree {
        let mut tree = QuadTree::new(Envelope::new(0.0, 0.0, 16.0, 16.0));
        tree.insert(record(0, Envelope::new(0.0, 0.0, 1.0, 1.0)));
        tree.insert(record(1, Envelope::new(2.0, 2.0, 3.0, 3.0)));
        tree.insert(record(2, Envelope::new(10.0, 10.0, 11.0, 11.0)));
        tree
    }

    #[test]
    fn query_returns_intersecting_records() {
        let tree = sample_tree();
        let mut hits = tree.query(&Envelope::new(0.5, 0.5, 2.5, 2.5));
        hits.sort_by_key(|r| r.offset);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].offset, 0);
        assert_eq!(hits[1].offset, 1);
    }

    #[test]
    fn query_outside_returns_nothing() {
        let tree = sample_tree();
        assert!(tree.query(&Envelope::new(4.0, 4.0, 9.0, 9.0)).is_empty());
    }

    #[test]
    fn invalid_envelope_is_skipped() {
        let mut tree = QuadTree::new(Envelope::new(0.0, 0.0, 1.0, 1.0));
        tree.insert(record(0, Envelope::invalid()));
        assert_eq!(tree.count_items(), 0);
    }

    #[test]
    fn items_descend_below_root() {
        let mut tree = QuadTree::new(Envelope::new(0.0, 0.0, 16.0, 16.0));
        tree.insert(record(0, Envelope::new(0.25, 0.25, 0.5, 0.5)));
        assert!(tree.count() > 1);
        assert_eq!(tree.count_items(), 1);
    }

    #[test]
    fn straddling_item_descends_into_overlap() {
        // Sits across the midline; the 0.55 overlap band still owns it.
        let mut tree = QuadTree::new(Envelope::new(0.0, 0.0, 16.0, 16.0));
        tree.insert(record(0, Envelope::new(7.5, 7.5, 8.5, 8.5)));
        assert!(tree.count() > 1);
        let hits = tree.query(&Envelope::new(7.0, 7.0, 9.0, 9.0));
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn trim_prunes_empty_branches() {
        let mut tree = sample_tree();
        let before = tree.count();
        tree.trim();
        assert!(tree.count() <= before);
        assert_eq!(tree.count_items(), 3);
        let hits = tree.query(&Envelope::new(0.0, 0.0, 16.0, 16.0));
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn equal_envelopes_share_a_node() {
        let mut tree = QuadTree::new(Envelope::new(0.0, 0.0, 16.0, 16.0));
        tree.insert(record(0, Envelope::new(1.0, 1.0, 2.0, 2.0)));
        tree.insert(record(1, Envelope::new(1.0, 1.0, 2.0, 2.0)));
        let hits = tree.query(&Envelope::new(0.0, 0.0, 3.0, 3.0));
        assert_eq!(hits.len(), 2);
    }
}
