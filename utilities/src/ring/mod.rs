//! Consistent-hash ring: the hash function placing nodes and files, and the
//! ordered membership table used to answer "who owns this hash".
mod node_info;

use std::collections::BTreeMap;

pub use node_info::{FileInfo, NodeInfo};

/// Size of the hash space, positions are in `[0, RING_CAPACITY)`.
pub const RING_CAPACITY: u32 = 32768;

/// Maps an identifier onto the ring. Polynomial (base 31) hash of the bytes
/// in wrapping `i32` arithmetic, sign dropped, reduced modulo the capacity.
/// Distinct identifiers may collide; that is accepted.
pub fn ring_hash(identifier: &str) -> u32 {
    let digest = identifier
        .bytes()
        .fold(0_i32, |h, b| h.wrapping_mul(31).wrapping_add(b as i32));
    digest.unsigned_abs() % RING_CAPACITY
}

/// Whether `hash` lies on the arc walking clockwise from `start` (exclusive)
/// to `end`. When `end` is below `start` the arc crosses the top of the hash
/// space.
pub fn arc_contains(start: u32, end: u32, hash: u32, end_inclusive: bool) -> bool {
    let below_end = if end_inclusive { hash <= end } else { hash < end };
    if start < end {
        hash > start && below_end
    } else if start > end {
        hash > start || below_end
    } else {
        false
    }
}

/// Ring membership ordered by position. One node per position: a node
/// hashing onto an occupied position replaces the occupant.
#[derive(Clone, Debug, Default)]
pub struct Ring {
    nodes: BTreeMap<u32, NodeInfo>,
}

impl Ring {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
    /// Adds `node`, moving it if its address was already present elsewhere.
    /// Returns the node previously occupying the same position, if any.
    pub fn insert(&mut self, node: NodeInfo) -> Option<NodeInfo> {
        self.remove(node.address());
        self.nodes.insert(node.hash(), node)
    }
    pub fn remove(&mut self, address: &str) -> Option<NodeInfo> {
        let position = self
            .nodes
            .iter()
            .find(|(_, n)| n.address() == address)
            .map(|(hash, _)| *hash)?;
        self.nodes.remove(&position)
    }
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }
    /// First node whose position is >= `hash`, wrapping to the lowest
    /// position past the top of the space.
    pub fn owner_of(&self, hash: u32) -> Option<&NodeInfo> {
        self.nodes
            .range(hash..)
            .next()
            .or_else(|| self.nodes.iter().next())
            .map(|(_, n)| n)
    }
    /// Next node clockwise from `node`, `None` when `node` is alone.
    pub fn successor(&self, node: &NodeInfo) -> Option<&NodeInfo> {
        self.nodes
            .range(node.hash().saturating_add(1)..)
            .chain(self.nodes.range(..=node.hash()))
            .map(|(_, n)| n)
            .find(|n| *n != node)
    }
    /// Next node counter-clockwise from `node`, `None` when `node` is alone.
    pub fn predecessor(&self, node: &NodeInfo) -> Option<&NodeInfo> {
        self.nodes
            .range(..node.hash())
            .rev()
            .chain(self.nodes.range(node.hash()..).rev())
            .map(|(_, n)| n)
            .find(|n| *n != node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(hashes: &[u32]) -> Ring {
        let mut ring = Ring::new();
        for h in hashes {
            ring.insert(NodeInfo::with_hash(format!("10.0.0.{h}:7100"), *h));
        }
        ring
    }

    #[test]
    fn hash_is_stable_and_in_range() {
        for id in ["", "node-a", "some/long/file name.txt", "ünïcode"] {
            let first = ring_hash(id);
            assert_eq!(first, ring_hash(id));
            assert!(first < RING_CAPACITY);
        }
    }

    #[test]
    fn hash_matches_known_positions() {
        assert_eq!(ring_hash(""), 0);
        assert_eq!(ring_hash("A"), 65);
        assert_eq!(ring_hash("node-a"), 17578);
        assert_eq!(ring_hash("node-b"), 17577);
        assert_eq!(ring_hash("file-2005.txt"), 10);
    }

    #[test]
    fn colliding_names_share_one_ring_position() {
        // "Aa" and "BB" hash identically; the later node takes the position
        assert_eq!(ring_hash("Aa"), ring_hash("BB"));
        let mut ring = Ring::new();
        ring.insert(NodeInfo::new("Aa", "10.0.0.1:7100"));
        let replaced = ring.insert(NodeInfo::new("BB", "10.0.0.2:7100"));
        assert_eq!(replaced.map(|n| n.address().to_owned()).as_deref(), Some("10.0.0.1:7100"));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn owner_is_first_node_at_or_after_hash() {
        let ring = ring_of(&[10, 50, 90]);
        assert_eq!(ring.owner_of(60).unwrap().hash(), 90);
        assert_eq!(ring.owner_of(50).unwrap().hash(), 50);
        assert_eq!(ring.owner_of(0).unwrap().hash(), 10);
        // wraps past the top of the ring
        assert_eq!(ring.owner_of(95).unwrap().hash(), 10);
        assert!(Ring::new().owner_of(5).is_none());
    }

    #[test]
    fn neighbours_wrap_around() {
        let ring = ring_of(&[10, 50, 90]);
        let first = NodeInfo::with_hash("10.0.0.10:7100", 10);
        let last = NodeInfo::with_hash("10.0.0.90:7100", 90);
        assert_eq!(ring.successor(&first).unwrap().hash(), 50);
        assert_eq!(ring.successor(&last).unwrap().hash(), 10);
        assert_eq!(ring.predecessor(&first).unwrap().hash(), 90);
        assert_eq!(ring.predecessor(&last).unwrap().hash(), 50);
    }

    #[test]
    fn lone_node_has_no_neighbours() {
        let ring = ring_of(&[10]);
        let only = NodeInfo::with_hash("10.0.0.10:7100", 10);
        assert!(ring.successor(&only).is_none());
        assert!(ring.predecessor(&only).is_none());
    }

    #[test]
    fn reinserting_an_address_moves_it() {
        let mut ring = ring_of(&[10, 50]);
        ring.insert(NodeInfo::with_hash("10.0.0.10:7100", 70));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.owner_of(60).unwrap().address(), "10.0.0.10:7100");
        assert!(ring.remove("10.0.0.50:7100").is_some());
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn arc_handles_wrap() {
        assert!(arc_contains(50, 80, 65, true));
        assert!(arc_contains(50, 80, 80, true));
        assert!(!arc_contains(50, 80, 80, false));
        assert!(!arc_contains(50, 80, 40, true));
        assert!(!arc_contains(50, 80, 95, true));
        assert!(arc_contains(30, 15, 10, true));
        assert!(arc_contains(30, 15, 100, true));
        assert!(!arc_contains(30, 15, 20, true));
        assert!(!arc_contains(30, 30, 20, true));
    }
}
