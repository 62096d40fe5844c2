use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::ring_hash;

/// Identity of a ring participant. Two values denote the same node iff their
/// addresses are equal, the ring position does not take part in equality.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    address: String,
    hash: u32,
}

impl NodeInfo {
    /// Places the node on the ring by hashing its human readable name.
    pub fn new(name: &str, address: impl Into<String>) -> Self {
        Self::with_hash(address, ring_hash(name))
    }
    pub fn with_hash(address: impl Into<String>, hash: u32) -> Self {
        Self {
            address: address.into(),
            hash,
        }
    }
    pub fn address(&self) -> &str {
        &self.address
    }
    pub fn hash(&self) -> u32 {
        self.hash
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}
impl Eq for NodeInfo {}

impl Hash for NodeInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// A tracked file and the nodes believed to hold a copy, in the order they
/// were recorded. Duplicates are kept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_name: String,
    pub file_owners: Vec<NodeInfo>,
}

impl FileInfo {
    pub fn new(file_name: impl Into<String>, owner: NodeInfo) -> Self {
        Self {
            file_name: file_name.into(),
            file_owners: vec![owner],
        }
    }
    pub fn hash(&self) -> u32 {
        ring_hash(&self.file_name)
    }
    pub fn is_held_by(&self, node: &NodeInfo) -> bool {
        self.file_owners.contains(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identity_is_the_address() {
        let a = NodeInfo::with_hash("10.0.0.1:7100", 10);
        let b = NodeInfo::with_hash("10.0.0.1:7100", 99);
        let c = NodeInfo::with_hash("10.0.0.2:7100", 10);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn file_info_round_trips_through_json() {
        let mut info = FileInfo::new("a.txt", NodeInfo::with_hash("10.0.0.1:7100", 3));
        info.file_owners.push(NodeInfo::with_hash("10.0.0.2:7100", 7));
        let json = serde_json::to_string(&info).unwrap();
        let back: FileInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.file_owners[1].hash(), 7);
    }
}
