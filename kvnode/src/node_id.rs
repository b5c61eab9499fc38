//! Stable, process-lifetime identifier for a cluster node.
use std::fmt;

/// A 160-bit random id rendered as lowercase hex, stable for the node's
/// process lifetime. Two nodes started at different times never collide in
/// practice; nothing in this codebase relies on a stronger guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub fn new() -> Self {
        let mut bytes = [0u8; 20];
        rand::fill(&mut bytes);
        NodeId(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_40_hex_chars() {
        let id = NodeId::new();
        assert_eq!(id.as_str().len(), 40);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn distinct_calls_produce_distinct_ids() {
        assert_ne!(NodeId::new(), NodeId::new());
    }
}
