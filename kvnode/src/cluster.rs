//! Cluster routing plane: tracks which node owns which slot range and the
//! per-node key/byte counters used to answer `/api/v1/keycount` and friends.
//!
//! Slot assignment only happens once, the moment the node count first
//! reaches three (`initialize`). Nodes met afterwards join unassigned and
//! are never folded into a rebalance — there is no rebalancing policy here.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::node_id::NodeId;
use crate::slot::SLOT_COUNT;

/// Number of nodes whose slot ranges get assigned when the cluster
/// initializes. The design leaves nodes met after that point unassigned.
const INITIAL_CLUSTER_SIZE: usize = 3;

/// One member of the cluster, as seen from this node's point of view.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
    slot: RwLock<Option<(u16, u16)>>,
    key_count: AtomicU64,
    byte_size: AtomicU64,
}

impl Node {
    fn new(id: NodeId, host: String, port: u16) -> Self {
        Node {
            id,
            host,
            port,
            slot: RwLock::new(None),
            key_count: AtomicU64::new(0),
            byte_size: AtomicU64::new(0),
        }
    }

    pub fn slot_range(&self) -> Option<(u16, u16)> {
        *self.slot.read().expect("node slot lock poisoned")
    }

    fn assign_slot(&self, start: u16, end: u16) {
        *self.slot.write().expect("node slot lock poisoned") = Some((start, end));
    }

    pub fn owns(&self, slot: u16) -> bool {
        matches!(self.slot_range(), Some((start, end)) if slot >= start && slot < end)
    }

    pub fn key_count(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size.load(Ordering::Relaxed)
    }

    pub fn incr_keys(&self) {
        self.key_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturating decrement: eviction racing a stats read must never wrap
    /// the counter below zero. Eviction does not currently call this, so
    /// counts can drift high under heavy eviction; see design notes.
    pub fn decr_keys(&self) {
        let _ = self
            .key_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn add_bytes(&self, n: u64) {
        self.byte_size.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sub_bytes(&self, n: u64) {
        let _ = self
            .byte_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(cur.saturating_sub(n))
            });
    }
}

/// Splits the 16,384 slots evenly (remainder to the last node) across
/// `node_count` nodes and returns the `[start, end)` range at `index`.
fn slot_range_for(node_count: u16, index: u16) -> (u16, u16) {
    let base = SLOT_COUNT / node_count;
    let start = base * index;
    let end = if index + 1 == node_count {
        SLOT_COUNT
    } else {
        base * (index + 1)
    };
    (start, end)
}

/// Owns the view of the cluster topology: this node's own entry plus every
/// peer learned via `CLUSTER MEET`. Before the cluster initializes (fewer
/// than three nodes), every node is unassigned and this node answers
/// `owner` for every slot — single-node mode.
pub struct ClusterManager {
    self_id: NodeId,
    nodes: RwLock<Vec<Node>>,
    initialized: std::sync::atomic::AtomicBool,
}

impl ClusterManager {
    pub fn new(host: String, port: u16) -> Self {
        let self_id = NodeId::new();
        let me = Node::new(self_id.clone(), host, port);
        ClusterManager {
            self_id,
            nodes: RwLock::new(vec![me]),
            initialized: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Registers a new peer under a freshly generated id. Duplicate
    /// `(host, port)` pairs are accepted and get a distinct id, matching
    /// the documented behavior of a real `CLUSTER MEET`.
    pub fn add_node(&self, host: String, port: u16) -> NodeId {
        let id = NodeId::new();
        let mut nodes = self.nodes.write().expect("cluster lock poisoned");
        nodes.push(Node::new(id.clone(), host, port));
        let count = nodes.len();
        drop(nodes);

        if count == INITIAL_CLUSTER_SIZE {
            self.initialize();
        }
        id
    }

    /// Sorts the first three node ids lexicographically and assigns each
    /// an even contiguous slot range, the last absorbing the remainder.
    /// Runs exactly once, the moment the node count first reaches three.
    fn initialize(&self) {
        let nodes = self.nodes.read().expect("cluster lock poisoned");
        let mut ids: Vec<&NodeId> = nodes.iter().map(|n| &n.id).collect();
        ids.sort();
        let chosen: Vec<NodeId> = ids.into_iter().take(INITIAL_CLUSTER_SIZE).cloned().collect();
        drop(nodes);

        let nodes = self.nodes.read().expect("cluster lock poisoned");
        for (index, id) in chosen.iter().enumerate() {
            let (start, end) = slot_range_for(INITIAL_CLUSTER_SIZE as u16, index as u16);
            if let Some(node) = nodes.iter().find(|n| &n.id == id) {
                node.assign_slot(start, end);
            }
        }
        self.initialized.store(true, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Returns the owner of `slot`. Single-node mode (fewer than three
    /// nodes, or not yet initialized) always answers `Local`. Once
    /// initialized, falls back to `Local` for any slot no assigned node
    /// covers — a documented limitation, not an error condition.
    pub fn owner(&self, slot: u16) -> NodeOwner {
        if !self.is_initialized() {
            return NodeOwner::Local;
        }
        let nodes = self.nodes.read().expect("cluster lock poisoned");
        match nodes.iter().find(|n| n.owns(slot)) {
            Some(node) if node.id == self.self_id => NodeOwner::Local,
            Some(node) => NodeOwner::Remote {
                host: node.host.clone(),
                port: node.port,
            },
            None => NodeOwner::Local,
        }
    }

    pub fn with_self<T>(&self, f: impl FnOnce(&Node) -> T) -> T {
        let nodes = self.nodes.read().expect("cluster lock poisoned");
        let me = nodes
            .iter()
            .find(|n| n.id == self.self_id)
            .expect("self must always be present");
        f(me)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().expect("cluster lock poisoned").len()
    }

    /// Snapshot of every node's id, host, port, and stats, for the HTTP
    /// cluster-status surface and for cluster-stats broadcasts. Unassigned
    /// slots are reported as `slot_start = slot_end = -1`.
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        self.nodes
            .read()
            .expect("cluster lock poisoned")
            .iter()
            .map(|n| {
                let (slot_start, slot_end) = match n.slot_range() {
                    Some((s, e)) => (i32::from(s), i32::from(e)),
                    None => (-1, -1),
                };
                NodeSnapshot {
                    id: n.id.to_string(),
                    host: n.host.clone(),
                    port: n.port,
                    slot_start,
                    slot_end,
                    key_count: n.key_count(),
                    byte_size: n.byte_size(),
                }
            })
            .collect()
    }
}

pub enum NodeOwner {
    Local,
    Remote { host: String, port: u16 },
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub slot_start: i32,
    pub slot_end: i32,
    pub key_count: u64,
    pub byte_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ClusterManager {
        ClusterManager::new("127.0.0.1".to_string(), 7000)
    }

    #[test]
    fn single_node_owns_every_slot() {
        let cm = manager();
        assert!(matches!(cm.owner(0), NodeOwner::Local));
        assert!(matches!(cm.owner(16383), NodeOwner::Local));
    }

    #[test]
    fn cluster_stays_unassigned_below_three_nodes() {
        let cm = manager();
        cm.add_node("127.0.0.1".to_string(), 7001);
        assert!(!cm.is_initialized());
        assert!(matches!(cm.owner(1000), NodeOwner::Local));
    }

    #[test]
    fn third_node_triggers_initialization() {
        let cm = manager();
        cm.add_node("127.0.0.1".to_string(), 7001);
        cm.add_node("127.0.0.1".to_string(), 7002);
        assert!(cm.is_initialized());

        let snap = cm.snapshot();
        assert_eq!(snap.len(), 3);
        let mut ranges: Vec<(i32, i32)> = snap.iter().map(|n| (n.slot_start, n.slot_end)).collect();
        ranges.sort();
        assert_eq!(ranges[0].0, 0);
        assert_eq!(ranges[2].1, i32::from(SLOT_COUNT));
        assert_eq!(ranges[0].1, ranges[1].0);
        assert_eq!(ranges[1].1, ranges[2].0);
    }

    #[test]
    fn a_fourth_node_joins_unassigned_without_rebalancing() {
        let cm = manager();
        cm.add_node("127.0.0.1".to_string(), 7001);
        cm.add_node("127.0.0.1".to_string(), 7002);
        let before = cm.snapshot();

        cm.add_node("127.0.0.1".to_string(), 7003);
        let after = cm.snapshot();

        assert_eq!(after.len(), 4);
        let fourth = after.iter().find(|n| n.port == 7003).unwrap();
        assert_eq!((fourth.slot_start, fourth.slot_end), (-1, -1));

        for id in before.iter().map(|n| &n.id) {
            let still = after.iter().find(|n| &n.id == id).unwrap();
            let prior = before.iter().find(|n| &n.id == id).unwrap();
            assert_eq!((still.slot_start, still.slot_end), (prior.slot_start, prior.slot_end));
        }
    }

    #[test]
    fn duplicate_host_port_pairs_get_distinct_ids() {
        let cm = manager();
        let a = cm.add_node("127.0.0.1".to_string(), 7001);
        let b = cm.add_node("127.0.0.1".to_string(), 7001);
        assert_ne!(a, b);
    }

    #[test]
    fn stats_mutators_saturate_at_zero() {
        let cm = manager();
        cm.with_self(|n| n.decr_keys());
        assert_eq!(cm.with_self(|n| n.key_count()), 0);
        cm.with_self(|n| n.sub_bytes(10));
        assert_eq!(cm.with_self(|n| n.byte_size()), 0);
    }
}
