use std::time::{Duration, SystemTime};

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::node::Node;

/// The cluster membership table: `lower(name) -> Node`, read-mostly.
/// Departures are tombstoned so a stale heartbeat arriving after a
/// newer `Bye` cannot resurrect the node.
#[derive(Default)]
pub struct Membership {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, Node>,
    departed: HashMap<String, SystemTime>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refreshes a known node's `touched` (and region when it changes),
    /// returning the refreshed entry.
    pub fn touch_node(&self, name: &str, region: i32) -> Option<Node> {
        let mut inner = self.inner.write();
        let node = inner.nodes.get_mut(&name.to_lowercase())?;
        node.touched = SystemTime::now();
        if region >= 0 {
            node.region = region;
        }
        Some(node.clone())
    }

    /// Installs a node. Returns false when a different node already
    /// holds the name, or when a newer departure tombstone outranks the
    /// announcement.
    pub fn put_node(&self, node: Node) -> bool {
        let mut inner = self.inner.write();
        let key = node.lower_name();
        if let Some(gone_at) = inner.departed.get(&key) {
            if *gone_at >= node.touched {
                tracing::debug!(node = %node, "ignoring stale announcement for departed node");
                return false;
            }
            inner.departed.remove(&key);
        }
        match inner.nodes.get(&key) {
            Some(existing) if *existing != node => false,
            _ => {
                inner.nodes.insert(key, node);
                true
            }
        }
    }

    pub fn get_node(&self, name: &str) -> Option<Node> {
        self.inner.read().nodes.get(&name.to_lowercase()).cloned()
    }

    /// Removes a node, recording the departure time.
    pub fn drop_node(&self, name: &str, at: SystemTime) -> bool {
        let mut inner = self.inner.write();
        let key = name.to_lowercase();
        let removed = inner.nodes.remove(&key).is_some();
        if removed {
            inner.departed.insert(key, at);
        }
        removed
    }

    /// Evicts every node whose last contact is older than
    /// `heartbeat_max`, returning the evicted entries.
    pub fn purge_stalled(&self, heartbeat_max: Duration) -> Vec<Node> {
        let now = SystemTime::now();
        let mut inner = self.inner.write();
        let stalled: Vec<String> = inner
            .nodes
            .iter()
            .filter(|(_, node)| node.is_stalled(now, heartbeat_max))
            .map(|(key, _)| key.clone())
            .collect();
        let mut evicted = Vec::with_capacity(stalled.len());
        for key in stalled {
            if let Some(node) = inner.nodes.remove(&key) {
                inner.departed.insert(key, now);
                evicted.push(node);
            }
        }
        evicted
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.inner.read().nodes.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().nodes.is_empty()
    }

    /// Members of `region`, the electorate for that region's raft.
    pub fn region_count(&self, region: i32) -> usize {
        self.inner
            .read()
            .nodes
            .values()
            .filter(|node| node.region == region)
            .count()
    }
}
