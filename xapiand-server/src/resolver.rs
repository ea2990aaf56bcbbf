use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;

use crate::discovery::HEARTBEAT_MAX;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::membership::Membership;

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub cache_entries: usize,
    /// First wait window after a probe; stretches by 3x while fewer
    /// than the requested replicas have answered.
    pub init_window: Duration,
    /// A cached resolution older than this re-probes.
    pub stale_after: Duration,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            cache_entries: 1000,
            init_window: Duration::from_millis(5),
            stale_after: Duration::from_secs(3600),
        }
    }
}

#[derive(Default)]
struct ListState {
    endpoints: Vec<Endpoint>,
    max_mastery: i64,
    resolved_at: Option<Instant>,
}

/// Mastery announcements collected for one shard path.
pub struct EndpointList {
    state: Mutex<ListState>,
    cond: Condvar,
}

impl EndpointList {
    fn new() -> Self {
        Self {
            state: Mutex::new(ListState::default()),
            cond: Condvar::new(),
        }
    }

    fn add(&self, endpoint: Endpoint) {
        let mut state = self.state.lock();
        state.max_mastery = state.max_mastery.max(endpoint.mastery_level);
        match state.endpoints.iter_mut().find(|known| **known == endpoint) {
            Some(known) => {
                if endpoint.mastery_level >= known.mastery_level {
                    *known = endpoint;
                }
            }
            None => state.endpoints.push(endpoint),
        }
        self.cond.notify_all();
    }
}

/// Resolves a shard path to its best replicas: an LRU of per-path
/// announcement lists, refilled by `DbUpdated` probes over discovery.
/// The cache lock is a single non-reentrant mutex; per-list state has
/// its own, and the two are never held together.
pub struct EndpointResolver {
    cache: Mutex<LruCache<String, Arc<EndpointList>>>,
    probe_tx: mpsc::UnboundedSender<String>,
    membership: Arc<Membership>,
    options: ResolverOptions,
}

impl EndpointResolver {
    pub fn new(
        membership: Arc<Membership>,
        probe_tx: mpsc::UnboundedSender<String>,
        options: ResolverOptions,
    ) -> Self {
        let capacity =
            NonZeroUsize::new(options.cache_entries.max(1)).expect("nonzero cache size");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            probe_tx,
            membership,
            options,
        }
    }

    fn list(&self, path: &str) -> Arc<EndpointList> {
        let mut cache = self.cache.lock();
        if let Some(list) = cache.get(path) {
            return list.clone();
        }
        let list = Arc::new(EndpointList::new());
        cache.put(path.to_owned(), list.clone());
        list
    }

    /// Feeds one mastery announcement into the cache. Called by the
    /// discovery actor for every `DbUpdated` it sees.
    pub fn add_endpoint(&self, path: &str, endpoint: Endpoint) {
        self.list(path).add(endpoint);
    }

    /// Resolves up to `n_replicas` endpoints for `path`, probing peers
    /// when the cache is cold or stale. Waiting starts with a short
    /// window that stretches while answers are missing.
    pub fn resolve(
        &self,
        path: &str,
        n_replicas: usize,
        timeout: Duration,
    ) -> Result<Vec<Endpoint>> {
        let list = self.list(path);
        let deadline = Instant::now() + timeout;

        let mut state = list.state.lock();
        let fresh = state
            .resolved_at
            .is_some_and(|at| at.elapsed() < self.options.stale_after);
        if !fresh || state.endpoints.is_empty() {
            // Ask the cluster to announce its masteries for this path.
            let _ = self.probe_tx.send(path.to_owned());
            let mut window = self.options.init_window;
            loop {
                if self.ranked(&state.endpoints).len() >= n_replicas {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let wait = window.min(deadline - now);
                list.cond.wait_for(&mut state, wait);
                window *= 3;
            }
            state.resolved_at = Some(Instant::now());
        }

        let ranked = self.ranked(&state.endpoints);
        if ranked.is_empty() {
            return Err(Error::EndpointUnresolved(path.to_owned()));
        }
        Ok(ranked.into_iter().take(n_replicas).collect())
    }

    /// Announcements ranked by mastery (descending), ties by node
    /// name, with endpoints of stalled or unknown nodes dropped.
    fn ranked(&self, endpoints: &[Endpoint]) -> Vec<Endpoint> {
        let now = std::time::SystemTime::now();
        let mut usable: Vec<Endpoint> = endpoints
            .iter()
            .filter(|endpoint| {
                if endpoint.node_name.is_empty() {
                    return endpoint.is_local();
                }
                match self.membership.get_node(&endpoint.node_name) {
                    Some(node) => !node.is_stalled(now, HEARTBEAT_MAX),
                    None => false,
                }
            })
            .cloned()
            .collect();
        usable.sort_by(|a, b| {
            b.mastery_level
                .cmp(&a.mastery_level)
                .then_with(|| a.node_name.cmp(&b.node_name))
        });
        usable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    fn resolver(membership: Arc<Membership>) -> (EndpointResolver, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EndpointResolver::new(membership, tx, ResolverOptions::default()),
            rx,
        )
    }

    fn member(membership: &Membership, name: &str) -> Node {
        let node = Node::new(name, format!("host-{name}"));
        membership.put_node(node.clone());
        node
    }

    #[test]
    fn ranks_by_mastery_then_name() {
        let membership = Arc::new(Membership::new());
        let (resolver, _rx) = resolver(membership.clone());
        for (name, mastery) in [("carol", 5), ("alice", 9), ("bob", 9)] {
            let node = member(&membership, name);
            resolver.add_endpoint(
                "/idx",
                Endpoint::on_node("/idx", &node).with_mastery(mastery),
            );
        }

        let resolved = resolver
            .resolve("/idx", 3, Duration::from_millis(50))
            .unwrap();
        let names: Vec<&str> = resolved
            .iter()
            .map(|endpoint| endpoint.node_name.as_str())
            .collect();
        assert_eq!(names, ["alice", "bob", "carol"]);
        assert!(resolved
            .windows(2)
            .all(|pair| pair[0].mastery_level >= pair[1].mastery_level));
    }

    #[test]
    fn stalled_nodes_are_filtered() {
        let membership = Arc::new(Membership::new());
        let (resolver, _rx) = resolver(membership.clone());

        let live = member(&membership, "live");
        resolver.add_endpoint("/idx", Endpoint::on_node("/idx", &live).with_mastery(1));

        let mut stalled = Node::new("stalled", "host-stalled");
        stalled.touched = std::time::SystemTime::now() - Duration::from_secs(60);
        membership.put_node(stalled.clone());
        resolver.add_endpoint("/idx", Endpoint::on_node("/idx", &stalled).with_mastery(9));

        let resolved = resolver
            .resolve("/idx", 2, Duration::from_millis(50))
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].node_name, "live");
    }

    #[test]
    fn cold_path_emits_probe_and_times_out_unresolved() {
        let membership = Arc::new(Membership::new());
        let (resolver, mut rx) = resolver(membership);
        let outcome = resolver.resolve("/nowhere", 1, Duration::from_millis(20));
        assert!(matches!(outcome, Err(Error::EndpointUnresolved(_))));
        assert_eq!(rx.try_recv().unwrap(), "/nowhere");
    }

    #[test]
    fn answers_arriving_mid_wait_unblock_the_resolver() {
        let membership = Arc::new(Membership::new());
        let (resolver, _rx) = resolver(membership.clone());
        let resolver = Arc::new(resolver);

        let feeder = {
            let resolver = resolver.clone();
            let membership = membership.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                let node = member(&membership, "late");
                resolver.add_endpoint("/idx", Endpoint::on_node("/idx", &node).with_mastery(2));
            })
        };

        let resolved = resolver.resolve("/idx", 1, Duration::from_secs(2)).unwrap();
        assert_eq!(resolved[0].node_name, "late");
        feeder.join().unwrap();
    }
}
