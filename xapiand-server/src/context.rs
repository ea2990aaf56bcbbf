//! The explicit server context: every long-lived component hangs off
//! one `ServerContext` passed at construction. There is no global
//! manager; tests build isolated contexts.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::database;
use crate::discovery::{Discovery, DiscoveryMessage, MasteryLookup};
use crate::membership::Membership;
use crate::node::Node;
use crate::pool::DatabasePool;
use crate::raft::Raft;
use crate::resolver::EndpointResolver;
use crate::workers::WorkerPools;

pub struct ServerContext {
    pub config: Config,
    pub membership: Arc<Membership>,
    pub pool: Arc<DatabasePool>,
    pub resolver: Arc<EndpointResolver>,
    pub workers: WorkerPools,
    local_node: RwLock<Node>,
    discovery: Mutex<Option<Arc<Discovery>>>,
    raft: Mutex<Option<Arc<Raft>>>,
    shutdown_tx: mpsc::UnboundedSender<()>,
}

impl ServerContext {
    pub fn new(
        config: Config,
        membership: Arc<Membership>,
        pool: Arc<DatabasePool>,
        resolver: Arc<EndpointResolver>,
        workers: WorkerPools,
        shutdown_tx: mpsc::UnboundedSender<()>,
    ) -> Self {
        let local_node = config.local_node();
        Self {
            config,
            membership,
            pool,
            resolver,
            workers,
            local_node: RwLock::new(local_node),
            discovery: Mutex::new(None),
            raft: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub fn local_node(&self) -> Node {
        self.local_node.read().clone()
    }

    /// Discovery may rename the node after a sneer.
    pub fn set_local_node(&self, node: Node) {
        *self.local_node.write() = node;
    }

    pub fn attach_discovery(&self, discovery: Arc<Discovery>) {
        *self.discovery.lock() = Some(discovery);
    }

    pub fn discovery(&self) -> Option<Arc<Discovery>> {
        self.discovery.lock().clone()
    }

    pub fn attach_raft(&self, raft: Arc<Raft>) {
        *self.raft.lock() = Some(raft);
    }

    pub fn raft(&self) -> Option<Arc<Raft>> {
        self.raft.lock().clone()
    }

    /// Mastery of a locally hosted shard, `None` when absent.
    pub fn shard_mastery(&self, path: &str) -> Option<i64> {
        database::shard_mastery(&self.pool.shard_dir(path))
    }

    /// Broadcasts the local mastery for `path` after a commit or a
    /// finished replication pull.
    pub fn announce_db_updated(&self, path: &str, mastery_level: i64) {
        if let Some(discovery) = self.discovery() {
            discovery.broadcast(DiscoveryMessage::DbUpdated {
                mastery_level,
                path: path.to_owned(),
                node: self.local_node(),
            });
        }
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// `MasteryLookup` over the local shard tree, for the discovery
/// handler.
pub struct LocalShardMastery {
    pool: Arc<DatabasePool>,
}

impl LocalShardMastery {
    pub fn new(pool: Arc<DatabasePool>) -> Self {
        Self { pool }
    }
}

impl MasteryLookup for LocalShardMastery {
    fn mastery_level(&self, path: &str) -> Option<i64> {
        database::shard_mastery(&self.pool.shard_dir(path))
    }
}
