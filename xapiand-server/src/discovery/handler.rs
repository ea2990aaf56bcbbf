use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::discovery::message::DiscoveryMessage;
use crate::endpoint::Endpoint;
use crate::membership::Membership;
use crate::node::Node;

use super::{HEARTBEAT_MAX, WAITING_FAST, WAITING_SLOW};

/// Lifecycle of the local node on the gossip ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Bootstrapping,
    Waiting,
    WaitingMore,
    Ready,
    Shutdown,
}

/// Everything that can happen to the handler. Packets are already
/// cluster-checked and decoded by the actor.
#[derive(Debug)]
pub enum DiscoveryEvent {
    /// Start (or restart) the join handshake.
    Enter,
    BootstrapTimeout,
    HeartbeatTick,
    Leave,
    Packet(DiscoveryMessage),
}

/// Side effects the driver must carry out. The handler itself only
/// mutates the membership table and its own state.
#[derive(Debug)]
pub enum DiscoveryAction {
    Send(DiscoveryMessage),
    ScheduleBootstrap(Duration),
    /// The local node finished its handshake.
    NodeIsReady,
    /// A peer announced a higher mastery for a shard we host.
    TriggerReplication {
        path: String,
        remote_mastery: i64,
        node: Node,
    },
    /// Any mastery announcement also feeds the endpoint resolver.
    FeedResolver {
        path: String,
        endpoint: Endpoint,
    },
    /// The node name was pinned and is taken: stop the server.
    ShutdownNode,
}

/// Local shard mastery lookup, answered by the database layer. `None`
/// means the shard is not hosted here.
pub trait MasteryLookup: Send + Sync {
    fn mastery_level(&self, path: &str) -> Option<i64>;
}

/// The pure gossip state machine: `advance(event) -> actions`. Driven
/// by the UDP actor in production and by an in-process bus in tests.
pub struct DiscoveryHandler {
    state: DiscoveryState,
    local: Node,
    base_name: String,
    name_pinned: bool,
    rename_attempt: u32,
    membership: Arc<Membership>,
    mastery: Arc<dyn MasteryLookup>,
}

impl DiscoveryHandler {
    pub fn new(
        local: Node,
        name_pinned: bool,
        membership: Arc<Membership>,
        mastery: Arc<dyn MasteryLookup>,
    ) -> Self {
        Self {
            state: DiscoveryState::Bootstrapping,
            base_name: local.name.clone(),
            local,
            name_pinned,
            rename_attempt: 0,
            membership,
            mastery,
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn local_node(&self) -> &Node {
        &self.local
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    /// Mastery to announce when probing for `path`: ours when we host
    /// the shard, otherwise -1 so any holder outranks the probe.
    pub fn probe_mastery(&self, path: &str) -> i64 {
        self.mastery.mastery_level(path).unwrap_or(-1)
    }

    pub fn advance(&mut self, event: DiscoveryEvent) -> Vec<DiscoveryAction> {
        match event {
            DiscoveryEvent::Enter => self.enter(),
            DiscoveryEvent::BootstrapTimeout => self.bootstrap_timeout(),
            DiscoveryEvent::HeartbeatTick => self.heartbeat_tick(),
            DiscoveryEvent::Leave => {
                self.state = DiscoveryState::Shutdown;
                vec![DiscoveryAction::Send(DiscoveryMessage::Bye(
                    self.local.clone(),
                ))]
            }
            DiscoveryEvent::Packet(message) => self.packet(message),
        }
    }

    fn enter(&mut self) -> Vec<DiscoveryAction> {
        self.state = DiscoveryState::Waiting;
        self.local.touched = SystemTime::now();
        vec![
            DiscoveryAction::Send(DiscoveryMessage::Hello(self.local.clone())),
            DiscoveryAction::ScheduleBootstrap(WAITING_FAST),
        ]
    }

    fn bootstrap_timeout(&mut self) -> Vec<DiscoveryAction> {
        match self.state {
            DiscoveryState::Waiting => {
                self.state = DiscoveryState::Ready;
                self.local.touched = SystemTime::now();
                self.membership.put_node(self.local.clone());
                tracing::info!(node = %self.local, "joined the cluster");
                vec![
                    DiscoveryAction::Send(DiscoveryMessage::Enter(self.local.clone())),
                    DiscoveryAction::NodeIsReady,
                ]
            }
            // Someone waved while we waited; linger a little longer so
            // the rest of the table reaches us before we go ready.
            DiscoveryState::WaitingMore => {
                self.state = DiscoveryState::Waiting;
                vec![DiscoveryAction::ScheduleBootstrap(WAITING_SLOW)]
            }
            _ => Vec::new(),
        }
    }

    fn heartbeat_tick(&mut self) -> Vec<DiscoveryAction> {
        if self.state != DiscoveryState::Ready {
            return Vec::new();
        }
        for stalled in self.membership.purge_stalled(HEARTBEAT_MAX) {
            tracing::info!(node = %stalled, "stalled node left the party");
        }
        self.local.touched = SystemTime::now();
        self.membership.put_node(self.local.clone());
        vec![DiscoveryAction::Send(DiscoveryMessage::Heartbeat(
            self.local.clone(),
        ))]
    }

    fn packet(&mut self, message: DiscoveryMessage) -> Vec<DiscoveryAction> {
        if self.state == DiscoveryState::Shutdown {
            return Vec::new();
        }
        match message {
            DiscoveryMessage::Hello(remote) => self.hello(remote),
            DiscoveryMessage::Heartbeat(remote) => self.wave(remote, true),
            DiscoveryMessage::Wave(remote) => self.wave(remote, false),
            DiscoveryMessage::Sneer(remote) => self.sneer(remote),
            DiscoveryMessage::Enter(remote) => {
                if self.membership.put_node(remote.clone()) {
                    tracing::info!(node = %remote, "node joined the party");
                }
                Vec::new()
            }
            DiscoveryMessage::Bye(remote) => {
                if self.membership.drop_node(&remote.name, SystemTime::now()) {
                    tracing::info!(node = %remote, "node left the party");
                }
                Vec::new()
            }
            DiscoveryMessage::DbUpdated {
                mastery_level,
                path,
                node,
            } => self.db_updated(mastery_level, path, node),
        }
    }

    fn hello(&mut self, remote: Node) -> Vec<DiscoveryAction> {
        if remote == self.local {
            // It's me! ...wave hello.
            return vec![DiscoveryAction::Send(DiscoveryMessage::Wave(
                self.local.clone(),
            ))];
        }
        match self.membership.get_node(&remote.name) {
            Some(known) if known != remote => {
                vec![DiscoveryAction::Send(DiscoveryMessage::Sneer(remote))]
            }
            _ => vec![DiscoveryAction::Send(DiscoveryMessage::Wave(
                self.local.clone(),
            ))],
        }
    }

    fn wave(&mut self, mut remote: Node, heartbeat: bool) -> Vec<DiscoveryAction> {
        if remote.lower_name() == self.local.lower_name() {
            return Vec::new();
        }
        // A wave during the handshake means the table is still filling.
        if self.state == DiscoveryState::Waiting {
            self.state = DiscoveryState::WaitingMore;
        }
        remote.touched = SystemTime::now();
        match self.membership.get_node(&remote.name) {
            Some(known) if known != remote => {
                let now = SystemTime::now();
                if heartbeat || known.is_stalled(now, HEARTBEAT_MAX) {
                    // Tombstone at the stalled node's last contact so
                    // the fresh announcement is the newer fact.
                    self.membership.drop_node(&remote.name, known.touched);
                    if self.membership.put_node(remote.clone()) {
                        tracing::info!(node = %remote, "stalled node replaced");
                    }
                }
            }
            Some(_) => {
                self.membership.touch_node(&remote.name, remote.region);
            }
            None => {
                if self.membership.put_node(remote.clone()) {
                    if heartbeat {
                        tracing::info!(node = %remote, "node joined the party");
                    } else {
                        tracing::debug!(node = %remote, "node joining the party");
                    }
                }
            }
        }
        Vec::new()
    }

    fn sneer(&mut self, remote: Node) -> Vec<DiscoveryAction> {
        if remote != self.local {
            return Vec::new();
        }
        if self.name_pinned {
            tracing::warn!(
                name = %self.local.name,
                "cannot join the party, node name already taken"
            );
            self.state = DiscoveryState::Shutdown;
            return vec![DiscoveryAction::ShutdownNode];
        }
        self.rename_attempt += 1;
        self.local.name = format!("{}-{}", self.base_name, self.rename_attempt);
        tracing::info!(
            name = %self.local.name,
            "node name taken, retrying under a new name"
        );
        self.enter()
    }

    fn db_updated(
        &mut self,
        remote_mastery: i64,
        path: String,
        node: Node,
    ) -> Vec<DiscoveryAction> {
        if node.lower_name() == self.local.lower_name() {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if remote_mastery >= 0 {
            let endpoint =
                Endpoint::on_node(path.clone(), &node).with_mastery(remote_mastery);
            actions.push(DiscoveryAction::FeedResolver {
                path: path.clone(),
                endpoint,
            });
        }

        let Some(local_mastery) = self.mastery.mastery_level(&path) else {
            return actions;
        };
        if remote_mastery > local_mastery {
            tracing::debug!(
                %path,
                local_mastery,
                remote_mastery,
                "remote mastery wins, updating"
            );
            self.membership.put_node(node.clone());
            actions.push(DiscoveryAction::TriggerReplication {
                path,
                remote_mastery,
                node,
            });
        } else if remote_mastery == local_mastery {
            tracing::debug!(%path, local_mastery, "equal mastery announcement ignored");
        } else {
            // Ours is authoritative; announce it (this is also how
            // resolver probes get their answers).
            actions.push(DiscoveryAction::Send(DiscoveryMessage::DbUpdated {
                mastery_level: local_mastery,
                path,
                node: self.local.clone(),
            }));
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoShards;

    impl MasteryLookup for NoShards {
        fn mastery_level(&self, _path: &str) -> Option<i64> {
            None
        }
    }

    struct FixedMastery(i64);

    impl MasteryLookup for FixedMastery {
        fn mastery_level(&self, _path: &str) -> Option<i64> {
            Some(self.0)
        }
    }

    fn handler(name: &str, mastery: Arc<dyn MasteryLookup>) -> DiscoveryHandler {
        DiscoveryHandler::new(
            Node::new(name, format!("host-{name}")),
            false,
            Arc::new(Membership::new()),
            mastery,
        )
    }

    #[test]
    fn handshake_reaches_ready() {
        let mut handler = handler("alpha", Arc::new(NoShards));
        let actions = handler.advance(DiscoveryEvent::Enter);
        assert!(matches!(
            actions[0],
            DiscoveryAction::Send(DiscoveryMessage::Hello(_))
        ));
        assert_eq!(handler.state(), DiscoveryState::Waiting);

        let actions = handler.advance(DiscoveryEvent::BootstrapTimeout);
        assert_eq!(handler.state(), DiscoveryState::Ready);
        assert!(actions
            .iter()
            .any(|action| matches!(action, DiscoveryAction::NodeIsReady)));
    }

    #[test]
    fn wave_stretches_the_handshake() {
        let mut handler = handler("alpha", Arc::new(NoShards));
        handler.advance(DiscoveryEvent::Enter);
        handler.advance(DiscoveryEvent::Packet(DiscoveryMessage::Wave(Node::new(
            "beta", "host-b",
        ))));
        assert_eq!(handler.state(), DiscoveryState::WaitingMore);

        let actions = handler.advance(DiscoveryEvent::BootstrapTimeout);
        assert_eq!(handler.state(), DiscoveryState::Waiting);
        match &actions[0] {
            DiscoveryAction::ScheduleBootstrap(delay) => assert_eq!(*delay, WAITING_SLOW),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn sneer_renames_and_retries() {
        let mut handler = handler("alpha", Arc::new(NoShards));
        handler.advance(DiscoveryEvent::Enter);
        let me = handler.local_node().clone();
        let actions = handler.advance(DiscoveryEvent::Packet(DiscoveryMessage::Sneer(me)));
        assert_eq!(handler.local_node().name, "alpha-1");
        assert!(matches!(
            actions[0],
            DiscoveryAction::Send(DiscoveryMessage::Hello(_))
        ));
    }

    #[test]
    fn sneer_with_pinned_name_shuts_down() {
        let mut handler = DiscoveryHandler::new(
            Node::new("alpha", "host-a"),
            true,
            Arc::new(Membership::new()),
            Arc::new(NoShards),
        );
        handler.advance(DiscoveryEvent::Enter);
        let me = handler.local_node().clone();
        let actions = handler.advance(DiscoveryEvent::Packet(DiscoveryMessage::Sneer(me)));
        assert!(matches!(actions[0], DiscoveryAction::ShutdownNode));
        assert_eq!(handler.state(), DiscoveryState::Shutdown);
    }

    #[test]
    fn hello_for_conflicting_node_draws_sneer() {
        let mut handler = handler("alpha", Arc::new(NoShards));
        handler
            .membership()
            .put_node(Node::new("beta", "host-original"));
        let impostor = Node::new("beta", "host-impostor");
        let actions =
            handler.advance(DiscoveryEvent::Packet(DiscoveryMessage::Hello(impostor)));
        assert!(matches!(
            actions[0],
            DiscoveryAction::Send(DiscoveryMessage::Sneer(_))
        ));
    }

    #[test]
    fn higher_remote_mastery_triggers_replication() {
        let mut handler = handler("alpha", Arc::new(FixedMastery(3)));
        let actions = handler.advance(DiscoveryEvent::Packet(DiscoveryMessage::DbUpdated {
            mastery_level: 7,
            path: "/x".into(),
            node: Node::new("beta", "host-b"),
        }));
        assert!(actions.iter().any(|action| matches!(
            action,
            DiscoveryAction::TriggerReplication { remote_mastery: 7, .. }
        )));
    }

    #[test]
    fn equal_mastery_is_ignored() {
        let mut handler = handler("alpha", Arc::new(FixedMastery(7)));
        let actions = handler.advance(DiscoveryEvent::Packet(DiscoveryMessage::DbUpdated {
            mastery_level: 7,
            path: "/x".into(),
            node: Node::new("beta", "host-b"),
        }));
        assert!(!actions.iter().any(|action| matches!(
            action,
            DiscoveryAction::TriggerReplication { .. }
                | DiscoveryAction::Send(DiscoveryMessage::DbUpdated { .. })
        )));
    }

    #[test]
    fn lower_remote_mastery_draws_announcement() {
        let mut handler = handler("alpha", Arc::new(FixedMastery(7)));
        let actions = handler.advance(DiscoveryEvent::Packet(DiscoveryMessage::DbUpdated {
            mastery_level: -1,
            path: "/x".into(),
            node: Node::new("beta", "host-b"),
        }));
        assert!(actions.iter().any(|action| matches!(
            action,
            DiscoveryAction::Send(DiscoveryMessage::DbUpdated { mastery_level: 7, .. })
        )));
    }
}
