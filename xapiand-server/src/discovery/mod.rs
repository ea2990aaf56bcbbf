//! UDP multicast gossip: node membership and shard mastery
//! announcements. The protocol logic lives in [`handler`] as a pure
//! state machine; this module is the socket-and-timers driver.

pub mod handler;
pub mod message;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::error::Result;
use crate::node::Node;
use crate::resolver::EndpointResolver;

pub use handler::{
    DiscoveryAction, DiscoveryEvent, DiscoveryHandler, DiscoveryState, MasteryLookup,
};
pub use message::DiscoveryMessage;

pub const WAITING_FAST: Duration = Duration::from_millis(200);
pub const WAITING_SLOW: Duration = Duration::from_secs(1);
pub const HEARTBEAT_MIN: Duration = Duration::from_secs(2);
pub const HEARTBEAT_MAX: Duration = Duration::from_secs(4);

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub group: Ipv4Addr,
    pub port: u16,
    pub cluster_name: String,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 192, 168, 70),
            port: 58870,
            cluster_name: "Xapiand".into(),
        }
    }
}

/// A peer holds a newer copy of a shard; the updaters pool pulls it.
#[derive(Debug, Clone)]
pub struct ReplicationRequest {
    pub path: String,
    pub remote_mastery: i64,
    pub node: Node,
}

#[derive(Debug)]
pub enum DiscoveryCommand {
    Enter,
    Leave,
    Broadcast(DiscoveryMessage),
}

/// Handle to the running discovery actor.
pub struct Discovery {
    cmd_tx: mpsc::UnboundedSender<DiscoveryCommand>,
    ready_rx: watch::Receiver<Option<Node>>,
    task: tokio::task::JoinHandle<()>,
}

impl Discovery {
    /// Binds the multicast socket and starts the actor.
    pub async fn spawn(
        options: DiscoveryOptions,
        handler: DiscoveryHandler,
        resolver: Arc<EndpointResolver>,
        probe_rx: mpsc::UnboundedReceiver<String>,
        replicate_tx: mpsc::UnboundedSender<ReplicationRequest>,
        shutdown_tx: mpsc::UnboundedSender<()>,
    ) -> Result<Self> {
        let socket = bind_multicast(options.group, options.port).await?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(None);
        let actor = Actor {
            options,
            socket,
            handler,
            resolver,
            probe_rx,
            cmd_rx,
            replicate_tx,
            shutdown_tx,
            ready_tx,
            bootstrap_at: None,
        };
        let task = tokio::spawn(actor.run());
        Ok(Self {
            cmd_tx,
            ready_rx,
            task,
        })
    }

    /// Starts the join handshake.
    pub fn enter(&self) {
        let _ = self.cmd_tx.send(DiscoveryCommand::Enter);
    }

    /// Says goodbye and stops the actor.
    pub fn leave(&self) {
        let _ = self.cmd_tx.send(DiscoveryCommand::Leave);
    }

    pub fn broadcast(&self, message: DiscoveryMessage) {
        let _ = self.cmd_tx.send(DiscoveryCommand::Broadcast(message));
    }

    /// Resolves once the local node reaches `Ready`, yielding the node
    /// as finally named (a sneer may have renamed it).
    pub async fn wait_ready(&self) -> Option<Node> {
        let mut ready = self.ready_rx.clone();
        loop {
            if let Some(node) = ready.borrow().clone() {
                return Some(node);
            }
            if ready.changed().await.is_err() {
                return None;
            }
        }
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn bind_multicast(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    Ok(socket)
}

struct Actor {
    options: DiscoveryOptions,
    socket: UdpSocket,
    handler: DiscoveryHandler,
    resolver: Arc<EndpointResolver>,
    probe_rx: mpsc::UnboundedReceiver<String>,
    cmd_rx: mpsc::UnboundedReceiver<DiscoveryCommand>,
    replicate_tx: mpsc::UnboundedSender<ReplicationRequest>,
    shutdown_tx: mpsc::UnboundedSender<()>,
    ready_tx: watch::Sender<Option<Node>>,
    bootstrap_at: Option<Instant>,
}

impl Actor {
    async fn run(mut self) {
        let mut buf = vec![0u8; 64 * 1024];
        let mut next_heartbeat = Instant::now() + heartbeat_jitter();
        loop {
            let bootstrap_at = self.bootstrap_at;
            let bootstrap = async move {
                match bootstrap_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, _from)) => self.datagram(&buf[..len]).await,
                        Err(err) => {
                            tracing::warn!(%err, "discovery socket receive failed");
                        }
                    }
                }
                Some(command) = self.cmd_rx.recv() => {
                    if self.command(command).await {
                        return;
                    }
                }
                Some(path) = self.probe_rx.recv() => {
                    self.probe(path).await;
                }
                _ = bootstrap => {
                    self.bootstrap_at = None;
                    let actions = self.handler.advance(DiscoveryEvent::BootstrapTimeout);
                    self.execute(actions).await;
                }
                _ = tokio::time::sleep_until(next_heartbeat) => {
                    next_heartbeat = Instant::now() + heartbeat_jitter();
                    let actions = self.handler.advance(DiscoveryEvent::HeartbeatTick);
                    self.execute(actions).await;
                }
            }
        }
    }

    async fn datagram(&mut self, datagram: &[u8]) {
        let message = match DiscoveryMessage::decode(datagram, &self.options.cluster_name) {
            Ok(message) => message,
            // Gossip is eventually consistent; anything unreadable is
            // dropped, a foreign cluster silently so.
            Err(crate::Error::ClusterNameMismatch) => return,
            Err(err) => {
                tracing::warn!(%err, "dropping discovery datagram");
                return;
            }
        };
        if !matches!(message, DiscoveryMessage::Heartbeat(_)) {
            tracing::debug!(msg = message.name(), node = %message.node(), ">> discovery");
        }
        let actions = self.handler.advance(DiscoveryEvent::Packet(message));
        self.execute(actions).await;
    }

    /// Returns true when the actor should stop.
    async fn command(&mut self, command: DiscoveryCommand) -> bool {
        match command {
            DiscoveryCommand::Enter => {
                let actions = self.handler.advance(DiscoveryEvent::Enter);
                self.execute(actions).await;
                false
            }
            DiscoveryCommand::Leave => {
                let actions = self.handler.advance(DiscoveryEvent::Leave);
                self.execute(actions).await;
                true
            }
            DiscoveryCommand::Broadcast(message) => {
                self.send(&message).await;
                false
            }
        }
    }

    async fn probe(&mut self, path: String) {
        let mastery_level = self.handler.probe_mastery(&path);
        let message = DiscoveryMessage::DbUpdated {
            mastery_level,
            path,
            node: self.handler.local_node().clone(),
        };
        self.send(&message).await;
    }

    async fn execute(&mut self, actions: Vec<DiscoveryAction>) {
        for action in actions {
            match action {
                DiscoveryAction::Send(message) => self.send(&message).await,
                DiscoveryAction::ScheduleBootstrap(delay) => {
                    self.bootstrap_at = Some(Instant::now() + delay);
                }
                DiscoveryAction::NodeIsReady => {
                    let _ = self.ready_tx.send(Some(self.handler.local_node().clone()));
                }
                DiscoveryAction::TriggerReplication {
                    path,
                    remote_mastery,
                    node,
                } => {
                    let _ = self.replicate_tx.send(ReplicationRequest {
                        path,
                        remote_mastery,
                        node,
                    });
                }
                DiscoveryAction::FeedResolver { path, endpoint } => {
                    self.resolver.add_endpoint(&path, endpoint);
                }
                DiscoveryAction::ShutdownNode => {
                    let _ = self.shutdown_tx.send(());
                }
            }
        }
    }

    async fn send(&self, message: &DiscoveryMessage) {
        let datagram = message.encode(&self.options.cluster_name);
        let target = (self.options.group, self.options.port);
        if let Err(err) = self.socket.send_to(&datagram, target).await {
            tracing::warn!(%err, msg = message.name(), "discovery send failed");
        }
    }
}

fn heartbeat_jitter() -> Duration {
    rand::thread_rng().gen_range(HEARTBEAT_MIN..HEARTBEAT_MAX)
}
