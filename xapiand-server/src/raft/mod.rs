//! Per-region leader election over UDP multicast. The election logic
//! is the pure state machine in [`state`]; this module drives it with
//! real sockets and randomized timers.

pub mod message;
pub mod state;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::error::Result;
use crate::membership::Membership;
use crate::node::Node;

pub use message::RaftMessage;
pub use state::{RaftAction, RaftEvent, RaftRole, RaftState};

pub const HEARTBEAT_LEADER_MIN: Duration = Duration::from_millis(1500);
pub const HEARTBEAT_LEADER_MAX: Duration = Duration::from_millis(3000);
pub const LEADER_ELECTION_MIN: Duration = Duration::from_millis(7500);
pub const LEADER_ELECTION_MAX: Duration = Duration::from_millis(15000);

#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub group: Ipv4Addr,
    pub port: u16,
    pub cluster_name: String,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 192, 168, 80),
            port: 58880,
            cluster_name: "Xapiand".into(),
        }
    }
}

/// Observable election state, published after every event.
#[derive(Debug, Clone, PartialEq)]
pub struct RaftStatus {
    pub role: RaftRole,
    pub term: u64,
    pub leader: Option<Node>,
}

#[derive(Debug)]
enum RaftCommand {
    Reset,
    Stop,
}

/// Handle to the running raft actor.
pub struct Raft {
    cmd_tx: mpsc::UnboundedSender<RaftCommand>,
    status_rx: watch::Receiver<RaftStatus>,
    task: tokio::task::JoinHandle<()>,
}

impl Raft {
    pub async fn spawn(
        options: RaftOptions,
        local: Node,
        membership: Arc<Membership>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, options.port)).await?;
        socket.join_multicast_v4(options.group, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;

        let state = RaftState::new(local);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(RaftStatus {
            role: state.role(),
            term: state.term(),
            leader: None,
        });
        let actor = Actor {
            options,
            socket,
            state,
            membership,
            cmd_rx,
            status_tx,
            heartbeat_enabled: false,
        };
        let task = tokio::spawn(actor.run());
        Ok(Self {
            cmd_tx,
            status_rx,
            task,
        })
    }

    pub fn status(&self) -> RaftStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch channel for tests and operators waiting on elections.
    pub fn watch(&self) -> watch::Receiver<RaftStatus> {
        self.status_rx.clone()
    }

    pub fn reset(&self) {
        let _ = self.cmd_tx.send(RaftCommand::Reset);
    }

    pub fn stop(&self) {
        let _ = self.cmd_tx.send(RaftCommand::Stop);
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

struct Actor {
    options: RaftOptions,
    socket: UdpSocket,
    state: RaftState,
    membership: Arc<Membership>,
    cmd_rx: mpsc::UnboundedReceiver<RaftCommand>,
    status_tx: watch::Sender<RaftStatus>,
    heartbeat_enabled: bool,
}

impl Actor {
    async fn run(mut self) {
        let mut buf = vec![0u8; 16 * 1024];
        let mut election_deadline = Instant::now() + election_jitter();
        let mut heartbeat_at = Instant::now() + leader_heartbeat_jitter();
        loop {
            let heartbeat_enabled = self.heartbeat_enabled;
            let heartbeat = async move {
                if heartbeat_enabled {
                    tokio::time::sleep_until(heartbeat_at).await
                } else {
                    std::future::pending().await
                }
            };
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, _from)) => {
                            if let Some(reset) = self.datagram(&buf[..len]).await {
                                if reset {
                                    election_deadline = Instant::now() + election_jitter();
                                }
                            }
                        }
                        Err(err) => tracing::warn!(%err, "raft socket receive failed"),
                    }
                }
                Some(command) = self.cmd_rx.recv() => {
                    match command {
                        RaftCommand::Reset => {
                            let actions = self.state.advance(RaftEvent::Packet(
                                RaftMessage::Reset(self.state.local_node().clone()),
                            ));
                            if self.execute(actions).await {
                                election_deadline = Instant::now() + election_jitter();
                            }
                            self.publish();
                        }
                        RaftCommand::Stop => return,
                    }
                }
                _ = tokio::time::sleep_until(election_deadline) => {
                    election_deadline = Instant::now() + election_jitter();
                    self.refresh_electorate();
                    let actions = self.state.advance(RaftEvent::ElectionTimeout);
                    self.execute(actions).await;
                    self.publish();
                }
                _ = heartbeat => {
                    heartbeat_at = Instant::now() + leader_heartbeat_jitter();
                    let actions = self.state.advance(RaftEvent::HeartbeatTick);
                    self.execute(actions).await;
                }
            }
        }
    }

    /// Returns `Some(reset_election_timer)` for processed datagrams.
    async fn datagram(&mut self, datagram: &[u8]) -> Option<bool> {
        let message = match RaftMessage::decode(datagram, &self.options.cluster_name) {
            Ok(message) => message,
            Err(crate::Error::ClusterNameMismatch) => return None,
            Err(err) => {
                tracing::warn!(%err, "dropping raft datagram");
                return None;
            }
        };
        if !matches!(message, RaftMessage::HeartbeatLeader(_)) {
            tracing::debug!(msg = message.name(), node = %message.node(), ">> raft");
        }
        self.refresh_electorate();
        let actions = self.state.advance(RaftEvent::Packet(message));
        let reset = self.execute(actions).await;
        self.publish();
        Some(reset)
    }

    fn refresh_electorate(&mut self) {
        let region = self.state.local_node().region;
        self.state
            .set_number_servers(self.membership.region_count(region));
    }

    /// Executes actions; returns whether the election timer must reset.
    async fn execute(&mut self, actions: Vec<RaftAction>) -> bool {
        let mut reset_timer = false;
        for action in actions {
            match action {
                RaftAction::Send(message) => {
                    let datagram = message.encode(&self.options.cluster_name);
                    let target = (self.options.group, self.options.port);
                    if let Err(err) = self.socket.send_to(&datagram, target).await {
                        tracing::warn!(%err, msg = message.name(), "raft send failed");
                    }
                }
                RaftAction::ResetElectionTimer => reset_timer = true,
                RaftAction::StartLeaderHeartbeat => self.heartbeat_enabled = true,
                RaftAction::StopLeaderHeartbeat => self.heartbeat_enabled = false,
            }
        }
        reset_timer
    }

    fn publish(&self) {
        let status = RaftStatus {
            role: self.state.role(),
            term: self.state.term(),
            leader: self.state.leader().cloned(),
        };
        if *self.status_tx.borrow() != status {
            let _ = self.status_tx.send(status);
        }
    }
}

fn election_jitter() -> Duration {
    rand::thread_rng().gen_range(LEADER_ELECTION_MIN..LEADER_ELECTION_MAX)
}

fn leader_heartbeat_jitter() -> Duration {
    rand::thread_rng().gen_range(HEARTBEAT_LEADER_MIN..HEARTBEAT_LEADER_MAX)
}
