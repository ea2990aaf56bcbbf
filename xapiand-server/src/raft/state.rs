use crate::node::Node;
use crate::raft::message::RaftMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Leader,
    Follower,
    Candidate,
}

#[derive(Debug)]
pub enum RaftEvent {
    /// No leader heartbeat arrived within the election window.
    ElectionTimeout,
    /// The local leader's own heartbeat timer fired.
    HeartbeatTick,
    Packet(RaftMessage),
}

/// Side effects for the driver. Timer bookkeeping stays out of the
/// state machine so it can run under simulated time in tests.
#[derive(Debug, PartialEq)]
pub enum RaftAction {
    Send(RaftMessage),
    ResetElectionTimer,
    StartLeaderHeartbeat,
    StopLeaderHeartbeat,
}

/// Election-only raft for one region: elects a leader and keeps it
/// alive with heartbeats. There is no replicated log; the leader's only
/// job is coordinating replication triggers.
pub struct RaftState {
    local: Node,
    role: RaftRole,
    term: u64,
    voted_for: Option<String>,
    leader: Option<Node>,
    votes: usize,
    number_servers: usize,
}

impl RaftState {
    pub fn new(local: Node) -> Self {
        Self {
            local,
            role: RaftRole::Follower,
            term: 0,
            voted_for: None,
            leader: None,
            votes: 0,
            number_servers: 1,
        }
    }

    pub fn role(&self) -> RaftRole {
        self.role
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn leader(&self) -> Option<&Node> {
        self.leader.as_ref()
    }

    pub fn local_node(&self) -> &Node {
        &self.local
    }

    /// The driver refreshes the electorate size from the membership
    /// table before each event.
    pub fn set_number_servers(&mut self, number_servers: usize) {
        self.number_servers = number_servers.max(1);
    }

    pub fn advance(&mut self, event: RaftEvent) -> Vec<RaftAction> {
        match event {
            RaftEvent::ElectionTimeout => self.election_timeout(),
            RaftEvent::HeartbeatTick => {
                if self.role == RaftRole::Leader {
                    vec![RaftAction::Send(RaftMessage::HeartbeatLeader(
                        self.local.clone(),
                    ))]
                } else {
                    Vec::new()
                }
            }
            RaftEvent::Packet(message) => {
                // Raft is per-region; foreign regions are not part of
                // this electorate.
                if message.node().region != self.local.region {
                    return Vec::new();
                }
                match message {
                    RaftMessage::HeartbeatLeader(node) => self.heartbeat_leader(node),
                    RaftMessage::RequestVote { node, term } => self.request_vote(node, term),
                    RaftMessage::ResponseVote { node, vote, term } => {
                        self.response_vote(node, vote, term)
                    }
                    RaftMessage::Leader {
                        node,
                        number_servers,
                        term,
                    } => self.leader_announced(node, number_servers, term),
                    RaftMessage::Leadership(_) => self.leadership_requested(),
                    RaftMessage::Reset(node) => {
                        if node == self.local {
                            self.reset()
                        } else {
                            Vec::new()
                        }
                    }
                }
            }
        }
    }

    fn election_timeout(&mut self) -> Vec<RaftAction> {
        if self.role == RaftRole::Leader {
            return Vec::new();
        }
        self.role = RaftRole::Candidate;
        self.term += 1;
        // The candidate's own vote arrives through its multicast
        // request looping back, like everyone else's.
        self.votes = 0;
        self.voted_for = None;
        self.leader = None;
        tracing::debug!(term = self.term, "election timeout, requesting votes");
        vec![
            RaftAction::Send(RaftMessage::RequestVote {
                node: self.local.clone(),
                term: self.term,
            }),
            RaftAction::ResetElectionTimer,
        ]
    }

    fn request_vote(&mut self, node: Node, remote_term: u64) -> Vec<RaftAction> {
        let mut actions = Vec::new();
        if remote_term > self.term {
            if self.role == RaftRole::Leader && node != self.local {
                tracing::warn!(
                    candidate = %node,
                    remote_term,
                    term = self.term,
                    "candidate outranks this leader, stepping down"
                );
                actions.extend(self.reset());
            }
            self.term = remote_term;
            self.voted_for = Some(node.lower_name());
            if node != self.local && self.role != RaftRole::Follower {
                self.role = RaftRole::Follower;
            }
            actions.push(RaftAction::Send(RaftMessage::ResponseVote {
                node,
                vote: true,
                term: remote_term,
            }));
            return actions;
        }

        if self.role == RaftRole::Leader && node != self.local {
            // A lagging candidate; tell it to fall back in line.
            actions.push(RaftAction::Send(RaftMessage::Reset(node)));
            return actions;
        }

        let (vote, term) = if remote_term < self.term {
            (false, self.term)
        } else {
            match &self.voted_for {
                None => {
                    self.voted_for = Some(node.lower_name());
                    (true, self.term)
                }
                Some(voted) if *voted == node.lower_name() => (true, self.term),
                Some(_) => (false, self.term),
            }
        };
        tracing::debug!(candidate = %node, vote, term, "answering vote request");
        actions.push(RaftAction::Send(RaftMessage::ResponseVote { node, vote, term }));
        actions
    }

    fn response_vote(&mut self, node: Node, vote: bool, remote_term: u64) -> Vec<RaftAction> {
        if node != self.local || self.role != RaftRole::Candidate {
            return Vec::new();
        }
        if vote {
            self.votes += 1;
            tracing::debug!(
                votes = self.votes,
                number_servers = self.number_servers,
                "vote received"
            );
            if self.votes * 2 > self.number_servers {
                self.role = RaftRole::Leader;
                self.leader = Some(self.local.clone());
                tracing::info!(
                    region = self.local.region,
                    term = self.term,
                    "raft: this node is the new leader"
                );
                return vec![RaftAction::StartLeaderHeartbeat];
            }
            return Vec::new();
        }
        if remote_term > self.term {
            self.term = remote_term;
            self.role = RaftRole::Follower;
        }
        Vec::new()
    }

    fn heartbeat_leader(&mut self, node: Node) -> Vec<RaftAction> {
        if self.role == RaftRole::Leader {
            if node != self.local {
                tracing::error!(other = %node, "another leader is heartbeating, resetting");
                return self.reset();
            }
            return Vec::new();
        }
        let mut actions = vec![RaftAction::ResetElectionTimer];
        if self.leader.as_ref() != Some(&node) {
            // Unknown leader; ask it for the region configuration.
            actions.push(RaftAction::Send(RaftMessage::Leadership(
                self.local.clone(),
            )));
        }
        actions
    }

    fn leader_announced(
        &mut self,
        node: Node,
        number_servers: u64,
        term: u64,
    ) -> Vec<RaftAction> {
        if self.role == RaftRole::Leader {
            if node == self.local {
                return Vec::new();
            }
            tracing::error!(other = %node, "conflicting leader announcement, resetting");
            return self.reset();
        }
        self.role = RaftRole::Follower;
        self.number_servers = number_servers.max(1) as usize;
        self.term = term;
        if self.leader.as_ref() != Some(&node) {
            tracing::info!(
                region = self.local.region,
                leader = %node,
                term,
                "raft: new leader for region"
            );
            self.leader = Some(node);
        }
        vec![RaftAction::ResetElectionTimer]
    }

    fn leadership_requested(&mut self) -> Vec<RaftAction> {
        if self.role != RaftRole::Leader {
            return Vec::new();
        }
        vec![RaftAction::Send(RaftMessage::Leader {
            node: self.local.clone(),
            number_servers: self.number_servers as u64,
            term: self.term,
        })]
    }

    fn reset(&mut self) -> Vec<RaftAction> {
        self.role = RaftRole::Follower;
        self.votes = 0;
        self.voted_for = None;
        self.leader = None;
        vec![
            RaftAction::StopLeaderHeartbeat,
            RaftAction::ResetElectionTimer,
        ]
    }
}
