use xapiand_replication::serial::{put_bool, put_length, Reader};

use crate::error::{Error, Result};
use crate::node::Node;

pub const RAFT_PROTOCOL_MAJOR_VERSION: u8 = 1;
pub const RAFT_PROTOCOL_MINOR_VERSION: u8 = 0;

/// Election datagrams, multicast within a region.
#[derive(Debug, Clone, PartialEq)]
pub enum RaftMessage {
    /// Only the leader heartbeats its followers.
    HeartbeatLeader(Node),
    /// A candidate gathering votes.
    RequestVote { node: Node, term: u64 },
    /// Answer to a vote request; `node` is the candidate addressed.
    ResponseVote { node: Node, vote: bool, term: u64 },
    /// A leader announcing itself and its view of the region.
    Leader {
        node: Node,
        number_servers: u64,
        term: u64,
    },
    /// Ask the leader to re-announce.
    Leadership(Node),
    /// Force the named node back to follower.
    Reset(Node),
}

impl RaftMessage {
    pub fn code(&self) -> u8 {
        match self {
            Self::HeartbeatLeader(_) => 0,
            Self::RequestVote { .. } => 1,
            Self::ResponseVote { .. } => 2,
            Self::Leader { .. } => 3,
            Self::Leadership(_) => 4,
            Self::Reset(_) => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::HeartbeatLeader(_) => "HEARTBEAT_LEADER",
            Self::RequestVote { .. } => "REQUEST_VOTE",
            Self::ResponseVote { .. } => "RESPONSE_VOTE",
            Self::Leader { .. } => "LEADER",
            Self::Leadership(_) => "LEADERSHIP",
            Self::Reset(_) => "RESET",
        }
    }

    pub fn node(&self) -> &Node {
        match self {
            Self::HeartbeatLeader(node)
            | Self::Leadership(node)
            | Self::Reset(node) => node,
            Self::RequestVote { node, .. }
            | Self::ResponseVote { node, .. }
            | Self::Leader { node, .. } => node,
        }
    }

    pub fn encode(&self, cluster_name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.code());
        buf.push(RAFT_PROTOCOL_MAJOR_VERSION);
        buf.push(RAFT_PROTOCOL_MINOR_VERSION);
        xapiand_replication::serial::put_string(&mut buf, cluster_name.as_bytes());
        buf.extend_from_slice(&self.node().serialize());
        match self {
            Self::RequestVote { term, .. } => put_length(&mut buf, *term),
            Self::ResponseVote { vote, term, .. } => {
                put_bool(&mut buf, *vote);
                put_length(&mut buf, *term);
            }
            Self::Leader {
                number_servers,
                term,
                ..
            } => {
                put_length(&mut buf, *number_servers);
                put_length(&mut buf, *term);
            }
            _ => {}
        }
        buf
    }

    pub fn decode(datagram: &[u8], cluster_name: &str) -> Result<Self> {
        if datagram.len() < 3 {
            return Err(Error::BadMessage("raft datagram too short".into()));
        }
        let code = datagram[0];
        if datagram[1] != RAFT_PROTOCOL_MAJOR_VERSION {
            return Err(Error::ProtocolVersionMismatch {
                found: datagram[1],
                expected: RAFT_PROTOCOL_MAJOR_VERSION,
            });
        }
        let mut reader = Reader::new(&datagram[3..]);
        let name = reader
            .string()
            .map_err(|err| Error::BadMessage(err.to_string()))?;
        if name != cluster_name.as_bytes() {
            return Err(Error::ClusterNameMismatch);
        }
        let node = Node::deserialize(&mut reader)
            .map_err(|err| Error::BadMessage(err.to_string()))?;
        let bad = |err: xapiand_replication::Error| Error::BadMessage(err.to_string());
        let message = match code {
            0 => Self::HeartbeatLeader(node),
            1 => Self::RequestVote {
                node,
                term: reader.length().map_err(bad)?,
            },
            2 => Self::ResponseVote {
                node,
                vote: reader.bool().map_err(bad)?,
                term: reader.length().map_err(bad)?,
            },
            3 => Self::Leader {
                node,
                number_servers: reader.length().map_err(bad)?,
                term: reader.length().map_err(bad)?,
            },
            4 => Self::Leadership(node),
            5 => Self::Reset(node),
            other => {
                return Err(Error::BadMessage(format!(
                    "unknown raft message type {other}"
                )))
            }
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_kinds() {
        let node = Node::new("alpha", "10.0.0.1");
        let messages = vec![
            RaftMessage::HeartbeatLeader(node.clone()),
            RaftMessage::RequestVote {
                node: node.clone(),
                term: 4,
            },
            RaftMessage::ResponseVote {
                node: node.clone(),
                vote: true,
                term: 4,
            },
            RaftMessage::Leader {
                node: node.clone(),
                number_servers: 5,
                term: 4,
            },
            RaftMessage::Leadership(node.clone()),
            RaftMessage::Reset(node),
        ];
        for message in messages {
            let decoded =
                RaftMessage::decode(&message.encode("Xapiand"), "Xapiand").unwrap();
            assert_eq!(decoded, message);
        }
    }
}
