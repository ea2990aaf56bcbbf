use xapiand_replication::frame::{get_varint, put_varint};
use xapiand_replication::serial::{put_string, Reader};

use crate::error::{Error, Result};
use crate::node::Node;

pub const DISCOVERY_PROTOCOL_MAJOR_VERSION: u8 = 1;
pub const DISCOVERY_PROTOCOL_MINOR_VERSION: u8 = 0;

/// Gossip datagrams. Codes are the first byte on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryMessage {
    Heartbeat(Node),
    Hello(Node),
    Wave(Node),
    Sneer(Node),
    Enter(Node),
    Bye(Node),
    DbUpdated {
        mastery_level: i64,
        path: String,
        node: Node,
    },
}

impl DiscoveryMessage {
    pub fn code(&self) -> u8 {
        match self {
            Self::Heartbeat(_) => 0,
            Self::Hello(_) => 1,
            Self::Wave(_) => 2,
            Self::Sneer(_) => 3,
            Self::Enter(_) => 4,
            Self::Bye(_) => 5,
            Self::DbUpdated { .. } => 6,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Heartbeat(_) => "HEARTBEAT",
            Self::Hello(_) => "HELLO",
            Self::Wave(_) => "WAVE",
            Self::Sneer(_) => "SNEER",
            Self::Enter(_) => "ENTER",
            Self::Bye(_) => "BYE",
            Self::DbUpdated { .. } => "DB_UPDATED",
        }
    }

    pub fn node(&self) -> &Node {
        match self {
            Self::Heartbeat(node)
            | Self::Hello(node)
            | Self::Wave(node)
            | Self::Sneer(node)
            | Self::Enter(node)
            | Self::Bye(node) => node,
            Self::DbUpdated { node, .. } => node,
        }
    }

    /// Datagram layout: `{msg_type, ver_major, ver_minor, cluster_name
    /// (varint-prefixed), payload}`.
    pub fn encode(&self, cluster_name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.code());
        buf.push(DISCOVERY_PROTOCOL_MAJOR_VERSION);
        buf.push(DISCOVERY_PROTOCOL_MINOR_VERSION);
        put_string(&mut buf, cluster_name.as_bytes());
        match self {
            Self::DbUpdated {
                mastery_level,
                path,
                node,
            } => {
                put_varint(&mut buf, *mastery_level as u64);
                put_string(&mut buf, path.as_bytes());
                buf.extend_from_slice(&node.serialize());
            }
            other => buf.extend_from_slice(&other.node().serialize()),
        }
        buf
    }

    /// Decodes a datagram, silently-droppable errors included: a
    /// foreign cluster name yields `ClusterNameMismatch`.
    pub fn decode(datagram: &[u8], cluster_name: &str) -> Result<Self> {
        if datagram.len() < 3 {
            return Err(Error::BadMessage("discovery datagram too short".into()));
        }
        let code = datagram[0];
        let major = datagram[1];
        if major != DISCOVERY_PROTOCOL_MAJOR_VERSION {
            return Err(Error::ProtocolVersionMismatch {
                found: major,
                expected: DISCOVERY_PROTOCOL_MAJOR_VERSION,
            });
        }
        let mut reader = Reader::new(&datagram[3..]);
        let name = reader
            .string()
            .map_err(|err| Error::BadMessage(err.to_string()))?;
        if name != cluster_name.as_bytes() {
            return Err(Error::ClusterNameMismatch);
        }

        let message = match code {
            6 => {
                let rest = reader.remaining();
                let (mastery, consumed) =
                    get_varint(rest).map_err(|err| Error::BadMessage(err.to_string()))?;
                let mut reader = Reader::new(&rest[consumed..]);
                let path = std::str::from_utf8(
                    reader
                        .string()
                        .map_err(|err| Error::BadMessage(err.to_string()))?,
                )
                .map_err(|_| Error::BadMessage("path is not utf-8".into()))?
                .to_owned();
                let node = Node::deserialize(&mut reader)
                    .map_err(|err| Error::BadMessage(err.to_string()))?;
                Self::DbUpdated {
                    mastery_level: mastery as i64,
                    path,
                    node,
                }
            }
            code @ 0..=5 => {
                let node = Node::deserialize(&mut reader)
                    .map_err(|err| Error::BadMessage(err.to_string()))?;
                match code {
                    0 => Self::Heartbeat(node),
                    1 => Self::Hello(node),
                    2 => Self::Wave(node),
                    3 => Self::Sneer(node),
                    4 => Self::Enter(node),
                    _ => Self::Bye(node),
                }
            }
            other => {
                return Err(Error::BadMessage(format!(
                    "unknown discovery message type {other}"
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
            DiscoveryMessage::Heartbeat(node.clone()),
            DiscoveryMessage::Hello(node.clone()),
            DiscoveryMessage::Wave(node.clone()),
            DiscoveryMessage::Sneer(node.clone()),
            DiscoveryMessage::Enter(node.clone()),
            DiscoveryMessage::Bye(node.clone()),
            DiscoveryMessage::DbUpdated {
                mastery_level: 7,
                path: "/idx/books".into(),
                node,
            },
        ];
        for message in messages {
            let encoded = message.encode("Xapiand");
            let decoded = DiscoveryMessage::decode(&encoded, "Xapiand").unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn foreign_cluster_is_rejected() {
        let message = DiscoveryMessage::Hello(Node::new("alpha", "h"));
        let encoded = message.encode("cluster-a");
        assert!(matches!(
            DiscoveryMessage::decode(&encoded, "cluster-b"),
            Err(Error::ClusterNameMismatch)
        ));
    }

    #[test]
    fn probe_mastery_survives_round_trip() {
        let message = DiscoveryMessage::DbUpdated {
            mastery_level: -1,
            path: "/idx".into(),
            node: Node::new("alpha", "h"),
        };
        let decoded =
            DiscoveryMessage::decode(&message.encode("Xapiand"), "Xapiand").unwrap();
        assert_eq!(decoded, message);
    }
}
