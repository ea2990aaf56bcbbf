use std::fmt;
use std::time::{Duration, SystemTime};

use xapiand_replication::error::{Error as WireError, Result as WireResult};
use xapiand_replication::serial::{put_string, Reader};

/// A member of the cluster. Names are unique case-insensitively; the
/// original casing is preserved for display.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub host: String,
    pub http_port: u16,
    pub binary_port: u16,
    pub region: i32,
    /// Last time any discovery traffic refreshed this node.
    pub touched: SystemTime,
    /// Regions known cluster-wide; -1 until recomputed.
    pub regions: i32,
}

impl Node {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            http_port: crate::HTTP_SERVERPORT,
            binary_port: crate::BINARY_SERVERPORT,
            region: 0,
            touched: SystemTime::now(),
            regions: -1,
        }
    }

    pub fn lower_name(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn is_stalled(&self, now: SystemTime, heartbeat_max: Duration) -> bool {
        match now.duration_since(self.touched) {
            Ok(idle) => idle > heartbeat_max,
            Err(_) => false,
        }
    }

    /// Discovery payload: `{name, host, http_port, binary_port,
    /// region}` with length-prefixed strings and little-endian ports.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_string(&mut buf, self.name.as_bytes());
        put_string(&mut buf, self.host.as_bytes());
        buf.extend_from_slice(&self.http_port.to_le_bytes());
        buf.extend_from_slice(&self.binary_port.to_le_bytes());
        buf.extend_from_slice(&self.region.to_le_bytes());
        buf
    }

    pub fn deserialize(reader: &mut Reader<'_>) -> WireResult<Self> {
        let name = string(reader)?;
        let host = string(reader)?;
        let http_port = u16::from_le_bytes([reader.u8()?, reader.u8()?]);
        let binary_port = u16::from_le_bytes([reader.u8()?, reader.u8()?]);
        let region = i32::from_le_bytes([
            reader.u8()?,
            reader.u8()?,
            reader.u8()?,
            reader.u8()?,
        ]);
        Ok(Self {
            name,
            host,
            http_port,
            binary_port,
            region,
            touched: SystemTime::now(),
            regions: -1,
        })
    }
}

fn string(reader: &mut Reader<'_>) -> WireResult<String> {
    std::str::from_utf8(reader.string()?)
        .map(str::to_owned)
        .map_err(|_| WireError::BadMessage("node field is not utf-8"))
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.lower_name() == other.lower_name()
            && self.host == other.host
            && self.http_port == other.http_port
            && self.binary_port == other.binary_port
    }
}

impl Eq for Node {}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.host, self.binary_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_round_trip() {
        let mut node = Node::new("Alpha", "10.0.0.7");
        node.region = 3;
        let buf = node.serialize();
        let mut reader = Reader::new(&buf);
        let decoded = Node::deserialize(&mut reader).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(decoded.region, 3);
    }

    #[test]
    fn equality_is_case_insensitive_on_name() {
        let a = Node::new("Alpha", "10.0.0.7");
        let b = Node::new("alpha", "10.0.0.7");
        assert_eq!(a, b);
        let c = Node::new("alpha", "10.0.0.8");
        assert_ne!(a, c);
    }

    #[test]
    fn stalled_after_heartbeat_max() {
        let mut node = Node::new("n", "h");
        let now = SystemTime::now();
        node.touched = now - Duration::from_secs(10);
        assert!(node.is_stalled(now, Duration::from_secs(4)));
        assert!(!node.is_stalled(now, Duration::from_secs(20)));
    }
}
