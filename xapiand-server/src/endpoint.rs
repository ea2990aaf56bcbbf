use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::node::Node;
use crate::BINARY_SERVERPORT;

/// A reference to one shard, possibly on a remote node. Two endpoints
/// are the same shard iff `(host, port, path)` match; mastery and node
/// name are advisory.
#[derive(Debug, Clone, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub mastery_level: i64,
    pub node_name: String,
}

impl Endpoint {
    /// A shard on this node, addressed only by path.
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            scheme: "file".into(),
            host: String::new(),
            port: 0,
            path: normalize_path(path.into()),
            mastery_level: 0,
            node_name: String::new(),
        }
    }

    /// The same shard path on a remote node.
    pub fn on_node(path: impl Into<String>, node: &Node) -> Self {
        Self {
            scheme: "xapian".into(),
            host: node.host.clone(),
            port: node.binary_port,
            path: normalize_path(path.into()),
            mastery_level: 0,
            node_name: node.name.clone(),
        }
    }

    pub fn with_mastery(mut self, mastery_level: i64) -> Self {
        self.mastery_level = mastery_level;
        self
    }

    pub fn is_local(&self) -> bool {
        self.host.is_empty()
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.path == other.path
    }
}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.path.hash(state);
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.host, self.port, &self.path).cmp(&(&other.host, other.port, &other.path))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            write!(f, "{}", self.path)?;
        } else {
            write!(f, "xapian://{}:{}{}", self.host, self.port, self.path)?;
        }
        if self.mastery_level != 0 {
            write!(f, "?mastery={}", self.mastery_level)?;
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parses `[xapian://]host[:port]/path[?mastery=N]`. A string
    /// starting with `/` is a local shard path.
    fn from_str(input: &str) -> Result<Self> {
        let (body, mastery_level) = match input.split_once('?') {
            Some((body, query)) => {
                let mastery = query
                    .strip_prefix("mastery=")
                    .ok_or_else(|| Error::InvalidArgument(format!("bad endpoint query: {query}")))?
                    .parse::<i64>()
                    .map_err(|_| Error::InvalidArgument(format!("bad mastery in: {input}")))?;
                (body, mastery)
            }
            None => (input, 0),
        };

        if body.is_empty() {
            return Err(Error::InvalidArgument("empty endpoint".into()));
        }
        if body.starts_with('/') {
            return Ok(Endpoint::local(body).with_mastery(mastery_level));
        }

        let rest = body.strip_prefix("xapian://").unwrap_or(body);
        let slash = rest
            .find('/')
            .ok_or_else(|| Error::InvalidArgument(format!("endpoint has no path: {input}")))?;
        let (authority, path) = rest.split_at(slash);
        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| Error::InvalidArgument(format!("bad port in: {input}")))?,
            ),
            None => (authority, BINARY_SERVERPORT),
        };
        if host.is_empty() {
            return Err(Error::InvalidArgument(format!("endpoint has no host: {input}")));
        }
        Ok(Self {
            scheme: "xapian".into(),
            host: host.to_owned(),
            port,
            path: normalize_path(path.to_owned()),
            mastery_level,
            node_name: String::new(),
        })
    }
}

fn normalize_path(mut path: String) -> String {
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    if !path.starts_with('/') {
        path.insert(0, '/');
    }
    path
}

/// An ordered shard group. The pool keys on a stable hash over the
/// sorted members plus the writable flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    inner: Vec<Endpoint>,
}

impl Endpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(endpoint: Endpoint) -> Self {
        Self {
            inner: vec![endpoint],
        }
    }

    pub fn add(&mut self, endpoint: Endpoint) {
        self.inner.push(endpoint);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Endpoint> {
        self.inner.iter()
    }

    pub fn first(&self) -> Option<&Endpoint> {
        self.inner.first()
    }

    /// Stable pool key: hash of the sorted `(host, port, path)` triples
    /// plus the writable flag.
    pub fn key_hash(&self, writable: bool) -> u64 {
        let mut sorted: Vec<&Endpoint> = self.inner.iter().collect();
        sorted.sort();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for endpoint in sorted {
            endpoint.hash(&mut hasher);
        }
        writable.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for endpoint in &self.inner {
            if !first {
                write!(f, ";")?;
            }
            write!(f, "{endpoint}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromIterator<Endpoint> for Endpoints {
    fn from_iter<T: IntoIterator<Item = Endpoint>>(iter: T) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Endpoints {
    type Item = &'a Endpoint;
    type IntoIter = std::slice::Iter<'a, Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}
