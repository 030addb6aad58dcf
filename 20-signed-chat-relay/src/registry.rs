use std::{collections::HashMap, fmt, net::SocketAddr};

/// Stable handle for an accepted stream connection, independent of the
/// socket type that backs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Where an identity can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Stream(ConnectionId),
    Datagram(SocketAddr),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Stream(id) => write!(f, "tcp/{id}"),
            Endpoint::Datagram(addr) => write!(f, "udp/{addr}"),
        }
    }
}

/// Bidirectional name <-> endpoint map spanning both transports.
///
/// Every name maps to exactly one endpoint and every endpoint to at most one
/// name; both maps are always updated together.
#[derive(Debug, Default)]
pub struct Registry {
    by_name: HashMap<String, Endpoint>,
    by_endpoint: HashMap<Endpoint, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `name` at `endpoint`. Returns false without touching anything
    /// if the name is empty, the name is taken on either transport, or the
    /// endpoint already carries an identity.
    pub fn register(&mut self, name: &str, endpoint: Endpoint) -> bool {
        if name.is_empty()
            || self.by_name.contains_key(name)
            || self.by_endpoint.contains_key(&endpoint)
        {
            return false;
        }
        self.by_name.insert(name.to_string(), endpoint);
        self.by_endpoint.insert(endpoint, name.to_string());
        true
    }

    /// Removes `name` everywhere. Unknown names are a no-op.
    pub fn unregister(&mut self, name: &str) -> Option<Endpoint> {
        let endpoint = self.by_name.remove(name)?;
        self.by_endpoint.remove(&endpoint);
        Some(endpoint)
    }

    pub fn resolve(&self, name: &str) -> Option<Endpoint> {
        self.by_name.get(name).copied()
    }

    pub fn identity_of(&self, endpoint: &Endpoint) -> Option<&str> {
        self.by_endpoint.get(endpoint).map(String::as_str)
    }

    /// All registered names in sorted order.
    pub fn roster(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Current membership, for fan-out.
    pub fn members(&self) -> impl Iterator<Item = (&str, Endpoint)> {
        self.by_name
            .iter()
            .map(|(name, endpoint)| (name.as_str(), *endpoint))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
