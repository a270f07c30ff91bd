//! Base (C3): a collection of MemCaches sharing one snapshot endpoint, one
//! publisher endpoint, one collector endpoint, and one peer-subscriber
//! endpoint (spec.md §4.3).

use crate::memcache::MemCache;
use std::collections::HashMap;

/// A Base owns a set of MemCache partitions and the port numbering that
/// derives the publisher/collector ports from its snapshot port.
pub struct Base {
    base_id: String,
    port: u16,
    peer: u16,
    memcaches: HashMap<String, MemCache>,
}

impl Base {
    /// Construct a Base from its configured id, local snapshot port, peer
    /// snapshot port, and the MemCaches it hosts.
    pub fn new(base_id: impl Into<String>, port: u16, peer: u16, memcaches: Vec<MemCache>) -> Self {
        let mut map = HashMap::new();
        for mc in memcaches {
            map.insert(mc.cache_id().to_string(), mc);
        }
        Self {
            base_id: base_id.into(),
            port,
            peer,
            memcaches: map,
        }
    }

    /// This base's configured id.
    pub fn base_id(&self) -> &str {
        &self.base_id
    }

    /// Local snapshot/voting port.
    pub fn snapshot_port(&self) -> u16 {
        self.port
    }

    /// Peer's snapshot/voting port (used to reach the peer for snapshot
    /// bootstrap after a role transition to passive).
    pub fn peer_port(&self) -> u16 {
        self.peer
    }

    /// Publisher fan-out port: `port + 1`.
    pub fn publisher_port(&self) -> u16 {
        self.port + 1
    }

    /// Collector fan-in port: `port + 2`.
    pub fn collector_port(&self) -> u16 {
        self.port + 2
    }

    /// Peer's publisher port, for the peer-subscriber connection.
    pub fn peer_publisher_port(&self) -> u16 {
        self.peer + 1
    }

    /// Look up a MemCache by its cache id.
    pub fn memcache(&self, cache_id: &str) -> Option<&MemCache> {
        self.memcaches.get(cache_id)
    }

    /// Mutably look up a MemCache by its cache id.
    pub fn memcache_mut(&mut self, cache_id: &str) -> Option<&mut MemCache> {
        self.memcaches.get_mut(cache_id)
    }

    /// Iterate all MemCaches owned by this Base.
    pub fn memcaches(&self) -> impl Iterator<Item = &MemCache> {
        self.memcaches.values()
    }

    /// Mutably iterate all MemCaches owned by this Base.
    pub fn memcaches_mut(&mut self) -> impl Iterator<Item = &mut MemCache> {
        self.memcaches.values_mut()
    }
}

/// Byte-exact prefix match used for snapshot/update subtree filtering
/// (spec.md §4.5): `subtree` must equal the leading `len(subtree)` bytes
/// of `key`. An empty subtree matches everything.
pub fn subtree_matches(key: &[u8], subtree: &[u8]) -> bool {
    subtree.is_empty() || key.starts_with(subtree)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_derive_from_base_port() {
        let base = Base::new("A", 5561, 5661, vec![]);
        assert_eq!(base.publisher_port(), 5562);
        assert_eq!(base.collector_port(), 5563);
        assert_eq!(base.peer_publisher_port(), 5662);
    }

    #[test]
    fn subtree_match_is_byte_exact_prefix() {
        assert!(subtree_matches(b"/orders/1", b"/orders/"));
        assert!(!subtree_matches(b"/users/1", b"/orders/"));
        assert!(subtree_matches(b"anything", b""));
    }
}
