//! Consistent-hash selection of servers for a key.
//!
//! Every server is placed on a hash ring at [`NODE_WEIGHT`] points. A key is
//! hashed onto the same ring and the ring is walked clockwise, collecting
//! distinct servers, which yields a full ranking of the servers for that key.
//! The first entry is the key's home server; the rest are its failover order.
//!
//! Hashes come from SHA-256 so the mapping is identical across processes,
//! platforms and releases. Caches stay warm across restarts.

use sha2::{Digest, Sha256};

use crate::config::ServerSpec;

/// Virtual points per server on the ring.
pub const NODE_WEIGHT: usize = 100;

/// Position of `data` on the ring.
pub(crate) fn ring_hash(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// The key as sent on the wire: lowercase hex SHA-256 of the caller's key.
///
/// Always 64 characters of `[0-9a-f]`, so any caller key is a valid
/// memcached key.
pub fn wire_key(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

/// Maps keys to an ordered list of server indices.
#[derive(Debug, Clone)]
pub struct KeySelector {
    /// (point, server index), sorted by point.
    points: Vec<(u64, usize)>,
    servers: usize,
}

impl KeySelector {
    /// Build the ring for `servers`. Indices returned by [`candidates`]
    /// refer to positions in this slice.
    ///
    /// [`candidates`]: KeySelector::candidates
    pub fn new(servers: &[ServerSpec]) -> Self {
        let mut points = Vec::with_capacity(servers.len() * NODE_WEIGHT);
        for (idx, server) in servers.iter().enumerate() {
            for i in 0..NODE_WEIGHT {
                let point = ring_hash(format!("{}-{}", server, i).as_bytes());
                points.push((point, idx));
            }
        }
        points.sort_unstable();

        Self {
            points,
            servers: servers.len(),
        }
    }

    /// Number of servers on the ring.
    pub fn len(&self) -> usize {
        self.servers
    }

    pub fn is_empty(&self) -> bool {
        self.servers == 0
    }

    /// Rank every server for `key`, most preferred first.
    pub fn candidates(&self, key: &str) -> Vec<usize> {
        let mut ranked = Vec::with_capacity(self.servers);
        if self.points.is_empty() {
            return ranked;
        }

        let hash = ring_hash(key.as_bytes());
        let start = self.points.partition_point(|&(point, _)| point <= hash);

        let (tail, head) = self.points.split_at(start);
        for &(_, idx) in head.iter().chain(tail) {
            if !ranked.contains(&idx) {
                ranked.push(idx);
                if ranked.len() == self.servers {
                    break;
                }
            }
        }
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn servers(n: usize) -> Vec<ServerSpec> {
        (1..=n)
            .map(|i| ServerSpec::new(format!("10.0.0.{}", i), 11211))
            .collect()
    }

    #[test]
    fn test_deterministic() {
        let selector = KeySelector::new(&servers(4));
        assert_eq!(selector.candidates("user:123"), selector.candidates("user:123"));

        // a fresh ring over the same servers agrees
        let again = KeySelector::new(&servers(4));
        assert_eq!(selector.candidates("user:123"), again.candidates("user:123"));
    }

    #[test]
    fn test_single_server() {
        let selector = KeySelector::new(&servers(1));
        assert_eq!(selector.candidates("anything"), vec![0]);
    }

    #[test]
    fn test_empty_ring() {
        let selector = KeySelector::new(&[]);
        assert!(selector.is_empty());
        assert!(selector.candidates("key").is_empty());
    }

    #[test]
    fn test_distribution() {
        let selector = KeySelector::new(&servers(4));
        let mut counts = [0u32; 4];
        for i in 0..10_000 {
            let home = selector.candidates(&format!("key_{}", i))[0];
            counts[home] += 1;
        }
        // each server gets a reasonable share (virtual nodes smooth it out)
        for count in counts {
            assert!(count > 1_500, "uneven distribution: {:?}", counts);
        }
    }

    #[test]
    fn test_adding_server_moves_few_keys() {
        let before = KeySelector::new(&servers(4));
        let after = KeySelector::new(&servers(5));

        let moved = (0..10_000)
            .filter(|i| {
                let key = format!("key_{}", i);
                before.candidates(&key)[0] != after.candidates(&key)[0]
            })
            .count();

        // ideal is 1/5 of the keys
        assert!(moved < 3_500, "moved {} keys", moved);
    }

    #[test]
    fn test_wire_key_shape() {
        let key = wire_key("a key with spaces and ünïcode");
        assert_eq!(key.len(), 64);
        assert!(key.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
        assert_eq!(key, wire_key("a key with spaces and ünïcode"));
    }

    proptest! {
        #[test]
        fn prop_candidates_rank_every_server_once(key in ".*", n in 1usize..8) {
            let selector = KeySelector::new(&servers(n));
            let mut ranked = selector.candidates(&key);
            prop_assert_eq!(ranked.len(), n);
            ranked.sort_unstable();
            prop_assert_eq!(ranked, (0..n).collect::<Vec<_>>());
        }
    }
}
