//! The memcached ring client.
//!
//! A [`Ring`] owns one slot per configured server: a connection pool and an
//! error limiter. Every operation ranks the servers for its key with the
//! [`KeySelector`], skips those whose breaker is open, and tries the rest in
//! order until one answers or `tries` attempts have been spent.
//!
//! Operations never fail because a backend is unavailable. Reads degrade to
//! a miss, writes to `false`, counters to `None`; the failure is logged and
//! counted instead.
//!
//! ```no_run
//! use memcache_ring::{Options, Ring, ServerSpec};
//! use std::time::Duration;
//!
//! # async fn demo() -> memcache_ring::RingResult<()> {
//! let options = Options::new()
//!     .servers(ServerSpec::parse_list("10.0.0.1:11211,10.0.0.2:11211")?)
//!     .build();
//! let ring = Ring::new(options)?;
//!
//! ring.set("greeting", "hello", Some(Duration::from_secs(60))).await;
//! if let Some(value) = ring.get("greeting").await {
//!     println!("{:?}", value);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::codec::{exptime, CacheEntry, CacheValue};
use crate::config::{Options, ServerSpec};
use crate::error::{RingError, RingResult};
use crate::limiter::{BreakerState, ErrorLimiter};
use crate::pool::ConnectionPool;
use crate::protocol::{Request, Response};
use crate::selector::{wire_key, KeySelector};
use crate::stats::{RingStats, StatsSnapshot};
use crate::tls;

/// Everything the ring keeps for one server.
#[derive(Debug)]
struct ServerSlot {
    spec: ServerSpec,
    pool: ConnectionPool,
    limiter: ErrorLimiter,
}

/// Outcome of trying one server.
enum Attempt {
    Done(Response),
    Failed(RingError),
    /// The breaker was open; nothing was sent.
    Suppressed,
}

/// A client for a ring of memcached servers.
///
/// Share it between tasks with an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct Ring {
    /// Keyed by `host:port`, in configuration order.
    servers: IndexMap<String, ServerSlot>,
    selector: KeySelector,
    stats: RingStats,
    options: Options,
}

impl Ring {
    /// Build the ring. Fails only when the TLS context cannot be created.
    pub fn new(options: Options) -> RingResult<Self> {
        let connector = options.get_tls().map(tls::connector).transpose()?;

        let mut servers = IndexMap::with_capacity(options.get_servers().len());
        for spec in options.get_servers() {
            let addr = spec.to_string();
            if servers.contains_key(&addr) {
                debug!(server = %addr, "ignoring duplicate server");
                continue;
            }
            let slot = ServerSlot {
                spec: spec.clone(),
                pool: ConnectionPool::new(spec.clone(), &options, connector.clone()),
                limiter: ErrorLimiter::new(
                    options.get_error_suppression_limit(),
                    options.get_error_suppression_interval(),
                    options.get_error_suppression_duration(),
                ),
            };
            servers.insert(addr, slot);
        }

        let specs: Vec<ServerSpec> = servers.values().map(|slot| slot.spec.clone()).collect();
        let selector = KeySelector::new(&specs);

        debug!(
            servers = servers.len(),
            tries = options.get_tries(),
            tls = connector.is_some(),
            "memcache ring ready"
        );

        Ok(Self {
            servers,
            selector,
            stats: RingStats::new(),
            options,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Servers in configuration order, without duplicates.
    pub fn servers(&self) -> impl Iterator<Item = &ServerSpec> {
        self.servers.values().map(|slot| &slot.spec)
    }

    /// Servers in the order they would be tried for `key`.
    pub fn candidates(&self, key: &str) -> Vec<&ServerSpec> {
        self.selector
            .candidates(key)
            .into_iter()
            .filter_map(|idx| self.servers.get_index(idx))
            .map(|(_, slot)| &slot.spec)
            .collect()
    }

    /// Whether the breaker of `server` (`host:port`) is open.
    /// Unknown servers are never suppressed.
    pub fn is_suppressed(&self, server: &str) -> bool {
        self.servers
            .get(server)
            .is_some_and(|slot| slot.limiter.is_suppressed())
    }

    /// Breaker state of `server` (`host:port`), or `None` if it is not in
    /// the ring.
    pub fn breaker_state(&self, server: &str) -> Option<BreakerState> {
        self.servers.get(server).map(|slot| slot.limiter.state())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Fetch `key`. Misses, undecodable entries and unreachable servers all
    /// yield `None`.
    pub async fn get(&self, key: &str) -> Option<CacheValue> {
        let wire = wire_key(key);
        let request = Request::Get {
            keys: vec![wire.clone()],
        };

        let value = match self.execute(key, &request).await {
            Some(Response::Values(found)) => found
                .into_iter()
                .find(|(k, _)| *k == wire)
                .and_then(|(_, entry)| self.decode(key, &entry)),
            _ => None,
        };
        self.record_read(value.is_some());
        value
    }

    /// Fetch `key` and deserialize it.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match value.to_json() {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(key, error = %e, "cached value does not match the requested type");
                None
            }
        }
    }

    /// Fetch several keys from the server chosen by `server_key`, in one
    /// round trip. Results line up with `keys`.
    pub async fn get_multi<K: AsRef<str>>(&self, server_key: &str, keys: &[K]) -> Vec<Option<CacheValue>> {
        // a bare `get` is a protocol error on the server side
        if keys.is_empty() {
            return Vec::new();
        }
        let wires: Vec<String> = keys.iter().map(|k| wire_key(k.as_ref())).collect();
        let request = Request::Get { keys: wires.clone() };

        let found: HashMap<String, CacheEntry> = match self.execute(server_key, &request).await {
            Some(Response::Values(found)) => found.into_iter().collect(),
            _ => HashMap::new(),
        };

        keys.iter()
            .zip(&wires)
            .map(|(key, wire)| {
                let value = found
                    .get(wire)
                    .and_then(|entry| self.decode(key.as_ref(), entry));
                self.record_read(value.is_some());
                value
            })
            .collect()
    }

    /// Store `value` under `key`. `ttl` of `None` never expires, and a TTL
    /// under one second is rounded up to one second.
    pub async fn set(&self, key: &str, value: impl Into<CacheValue>, ttl: Option<Duration>) -> bool {
        let entry = match self.encode(key, &value.into()) {
            Some(entry) => entry,
            None => return false,
        };
        let request = Request::Store {
            items: vec![(wire_key(key), entry)],
            exptime: exptime(ttl),
            only_if_absent: false,
        };
        self.store(key, &request).await
    }

    /// Serialize `value` as JSON and store it.
    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        match CacheValue::json(value) {
            Ok(value) => self.set(key, value, ttl).await,
            Err(e) => {
                warn!(key, error = %e, "failed to serialize value");
                false
            }
        }
    }

    /// Store several entries on the server chosen by `server_key`, in one
    /// round trip. Returns `true` only if every entry was stored.
    pub async fn set_multi<K, V, I>(&self, server_key: &str, entries: I, ttl: Option<Duration>) -> bool
    where
        K: AsRef<str>,
        V: Into<CacheValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut items = Vec::new();
        for (key, value) in entries {
            let key = key.as_ref();
            match self.encode(key, &value.into()) {
                Some(entry) => items.push((wire_key(key), entry)),
                None => return false,
            }
        }
        if items.is_empty() {
            return true;
        }

        let request = Request::Store {
            items,
            exptime: exptime(ttl),
            only_if_absent: false,
        };
        self.store(server_key, &request).await
    }

    /// Remove `key`. A key that was already gone counts as deleted.
    pub async fn delete(&self, key: &str) -> bool {
        let request = Request::Delete { key: wire_key(key) };
        match self.execute(key, &request).await {
            Some(Response::Deleted(_)) => {
                self.stats.record_delete();
                true
            }
            _ => false,
        }
    }

    /// Add `delta` to the counter at `key`, creating it at `delta`.
    pub async fn incr(&self, key: &str, delta: u64, ttl: Option<Duration>) -> Option<u64> {
        self.arith(key, delta, false, ttl).await
    }

    /// Subtract `delta` from the counter at `key`, flooring at zero.
    /// A missing counter is created at zero.
    pub async fn decr(&self, key: &str, delta: u64, ttl: Option<Duration>) -> Option<u64> {
        self.arith(key, delta, true, ttl).await
    }

    async fn arith(&self, key: &str, delta: u64, decrement: bool, ttl: Option<Duration>) -> Option<u64> {
        let request = Request::Arith {
            key: wire_key(key),
            delta,
            decrement,
            exptime: exptime(ttl),
        };
        match self.execute(key, &request).await {
            Some(Response::Counter(value)) => Some(value),
            _ => None,
        }
    }

    async fn store(&self, key: &str, request: &Request) -> bool {
        match self.execute(key, request).await {
            Some(Response::Stored(true)) => {
                self.stats.record_set();
                true
            }
            Some(Response::Stored(false)) => {
                debug!(key, "server declined to store");
                false
            }
            _ => false,
        }
    }

    /// Run `request` against the servers ranked for `key`.
    async fn execute(&self, key: &str, request: &Request) -> Option<Response> {
        let command = request.command();
        let mut attempts = 0;

        for idx in self.selector.candidates(key) {
            if attempts >= self.options.get_tries() {
                break;
            }
            let Some((addr, slot)) = self.servers.get_index(idx) else {
                continue;
            };

            match self.attempt(slot, request).await {
                Attempt::Done(response) => {
                    debug!(server = %addr, %command, "request served");
                    return Some(response);
                }
                Attempt::Suppressed => {
                    self.stats.record_suppressed();
                    debug!(server = %addr, %command, "skipping suppressed server");
                }
                Attempt::Failed(e) => {
                    attempts += 1;
                    self.stats.record_failure();
                    debug!(server = %addr, %command, error = %e, "request failed");
                    if slot.limiter.record_failure() {
                        error!(
                            server = %addr,
                            limit = self.options.get_error_suppression_limit(),
                            duration = ?self.options.get_error_suppression_duration(),
                            "error limit reached, suppressing server"
                        );
                    }
                }
            }
        }

        self.stats.record_degraded();
        warn!(key, %command, attempts, "all memcached servers failed");
        None
    }

    async fn attempt(&self, slot: &ServerSlot, request: &Request) -> Attempt {
        if slot.limiter.is_suppressed() {
            return Attempt::Suppressed;
        }

        let mut conn = match slot.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => return Attempt::Failed(e),
        };
        let mut result = conn.execute(request).await;

        // a reused connection may have been closed by the server while idle
        if conn.is_reused() && result.as_ref().is_err_and(RingError::is_disconnect) {
            debug!(server = %slot.spec, "pooled connection was closed, reconnecting");
            conn = match slot.pool.reconnect(conn).await {
                Ok(conn) => conn,
                Err(e) => return Attempt::Failed(e),
            };
            result = conn.execute(request).await;
        }

        match result {
            Ok(response) => {
                slot.pool.release(conn, true);
                Attempt::Done(response)
            }
            Err(e) => {
                slot.pool.release(conn, false);
                Attempt::Failed(e)
            }
        }
    }

    fn encode(&self, key: &str, value: &CacheValue) -> Option<CacheEntry> {
        let entry = match value.encode() {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "failed to encode value");
                return None;
            }
        };

        let threshold = self.options.get_item_size_warning_threshold();
        if entry.exceeds(threshold) {
            self.stats.record_oversized();
            warn!(key, size = entry.len(), threshold, "item size exceeds warning threshold");
        }
        Some(entry)
    }

    fn decode(&self, key: &str, entry: &CacheEntry) -> Option<CacheValue> {
        match entry.decode() {
            Ok(value) => Some(value),
            Err(RingError::UnsupportedFlags(flags)) => {
                warn!(key, flags, "ignoring entry with unsupported serialization");
                None
            }
            Err(e) => {
                warn!(key, error = %e, "failed to decode cached value");
                None
            }
        }
    }

    fn record_read(&self, hit: bool) {
        if hit {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
    }
}
