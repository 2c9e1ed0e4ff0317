//! Resolved client options.
//!
//! [`Options`] is the immutable value a [`Ring`](crate::Ring) is built from.
//! It is usually produced by the [`ConfigResolver`](crate::ConfigResolver),
//! but can also be assembled directly with the builder methods:
//!
//! ```
//! use memcache_ring::{Options, ServerSpec};
//! use std::time::Duration;
//!
//! let options = Options::new()
//!     .servers(vec![
//!         ServerSpec::new("10.0.0.1", 11211),
//!         ServerSpec::new("10.0.0.2", 11211),
//!     ])
//!     .max_connections(4)
//!     .io_timeout(Duration::from_millis(500))
//!     .build();
//!
//! // tries is clamped to the number of servers
//! assert_eq!(options.get_tries(), 2);
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RingError, RingResult};

/// Port used when a server address omits one.
pub const DEFAULT_PORT: u16 = 11211;

/// One configured cache server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerSpec {
    host: String,
    port: u16,
}

impl ServerSpec {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parse a comma-separated server list, skipping empty entries.
    pub fn parse_list(list: &str) -> RingResult<Vec<ServerSpec>> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for ServerSpec {
    type Err = RingError;

    /// Accepts `host:port`, `host`, `[v6addr]:port` and `[v6addr]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || RingError::InvalidServer(s.to_string());

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            match tail {
                "" => (host, None),
                _ => (host, Some(tail.strip_prefix(':').ok_or_else(invalid)?)),
            }
        } else {
            match s.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };
        Ok(ServerSpec::new(host, port))
    }
}

impl fmt::Display for ServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// TLS transport settings shared by every server's pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// CA bundle used to verify servers. `None` uses the bundled web roots.
    pub cafile: Option<PathBuf>,
    /// Client certificate chain, for servers requiring client auth.
    pub certfile: Option<PathBuf>,
    /// Private key for `certfile`. When unset the key is read from `certfile`.
    pub keyfile: Option<PathBuf>,
}

/// Immutable options for a ring client.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub(crate) servers: Vec<ServerSpec>,
    pub(crate) tries: usize,
    pub(crate) connect_timeout: Duration,
    pub(crate) pool_timeout: Duration,
    pub(crate) io_timeout: Duration,
    /// Idle pooled connections older than this are closed instead of reused.
    pub(crate) idle_timeout: Duration,
    pub(crate) max_connections: usize,
    pub(crate) error_suppression_limit: u32,
    pub(crate) error_suppression_interval: Duration,
    pub(crate) error_suppression_duration: Duration,
    /// `None` disables TLS.
    pub(crate) tls: Option<TlsSettings>,
    /// Negative values disable the size warning.
    pub(crate) item_size_warning_threshold: i64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            servers: vec![ServerSpec::new("127.0.0.1", DEFAULT_PORT)],
            tries: 3,
            connect_timeout: Duration::from_millis(300),
            pool_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(60),
            max_connections: 2,
            error_suppression_limit: 10,
            error_suppression_interval: Duration::from_secs(60),
            error_suppression_duration: Duration::from_secs(60),
            tls: None,
            item_size_warning_threshold: -1,
        }
    }
}

impl Options {
    /// Start from the built-in defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server list. An empty list keeps the current servers.
    pub fn servers(mut self, servers: Vec<ServerSpec>) -> Self {
        if !servers.is_empty() {
            self.servers = servers;
        }
        self
    }

    /// Maximum number of servers attempted per operation.
    pub fn tries(mut self, tries: usize) -> Self {
        self.tries = tries;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout = timeout;
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Per-server pool capacity. Zero is treated as one.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Failures within the interval that open a server's breaker.
    pub fn error_suppression_limit(mut self, limit: u32) -> Self {
        self.error_suppression_limit = limit;
        self
    }

    /// Set the failure-counting window. The cool-down follows it unless it
    /// is set separately afterwards.
    pub fn error_suppression_interval(mut self, interval: Duration) -> Self {
        self.error_suppression_interval = interval;
        self.error_suppression_duration = interval;
        self
    }

    /// How long an opened breaker keeps the server out of rotation.
    pub fn error_suppression_duration(mut self, duration: Duration) -> Self {
        self.error_suppression_duration = duration;
        self
    }

    pub fn tls(mut self, tls: Option<TlsSettings>) -> Self {
        self.tls = tls;
        self
    }

    /// Encoded size (bytes) above which writes log a warning. `-1` disables.
    pub fn item_size_warning_threshold(mut self, threshold: i64) -> Self {
        self.item_size_warning_threshold = threshold;
        self
    }

    /// Finish building, clamping `tries` to `1..=servers.len()`.
    pub fn build(mut self) -> Self {
        self.tries = self.tries.clamp(1, self.servers.len().max(1));
        self
    }

    pub fn get_servers(&self) -> &[ServerSpec] {
        &self.servers
    }

    pub fn get_tries(&self) -> usize {
        self.tries
    }

    pub fn get_connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn get_pool_timeout(&self) -> Duration {
        self.pool_timeout
    }

    pub fn get_io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn get_idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn get_max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn get_error_suppression_limit(&self) -> u32 {
        self.error_suppression_limit
    }

    pub fn get_error_suppression_interval(&self) -> Duration {
        self.error_suppression_interval
    }

    pub fn get_error_suppression_duration(&self) -> Duration {
        self.error_suppression_duration
    }

    pub fn get_tls(&self) -> Option<&TlsSettings> {
        self.tls.as_ref()
    }

    pub fn get_item_size_warning_threshold(&self) -> i64 {
        self.item_size_warning_threshold
    }
}
