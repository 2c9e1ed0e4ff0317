//! # memcache-ring
//!
//! A fault-tolerant client for a ring of memcached servers.
//!
//! ## Features
//!
//! - **Consistent hashing**: keys map to servers through a weighted hash ring
//!   that is identical across processes, so adding a server moves few keys
//! - **Failover**: each operation tries up to `tries` servers in ring order
//! - **Error limiting**: a server that keeps failing is skipped for a while
//! - **Bounded pools**: at most `max_connections` connections per server
//! - **Layered configuration**: inline options, `memcache.conf`, defaults
//! - **Fail soft**: an unavailable cache is a miss, never an error
//!
//! ## Quick Start
//!
//! ```no_run
//! use memcache_ring::{ConfigResolver, Ring};
//! use memcache_ring::resolver::Conf;
//! use std::time::Duration;
//!
//! # async fn demo() -> memcache_ring::RingResult<()> {
//! let mut conf = Conf::new();
//! conf.insert("memcache_servers".into(), "10.0.0.1:11211,10.0.0.2:11211".into());
//! conf.insert("max_connections".into(), "4".into());
//!
//! let options = ConfigResolver::new().resolve(&conf)?;
//! let ring = Ring::new(options)?;
//!
//! ring.set_json("user:123", &vec!["alice", "admin"], Some(Duration::from_secs(300))).await;
//! let roles: Option<Vec<String>> = ring.get_json("user:123").await;
//!
//! if let Some(hits) = ring.incr("page:views", 1, None).await {
//!     println!("views: {}", hits);
//! }
//! println!("hit rate: {:.1}%", ring.stats().hit_rate);
//! # Ok(())
//! # }
//! ```
//!
//! ## Sharing
//!
//! A [`Ring`] is `Send + Sync`; wrap it in an `Arc` and clone the handle
//! into every task. [`CacheFilter`] does exactly that for a request
//! pipeline.

pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod limiter;
pub mod resolver;
pub mod ring;
pub mod selector;
pub mod stats;

pub use codec::{CacheEntry, CacheValue};
pub use config::{Options, ServerSpec, TlsSettings};
pub use error::{RingError, RingResult};
pub use filter::{filter_factory, CacheFilter, Environ, CACHE_ENV_KEY};
pub use limiter::{BreakerState, ErrorLimiter};
pub use resolver::{ConfigResolver, ConfigSource, EmptyConfigSource, FileConfigSource};
pub use ring::Ring;
pub use selector::KeySelector;
pub use stats::{RingStats, StatsSnapshot};

// Internal modules - not part of public API
pub(crate) mod pool;
pub(crate) mod protocol;
pub(crate) mod tls;

pub mod cli;
pub use cli::{Cli, ClientCommand};
