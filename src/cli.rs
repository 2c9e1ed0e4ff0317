//! Command-line interface definitions.
//!
//! This module defines the CLI structure for the ring client using clap.

use clap::{Parser, Subcommand};

use crate::resolver::Conf;

/// Memcache ring client.
///
/// Runs a single cache operation against a ring of memcached servers.
/// Options not given on the command line come from memcache.conf.
#[derive(Parser, Debug)]
#[command(name = "ring-client")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Comma-separated list of host:port servers.
    #[arg(long, global = true)]
    pub servers: Option<String>,

    /// Connections per server.
    #[arg(long, global = true)]
    pub max_connections: Option<usize>,

    /// Servers to try before giving up.
    #[arg(long, global = true)]
    pub tries: Option<usize>,

    /// Directory holding memcache.conf.
    #[arg(long, global = true)]
    pub config_dir: Option<String>,

    /// The command to execute.
    #[clap(subcommand)]
    pub command: ClientCommand,
}

impl Cli {
    /// The flags given on the command line, as inline options.
    pub fn inline_conf(&self) -> Conf {
        let mut conf = Conf::new();
        if let Some(servers) = &self.servers {
            conf.insert("memcache_servers".to_string(), servers.clone());
        }
        if let Some(max) = self.max_connections {
            conf.insert("memcache_max_connections".to_string(), max.to_string());
        }
        if let Some(tries) = self.tries {
            conf.insert("tries".to_string(), tries.to_string());
        }
        if let Some(dir) = &self.config_dir {
            conf.insert("config_dir".to_string(), dir.clone());
        }
        conf
    }
}

/// Available client commands.
#[derive(Subcommand, Debug)]
pub enum ClientCommand {
    /// Get a value by key.
    Get {
        /// The key to look up.
        key: String,
    },

    /// Set a key-value pair.
    ///
    /// Stores the value at the given key, replacing any previous value.
    Set {
        /// The key to store the value under.
        key: String,
        /// The value to store.
        value: String,
        /// Expire after this many seconds.
        #[arg(long)]
        ttl: Option<u64>,
        /// Parse the value as JSON and store it as a JSON entry.
        #[arg(long)]
        json: bool,
    },

    /// Delete a key.
    Delete {
        /// The key to delete.
        key: String,
    },

    /// Increment a counter, creating it if missing.
    Incr {
        key: String,
        #[arg(default_value_t = 1)]
        delta: u64,
    },

    /// Decrement a counter, flooring at zero.
    Decr {
        key: String,
        #[arg(default_value_t = 1)]
        delta: u64,
    },

    /// Show the servers a key maps to, in failover order.
    Stats {
        /// Key to route; omit to list all servers.
        key: Option<String>,
    },
}
