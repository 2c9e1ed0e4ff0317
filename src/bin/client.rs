//! Memcache ring client.
//!
//! This binary runs one cache operation against the configured ring.

use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use memcache_ring::cli::{Cli, ClientCommand};
use memcache_ring::{BreakerState, CacheValue, ConfigResolver, Ring};

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();

    let args = Cli::parse();

    let options = match ConfigResolver::new().resolve(&args.inline_conf()) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };
    let ring = Ring::new(options)?;

    match args.command {
        ClientCommand::Get { key } => match ring.get(&key).await {
            Some(CacheValue::Raw(bytes)) => println!("{}", String::from_utf8_lossy(&bytes)),
            Some(CacheValue::Json(value)) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => println!("Key '{}' not found", key),
        },

        ClientCommand::Set { key, value, ttl, json } => {
            let ttl = ttl.map(Duration::from_secs);
            let stored = if json {
                let parsed: serde_json::Value = serde_json::from_str(&value)?;
                ring.set(&key, parsed, ttl).await
            } else {
                ring.set(&key, value, ttl).await
            };
            if stored {
                println!("Set key '{}'", key);
            } else {
                eprintln!("Failed to store key '{}'", key);
                std::process::exit(1);
            }
        }

        ClientCommand::Delete { key } => {
            if ring.delete(&key).await {
                println!("Deleted key '{}'", key);
            } else {
                eprintln!("Failed to delete key '{}'", key);
                std::process::exit(1);
            }
        }

        ClientCommand::Incr { key, delta } => counter(&key, ring.incr(&key, delta, None).await),

        ClientCommand::Decr { key, delta } => counter(&key, ring.decr(&key, delta, None).await),

        ClientCommand::Stats { key } => {
            let options = ring.options();
            println!("Ring:");
            println!("  tries: {}", options.get_tries());
            println!("  max_connections: {}", options.get_max_connections());
            println!("  io_timeout: {:?}", options.get_io_timeout());
            println!("  tls: {}", options.get_tls().is_some());

            let servers = match &key {
                Some(key) => {
                    println!("Servers for '{}', in failover order:", key);
                    ring.candidates(key)
                }
                None => {
                    println!("Servers:");
                    ring.servers().collect()
                }
            };
            for server in servers {
                let addr = server.to_string();
                match ring.breaker_state(&addr) {
                    Some(BreakerState::Open { until }) => println!(
                        "  {} (open, retried in {:?})",
                        addr,
                        until.saturating_duration_since(Instant::now())
                    ),
                    Some(state) => println!("  {} ({})", addr, state),
                    None => println!("  {}", addr),
                }
            }
        }
    }

    Ok(())
}

fn counter(key: &str, value: Option<u64>) {
    match value {
        Some(value) => println!("{}", value),
        None => {
            eprintln!("Failed to update counter '{}'", key);
            std::process::exit(1);
        }
    }
}
