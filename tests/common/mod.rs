//! An in-process memcached stand-in speaking the text protocol.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use memcache_ring::ServerSpec;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub flags: u32,
    pub exptime: u64,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct Shared {
    items: Mutex<HashMap<String, Item>>,
    stall: AtomicBool,
    hangup: AtomicBool,
    accepted: AtomicUsize,
    commands: AtomicUsize,
}

/// A fake server bound to an ephemeral localhost port.
#[derive(Clone)]
pub struct FakeMemcached {
    port: u16,
    shared: Arc<Shared>,
}

impl FakeMemcached {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Shared::default());

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                let shared = Arc::clone(&accept_shared);
                tokio::spawn(async move {
                    let _ = serve(socket, shared).await;
                });
            }
        });

        Self { port, shared }
    }

    pub fn spec(&self) -> ServerSpec {
        ServerSpec::new("127.0.0.1", self.port)
    }

    pub fn addr(&self) -> String {
        self.spec().to_string()
    }

    /// While stalled, commands are read but never answered.
    pub fn stall(&self, stall: bool) {
        self.shared.stall.store(stall, Ordering::SeqCst);
    }

    /// While hanging up, each connection is closed after one reply.
    pub fn hangup(&self, hangup: bool) {
        self.shared.hangup.store(hangup, Ordering::SeqCst);
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Commands received so far, stalled ones included.
    pub fn commands(&self) -> usize {
        self.shared.commands.load(Ordering::SeqCst)
    }

    pub fn item(&self, wire_key: &str) -> Option<Item> {
        self.shared.items.lock().unwrap().get(wire_key).cloned()
    }

    pub fn put(&self, wire_key: &str, flags: u32, data: &[u8]) {
        self.shared.items.lock().unwrap().insert(
            wire_key.to_string(),
            Item {
                flags,
                exptime: 0,
                data: data.to_vec(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.shared.items.lock().unwrap().len()
    }
}

/// An address nobody listens on.
pub async fn dead_server() -> ServerSpec {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    ServerSpec::new("127.0.0.1", listener.local_addr().unwrap().port())
}

async fn serve(socket: TcpStream, shared: Arc<Shared>) -> std::io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        shared.commands.fetch_add(1, Ordering::SeqCst);
        let parts: Vec<String> = line.split_whitespace().map(str::to_string).collect();

        // storage commands carry a data block that must be consumed
        let mut data = Vec::new();
        if matches!(parts.first().map(String::as_str), Some("set") | Some("add")) {
            let len: usize = parts.get(4).and_then(|n| n.parse().ok()).unwrap_or(0);
            data = vec![0u8; len + 2];
            reader.read_exact(&mut data).await?;
            data.truncate(len);
        }

        if shared.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let reply = respond(&shared, &parts, data);
        writer.write_all(&reply).await?;
        if shared.hangup.load(Ordering::SeqCst) {
            return Ok(());
        }
    }
}

fn respond(shared: &Shared, parts: &[String], data: Vec<u8>) -> Vec<u8> {
    let mut items = shared.items.lock().unwrap();
    let arg = |i: usize| parts.get(i).map(String::as_str).unwrap_or("");
    let line = |text: &str| format!("{}\r\n", text).into_bytes();

    match arg(0) {
        // memcached rejects a get without keys
        "get" if parts.len() < 2 => line("ERROR"),
        "get" => {
            let mut reply = Vec::new();
            for key in &parts[1..] {
                if let Some(item) = items.get(key) {
                    reply.extend(line(&format!("VALUE {} {} {}", key, item.flags, item.data.len())));
                    reply.extend(&item.data);
                    reply.extend(b"\r\n");
                }
            }
            reply.extend(line("END"));
            reply
        }
        cmd @ ("set" | "add") => {
            if cmd == "add" && items.contains_key(arg(1)) {
                return line("NOT_STORED");
            }
            let item = Item {
                flags: arg(2).parse().unwrap_or(0),
                exptime: arg(3).parse().unwrap_or(0),
                data,
            };
            items.insert(arg(1).to_string(), item);
            line("STORED")
        }
        "delete" => match items.remove(arg(1)) {
            Some(_) => line("DELETED"),
            None => line("NOT_FOUND"),
        },
        cmd @ ("incr" | "decr") => {
            let Some(item) = items.get_mut(arg(1)) else {
                return line("NOT_FOUND");
            };
            let delta: u64 = arg(2).parse().unwrap_or(0);
            let current: u64 = String::from_utf8_lossy(&item.data).parse().unwrap_or(0);
            let next = if cmd == "incr" {
                current.wrapping_add(delta)
            } else {
                current.saturating_sub(delta)
            };
            item.data = next.to_string().into_bytes();
            line(&next.to_string())
        }
        _ => line("ERROR"),
    }
}
