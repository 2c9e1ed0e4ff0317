//! The subset of the memcached text protocol the ring speaks.
//!
//! A [`Connection`] executes one [`Request`] at a time and yields a
//! [`Response`]. Every exchange runs under the connection's I/O deadline.
//! Any error (timeout, reset, malformed reply, server error line) leaves the
//! stream in an unknown state, so callers must discard the connection.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::time::timeout;

use crate::codec::{CacheEntry, FLAG_RAW};
use crate::error::{RingError, RingResult};

/// Largest value accepted from a server; memcached's own item size cap.
pub const MAX_VALUE_LEN: usize = 1024 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// Commands sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Get,
    Set,
    Add,
    Delete,
    Incr,
    Decr,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Get => "get",
            Command::Set => "set",
            Command::Add => "add",
            Command::Delete => "delete",
            Command::Incr => "incr",
            Command::Decr => "decr",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One logical operation against a single server.
#[derive(Debug, Clone)]
pub enum Request {
    /// Fetch one or more keys in a single round trip.
    Get { keys: Vec<String> },
    /// Store entries with `set` (or `add` when `only_if_absent`).
    Store {
        items: Vec<(String, CacheEntry)>,
        exptime: u64,
        only_if_absent: bool,
    },
    Delete { key: String },
    /// `incr`/`decr`, creating the counter when it does not exist yet.
    Arith {
        key: String,
        delta: u64,
        decrement: bool,
        exptime: u64,
    },
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::Get { .. } => Command::Get,
            Request::Store { only_if_absent: true, .. } => Command::Add,
            Request::Store { .. } => Command::Set,
            Request::Delete { .. } => Command::Delete,
            Request::Arith { decrement: false, .. } => Command::Incr,
            Request::Arith { decrement: true, .. } => Command::Decr,
        }
    }
}

/// The server's answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Hits only, in server order.
    Values(Vec<(String, CacheEntry)>),
    /// Whether every entry was stored.
    Stored(bool),
    /// Whether the key existed.
    Deleted(bool),
    /// Counter value after the operation.
    Counter(u64),
}

/// Anything a connection can run over: plain TCP, TLS, or an in-memory pipe.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// A buffered connection to one server.
pub struct Connection {
    stream: BufStream<Box<dyn Transport>>,
    io_timeout: Duration,
    line: String,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("io_timeout", &self.io_timeout)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, io_timeout: Duration) -> Self {
        Self {
            stream: BufStream::new(transport),
            io_timeout,
            line: String::with_capacity(64),
        }
    }

    /// Run `request`, bounded by the I/O deadline.
    pub async fn execute(&mut self, request: &Request) -> RingResult<Response> {
        let io_timeout = self.io_timeout;
        match timeout(io_timeout, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => Err(RingError::Timeout {
                op: request.command().as_str(),
                after: io_timeout,
            }),
        }
    }

    async fn exchange(&mut self, request: &Request) -> RingResult<Response> {
        match request {
            Request::Get { keys } => self.get(keys).await.map(Response::Values),
            Request::Store {
                items,
                exptime,
                only_if_absent,
            } => {
                let command = if *only_if_absent { Command::Add } else { Command::Set };
                self.store(command, items, *exptime).await.map(Response::Stored)
            }
            Request::Delete { key } => self.delete(key).await.map(Response::Deleted),
            Request::Arith {
                key,
                delta,
                decrement,
                exptime,
            } => self
                .arith(key, *delta, *decrement, *exptime)
                .await
                .map(Response::Counter),
        }
    }

    async fn get(&mut self, keys: &[String]) -> RingResult<Vec<(String, CacheEntry)>> {
        let mut request = String::from("get");
        for key in keys {
            request.push(' ');
            request.push_str(key);
        }
        request.push_str("\r\n");
        self.send(request.as_bytes()).await?;

        let mut found = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "END" {
                return Ok(found);
            }

            // VALUE <key> <flags> <bytes> [<cas>]
            let mut parts = line.split(' ');
            let (key, flags, len) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some("VALUE"), Some(key), Some(flags), Some(len)) => (
                    key.to_string(),
                    parse_number::<u32>(flags, &line)?,
                    parse_number::<usize>(len, &line)?,
                ),
                _ => return Err(unexpected(&line)),
            };

            if len > MAX_VALUE_LEN {
                return Err(RingError::Protocol(format!(
                    "value for {} claims {} bytes, above the {} byte limit",
                    key, len, MAX_VALUE_LEN
                )));
            }

            // grow with the data actually received rather than trusting the header
            let expected = len + 2;
            let mut data = Vec::with_capacity(expected.min(READ_CHUNK));
            (&mut self.stream)
                .take(expected as u64)
                .read_to_end(&mut data)
                .await?;
            if data.len() < expected {
                return Err(RingError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed the connection mid-value",
                )));
            }
            if !data.ends_with(b"\r\n") {
                return Err(RingError::Protocol(format!(
                    "value for {} not terminated by CRLF",
                    key
                )));
            }
            data.truncate(len);
            found.push((key, CacheEntry::new(Bytes::from(data), flags)));
        }
    }

    async fn store(
        &mut self,
        command: Command,
        items: &[(String, CacheEntry)],
        exptime: u64,
    ) -> RingResult<bool> {
        for (key, entry) in items {
            self.write_storage(command, key, entry, exptime).await?;
        }
        self.stream.flush().await?;

        let mut all_stored = true;
        for _ in items {
            let line = self.read_line().await?;
            match line.as_str() {
                "STORED" => {}
                "NOT_STORED" | "EXISTS" | "NOT_FOUND" => all_stored = false,
                _ => return Err(unexpected(&line)),
            }
        }
        Ok(all_stored)
    }

    async fn delete(&mut self, key: &str) -> RingResult<bool> {
        self.send(format!("delete {}\r\n", key).as_bytes()).await?;
        let line = self.read_line().await?;
        match line.as_str() {
            "DELETED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            _ => Err(unexpected(&line)),
        }
    }

    async fn arith(&mut self, key: &str, delta: u64, decrement: bool, exptime: u64) -> RingResult<u64> {
        let command = if decrement { Command::Decr } else { Command::Incr };
        if let Some(value) = self.arith_once(command, key, delta).await? {
            return Ok(value);
        }

        // Missing counter: create it. Decrementing a missing counter floors at 0.
        let initial = if decrement { 0 } else { delta };
        let entry = CacheEntry::new(Bytes::from(initial.to_string()), FLAG_RAW);
        self.write_storage(Command::Add, key, &entry, exptime).await?;
        self.stream.flush().await?;

        let line = self.read_line().await?;
        match line.as_str() {
            "STORED" => Ok(initial),
            // someone else created it first
            "NOT_STORED" => match self.arith_once(command, key, delta).await? {
                Some(value) => Ok(value),
                None => Err(RingError::Protocol(format!(
                    "counter {} vanished during {}",
                    key, command
                ))),
            },
            _ => Err(unexpected(&line)),
        }
    }

    async fn arith_once(&mut self, command: Command, key: &str, delta: u64) -> RingResult<Option<u64>> {
        self.send(format!("{} {} {}\r\n", command, key, delta).as_bytes())
            .await?;
        let line = self.read_line().await?;
        if line == "NOT_FOUND" {
            return Ok(None);
        }
        parse_number::<u64>(&line, &line).map(Some)
    }

    async fn write_storage(
        &mut self,
        command: Command,
        key: &str,
        entry: &CacheEntry,
        exptime: u64,
    ) -> RingResult<()> {
        let header = format!(
            "{} {} {} {} {}\r\n",
            command,
            key,
            entry.flags,
            exptime,
            entry.len()
        );
        self.stream.write_all(header.as_bytes()).await?;
        self.stream.write_all(&entry.value).await?;
        self.stream.write_all(b"\r\n").await?;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> RingResult<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read one reply line without its CRLF.
    async fn read_line(&mut self) -> RingResult<String> {
        self.line.clear();
        let n = self.stream.read_line(&mut self.line).await?;
        if n == 0 {
            return Err(RingError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }

        let line = self.line.trim_end_matches(['\r', '\n']);
        if line == "ERROR" || line.starts_with("CLIENT_ERROR") || line.starts_with("SERVER_ERROR") {
            return Err(RingError::Protocol(line.to_string()));
        }
        Ok(line.to_string())
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, line: &str) -> RingResult<T> {
    field.trim().parse::<T>().map_err(|_| unexpected(line))
}

fn unexpected(line: &str) -> RingError {
    RingError::Protocol(format!("unexpected reply '{}'", line))
}
