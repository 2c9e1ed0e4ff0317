//! Bounded per-server connection pool.
//!
//! A semaphore with `max_connections` permits bounds the number of
//! connections checked out at once; released healthy connections wait in an
//! idle list for reuse. A caller holding a permit either takes an idle
//! connection or opens a new one, so a server never has more than
//! `max_connections` open connections. Connections idle for longer than
//! `idle_timeout` are closed rather than handed out.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{Options, ServerSpec};
use crate::error::{RingError, RingResult};
use crate::protocol::{Connection, Transport};

/// Pool of connections to one server.
pub struct ConnectionPool {
    server: ServerSpec,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
    max_connections: usize,
    connect_timeout: Duration,
    pool_timeout: Duration,
    io_timeout: Duration,
    idle_timeout: Duration,
    tls: Option<TlsConnector>,
    opened: AtomicU64,
}

#[derive(Debug)]
struct IdleConnection {
    conn: Connection,
    since: Instant,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("server", &self.server)
            .field("max_connections", &self.max_connections)
            .field("idle", &self.idle_count())
            .field("opened", &self.opened())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(server: ServerSpec, options: &Options, tls: Option<TlsConnector>) -> Self {
        Self {
            server,
            permits: Arc::new(Semaphore::new(options.max_connections)),
            idle: Mutex::new(Vec::with_capacity(options.max_connections)),
            max_connections: options.max_connections,
            connect_timeout: options.connect_timeout,
            pool_timeout: options.pool_timeout,
            io_timeout: options.io_timeout,
            idle_timeout: options.idle_timeout,
            tls,
            opened: AtomicU64::new(0),
        }
    }

    /// Connections currently waiting in the idle list.
    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }

    /// Total connections ever opened by this pool.
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// Borrow a connection, waiting at most `pool_timeout` for a free slot.
    pub async fn acquire(&self) -> RingResult<PooledConnection> {
        let permit = match timeout(self.pool_timeout, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            // the semaphore is never closed, so both arms mean "no slot"
            Ok(Err(_)) | Err(_) => {
                return Err(RingError::PoolExhausted {
                    server: self.server.to_string(),
                    waited: self.pool_timeout,
                })
            }
        };

        if let Some(conn) = self.take_idle() {
            return Ok(PooledConnection {
                conn,
                _permit: permit,
                reused: true,
            });
        }

        // on error the permit drops here and frees the slot
        let conn = self.connect().await?;
        Ok(PooledConnection {
            conn,
            _permit: permit,
            reused: false,
        })
    }

    /// Replace the connection inside `pooled` with a freshly opened one,
    /// keeping its slot.
    pub async fn reconnect(&self, pooled: PooledConnection) -> RingResult<PooledConnection> {
        let PooledConnection { conn, _permit, .. } = pooled;
        drop(conn);
        let conn = self.connect().await?;
        Ok(PooledConnection {
            conn,
            _permit,
            reused: false,
        })
    }

    /// Most recently used idle connection that has not gone stale.
    fn take_idle(&self) -> Option<Connection> {
        let now = Instant::now();
        let mut idle = self.idle();
        while let Some(entry) = idle.pop() {
            if now.duration_since(entry.since) < self.idle_timeout {
                return Some(entry.conn);
            }
            debug!(server = %self.server, idle = ?now.duration_since(entry.since), "closing stale connection");
        }
        None
    }

    /// Return a borrowed connection. Unhealthy connections are closed and
    /// their slot becomes available for a fresh connection.
    pub fn release(&self, pooled: PooledConnection, healthy: bool) {
        let PooledConnection { conn, _permit, .. } = pooled;
        if healthy {
            self.idle().push(IdleConnection {
                conn,
                since: Instant::now(),
            });
        } else {
            debug!(server = %self.server, "discarding connection");
            drop(conn);
        }
        // the slot frees when `_permit` drops, after the connection is back
    }

    async fn connect(&self) -> RingResult<Connection> {
        let host = self.server.host();
        let tcp = match timeout(self.connect_timeout, TcpStream::connect((host, self.server.port()))).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => {
                return Err(RingError::Connect {
                    server: self.server.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(RingError::Timeout {
                    op: "connect",
                    after: self.connect_timeout,
                })
            }
        };
        tcp.set_nodelay(true)?;

        let transport: Box<dyn Transport> = match &self.tls {
            Some(connector) => {
                let name = ServerName::try_from(host.to_string())
                    .map_err(|e| RingError::Tls(format!("{}: {}", host, e)))?;
                match timeout(self.connect_timeout, connector.connect(name, tcp)).await {
                    Ok(Ok(stream)) => Box::new(stream),
                    Ok(Err(e)) => {
                        return Err(RingError::Connect {
                            server: self.server.to_string(),
                            reason: format!("TLS handshake: {}", e),
                        })
                    }
                    Err(_) => {
                        return Err(RingError::Timeout {
                            op: "TLS handshake",
                            after: self.connect_timeout,
                        })
                    }
                }
            }
            None => Box::new(tcp),
        };

        self.opened.fetch_add(1, Ordering::Relaxed);
        debug!(server = %self.server, tls = self.tls.is_some(), "opened connection");
        Ok(Connection::new(transport, self.io_timeout))
    }

    fn idle(&self) -> MutexGuard<'_, Vec<IdleConnection>> {
        // a panic while holding the lock cannot leave the Vec inconsistent
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dropping it without [`ConnectionPool::release`] closes the connection and
/// frees its slot.
#[derive(Debug)]
pub struct PooledConnection {
    conn: Connection,
    _permit: OwnedSemaphorePermit,
    reused: bool,
}

impl PooledConnection {
    /// Whether this connection came from the idle list rather than a fresh
    /// connect. The server may have closed it since it was last used.
    pub fn is_reused(&self) -> bool {
        self.reused
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    /// A listener that accepts connections and keeps them open.
    async fn holding_listener() -> ServerSpec {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        ServerSpec::new("127.0.0.1", port)
    }

    fn options(max_connections: usize) -> Options {
        Options::new()
            .max_connections(max_connections)
            .pool_timeout(Duration::from_millis(100))
            .build()
    }

    #[tokio::test]
    async fn test_reuses_healthy_connection() {
        let pool = ConnectionPool::new(holding_listener().await, &options(2), None);

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, true);
        assert_eq!(pool.idle_count(), 1);

        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_reused());
        assert_eq!(pool.idle_count(), 0);
        pool.release(conn, true);

        assert_eq!(pool.opened(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_connection_is_replaced() {
        let pool = ConnectionPool::new(holding_listener().await, &options(1), None);

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, false);
        assert_eq!(pool.idle_count(), 0);

        // the slot was freed, so a new connection can be opened
        let conn = pool.acquire().await.unwrap();
        pool.release(conn, true);
        assert_eq!(pool.opened(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let pool = ConnectionPool::new(holding_listener().await, &options(1), None);

        let held = pool.acquire().await.unwrap();
        let started = Instant::now();
        let err = pool.acquire().await.unwrap_err();

        assert!(matches!(err, RingError::PoolExhausted { .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
        drop(held);
    }

    #[tokio::test]
    async fn test_waiter_gets_released_connection() {
        let pool = Arc::new(ConnectionPool::new(holding_listener().await, &options(1), None));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|conn| pool.release(conn, true)) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(held, true);

        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(pool.opened(), 1);
    }

    #[tokio::test]
    async fn test_stale_idle_connection_is_closed() {
        let options = Options::new()
            .max_connections(1)
            .idle_timeout(Duration::from_millis(50))
            .build();
        let pool = ConnectionPool::new(holding_listener().await, &options, None);

        let conn = pool.acquire().await.unwrap();
        assert!(!conn.is_reused());
        pool.release(conn, true);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let conn = pool.acquire().await.unwrap();
        assert!(!conn.is_reused());
        assert_eq!(pool.opened(), 2);
        assert_eq!(pool.idle_count(), 0);
        pool.release(conn, true);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_slot() {
        let pool = ConnectionPool::new(holding_listener().await, &options(1), None);
        let conn = pool.acquire().await.unwrap();
        pool.release(conn, true);

        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_reused());
        let conn = pool.reconnect(conn).await.unwrap();
        assert!(!conn.is_reused());
        assert_eq!(pool.opened(), 2);

        // still holding the only slot
        assert!(matches!(
            pool.acquire().await.unwrap_err(),
            RingError::PoolExhausted { .. }
        ));
        pool.release(conn, true);
    }

    #[tokio::test]
    async fn test_dropped_connection_frees_slot() {
        let pool = ConnectionPool::new(holding_listener().await, &options(1), None);
        drop(pool.acquire().await.unwrap());
        assert!(pool.acquire().await.is_ok());
        assert_eq!(pool.opened(), 2);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let pool = ConnectionPool::new(ServerSpec::new("127.0.0.1", port), &options(1), None);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, RingError::Connect { .. }));
        // a failed connect does not leak the slot
        assert!(matches!(
            pool.acquire().await.unwrap_err(),
            RingError::Connect { .. }
        ));
    }
}
