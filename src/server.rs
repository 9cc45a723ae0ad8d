//! Listener and connection registry
//!
//! A [`Server`] accepts TCP connections, runs each through the SSH
//! transport on a task of its own and keeps track of listeners and live
//! connections so it can stop them. Once [`Server::close`] or
//! [`Server::shutdown`] has been called the server stays closed: serving
//! again fails with [`Error::ServerClosed`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::config::ServerConfig;
use crate::conn::Conn;
use crate::context::{ConnMeta, Context};
use crate::error::{Error, Result};
use crate::ssh;
use crate::transport::RawStream;

struct ListenerEntry {
    addr: SocketAddr,
    stop: CancellationToken,
}

/// A connection from accept until its task ends.
///
/// `conn` is filled in once the handshake has completed.
struct ConnEntry {
    ctx: Context,
    conn: Option<Arc<Conn>>,
}

#[derive(Default)]
struct Registry {
    closed: bool,
    next_listener: u64,
    listeners: HashMap<u64, ListenerEntry>,
    conns: HashMap<String, ConnEntry>,
}

struct Inner {
    config: Arc<ServerConfig>,
    russh_config: Arc<russh::server::Config>,
    registry: Mutex<Registry>,
    drained: Notify,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the live connection; false if the server closed meanwhile.
    fn attach(&self, conn: Arc<Conn>) -> bool {
        let mut registry = self.registry();
        if registry.closed {
            return false;
        }
        match registry.conns.get_mut(conn.context().session_id()) {
            Some(entry) => {
                entry.conn = Some(conn);
                true
            }
            None => false,
        }
    }

    fn detach(&self, session_id: &str) {
        let mut registry = self.registry();
        registry.conns.remove(session_id);
        if registry.conns.is_empty() {
            self.drained.notify_waiters();
        }
    }
}

/// SSH server: listeners, live connections and shutdown.
///
/// Cloning is cheap and every clone drives the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let russh_config = Arc::new(ssh::russh_config(&config));
        Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                russh_config,
                registry: Mutex::new(Registry::default()),
                drained: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Bind the configured address and serve on it.
    pub async fn listen_and_serve(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ServerClosed);
        }
        let listener = TcpListener::bind(self.inner.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until the server is closed.
    ///
    /// Always ends with an error; [`Error::ServerClosed`] after `close` or
    /// `shutdown`.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        let stop = CancellationToken::new();
        let id = {
            let mut registry = self.inner.registry();
            if registry.closed {
                return Err(Error::ServerClosed);
            }
            let id = registry.next_listener;
            registry.next_listener += 1;
            registry.listeners.insert(
                id,
                ListenerEntry {
                    addr,
                    stop: stop.clone(),
                },
            );
            id
        };
        info!(addr = %addr, "listening");

        let result = self.accept_loop(&listener, &stop).await;

        self.inner.registry().listeners.remove(&id);
        info!(addr = %addr, "listener stopped");
        result
    }

    async fn accept_loop(&self, listener: &TcpListener, stop: &CancellationToken) -> Result<()> {
        let mut backoff = Backoff::new();
        loop {
            let accepted = tokio::select! {
                _ = stop.cancelled() => return Err(Error::ServerClosed),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    backoff.reset();
                    self.spawn_connection(stream, peer);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(attempt = backoff.attempt(), ?delay, "accept failed: {}", e);
                    tokio::select! {
                        _ = stop.cancelled() => return Err(Error::ServerClosed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!(peer = %peer, "dropping connection: {}", e);
                return;
            }
        };
        let _ = stream.set_nodelay(true);

        let config = self.inner.config.clone();
        let ctx = Context::new(ConnMeta {
            session_id: Uuid::new_v4().simple().to_string(),
            server_version: config.banner(),
            local_addr,
            remote_addr: peer,
        });
        let session_id = ctx.session_id().to_string();

        {
            let mut registry = self.inner.registry();
            if registry.closed {
                return;
            }
            registry.conns.insert(
                session_id.clone(),
                ConnEntry {
                    ctx: ctx.clone(),
                    conn: None,
                },
            );
        }
        info!(peer = %peer, session_id = %session_id, "new connection");

        let stream: Box<dyn RawStream> = Box::new(stream);
        let stream = match &config.conn_callback {
            Some(wrap) => wrap(&ctx, stream),
            None => stream,
        };

        let inner = self.inner.clone();
        let russh_config = inner.russh_config.clone();
        tokio::spawn(async move {
            let attach = {
                let inner = inner.clone();
                move |conn: Arc<Conn>| inner.attach(conn)
            };
            ssh::run_connection(ctx, config, russh_config, stream, attach).await;
            inner.detach(&session_id);
            info!(peer = %peer, session_id = %session_id, "connection closed");
        });
    }

    /// Stop all listeners and drop every live connection now.
    pub async fn close(&self) -> Result<()> {
        let (listeners, conns) = self.mark_closed();
        for stop in listeners {
            stop.cancel();
        }
        for entry in conns {
            match entry.conn {
                Some(conn) => {
                    if let Err(e) = conn.close().await {
                        debug!(peer = %entry.ctx.remote_addr(), "close failed: {}", e);
                    }
                }
                None => entry.ctx.cancel(),
            }
        }
        Ok(())
    }

    /// Stop all listeners, then wait for live connections to end on their own.
    ///
    /// Returns [`Error::ShutdownInterrupted`] if `cancel` fires first; the
    /// remaining connections are left running.
    pub async fn shutdown(&self, cancel: CancellationToken) -> Result<()> {
        let (listeners, _) = self.mark_closed();
        for stop in listeners {
            stop.cancel();
        }

        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            let remaining = self.inner.registry().conns.len();
            if remaining == 0 {
                return Ok(());
            }
            debug!(remaining, "waiting for connections to drain");

            tokio::select! {
                _ = &mut drained => {}
                _ = cancel.cancelled() => {
                    warn!(remaining, "shutdown interrupted");
                    return Err(Error::ShutdownInterrupted);
                }
            }
        }
    }

    fn mark_closed(&self) -> (Vec<CancellationToken>, Vec<ConnEntry>) {
        let mut registry = self.inner.registry();
        registry.closed = true;
        let listeners = registry
            .listeners
            .values()
            .map(|l| l.stop.clone())
            .collect();
        let conns = registry
            .conns
            .values()
            .map(|c| ConnEntry {
                ctx: c.ctx.clone(),
                conn: c.conn.clone(),
            })
            .collect();
        (listeners, conns)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.registry().closed
    }

    /// Addresses of the listeners currently serving.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .registry()
            .listeners
            .values()
            .map(|l| l.addr)
            .collect()
    }

    /// Number of connections accepted and not yet finished.
    pub fn connection_count(&self) -> usize {
        self.inner.registry().conns.len()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("version", &self.inner.config.version())
            .field("listeners", &self.local_addrs())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tests::test_config;
    use std::time::Duration;

    fn test_server() -> Server {
        Server::new(test_config().build().unwrap())
    }

    #[tokio::test]
    async fn test_serve_after_close_is_server_closed() {
        let server = test_server();
        server.close().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(server.serve(listener).await, Err(Error::ServerClosed)));
        assert!(matches!(
            server.listen_and_serve().await,
            Err(Error::ServerClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_stops_serving() {
        let server = test_server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });
        for _ in 0..100 {
            if !server.local_addrs().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.local_addrs(), vec![addr]);

        server.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::ServerClosed)));
        assert!(server.local_addrs().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_without_connections_returns() {
        let server = test_server();
        tokio::time::timeout(
            Duration::from_secs(5),
            server.shutdown(CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_interrupted_with_open_connection() {
        let server = test_server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        // a raw TCP client that never finishes the handshake
        let _client = TcpStream::connect(addr).await.unwrap();
        for _ in 0..100 {
            if server.connection_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.connection_count(), 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            server.shutdown(cancel).await,
            Err(Error::ShutdownInterrupted)
        ));

        server.close().await.unwrap();
        for _ in 0..100 {
            if server.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_client_dropped_after_idle_timeout() {
        let server = Server::new(
            test_config()
                .idle_timeout(Duration::from_millis(100))
                .build()
                .unwrap(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        // connects but never sends an identification line
        let _client = TcpStream::connect(addr).await.unwrap();
        for _ in 0..100 {
            if server.connection_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for _ in 0..200 {
            if server.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.connection_count(), 0);
        server.close().await.unwrap();
    }
}
