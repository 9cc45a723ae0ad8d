//! Per-connection view and supervisor loop

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::channel;
use crate::config::ServerConfig;
use crate::context::Context;
use crate::error::Result;
use crate::request;
use crate::transport::{AcceptedChannel, ConnectionEvent, ConnectionIo};

/// One live connection, as seen by extension handlers.
pub struct Conn {
    ctx: Context,
    config: Arc<ServerConfig>,
    io: Arc<dyn ConnectionIo>,
}

impl Conn {
    pub fn new(ctx: Context, config: Arc<ServerConfig>, io: Arc<dyn ConnectionIo>) -> Arc<Self> {
        Arc::new(Self { ctx, config, io })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open a server-initiated channel to the client.
    pub async fn open_channel(&self, channel_type: &str, extra_data: Bytes) -> Result<AcceptedChannel> {
        self.io.open_channel(channel_type, extra_data).await
    }

    /// Disconnect the client and cancel everything running under this connection.
    pub async fn close(&self) -> Result<()> {
        let result = self.io.close().await;
        self.ctx.cancel();
        result
    }
}

/// Far enough away to never fire; used when a timeout is disabled.
const NEVER: Duration = Duration::from_secs(30 * 365 * 24 * 3600);

/// Drive one connection until it closes.
///
/// Channel opens and global requests are dispatched onto their own tasks.
/// `activity` is notified by the transport on inbound traffic and resets the
/// idle timer. On return the connection context is cancelled.
pub(crate) async fn supervise(
    conn: Arc<Conn>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    activity: Arc<Notify>,
) {
    let idle_timeout = conn.config.idle_timeout;
    let deadline = conn.config.max_timeout.map(|max| Instant::now() + max);

    let idle = sleep(idle_timeout.unwrap_or(NEVER));
    tokio::pin!(idle);
    let absolute = async move {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => pending().await,
        }
    };
    tokio::pin!(absolute);

    debug!(session_id = %conn.ctx.session_id(), "supervising connection");

    loop {
        tokio::select! {
            _ = conn.ctx.cancelled() => break,
            event = events.recv() => match event {
                Some(ConnectionEvent::ChannelOpen(channel)) => {
                    channel::dispatch(conn.clone(), channel);
                }
                Some(ConnectionEvent::GlobalRequest(req)) => {
                    tokio::spawn(request::route_global_request(conn.clone(), req));
                }
                None => {
                    debug!(session_id = %conn.ctx.session_id(), "transport closed");
                    break;
                }
            },
            _ = activity.notified() => {
                if let Some(timeout) = idle_timeout {
                    idle.as_mut().reset(Instant::now() + timeout);
                }
            }
            _ = &mut idle, if idle_timeout.is_some() => {
                info!(peer = %conn.ctx.remote_addr(), "idle timeout, closing connection");
                close_quietly(&conn).await;
                break;
            }
            _ = &mut absolute => {
                info!(peer = %conn.ctx.remote_addr(), "max timeout, closing connection");
                close_quietly(&conn).await;
                break;
            }
        }
    }

    conn.ctx.cancel();
}

async fn close_quietly(conn: &Conn) {
    if let Err(e) = conn.close().await {
        warn!(peer = %conn.ctx.remote_addr(), "close failed: {}", e);
    }
}
