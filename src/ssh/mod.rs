//! SSH transport
//!
//! Binds the framework to russh: key exchange, encryption and
//! authentication stay in russh, everything after that is re-expressed as
//! transport events and handed to the connection supervisor.

mod handler;
mod io;
mod version;

use std::sync::Arc;
use std::time::Duration;

use russh::{MethodKind, MethodSet};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::conn::{self, Conn};
use crate::context::Context;
use crate::transport::RawStream;

use handler::SshHandler;
use io::RusshConnection;
use version::VersionSniffer;

/// russh settings derived from a server configuration.
///
/// Only the methods with a callback are advertised; with none at all the
/// server accepts `none`.
pub(crate) fn russh_config(config: &ServerConfig) -> russh::server::Config {
    let mut russh_config = russh::server::Config {
        auth_rejection_time: Duration::from_millis(250),
        auth_rejection_time_initial: Some(Duration::from_millis(0)),
        server_id: russh::SshId::Standard(config.banner()),
        // idle and absolute timeouts belong to the supervisor
        inactivity_timeout: None,
        nodelay: true,
        ..Default::default()
    };

    russh_config.methods = MethodSet::empty();
    if config.public_key_handler.is_some() {
        russh_config.methods.push(MethodKind::PublicKey);
    }
    if config.password_handler.is_some() {
        russh_config.methods.push(MethodKind::Password);
    }
    if config.keyboard_interactive.is_some() {
        russh_config.methods.push(MethodKind::KeyboardInteractive);
    }
    if config.allows_anonymous() {
        russh_config.methods.push(MethodKind::None);
    }

    russh_config.keys.extend(config.host_keys.iter().cloned());
    russh_config
}

/// Run one accepted connection to completion.
///
/// Returns once the client disconnects, the connection is closed by the
/// server or the handshake fails. Cancelling `ctx` abandons a handshake
/// still in progress, as does running past the idle or absolute timeout
/// before it completes. `attach` receives the live connection once the
/// handshake is done; when it returns false the connection is closed
/// straight away. The connection context is cancelled on return.
pub(crate) async fn run_connection<F>(
    ctx: Context,
    config: Arc<ServerConfig>,
    russh_config: Arc<russh::server::Config>,
    stream: Box<dyn RawStream>,
    attach: F,
) where
    F: FnOnce(Arc<Conn>) -> bool,
{
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let activity = Arc::new(Notify::new());
    let handler = SshHandler::new(ctx.clone(), config.clone(), events_tx, activity.clone());
    let stream = VersionSniffer::new(stream, ctx.clone());

    // a client that never sends its identification line is bound by the
    // same limits as an established connection
    let limit = match (config.idle_timeout, config.max_timeout) {
        (Some(idle), Some(max)) => Some(idle.min(max)),
        (idle, max) => idle.or(max),
    };
    let expired = async move {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    let handshake = russh::server::run_stream(russh_config, stream, handler);
    let running = tokio::select! {
        result = handshake => match result {
            Ok(running) => running,
            Err(e) => {
                debug!(peer = %ctx.remote_addr(), "handshake failed: {}", e);
                ctx.cancel();
                return;
            }
        },
        _ = ctx.cancelled() => {
            debug!(peer = %ctx.remote_addr(), "handshake abandoned");
            return;
        }
        _ = expired => {
            debug!(peer = %ctx.remote_addr(), "handshake timed out");
            ctx.cancel();
            return;
        }
    };

    let conn = Conn::new(ctx.clone(), config, RusshConnection::new(running.handle()));
    if !attach(conn.clone()) {
        if let Err(e) = conn.close().await {
            debug!(peer = %ctx.remote_addr(), "close failed: {}", e);
        }
    }
    let supervisor = tokio::spawn(conn::supervise(conn, events_rx, activity));

    if let Err(e) = running.await {
        warn!(peer = %ctx.remote_addr(), "connection error: {}", e);
    }
    ctx.cancel();
    let _ = supervisor.await;
    debug!(peer = %ctx.remote_addr(), "connection finished");
}
