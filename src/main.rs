//! sshframe demo server
//!
//! Accepts any client (no authentication callbacks are configured), greets
//! it, reports the pty, environment and command it asked for, then echoes
//! input until Ctrl-D.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sshframe::config::Config;
use sshframe::{forward, handler, paths, Server, ServerConfig, Session, SessionEvent};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const CTRL_D: u8 = 0x04;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sshframe=info".parse()?),
        )
        .init();

    paths::log_paths();
    let config = Config::load(paths::config_path()).context("failed to load config")?;
    info!(addr = %config.listen_addr, "starting sshframe");

    let key = load_or_generate_host_key(&config.host_key_path())?;
    let mut builder = config.apply(
        ServerConfig::builder()
            .host_key(key)
            .handler(handler(demo_session)),
    );
    // the demo trusts its operator: enabling forwarding opens every address
    if config.allow_local_forwarding {
        warn!("local port forwarding enabled for every destination");
        builder = forward::enable_local_forwarding(builder, |_, _, _| true);
    }
    if config.allow_reverse_forwarding {
        warn!("reverse port forwarding enabled for every bind address");
        builder = forward::enable_reverse_forwarding(builder, |_, _, _| true);
    }
    let server_config = builder.build().context("invalid server configuration")?;

    let server = Server::new(server_config);
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.listen_and_serve().await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down, waiting up to {:?} for connections", SHUTDOWN_GRACE);

    let cancel = CancellationToken::new();
    let timer = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            cancel.cancel();
        }
    });
    if let Err(e) = server.shutdown(cancel).await {
        warn!("{}, closing remaining connections", e);
        server.close().await?;
    }
    timer.abort();

    match serving.await? {
        Err(sshframe::Error::ServerClosed) => Ok(()),
        Err(e) => Err(e.into()),
        Ok(()) => Ok(()),
    }
}

async fn demo_session(mut session: Session) {
    let user = match session.user() {
        "" => "stranger".to_string(),
        user => user.to_string(),
    };
    let mut report = format!("hello {}, from {}\r\n", user, session.remote_addr());
    match session.pty() {
        Some(pty) => report.push_str(&format!(
            "pty: {} {}x{}\r\n",
            pty.term, pty.window.width, pty.window.height
        )),
        None => report.push_str("no pty\r\n"),
    }
    for var in session.environ() {
        report.push_str(&format!("env: {}\r\n", var));
    }
    if !session.raw_command().is_empty() {
        report.push_str(&format!("command: {:?}\r\n", session.command()));
    }
    if let Some(name) = session.subsystem() {
        report.push_str(&format!("subsystem: {}\r\n", name));
    }
    report.push_str("type to echo, ctrl-d to quit\r\n");
    if session.write(report).await.is_err() {
        return;
    }

    while let Some(event) = session.next_event().await {
        let reply = match event {
            SessionEvent::Input(data) if data.contains(&CTRL_D) => break,
            SessionEvent::Input(data) => data,
            SessionEvent::Resize(window) => {
                format!("\r\nwindow: {}x{}\r\n", window.width, window.height).into()
            }
            SessionEvent::Signal(signal) => {
                info!(user = %user, %signal, "signal received");
                format!("\r\nsignal: {}\r\n", signal).into()
            }
        };
        if session.write(reply).await.is_err() {
            return;
        }
    }

    let _ = session.write("bye\r\n").await;
    if let Err(e) = session.exit(0).await {
        warn!(user = %user, "exit failed: {}", e);
    }
}

fn load_or_generate_host_key(path: &Path) -> Result<russh::keys::PrivateKey> {
    if path.exists() {
        info!("loading host key from {}", path.display());
        Ok(russh::keys::decode_secret_key(
            &std::fs::read_to_string(path)?,
            None,
        )?)
    } else {
        info!("generating new host key at {}", path.display());
        let key = russh::keys::PrivateKey::random(
            &mut rand::thread_rng(),
            russh::keys::Algorithm::Ed25519,
        )
        .context("failed to generate key")?;

        paths::ensure_parent(path)?;
        std::fs::write(path, key.to_openssh(russh::keys::ssh_key::LineEnding::LF)?)?;

        Ok(key)
    }
}
