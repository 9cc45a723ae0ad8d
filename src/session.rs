//! Application-facing session handle
//!
//! A [`Session`] is handed to the session handler once the client has sent
//! its run request (`shell`, `exec` or `subsystem`). Everything negotiated
//! before that (environment, PTY, command) is frozen into it; window changes
//! and signals keep arriving through it while the handler runs.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::auth::{Permissions, PublicKey};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::pty::{Pty, Window};
use crate::transport::ChannelIo;

/// Callback invoked once per session, after the run request is accepted.
pub type SessionHandler = Arc<dyn Fn(Session) -> BoxFuture<'static, ()> + Send + Sync>;

/// Build a [`SessionHandler`] from an async function.
pub fn handler<F, Fut>(f: F) -> SessionHandler
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |session| Box::pin(f(session)))
}

/// POSIX signals as listed in RFC 4254 section 6.10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Abrt,
    Alrm,
    Fpe,
    Hup,
    Ill,
    Int,
    Kill,
    Pipe,
    Quit,
    Segv,
    Term,
    Usr1,
    Usr2,
}

impl Signal {
    pub const ALL: [Signal; 13] = [
        Signal::Abrt,
        Signal::Alrm,
        Signal::Fpe,
        Signal::Hup,
        Signal::Ill,
        Signal::Int,
        Signal::Kill,
        Signal::Pipe,
        Signal::Quit,
        Signal::Segv,
        Signal::Term,
        Signal::Usr1,
        Signal::Usr2,
    ];

    /// Wire name, without the `SIG` prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Abrt => "ABRT",
            Signal::Alrm => "ALRM",
            Signal::Fpe => "FPE",
            Signal::Hup => "HUP",
            Signal::Ill => "ILL",
            Signal::Int => "INT",
            Signal::Kill => "KILL",
            Signal::Pipe => "PIPE",
            Signal::Quit => "QUIT",
            Signal::Segv => "SEGV",
            Signal::Term => "TERM",
            Signal::Usr1 => "USR1",
            Signal::Usr2 => "USR2",
        }
    }
}

impl FromStr for Signal {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Signal::ALL
            .iter()
            .copied()
            .find(|sig| sig.as_str() == s)
            .ok_or(())
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What [`Session::next_event`] yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Input(Bytes),
    Resize(Window),
    Signal(Signal),
}

async fn next_window(window: &mut Option<watch::Receiver<Window>>) -> Option<Window> {
    let rx = window.as_mut()?;
    rx.changed().await.ok()?;
    let window = *rx.borrow_and_update();
    Some(window)
}

/// Send the exit status and close, at most once per session.
pub(crate) async fn send_exit(io: &dyn ChannelIo, exited: &AtomicBool, code: u32) -> Result<()> {
    if exited.swap(true, Ordering::SeqCst) {
        return Err(Error::SessionExited);
    }
    io.exit_status(code).await?;
    io.close().await
}

/// Everything the channel worker hands over when the session starts.
pub(crate) struct SessionParts {
    pub ctx: Context,
    pub io: Arc<dyn ChannelIo>,
    pub env: Vec<String>,
    pub raw_command: String,
    pub command: Vec<String>,
    pub subsystem: Option<String>,
    pub pty: Option<(String, watch::Receiver<Window>)>,
    pub stdin: mpsc::UnboundedReceiver<Bytes>,
    pub signals: mpsc::UnboundedReceiver<Signal>,
    pub exited: Arc<AtomicBool>,
    pub closed: CancellationToken,
}

/// A running session on one channel.
pub struct Session {
    ctx: Context,
    io: Arc<dyn ChannelIo>,
    env: Vec<String>,
    raw_command: String,
    command: Vec<String>,
    subsystem: Option<String>,
    term: Option<String>,
    window: Option<watch::Receiver<Window>>,
    stdin: mpsc::UnboundedReceiver<Bytes>,
    signals: mpsc::UnboundedReceiver<Signal>,
    exited: Arc<AtomicBool>,
    closed: CancellationToken,
}

impl Session {
    pub(crate) fn new(parts: SessionParts) -> Self {
        let (term, window) = match parts.pty {
            Some((term, window)) => (Some(term), Some(window)),
            None => (None, None),
        };
        Self {
            ctx: parts.ctx,
            io: parts.io,
            env: parts.env,
            raw_command: parts.raw_command,
            command: parts.command,
            subsystem: parts.subsystem,
            term,
            window,
            stdin: parts.stdin,
            signals: parts.signals,
            exited: parts.exited,
            closed: parts.closed,
        }
    }

    /// Give the inbound queues back when a run request is refused.
    pub(crate) fn into_queues(
        self,
    ) -> (mpsc::UnboundedReceiver<Bytes>, mpsc::UnboundedReceiver<Signal>) {
        (self.stdin, self.signals)
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Username of the connection; empty when the client never sent one.
    pub fn user(&self) -> &str {
        self.ctx.user().unwrap_or_default()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.ctx.remote_addr()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.ctx.local_addr()
    }

    pub fn permissions(&self) -> Option<&Permissions> {
        self.ctx.permissions()
    }

    pub fn public_key(&self) -> Option<&PublicKey> {
        self.ctx.public_key()
    }

    /// Environment sent by the client, as `key=value` in arrival order.
    pub fn environ(&self) -> &[String] {
        &self.env
    }

    /// Shell-parsed command, empty for `shell` and subsystems.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Command exactly as the client sent it.
    pub fn raw_command(&self) -> &str {
        &self.raw_command
    }

    pub fn subsystem(&self) -> Option<&str> {
        self.subsystem.as_deref()
    }

    /// Allocated PTY with its current window, if the client asked for one.
    pub fn pty(&self) -> Option<Pty> {
        let term = self.term.clone()?;
        let window = *self.window.as_ref()?.borrow();
        Some(Pty { term, window })
    }

    /// Wait for the next terminal resize.
    ///
    /// Returns `None` without a PTY or once the channel is gone. Resizes
    /// that land while nobody waits are coalesced into the latest one.
    pub async fn window_changed(&mut self) -> Option<Window> {
        next_window(&mut self.window).await
    }

    /// Next input, resize or signal, whichever comes first.
    ///
    /// Returns `None` once input has ended; signals and resizes still
    /// pending at that point can be drained with [`Session::signal`] and
    /// [`Session::window_changed`].
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let Self {
            stdin,
            signals,
            window,
            ..
        } = self;
        tokio::select! {
            biased;
            Some(signal) = signals.recv() => Some(SessionEvent::Signal(signal)),
            Some(window) = next_window(window) => Some(SessionEvent::Resize(window)),
            input = stdin.recv() => input.map(SessionEvent::Input),
        }
    }

    /// Next signal delivered by the client. Signals queue until read.
    pub async fn signal(&mut self) -> Option<Signal> {
        self.signals.recv().await
    }

    /// Next chunk of client input, `None` after EOF or close.
    pub async fn read(&mut self) -> Option<Bytes> {
        self.stdin.recv().await
    }

    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        self.io.write(data.into()).await
    }

    pub async fn write_stderr(&self, data: impl Into<Bytes>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        self.io.write_stderr(data.into()).await
    }

    /// Send the exit status, then close the channel.
    ///
    /// Only the first call does anything; later calls return
    /// [`Error::SessionExited`].
    pub async fn exit(&self, code: u32) -> Result<()> {
        send_exit(self.io.as_ref(), &self.exited, code).await
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Close the channel without an exit status.
    pub async fn close(&self) -> Result<()> {
        self.io.close().await
    }

    /// True once the client closed the channel or the connection went away.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user())
            .field("remote_addr", &self.remote_addr())
            .field("command", &self.command)
            .field("subsystem", &self.subsystem)
            .field("term", &self.term)
            .finish()
    }
}
