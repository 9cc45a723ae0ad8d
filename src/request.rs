//! Request handling: the per-channel session worker and global requests
//!
//! A session channel is driven by one [`SessionWorker`] task that consumes
//! the channel's inbox strictly in arrival order:
//!
//! ```text
//! Opened ──env/pty-req──▶ Configuring ──shell/exec/subsystem──▶ Running ──handler done──▶ Exited
//!    └──────────────────shell/exec/subsystem──────────────────────▲
//! ```
//!
//! Requests that fail to decode or are not allowed in the current state are
//! answered `false`; nothing a client sends tears the connection down.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent;
use crate::conn::Conn;
use crate::pty::Window;
use crate::session::{send_exit, Session, SessionHandler, SessionParts, Signal};
use crate::transport::{ChannelEvent, ChannelIo, ChannelRequest, GlobalReply, GlobalRequest};
use crate::wire;

/// Handler for an extension request type.
///
/// Serves global requests and channel requests the session worker does not
/// recognize. For channel requests only `ok` is sent back.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, conn: Arc<Conn>, request_type: &str, payload: &[u8]) -> GlobalReply;
}

/// Answer a global request from the extension table.
pub(crate) async fn route_global_request(conn: Arc<Conn>, req: GlobalRequest) {
    let reply = dispatch_extension(&conn, &req.request_type, &req.payload).await;
    req.reply(reply);
}

async fn dispatch_extension(conn: &Arc<Conn>, request_type: &str, payload: &[u8]) -> GlobalReply {
    match conn.config().request_handlers.get(request_type).cloned() {
        Some(handler) => handler.handle(conn.clone(), request_type, payload).await,
        None => {
            debug!(request = request_type, "no handler for request");
            GlobalReply::failure()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Opened,
    Configuring,
    Running,
    Exited,
}

struct PtyState {
    term: String,
    window: watch::Sender<Window>,
}

/// Owns the state of one session channel.
pub(crate) struct SessionWorker {
    conn: Arc<Conn>,
    io: Arc<dyn ChannelIo>,
    state: SessionState,
    env: Vec<String>,
    pty: Option<PtyState>,
    stdin_tx: Option<mpsc::UnboundedSender<Bytes>>,
    stdin_rx: Option<mpsc::UnboundedReceiver<Bytes>>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signal_rx: Option<mpsc::UnboundedReceiver<Signal>>,
    exited: Arc<AtomicBool>,
    closed: CancellationToken,
}

impl SessionWorker {
    pub(crate) fn new(conn: Arc<Conn>, io: Arc<dyn ChannelIo>) -> Self {
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let closed = conn.context().child_token();
        Self {
            conn,
            io,
            state: SessionState::Opened,
            env: Vec::new(),
            pty: None,
            stdin_tx: Some(stdin_tx),
            stdin_rx: Some(stdin_rx),
            signal_tx,
            signal_rx: Some(signal_rx),
            exited: Arc::new(AtomicBool::new(false)),
            closed,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// Process the channel inbox until the channel or connection closes.
    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        let mut running: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                _ = join(&mut running) => {
                    running = None;
                    self.state = SessionState::Exited;
                }
                event = events.recv() => match event {
                    Some(ChannelEvent::Request(req)) => {
                        if let Some(task) = self.handle_request(req).await {
                            running = Some(task);
                        }
                    }
                    Some(ChannelEvent::Data(data)) => {
                        if let Some(stdin) = &self.stdin_tx {
                            let _ = stdin.send(data);
                        }
                    }
                    Some(ChannelEvent::ExtendedData { code, .. }) => {
                        debug!(code, "ignoring extended data from client");
                    }
                    Some(ChannelEvent::Eof) => {
                        self.stdin_tx = None;
                    }
                    Some(ChannelEvent::Close) | None => break,
                }
            }
        }

        self.closed.cancel();
    }

    /// Handle one request; returns the handler task if the session started.
    pub(crate) async fn handle_request(&mut self, req: ChannelRequest) -> Option<JoinHandle<()>> {
        debug!(request = %req.request_type, state = ?self.state, "channel request");
        let request_type = req.request_type.clone();
        match request_type.as_str() {
            "env" => {
                self.handle_env(req);
                None
            }
            "pty-req" => {
                self.handle_pty(req);
                None
            }
            "window-change" => {
                self.handle_window_change(req);
                None
            }
            "shell" | "exec" | "subsystem" => self.start(req),
            "signal" => {
                self.handle_signal(req);
                None
            }
            agent::AGENT_REQUEST_TYPE => {
                agent::set_agent_requested(self.conn.context()).await;
                req.reply(true);
                None
            }
            other => {
                let reply = dispatch_extension(&self.conn, other, &req.payload).await;
                req.reply(reply.ok);
                None
            }
        }
    }

    fn configure(&mut self) {
        if self.state == SessionState::Opened {
            self.state = SessionState::Configuring;
        }
    }

    fn handle_env(&mut self, req: ChannelRequest) {
        let Some((name, value)) = wire::parse_env_request(&req.payload) else {
            req.reply(false);
            return;
        };
        if self.state >= SessionState::Running {
            debug!(name = %name, "env after session start, ignoring");
        } else {
            self.configure();
            self.env.push(format!("{}={}", name, value));
        }
        req.reply(true);
    }

    fn handle_pty(&mut self, req: ChannelRequest) {
        if self.state >= SessionState::Running {
            req.reply(false);
            return;
        }
        let Some(pty) = wire::parse_pty_request(&req.payload) else {
            debug!("malformed pty-req");
            req.reply(false);
            return;
        };
        if let Some(allow) = &self.conn.config().pty_callback {
            if !allow(self.conn.context(), &pty) {
                debug!(term = %pty.term, "pty denied");
                req.reply(false);
                return;
            }
        }
        self.configure();
        match &mut self.pty {
            Some(state) => {
                state.term = pty.term;
                state.window.send_replace(pty.window);
            }
            None => {
                let (window, _) = watch::channel(pty.window);
                self.pty = Some(PtyState {
                    term: pty.term,
                    window,
                });
            }
        }
        req.reply(true);
    }

    fn handle_window_change(&mut self, req: ChannelRequest) {
        let Some(state) = &self.pty else {
            req.reply(false);
            return;
        };
        match wire::parse_winch_request(&req.payload) {
            Some(window) => {
                state.window.send_replace(window);
                req.reply(true);
            }
            None => req.reply(false),
        }
    }

    fn handle_signal(&mut self, req: ChannelRequest) {
        let signal = wire::parse_string(&req.payload).and_then(|(name, _)| name.parse::<Signal>().ok());
        match signal {
            Some(signal) => {
                let _ = self.signal_tx.send(signal);
                req.reply(true);
            }
            None => {
                debug!("unknown signal");
                req.reply(false);
            }
        }
    }

    fn start(&mut self, req: ChannelRequest) -> Option<JoinHandle<()>> {
        if self.state >= SessionState::Running {
            debug!(request = %req.request_type, "session already started");
            req.reply(false);
            return None;
        }

        let request_type = req.request_type.clone();
        let (raw_command, subsystem) = match request_type.as_str() {
            "exec" => match wire::parse_bytes(&req.payload).map(|(raw, _)| std::str::from_utf8(raw)) {
                Some(Ok(command)) => (command.to_string(), None),
                Some(Err(_)) => {
                    debug!("exec command is not valid UTF-8");
                    req.reply(false);
                    return None;
                }
                None => {
                    req.reply(false);
                    return None;
                }
            },
            "subsystem" => match wire::parse_string(&req.payload) {
                Some((name, _)) => (String::new(), Some(name)),
                None => {
                    req.reply(false);
                    return None;
                }
            },
            _ => (String::new(), None),
        };

        let handler: SessionHandler = match &subsystem {
            Some(name) => match self.conn.config().subsystem_handlers.get(name) {
                Some(handler) => handler.clone(),
                None => {
                    debug!(subsystem = %name, "unknown subsystem");
                    req.reply(false);
                    return None;
                }
            },
            None => self.conn.config().handler.clone(),
        };

        let (stdin, signals) = match (self.stdin_rx.take(), self.signal_rx.take()) {
            (Some(stdin), Some(signals)) => (stdin, signals),
            _ => {
                req.reply(false);
                return None;
            }
        };

        let session = Session::new(SessionParts {
            ctx: self.conn.context().clone(),
            io: self.io.clone(),
            env: self.env.clone(),
            command: split_command(&raw_command),
            raw_command,
            subsystem,
            pty: self
                .pty
                .as_ref()
                .map(|state| (state.term.clone(), state.window.subscribe())),
            stdin,
            signals,
            exited: self.exited.clone(),
            closed: self.closed.clone(),
        });

        if let Some(allow) = &self.conn.config().session_request_callback {
            if !allow(&session, &request_type) {
                debug!(request = %request_type, "session request denied");
                let (stdin, signals) = session.into_queues();
                self.stdin_rx = Some(stdin);
                self.signal_rx = Some(signals);
                req.reply(false);
                return None;
            }
        }

        self.state = SessionState::Running;
        req.reply(true);

        let io = self.io.clone();
        let exited = self.exited.clone();
        Some(tokio::spawn(async move {
            handler(session).await;
            match send_exit(io.as_ref(), &exited, 0).await {
                Ok(()) | Err(crate::Error::SessionExited) => {}
                Err(e) => debug!("default exit failed: {}", e),
            }
        }))
    }
}

/// Split a command line with POSIX shell quoting.
///
/// Unbalanced quotes yield an empty argument list; the raw command is
/// still available to the handler.
pub fn split_command(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    shlex::split(raw).unwrap_or_else(|| {
        warn!(command = raw, "unbalanced quoting in command");
        Vec::new()
    })
}

async fn join(task: &mut Option<JoinHandle<()>>) {
    match task {
        Some(task) => {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("session handler panicked");
                }
            }
        }
        None => std::future::pending().await,
    }
}
