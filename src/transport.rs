//! Contract between the framework and the secure transport
//!
//! The transport owns key exchange, encryption and authentication. Once a
//! connection is up it feeds the framework [`ConnectionEvent`]s (channel
//! opens, global requests) and, per accepted channel, [`ChannelEvent`]s in
//! arrival order. Outbound traffic goes back through [`ChannelIo`] and
//! [`ConnectionIo`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;

/// Byte stream a connection runs over, before the SSH handshake.
pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Inbound event on one channel.
#[derive(Debug)]
pub enum ChannelEvent {
    Request(ChannelRequest),
    Data(Bytes),
    ExtendedData { code: u32, data: Bytes },
    Eof,
    Close,
}

/// A channel request awaiting its answer.
///
/// Dropping it unanswered replies `false`.
pub struct ChannelRequest {
    pub request_type: String,
    pub want_reply: bool,
    pub payload: Bytes,
    reply: Option<oneshot::Sender<bool>>,
}

impl ChannelRequest {
    pub fn new(
        request_type: impl Into<String>,
        want_reply: bool,
        payload: Bytes,
    ) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            request_type: request_type.into(),
            want_reply,
            payload,
            reply: Some(tx),
        };
        (request, rx)
    }

    pub fn reply(mut self, ok: bool) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(ok);
        }
    }
}

impl Drop for ChannelRequest {
    fn drop(&mut self) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(false);
        }
    }
}

impl fmt::Debug for ChannelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRequest")
            .field("request_type", &self.request_type)
            .field("want_reply", &self.want_reply)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Answer to a global request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GlobalReply {
    pub ok: bool,
    pub payload: Bytes,
}

impl GlobalReply {
    pub fn success(payload: Bytes) -> Self {
        Self { ok: true, payload }
    }

    pub fn failure() -> Self {
        Self::default()
    }
}

/// A connection-scoped request awaiting its answer.
///
/// Dropping it unanswered replies `ok=false` with an empty payload.
pub struct GlobalRequest {
    pub request_type: String,
    pub want_reply: bool,
    pub payload: Bytes,
    reply: Option<oneshot::Sender<GlobalReply>>,
}

impl GlobalRequest {
    pub fn new(
        request_type: impl Into<String>,
        want_reply: bool,
        payload: Bytes,
    ) -> (Self, oneshot::Receiver<GlobalReply>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            request_type: request_type.into(),
            want_reply,
            payload,
            reply: Some(tx),
        };
        (request, rx)
    }

    pub fn reply(mut self, reply: GlobalReply) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(reply);
        }
    }
}

impl Drop for GlobalRequest {
    fn drop(&mut self) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(GlobalReply::failure());
        }
    }
}

impl fmt::Debug for GlobalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalRequest")
            .field("request_type", &self.request_type)
            .field("want_reply", &self.want_reply)
            .finish()
    }
}

/// Outbound half of one channel.
#[async_trait]
pub trait ChannelIo: Send + Sync {
    async fn write(&self, data: Bytes) -> Result<()>;
    async fn write_stderr(&self, data: Bytes) -> Result<()>;
    async fn exit_status(&self, code: u32) -> Result<()>;
    async fn eof(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Outbound half of one connection.
#[async_trait]
pub trait ConnectionIo: Send + Sync {
    /// Open a server-initiated channel to the client.
    async fn open_channel(&self, channel_type: &str, extra_data: Bytes) -> Result<AcceptedChannel>;
    /// Tear the connection down, with every channel on it.
    async fn close(&self) -> Result<()>;
}

/// Channel-open failure reasons (RFC 4254 section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
}

impl RejectReason {
    pub fn code(self) -> u32 {
        match self {
            RejectReason::AdministrativelyProhibited => 1,
            RejectReason::ConnectFailed => 2,
            RejectReason::UnknownChannelType => 3,
            RejectReason::ResourceShortage => 4,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::AdministrativelyProhibited => "administratively prohibited",
            RejectReason::ConnectFailed => "connect failed",
            RejectReason::UnknownChannelType => "unknown channel type",
            RejectReason::ResourceShortage => "resource shortage",
        };
        f.write_str(s)
    }
}

/// Why a channel open was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRejection {
    pub reason: RejectReason,
    pub message: String,
}

/// An accepted channel: where to write and where inbound events arrive.
pub struct AcceptedChannel {
    pub io: Arc<dyn ChannelIo>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl fmt::Debug for AcceptedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptedChannel").finish_non_exhaustive()
    }
}

/// A channel-open awaiting a decision.
///
/// Dropping it undecided rejects with [`RejectReason::ResourceShortage`].
pub struct NewChannel {
    channel_type: String,
    extra_data: Bytes,
    io: Arc<dyn ChannelIo>,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    decision: Option<oneshot::Sender<std::result::Result<(), OpenRejection>>>,
}

/// Transport side of a [`NewChannel`]: where to push inbound events and
/// where the decision arrives.
pub struct PendingOpen {
    pub events: mpsc::UnboundedSender<ChannelEvent>,
    pub decision: oneshot::Receiver<std::result::Result<(), OpenRejection>>,
}

impl NewChannel {
    pub fn new(
        channel_type: impl Into<String>,
        extra_data: Bytes,
        io: Arc<dyn ChannelIo>,
    ) -> (Self, PendingOpen) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (decision_tx, decision_rx) = oneshot::channel();
        let channel = Self {
            channel_type: channel_type.into(),
            extra_data,
            io,
            events: Some(events_rx),
            decision: Some(decision_tx),
        };
        let pending = PendingOpen {
            events: events_tx,
            decision: decision_rx,
        };
        (channel, pending)
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    pub fn extra_data(&self) -> &[u8] {
        &self.extra_data
    }

    pub fn accept(mut self) -> AcceptedChannel {
        if let Some(tx) = self.decision.take() {
            let _ = tx.send(Ok(()));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        drop(events_tx);
        AcceptedChannel {
            io: self.io.clone(),
            events: self.events.take().unwrap_or(events_rx),
        }
    }

    pub fn reject(mut self, reason: RejectReason, message: impl Into<String>) {
        if let Some(tx) = self.decision.take() {
            let _ = tx.send(Err(OpenRejection {
                reason,
                message: message.into(),
            }));
        }
    }
}

impl Drop for NewChannel {
    fn drop(&mut self) {
        if let Some(tx) = self.decision.take() {
            let _ = tx.send(Err(OpenRejection {
                reason: RejectReason::ResourceShortage,
                message: "channel open abandoned".to_string(),
            }));
        }
    }
}

impl fmt::Debug for NewChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewChannel")
            .field("channel_type", &self.channel_type)
            .field("extra_data_len", &self.extra_data.len())
            .finish()
    }
}

/// Connection-level event produced by the transport.
#[derive(Debug)]
pub enum ConnectionEvent {
    ChannelOpen(NewChannel),
    GlobalRequest(GlobalRequest),
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory transport used by unit tests.

    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;

    /// What a mock channel was asked to send to the peer.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Sent {
        Data(Vec<u8>),
        Stderr(Vec<u8>),
        ExitStatus(u32),
        Eof,
        Close,
    }

    #[derive(Default)]
    pub struct MockChannel {
        sent: Mutex<Vec<Sent>>,
        notify: tokio::sync::Notify,
    }

    impl MockChannel {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }

        fn push(&self, item: Sent) -> Result<()> {
            let mut sent = self.sent.lock().unwrap();
            if sent.contains(&Sent::Close) {
                return Err(Error::ChannelClosed);
            }
            sent.push(item);
            self.notify.notify_waiters();
            Ok(())
        }

        /// Wait until something matching `pred` has been sent.
        pub async fn wait_for(&self, pred: impl Fn(&[Sent]) -> bool) {
            loop {
                let notified = self.notify.notified();
                if pred(&self.sent.lock().unwrap()) {
                    return;
                }
                notified.await;
            }
        }
    }

    #[async_trait]
    impl ChannelIo for MockChannel {
        async fn write(&self, data: Bytes) -> Result<()> {
            self.push(Sent::Data(data.to_vec()))
        }

        async fn write_stderr(&self, data: Bytes) -> Result<()> {
            self.push(Sent::Stderr(data.to_vec()))
        }

        async fn exit_status(&self, code: u32) -> Result<()> {
            self.push(Sent::ExitStatus(code))
        }

        async fn eof(&self) -> Result<()> {
            self.push(Sent::Eof)
        }

        async fn close(&self) -> Result<()> {
            self.push(Sent::Close)
        }
    }

    /// Connection fake: records opened channels and whether it was closed.
    #[derive(Default)]
    pub struct MockConnection {
        pub opened: Mutex<Vec<(String, Bytes, mpsc::UnboundedSender<ChannelEvent>, Arc<MockChannel>)>>,
        pub closed: std::sync::atomic::AtomicBool,
    }

    impl MockConnection {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConnectionIo for MockConnection {
        async fn open_channel(&self, channel_type: &str, extra_data: Bytes) -> Result<AcceptedChannel> {
            let io = MockChannel::new();
            let (tx, rx) = mpsc::unbounded_channel();
            self.opened
                .lock()
                .unwrap()
                .push((channel_type.to_string(), extra_data, tx, io.clone()));
            Ok(AcceptedChannel { io, events: rx })
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mock::MockChannel;

    #[tokio::test]
    async fn test_dropped_channel_request_replies_false() {
        let (req, rx) = ChannelRequest::new("pty-req", true, Bytes::new());
        drop(req);
        assert!(!rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_channel_request_reply() {
        let (req, rx) = ChannelRequest::new("shell", true, Bytes::new());
        req.reply(true);
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_global_request_replies_failure() {
        let (req, rx) = GlobalRequest::new("keepalive@openssh.com", true, Bytes::new());
        drop(req);
        assert_eq!(rx.await.unwrap(), GlobalReply::failure());
    }

    #[tokio::test]
    async fn test_new_channel_accept_routes_events() {
        let (nc, pending) = NewChannel::new("session", Bytes::new(), MockChannel::new());
        let mut accepted = nc.accept();
        assert_eq!(pending.decision.await.unwrap(), Ok(()));
        pending.events.send(ChannelEvent::Eof).unwrap();
        assert!(matches!(accepted.events.recv().await, Some(ChannelEvent::Eof)));
    }

    #[tokio::test]
    async fn test_new_channel_reject() {
        let (nc, pending) = NewChannel::new("x11", Bytes::new(), MockChannel::new());
        nc.reject(RejectReason::UnknownChannelType, "unknown channel type");
        let rejection = pending.decision.await.unwrap().unwrap_err();
        assert_eq!(rejection.reason, RejectReason::UnknownChannelType);
        assert_eq!(rejection.reason.code(), 3);
    }

    #[tokio::test]
    async fn test_new_channel_drop_rejects() {
        let (nc, pending) = NewChannel::new("session", Bytes::new(), MockChannel::new());
        drop(nc);
        let rejection = pending.decision.await.unwrap().unwrap_err();
        assert_eq!(rejection.reason, RejectReason::ResourceShortage);
    }
}
