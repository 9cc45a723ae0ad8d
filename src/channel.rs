//! Channel-open dispatch

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::conn::Conn;
use crate::request::SessionWorker;
use crate::transport::{NewChannel, RejectReason};

pub const SESSION_CHANNEL_TYPE: &str = "session";

/// Handler for an extension channel type.
///
/// The handler owns the decision: it must `accept` or `reject` the channel
/// (dropping it rejects with a resource shortage).
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn handle(&self, conn: Arc<Conn>, channel: NewChannel);
}

/// Built-in handler for `session` channels.
///
/// Registered implicitly; exposed so a replacement handler can fall back
/// to it.
pub struct SessionChannelHandler;

#[async_trait]
impl ChannelHandler for SessionChannelHandler {
    async fn handle(&self, conn: Arc<Conn>, channel: NewChannel) {
        let accepted = channel.accept();
        SessionWorker::new(conn, accepted.io).run(accepted.events).await;
    }
}

/// Route a channel open to its handler on a task of its own.
pub(crate) fn dispatch(conn: Arc<Conn>, channel: NewChannel) {
    let channel_type = channel.channel_type().to_string();
    debug!(channel_type = %channel_type, "channel open");

    let handler: Arc<dyn ChannelHandler> = match conn.config().channel_handlers.get(&channel_type) {
        Some(handler) => handler.clone(),
        None if channel_type == SESSION_CHANNEL_TYPE => Arc::new(SessionChannelHandler),
        None => {
            debug!(channel_type = %channel_type, "rejecting unknown channel type");
            channel.reject(RejectReason::UnknownChannelType, "unknown channel type");
            return;
        }
    };

    tokio::spawn(async move { handler.handle(conn, channel).await });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tests::{test_config, test_conn};
    use crate::transport::mock::MockChannel;
    use bytes::Bytes;

    struct Refuse;

    #[async_trait]
    impl ChannelHandler for Refuse {
        async fn handle(&self, _conn: Arc<Conn>, channel: NewChannel) {
            channel.reject(RejectReason::AdministrativelyProhibited, "no sessions here");
        }
    }

    struct Forget;

    #[async_trait]
    impl ChannelHandler for Forget {
        async fn handle(&self, _conn: Arc<Conn>, _channel: NewChannel) {}
    }

    #[tokio::test]
    async fn test_extension_overrides_session() {
        let config = test_config()
            .channel_handler("session", Arc::new(Refuse))
            .build()
            .unwrap();
        let (conn, _) = test_conn(config);
        let (channel, pending) = NewChannel::new("session", Bytes::new(), MockChannel::new());
        dispatch(conn, channel);
        let rejection = pending.decision.await.unwrap().unwrap_err();
        assert_eq!(rejection.reason, RejectReason::AdministrativelyProhibited);
        assert_eq!(rejection.message, "no sessions here");
    }

    #[tokio::test]
    async fn test_session_accepted_by_default() {
        let (conn, _) = test_conn(test_config().build().unwrap());
        let (channel, pending) = NewChannel::new("session", Bytes::new(), MockChannel::new());
        dispatch(conn, channel);
        assert_eq!(pending.decision.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let (conn, _) = test_conn(test_config().build().unwrap());
        let (channel, pending) = NewChannel::new("x11", Bytes::new(), MockChannel::new());
        dispatch(conn, channel);
        let rejection = pending.decision.await.unwrap().unwrap_err();
        assert_eq!(rejection.reason, RejectReason::UnknownChannelType);
    }

    #[tokio::test]
    async fn test_handler_dropping_channel_rejects() {
        let config = test_config()
            .channel_handler("custom@example.com", Arc::new(Forget))
            .build()
            .unwrap();
        let (conn, _) = test_conn(config);
        let (channel, pending) = NewChannel::new("custom@example.com", Bytes::new(), MockChannel::new());
        dispatch(conn, channel);
        let rejection = pending.decision.await.unwrap().unwrap_err();
        assert_eq!(rejection.reason, RejectReason::ResourceShortage);
    }
}
