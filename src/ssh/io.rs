//! Outbound halves backed by a russh session handle

use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, Disconnect};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::forward::FORWARDED_TCPIP_CHANNEL_TYPE;
use crate::transport::{AcceptedChannel, ChannelEvent, ChannelIo, ConnectionIo};
use crate::wire::TcpipChannelData;

/// One channel, written through the session handle.
pub(crate) struct RusshChannel {
    id: ChannelId,
    handle: Handle,
}

impl RusshChannel {
    pub(crate) fn new(id: ChannelId, handle: Handle) -> Arc<Self> {
        Arc::new(Self { id, handle })
    }
}

#[async_trait]
impl ChannelIo for RusshChannel {
    async fn write(&self, data: Bytes) -> Result<()> {
        self.handle
            .data(self.id, CryptoVec::from(&data[..]))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    async fn write_stderr(&self, data: Bytes) -> Result<()> {
        self.handle
            .extended_data(self.id, 1, CryptoVec::from(&data[..]))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    async fn exit_status(&self, code: u32) -> Result<()> {
        self.handle
            .exit_status_request(self.id, code)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    async fn eof(&self) -> Result<()> {
        self.handle.eof(self.id).await.map_err(|_| Error::ChannelClosed)
    }

    async fn close(&self) -> Result<()> {
        self.handle.close(self.id).await.map_err(|_| Error::ChannelClosed)
    }
}

/// The connection as a whole.
pub(crate) struct RusshConnection {
    handle: Handle,
}

impl RusshConnection {
    pub(crate) fn new(handle: Handle) -> Arc<Self> {
        Arc::new(Self { handle })
    }
}

#[async_trait]
impl ConnectionIo for RusshConnection {
    async fn open_channel(&self, channel_type: &str, extra_data: Bytes) -> Result<AcceptedChannel> {
        if channel_type != FORWARDED_TCPIP_CHANNEL_TYPE {
            return Err(Error::Transport(format!(
                "cannot open {channel_type} channels"
            )));
        }
        let data = TcpipChannelData::parse(&extra_data)
            .ok_or_else(|| Error::Transport("malformed forwarded-tcpip data".to_string()))?;

        let channel = self
            .handle
            .channel_open_forwarded_tcpip(
                data.host,
                data.port,
                data.originator_host,
                data.originator_port,
            )
            .await?;

        let io = RusshChannel::new(channel.id(), self.handle.clone());
        let (tx, events) = mpsc::unbounded_channel();
        tokio::spawn(pump(channel, tx));
        Ok(AcceptedChannel { io, events })
    }

    async fn close(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "closed by server".into(), "en".into())
            .await?;
        Ok(())
    }
}

/// Feed a server-opened channel's messages into its inbox.
async fn pump(mut channel: Channel<Msg>, tx: mpsc::UnboundedSender<ChannelEvent>) {
    while let Some(msg) = channel.wait().await {
        let event = match msg {
            ChannelMsg::Data { data } => ChannelEvent::Data(Bytes::copy_from_slice(&data)),
            ChannelMsg::ExtendedData { data, ext } => ChannelEvent::ExtendedData {
                code: ext,
                data: Bytes::copy_from_slice(&data),
            },
            ChannelMsg::Eof => ChannelEvent::Eof,
            ChannelMsg::Close => ChannelEvent::Close,
            _ => continue,
        };
        let closing = matches!(event, ChannelEvent::Close);
        if tx.send(event).is_err() || closing {
            break;
        }
    }
    debug!(channel = ?channel.id(), "forwarded channel finished");
}
