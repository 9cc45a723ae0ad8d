//! TCP port forwarding extensions
//!
//! Neither handler is installed by default. [`enable_local_forwarding`]
//! registers `direct-tcpip` channels, [`enable_reverse_forwarding`] the
//! `tcpip-forward` / `cancel-tcpip-forward` global requests. Both take the
//! callback every destination has to pass; without one, everything is
//! refused.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ChannelHandler;
use crate::config::ServerConfigBuilder;
use crate::conn::Conn;
use crate::context::Context;
use crate::request::RequestHandler;
use crate::transport::{AcceptedChannel, ChannelEvent, GlobalReply, NewChannel, RejectReason};
use crate::wire::{self, ForwardRequest, TcpipChannelData};

pub const DIRECT_TCPIP_CHANNEL_TYPE: &str = "direct-tcpip";
pub const FORWARDED_TCPIP_CHANNEL_TYPE: &str = "forwarded-tcpip";
pub const TCPIP_FORWARD_REQUEST_TYPE: &str = "tcpip-forward";
pub const CANCEL_TCPIP_FORWARD_REQUEST_TYPE: &str = "cancel-tcpip-forward";

const RELAY_BUFFER: usize = 32 * 1024;

/// Register `direct-tcpip`. Only destinations `allow` accepts are dialed.
pub fn enable_local_forwarding<F>(builder: ServerConfigBuilder, allow: F) -> ServerConfigBuilder
where
    F: Fn(&Context, &str, u32) -> bool + Send + Sync + 'static,
{
    builder
        .local_port_forwarding_callback(allow)
        .channel_handler(DIRECT_TCPIP_CHANNEL_TYPE, Arc::new(DirectTcpipHandler))
}

/// Register `tcpip-forward` and its cancellation. Only bind addresses
/// `allow` accepts are listened on.
pub fn enable_reverse_forwarding<F>(builder: ServerConfigBuilder, allow: F) -> ServerConfigBuilder
where
    F: Fn(&Context, &str, u32) -> bool + Send + Sync + 'static,
{
    let handler = Arc::new(ForwardedTcpHandler::default());
    builder
        .reverse_port_forwarding_callback(allow)
        .request_handler(TCPIP_FORWARD_REQUEST_TYPE, handler.clone())
        .request_handler(CANCEL_TCPIP_FORWARD_REQUEST_TYPE, handler)
}

/// Client-requested connections from the server to a TCP destination.
pub struct DirectTcpipHandler;

#[async_trait]
impl ChannelHandler for DirectTcpipHandler {
    async fn handle(&self, conn: Arc<Conn>, channel: NewChannel) {
        let Some(target) = TcpipChannelData::parse(channel.extra_data()) else {
            channel.reject(RejectReason::ConnectFailed, "error parsing forward data");
            return;
        };

        let allowed = conn
            .config()
            .local_port_forwarding_callback
            .as_ref()
            .is_some_and(|allow| allow(conn.context(), &target.host, target.port));
        if !allowed {
            debug!(host = %target.host, port = target.port, "local forwarding denied");
            channel.reject(RejectReason::AdministrativelyProhibited, "port forwarding is disabled");
            return;
        }

        // accept first so a slow dial never holds up the transport
        let accepted = channel.accept();
        let dest = format!("{}:{}", target.host, target.port);
        let stream = tokio::select! {
            _ = conn.context().cancelled() => return,
            result = TcpStream::connect(dest.as_str()) => result,
        };
        match stream {
            Ok(stream) => {
                debug!(dest = %dest, originator = %target.originator_host, "direct-tcpip connected");
                relay(stream, accepted).await;
            }
            Err(e) => {
                warn!(dest = %dest, "direct-tcpip dial failed: {}", e);
                let _ = accepted.io.close().await;
            }
        }
    }
}

/// Remote forwards: listeners bound on the client's behalf.
///
/// One instance serves every connection; listeners are keyed by session
/// and bind address and stop when their connection closes.
#[derive(Default)]
pub struct ForwardedTcpHandler {
    listeners: Arc<DashMap<String, CancellationToken>>,
}

impl ForwardedTcpHandler {
    fn key(conn: &Conn, host: &str, port: u32) -> String {
        format!("{}/{}:{}", conn.context().session_id(), host, port)
    }

    async fn forward(&self, conn: Arc<Conn>, req: ForwardRequest) -> GlobalReply {
        let allowed = conn
            .config()
            .reverse_port_forwarding_callback
            .as_ref()
            .is_some_and(|allow| allow(conn.context(), &req.bind_host, req.bind_port));
        if !allowed {
            debug!(host = %req.bind_host, port = req.bind_port, "reverse forwarding denied");
            return GlobalReply::failure();
        }
        let Ok(port) = u16::try_from(req.bind_port) else {
            return GlobalReply::failure();
        };

        let listener = match TcpListener::bind((req.bind_host.as_str(), port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(host = %req.bind_host, port, "tcpip-forward bind failed: {}", e);
                return GlobalReply::failure();
            }
        };
        let bound_port = match listener.local_addr() {
            Ok(addr) => u32::from(addr.port()),
            Err(_) => return GlobalReply::failure(),
        };

        let token = conn.context().child_token();
        let key = Self::key(&conn, &req.bind_host, bound_port);
        self.listeners.insert(key.clone(), token.clone());
        info!(host = %req.bind_host, port = bound_port, "remote forward listening");

        let bind_host = req.bind_host.clone();
        let listeners = self.listeners.clone();
        tokio::spawn(async move {
            accept_forwarded(conn, listener, bind_host, bound_port, token.clone()).await;
            // a newer forward on the same address holds a live token
            token.cancel();
            listeners.remove_if(&key, |_, t| t.is_cancelled());
        });

        if req.bind_port == 0 {
            let mut payload = Vec::with_capacity(4);
            wire::put_u32(&mut payload, bound_port);
            GlobalReply::success(payload.into())
        } else {
            GlobalReply::success(Bytes::new())
        }
    }

    fn cancel(&self, conn: &Conn, req: ForwardRequest) -> GlobalReply {
        let key = Self::key(conn, &req.bind_host, req.bind_port);
        match self.listeners.remove(&key) {
            Some((_, token)) => {
                token.cancel();
                GlobalReply::success(Bytes::new())
            }
            None => GlobalReply::failure(),
        }
    }
}

#[async_trait]
impl RequestHandler for ForwardedTcpHandler {
    async fn handle(&self, conn: Arc<Conn>, request_type: &str, payload: &[u8]) -> GlobalReply {
        let Some(req) = ForwardRequest::parse(payload) else {
            return GlobalReply::failure();
        };
        match request_type {
            TCPIP_FORWARD_REQUEST_TYPE => self.forward(conn, req).await,
            CANCEL_TCPIP_FORWARD_REQUEST_TYPE => self.cancel(&conn, req),
            _ => GlobalReply::failure(),
        }
    }
}

async fn accept_forwarded(
    conn: Arc<Conn>,
    listener: TcpListener,
    bind_host: String,
    bind_port: u32,
    token: CancellationToken,
) {
    loop {
        let (stream, origin) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(port = bind_port, "remote forward accept failed: {}", e);
                    break;
                }
            },
        };
        let conn = conn.clone();
        let extra = forwarded_data(&bind_host, bind_port, origin);
        tokio::spawn(async move {
            match conn.open_channel(FORWARDED_TCPIP_CHANNEL_TYPE, extra).await {
                Ok(channel) => relay(stream, channel).await,
                Err(e) => debug!(origin = %origin, "forwarded-tcpip open failed: {}", e),
            }
        });
    }
    debug!(port = bind_port, "remote forward stopped");
}

fn forwarded_data(bind_host: &str, bind_port: u32, origin: SocketAddr) -> Bytes {
    TcpipChannelData {
        host: bind_host.to_string(),
        port: bind_port,
        originator_host: origin.ip().to_string(),
        originator_port: u32::from(origin.port()),
    }
    .encode()
}

/// Copy bytes between a TCP stream and a channel until either side closes.
async fn relay(stream: TcpStream, channel: AcceptedChannel) {
    let AcceptedChannel { io, mut events } = channel;
    let (mut reader, mut writer) = stream.into_split();

    let outbound = {
        let io = io.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RELAY_BUFFER];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if io.write(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            return;
                        }
                    }
                }
            }
            let _ = io.eof().await;
            let _ = io.close().await;
        })
    };

    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Data(data) => {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
            }
            ChannelEvent::Eof => {
                let _ = writer.shutdown().await;
            }
            ChannelEvent::Close => break,
            ChannelEvent::Request(req) => req.reply(false),
            ChannelEvent::ExtendedData { .. } => {}
        }
    }

    outbound.abort();
    let _ = io.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tests::{test_config, test_conn};
    use crate::transport::mock::{MockChannel, Sent};
    use crate::wire::parse_u32;

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn direct(addr: SocketAddr) -> Bytes {
        TcpipChannelData {
            host: addr.ip().to_string(),
            port: u32::from(addr.port()),
            originator_host: "10.0.0.9".to_string(),
            originator_port: 40000,
        }
        .encode()
    }

    #[tokio::test]
    async fn test_direct_tcpip_denied_without_callback() {
        let config = test_config()
            .channel_handler(DIRECT_TCPIP_CHANNEL_TYPE, Arc::new(DirectTcpipHandler))
            .build()
            .unwrap();
        let (conn, _) = test_conn(config);
        let (channel, pending) = NewChannel::new(DIRECT_TCPIP_CHANNEL_TYPE, direct(echo_server().await), MockChannel::new());
        DirectTcpipHandler.handle(conn, channel).await;
        let rejection = pending.decision.await.unwrap().unwrap_err();
        assert_eq!(rejection.reason, RejectReason::AdministrativelyProhibited);
    }

    #[tokio::test]
    async fn test_direct_tcpip_malformed() {
        let (conn, _) = test_conn(enable_local_forwarding(test_config(), |_, _, _| true).build().unwrap());
        let (channel, pending) = NewChannel::new(DIRECT_TCPIP_CHANNEL_TYPE, Bytes::from_static(b"\0\0"), MockChannel::new());
        DirectTcpipHandler.handle(conn, channel).await;
        let rejection = pending.decision.await.unwrap().unwrap_err();
        assert_eq!(rejection.reason, RejectReason::ConnectFailed);
    }

    #[tokio::test]
    async fn test_direct_tcpip_relays() {
        let (conn, _) = test_conn(enable_local_forwarding(test_config(), |_, _, _| true).build().unwrap());
        let io = MockChannel::new();
        let (channel, pending) = NewChannel::new(DIRECT_TCPIP_CHANNEL_TYPE, direct(echo_server().await), io.clone());
        let task = tokio::spawn(async move { DirectTcpipHandler.handle(conn, channel).await });

        assert_eq!(pending.decision.await.unwrap(), Ok(()));
        pending.events.send(ChannelEvent::Data(Bytes::from_static(b"ping"))).unwrap();
        io.wait_for(|sent| sent.contains(&Sent::Data(b"ping".to_vec()))).await;

        pending.events.send(ChannelEvent::Close).unwrap();
        task.await.unwrap();
        assert!(io.sent().contains(&Sent::Close));
    }

    #[tokio::test]
    async fn test_local_callback_filters_destinations() {
        let builder = enable_local_forwarding(test_config(), |_, host, _| host == "localhost");
        let (conn, _) = test_conn(builder.build().unwrap());
        let (channel, pending) = NewChannel::new(DIRECT_TCPIP_CHANNEL_TYPE, direct(echo_server().await), MockChannel::new());
        DirectTcpipHandler.handle(conn, channel).await;
        let rejection = pending.decision.await.unwrap().unwrap_err();
        assert_eq!(rejection.reason, RejectReason::AdministrativelyProhibited);
    }

    #[tokio::test]
    async fn test_reverse_forward_opens_channel() {
        let handler = ForwardedTcpHandler::default();
        let (conn, io) = test_conn(enable_reverse_forwarding(test_config(), |_, _, _| true).build().unwrap());

        let req = ForwardRequest {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 0,
        };
        let reply = handler
            .handle(conn.clone(), TCPIP_FORWARD_REQUEST_TYPE, &req.encode())
            .await;
        assert!(reply.ok);
        let (port, _) = parse_u32(&reply.payload).unwrap();
        assert_ne!(port, 0);

        let _client = TcpStream::connect(("127.0.0.1", port as u16)).await.unwrap();
        let extra = loop {
            if let Some((channel_type, extra, _, _)) = io.opened.lock().unwrap().first() {
                assert_eq!(channel_type, FORWARDED_TCPIP_CHANNEL_TYPE);
                break extra.clone();
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        };
        let data = TcpipChannelData::parse(&extra).unwrap();
        assert_eq!(data.host, "127.0.0.1");
        assert_eq!(data.port, port);
        assert_eq!(data.originator_host, "127.0.0.1");

        let cancel = ForwardRequest {
            bind_host: "127.0.0.1".to_string(),
            bind_port: port,
        };
        let reply = handler
            .handle(conn.clone(), CANCEL_TCPIP_FORWARD_REQUEST_TYPE, &cancel.encode())
            .await;
        assert!(reply.ok);
        let reply = handler
            .handle(conn, CANCEL_TCPIP_FORWARD_REQUEST_TYPE, &cancel.encode())
            .await;
        assert!(!reply.ok);
    }

    #[tokio::test]
    async fn test_reverse_forward_denied() {
        let handler = ForwardedTcpHandler::default();
        let config = test_config()
            .request_handler(TCPIP_FORWARD_REQUEST_TYPE, Arc::new(ForwardedTcpHandler::default()))
            .build()
            .unwrap();
        let (conn, _) = test_conn(config);
        let req = ForwardRequest {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 0,
        };
        let reply = handler.handle(conn, TCPIP_FORWARD_REQUEST_TYPE, &req.encode()).await;
        assert_eq!(reply, GlobalReply::failure());
    }
}
