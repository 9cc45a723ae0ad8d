//! russh callbacks translated into connection and channel events

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use russh::keys::PublicKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, Pty, Sig};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::agent::AGENT_REQUEST_TYPE;
use crate::auth::Permissions;
use crate::channel::SESSION_CHANNEL_TYPE;
use crate::config::ServerConfig;
use crate::context::Context;
use crate::forward::{
    CANCEL_TCPIP_FORWARD_REQUEST_TYPE, DIRECT_TCPIP_CHANNEL_TYPE, TCPIP_FORWARD_REQUEST_TYPE,
};
use crate::pty::Window;
use crate::ssh::io::RusshChannel;
use crate::transport::{
    ChannelEvent, ChannelRequest, ConnectionEvent, GlobalRequest, NewChannel,
};
use crate::wire::{self, ForwardRequest, TcpipChannelData};

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

/// Per-connection russh handler
///
/// Owns nothing but routing: every callback becomes an event for the
/// connection supervisor or for the channel's worker, and the answer that
/// comes back is relayed to the client.
pub struct SshHandler {
    ctx: Context,
    config: Arc<ServerConfig>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    routes: HashMap<ChannelId, mpsc::UnboundedSender<ChannelEvent>>,
    activity: Arc<Notify>,
}

impl SshHandler {
    pub(crate) fn new(
        ctx: Context,
        config: Arc<ServerConfig>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        activity: Arc<Notify>,
    ) -> Self {
        Self {
            ctx,
            config,
            events,
            routes: HashMap::new(),
            activity,
        }
    }

    fn touch(&self) {
        self.activity.notify_one();
    }

    /// Commit a verified login: the user and what it was granted.
    fn authenticated(&self, user: &str, permissions: Permissions) -> Auth {
        self.ctx.set_user(user);
        self.ctx.set_permissions(permissions);
        info!(user, peer = %self.ctx.remote_addr(), "authenticated");
        Auth::Accept
    }

    async fn open(
        &mut self,
        channel: Channel<Msg>,
        channel_type: &str,
        extra_data: Bytes,
        session: &mut Session,
    ) -> bool {
        self.touch();
        let id = channel.id();
        // inbound traffic arrives through the callbacks below
        drop(channel);

        let io = RusshChannel::new(id, session.handle());
        let (new_channel, pending) = NewChannel::new(channel_type, extra_data, io);
        if self.events.send(ConnectionEvent::ChannelOpen(new_channel)).is_err() {
            return false;
        }
        match pending.decision.await {
            Ok(Ok(())) => {
                self.routes.insert(id, pending.events);
                true
            }
            Ok(Err(rejection)) => {
                debug!(
                    channel_type,
                    reason = %rejection.reason,
                    message = %rejection.message,
                    "channel open rejected"
                );
                false
            }
            Err(_) => false,
        }
    }

    fn route(&mut self, id: ChannelId, event: ChannelEvent) {
        self.touch();
        let Some(tx) = self.routes.get(&id) else {
            return;
        };
        if tx.send(event).is_err() {
            self.routes.remove(&id);
        }
    }

    /// Hand a channel request to the channel's worker and wait for its verdict.
    async fn request(&mut self, id: ChannelId, request_type: &str, payload: Bytes) -> bool {
        self.touch();
        let Some(tx) = self.routes.get(&id) else {
            return false;
        };
        let (req, reply) = ChannelRequest::new(request_type, true, payload);
        if tx.send(ChannelEvent::Request(req)).is_err() {
            return false;
        }
        reply.await.unwrap_or(false)
    }

    async fn answer(
        &mut self,
        id: ChannelId,
        request_type: &str,
        payload: Bytes,
        session: &mut Session,
    ) -> anyhow::Result<()> {
        if self.request(id, request_type, payload).await {
            session.channel_success(id)?;
        } else {
            session.channel_failure(id)?;
        }
        Ok(())
    }

    async fn global(&mut self, request_type: &str, payload: Bytes) -> Option<Bytes> {
        self.touch();
        let (req, reply) = GlobalRequest::new(request_type, true, payload);
        if self.events.send(ConnectionEvent::GlobalRequest(req)).is_err() {
            return None;
        }
        match reply.await {
            Ok(reply) if reply.ok => Some(reply.payload),
            _ => None,
        }
    }
}

/// Terminal modes back in their wire encoding.
fn encode_modes(modes: &[(Pty, u32)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(modes.len() * 5 + 1);
    for (op, value) in modes {
        buf.push(*op as u8);
        wire::put_u32(&mut buf, *value);
    }
    buf.push(0);
    buf
}

fn signal_name(sig: Sig) -> String {
    match sig {
        Sig::Custom(name) => name,
        other => format!("{other:?}"),
    }
}

impl server::Handler for SshHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.ctx.set_attempted_user(user);
        if self.config.allows_anonymous() {
            return Ok(self.authenticated(user, Permissions::new()));
        }
        Ok(reject())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let Some(check) = self.config.password_handler.clone() else {
            return Ok(reject());
        };
        self.ctx.set_attempted_user(user);
        match check(&self.ctx, password) {
            Some(permissions) => Ok(self.authenticated(user, permissions)),
            None => {
                warn!(user, peer = %self.ctx.remote_addr(), "password rejected");
                Ok(reject())
            }
        }
    }

    /// No signature yet: only tells the client whether signing is worth it.
    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let Some(check) = self.config.public_key_handler.clone() else {
            return Ok(reject());
        };
        self.ctx.set_attempted_user(user);
        if check(&self.ctx, key).is_some() {
            Ok(Auth::Accept)
        } else {
            Ok(reject())
        }
    }

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let Some(check) = self.config.public_key_handler.clone() else {
            return Ok(reject());
        };
        self.ctx.set_attempted_user(user);
        match check(&self.ctx, key) {
            Some(permissions) => {
                self.ctx.set_public_key(key.clone());
                Ok(self.authenticated(user, permissions))
            }
            None => {
                warn!(user, peer = %self.ctx.remote_addr(), "public key rejected");
                Ok(reject())
            }
        }
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        response: Option<server::Response<'_>>,
    ) -> Result<Auth, Self::Error> {
        let Some(challenge) = self.config.keyboard_interactive.clone() else {
            return Ok(reject());
        };
        self.ctx.set_attempted_user(user);
        match response {
            None => {
                let prompts: Vec<(Cow<'static, str>, bool)> = challenge
                    .prompts
                    .iter()
                    .map(|(text, echo)| (Cow::Owned(text.clone()), *echo))
                    .collect();
                Ok(Auth::Partial {
                    name: challenge.name.clone().into(),
                    instructions: challenge.instructions.clone().into(),
                    prompts: prompts.into(),
                })
            }
            Some(response) => {
                let answers: Vec<String> = response
                    .into_iter()
                    .map(|r| String::from_utf8_lossy(&r).to_string())
                    .collect();
                match (challenge.verify)(&self.ctx, &answers) {
                    Some(permissions) => Ok(self.authenticated(user, permissions)),
                    None => {
                        warn!(user, peer = %self.ctx.remote_addr(), "keyboard-interactive rejected");
                        Ok(reject())
                    }
                }
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self
            .open(channel, SESSION_CHANNEL_TYPE, Bytes::new(), session)
            .await)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let extra = TcpipChannelData {
            host: host_to_connect.to_string(),
            port: port_to_connect,
            originator_host: originator_address.to_string(),
            originator_port,
        }
        .encode();
        Ok(self
            .open(channel, DIRECT_TCPIP_CHANNEL_TYPE, extra, session)
            .await)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, ChannelEvent::Data(Bytes::copy_from_slice(data)));
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let data = Bytes::copy_from_slice(data);
        self.route(channel, ChannelEvent::ExtendedData { code, data });
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, ChannelEvent::Eof);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, ChannelEvent::Close);
        self.routes.remove(&channel);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = wire::encode_pty_request(
            term,
            Window::new(col_width, row_height),
            pix_width,
            pix_height,
            &encode_modes(modes),
        );
        self.answer(channel, "pty-req", payload, session).await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = wire::encode_env_request(variable_name, variable_value);
        self.answer(channel, "env", payload, session).await
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.answer(channel, "shell", Bytes::new(), session).await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = wire::encode_string(data);
        self.answer(channel, "exec", payload, session).await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = wire::encode_string(name.as_bytes());
        self.answer(channel, "subsystem", payload, session).await
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload =
            wire::encode_winch_request(Window::new(col_width, row_height), pix_width, pix_height);
        self.answer(channel, "window-change", payload, session).await
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = wire::encode_string(signal_name(signal).as_bytes());
        self.answer(channel, "signal", payload, session).await
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.request(channel, AGENT_REQUEST_TYPE, Bytes::new()).await)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let payload = ForwardRequest {
            bind_host: address.to_string(),
            bind_port: *port,
        }
        .encode();
        let Some(reply) = self.global(TCPIP_FORWARD_REQUEST_TYPE, payload).await else {
            return Ok(false);
        };
        if *port == 0 {
            if let Some((bound, _)) = wire::parse_u32(&reply) {
                *port = bound;
            }
        }
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let payload = ForwardRequest {
            bind_host: address.to_string(),
            bind_port: port,
        }
        .encode();
        Ok(self
            .global(CANCEL_TCPIP_FORWARD_REQUEST_TYPE, payload)
            .await
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keys_equal;
    use crate::conn::tests::test_config;
    use crate::context::test_context;
    use russh::keys::{Algorithm, PrivateKey};
    use russh::server::Handler;

    fn test_handler(config: ServerConfig) -> SshHandler {
        let (events, _) = mpsc::unbounded_channel();
        SshHandler::new(test_context(), Arc::new(config), events, Arc::new(Notify::new()))
    }

    fn public_key() -> PublicKey {
        PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    fn role(ctx: &Context) -> Option<String> {
        ctx.permissions()?.extension("role").map(str::to_string)
    }

    #[tokio::test]
    async fn test_offered_key_grants_nothing() {
        let admin = public_key();
        let guest = public_key();
        let config = test_config()
            .public_key_handler({
                let (admin, guest) = (admin.clone(), guest.clone());
                move |_, key| {
                    if keys_equal(key, &admin) {
                        Some(Permissions::new().with_extension("role", "admin"))
                    } else if keys_equal(key, &guest) {
                        Some(Permissions::new().with_extension("role", "guest"))
                    } else {
                        None
                    }
                }
            })
            .build()
            .unwrap();
        let mut handler = test_handler(config);

        // anyone can offer a public key without holding its private half
        let offered = handler.auth_publickey_offered("guest", &admin).await.unwrap();
        assert!(matches!(offered, Auth::Accept));
        assert!(handler.ctx.permissions().is_none());
        assert!(handler.ctx.user().is_none());

        let signed = handler.auth_publickey("guest", &guest).await.unwrap();
        assert!(matches!(signed, Auth::Accept));
        assert_eq!(role(&handler.ctx).as_deref(), Some("guest"));
        assert!(keys_equal(handler.ctx.public_key().unwrap(), &guest));
    }

    #[tokio::test]
    async fn test_failed_attempt_does_not_pin_user() {
        let config = test_config()
            .password_handler(|ctx, password| {
                let ok = ctx.attempted_user().as_deref() == Some("bob") && password == "bobpw";
                ok.then(|| Permissions::new().with_extension("role", "bob"))
            })
            .build()
            .unwrap();
        let mut handler = test_handler(config);

        let first = handler.auth_password("root", "bobpw").await.unwrap();
        assert!(matches!(first, Auth::Reject { .. }));
        assert!(handler.ctx.user().is_none());
        assert!(handler.ctx.permissions().is_none());

        let second = handler.auth_password("bob", "bobpw").await.unwrap();
        assert!(matches!(second, Auth::Accept));
        assert_eq!(handler.ctx.user(), Some("bob"));
        assert_eq!(role(&handler.ctx).as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_none_refused_when_auth_configured() {
        let config = test_config()
            .password_handler(|_, _| Some(Permissions::new()))
            .build()
            .unwrap();
        let mut handler = test_handler(config);
        let auth = handler.auth_none("eve").await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
        assert!(handler.ctx.user().is_none());
    }

    #[tokio::test]
    async fn test_anonymous_gets_empty_permissions() {
        let mut handler = test_handler(test_config().build().unwrap());
        let auth = handler.auth_none("anyone").await.unwrap();
        assert!(matches!(auth, Auth::Accept));
        assert_eq!(handler.ctx.user(), Some("anyone"));
        assert_eq!(handler.ctx.permissions(), Some(&Permissions::new()));
    }

    #[test]
    fn test_encode_modes_terminated() {
        let modes = [(Pty::VINTR, 3), (Pty::ECHO, 1)];
        let buf = encode_modes(&modes);
        assert_eq!(buf.len(), 11);
        assert_eq!(buf[0], Pty::VINTR as u8);
        assert_eq!(&buf[1..5], &3u32.to_be_bytes());
        assert_eq!(*buf.last().unwrap(), 0);
    }

    #[test]
    fn test_encode_modes_empty() {
        assert_eq!(encode_modes(&[]), vec![0]);
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(Sig::TERM), "TERM");
        assert_eq!(signal_name(Sig::USR1), "USR1");
        assert_eq!(signal_name(Sig::Custom("WINCH".into())), "WINCH");
    }

    #[test]
    fn test_pty_payload_decodes() {
        let payload = wire::encode_pty_request(
            "xterm",
            Window::new(80, 24),
            0,
            0,
            &encode_modes(&[(Pty::ECHO, 1)]),
        );
        let pty = wire::parse_pty_request(&payload).unwrap();
        assert_eq!(pty.term, "xterm");
        assert_eq!(pty.window, Window::new(80, 24));
    }
}
