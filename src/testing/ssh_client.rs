//! SSH test client for automated testing
//!
//! Connects to an sshframe server, opens session channels, sends input and
//! captures output and exit status. Supports SSH agent for encrypted keys.

use anyhow::{Context, Result};
use russh::client::{self, Handle, Msg};
use russh::keys::agent::client::AgentClient;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How the client proves who it is.
pub enum ClientAuth {
    /// The `none` method, for servers without authentication callbacks.
    None,
    Password(String),
    Key(PrivateKey),
    /// SSH agent first, then the key file (default `~/.ssh/id_ed25519`).
    AgentOrKeyFile(Option<String>),
}

/// SSH test client holding one authenticated connection
pub struct SshTestClient {
    handle: Handle<ClientHandler>,
}

impl SshTestClient {
    /// Connect and authenticate.
    pub async fn connect(addr: &str, username: &str, auth: ClientAuth) -> Result<Self> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, addr, ClientHandler)
            .await
            .context("failed to connect")?;

        let accepted = match auth {
            ClientAuth::None => handle
                .authenticate_none(username)
                .await
                .context("none authentication failed")?
                .success(),
            ClientAuth::Password(password) => handle
                .authenticate_password(username, password)
                .await
                .context("password authentication failed")?
                .success(),
            ClientAuth::Key(key) => authenticate_key(&mut handle, username, key).await?,
            ClientAuth::AgentOrKeyFile(key_path) => {
                if try_agent(&mut handle, username).await {
                    true
                } else {
                    let key = load_private_key(key_path.as_deref())?;
                    authenticate_key(&mut handle, username, key).await?
                }
            }
        };
        if !accepted {
            anyhow::bail!("authentication rejected");
        }

        Ok(Self { handle })
    }

    /// Open a session channel and start a shell, optionally with a PTY.
    pub async fn shell(&self, pty: Option<(&str, u32, u32)>) -> Result<TestChannel> {
        let mut channel = self.open_session().await?;
        if let Some((term, width, height)) = pty {
            channel.request_pty(term, width, height).await?;
        }
        channel.channel.request_shell(true).await?;
        channel.expect_success("shell").await?;
        Ok(channel)
    }

    /// Open a session channel and run `command`.
    pub async fn exec(&self, command: &str) -> Result<TestChannel> {
        let mut channel = self.open_session().await?;
        channel.channel.exec(true, command).await?;
        channel.expect_success("exec").await?;
        Ok(channel)
    }

    /// Open a bare session channel; nothing is requested yet.
    pub async fn open_session(&self) -> Result<TestChannel> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .context("failed to open session channel")?;
        Ok(TestChannel {
            channel,
            pending: Vec::new(),
            exit_status: None,
        })
    }

    /// Access to the underlying russh handle, e.g. for port forwarding.
    pub fn handle(&self) -> &Handle<ClientHandler> {
        &self.handle
    }

    /// Close the connection
    pub async fn close(self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "goodbye", "en")
            .await
            .context("failed to disconnect")?;
        Ok(())
    }
}

async fn authenticate_key(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    key: PrivateKey,
) -> Result<bool> {
    // no hash alg needed for Ed25519
    let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);
    Ok(handle
        .authenticate_publickey(username, key_with_alg)
        .await
        .context("key authentication failed")?
        .success())
}

async fn try_agent(handle: &mut Handle<ClientHandler>, username: &str) -> bool {
    let Ok(mut agent) = AgentClient::connect_env().await else {
        return false;
    };
    let Ok(identities) = agent.request_identities().await else {
        return false;
    };
    let Some(pubkey) = identities.first() else {
        return false;
    };
    matches!(
        handle
            .authenticate_publickey_with(username, pubkey.clone(), None, &mut agent)
            .await,
        Ok(result) if result.success()
    )
}

/// One session channel seen from the client side
pub struct TestChannel {
    channel: Channel<Msg>,
    /// Output that arrived while waiting for a request reply.
    pending: Vec<u8>,
    exit_status: Option<u32>,
}

impl TestChannel {
    /// Request a PTY and wait for the answer.
    pub async fn request_pty(&mut self, term: &str, width: u32, height: u32) -> Result<()> {
        self.channel
            .request_pty(true, term, width, height, 0, 0, &[])
            .await
            .context("failed to request PTY")?;
        self.expect_success("pty-req").await
    }

    /// Set an environment variable and wait for the answer.
    pub async fn set_env(&mut self, name: &str, value: &str) -> Result<()> {
        self.channel
            .set_env(true, name, value)
            .await
            .context("failed to send env")?;
        self.expect_success("env").await
    }

    /// Ask for a second run request; returns whether the server allowed it.
    pub async fn request_exec(&mut self, command: &str) -> Result<bool> {
        self.channel.exec(true, command).await?;
        self.reply().await
    }

    pub async fn resize(&self, width: u32, height: u32) -> Result<()> {
        self.channel
            .window_change(width, height, 0, 0)
            .await
            .context("failed to send window change")
    }

    pub async fn signal(&self, signal: Sig) -> Result<()> {
        self.channel
            .signal(signal)
            .await
            .context("failed to send signal")
    }

    /// Send raw bytes.
    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        self.channel.data(data).await.context("failed to send data")
    }

    /// Send input to the shell (adds newline if not present)
    pub async fn send(&self, input: &str) -> Result<()> {
        let data = if input.ends_with('\n') {
            input.as_bytes().to_vec()
        } else {
            format!("{}\n", input).into_bytes()
        };
        self.send_raw(&data).await
    }

    pub async fn eof(&self) -> Result<()> {
        self.channel.eof().await.context("failed to send eof")
    }

    /// Exit status, once the server has sent one.
    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status
    }

    async fn expect_success(&mut self, what: &str) -> Result<()> {
        if !self.reply().await? {
            anyhow::bail!("{} refused", what);
        }
        Ok(())
    }

    /// Wait for the answer to the last request, keeping any output.
    async fn reply(&mut self) -> Result<bool> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.channel.wait())
                .await
                .context("timeout waiting for request reply")?;
            match msg {
                Some(ChannelMsg::Success) => return Ok(true),
                Some(ChannelMsg::Failure) => return Ok(false),
                Some(ChannelMsg::Data { data }) => self.pending.extend_from_slice(&data),
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    self.exit_status = Some(exit_status)
                }
                Some(_) => {}
                None => anyhow::bail!("channel closed before reply"),
            }
        }
    }

    /// Wait for output with timeout, then collect what we got
    pub async fn wait_and_collect(&mut self, duration: Duration) -> Result<Vec<u8>> {
        self.wait_internal(duration, None).await
    }

    /// Wait until pattern appears in output, or timeout
    ///
    /// Returns all collected output once pattern is found.
    pub async fn wait_for_pattern(&mut self, pattern: &str, timeout: Duration) -> Result<Vec<u8>> {
        self.wait_internal(timeout, Some(pattern)).await
    }

    /// Read until the server closes the channel; returns output and exit status.
    pub async fn wait_close(&mut self, timeout: Duration) -> Result<(Vec<u8>, Option<u32>)> {
        let mut output = std::mem::take(&mut self.pending);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.channel.wait())
                .await
                .context("timeout waiting for channel close")?;
            match msg {
                Some(ChannelMsg::Data { data }) => output.extend_from_slice(&data),
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    self.exit_status = Some(exit_status)
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
        Ok((output, self.exit_status))
    }

    async fn wait_internal(&mut self, duration: Duration, pattern: Option<&str>) -> Result<Vec<u8>> {
        let mut output = std::mem::take(&mut self.pending);
        let deadline = tokio::time::Instant::now() + duration;

        loop {
            if let Some(pat) = pattern {
                if String::from_utf8_lossy(&output).contains(pat) {
                    return Ok(output);
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                if pattern.is_some() {
                    anyhow::bail!("timeout waiting for pattern");
                }
                break;
            }

            tokio::select! {
                msg = self.channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            output.extend_from_slice(&data);
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            self.exit_status = Some(exit_status);
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                            break;
                        }
                        Some(_) => {}
                    }
                }
                _ = tokio::time::sleep(remaining) => {
                    if pattern.is_some() {
                        anyhow::bail!("timeout waiting for pattern");
                    }
                    break;
                }
            }
        }

        if let Some(pat) = pattern {
            if !String::from_utf8_lossy(&output).contains(pat) {
                anyhow::bail!("channel ended before pattern appeared");
            }
        }
        Ok(output)
    }
}

/// Load a private key from a file path
fn load_private_key(path: Option<&str>) -> Result<PrivateKey> {
    let expanded = match path {
        Some(path) => match path.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| Path::new(path).to_path_buf()),
            None => Path::new(path).to_path_buf(),
        },
        None => dirs::home_dir()
            .map(|home| home.join(".ssh/id_ed25519"))
            .context("no home directory for the default key")?,
    };

    let key_str = std::fs::read_to_string(&expanded)
        .with_context(|| format!("failed to read key file: {}", expanded.display()))?;

    russh::keys::decode_secret_key(&key_str, None).context("failed to decode private key")
}

/// Client handler accepting any host key
pub struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // local testing only
        Ok(true)
    }
}
