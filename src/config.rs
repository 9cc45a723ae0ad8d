//! Server configuration
//!
//! [`ServerConfig`] is the typed configuration a [`crate::Server`] runs
//! with: handlers, authentication callbacks, timeouts and the extension
//! tables. It is assembled through [`ServerConfigBuilder`] and validated
//! once in [`ServerConfigBuilder::build`].
//!
//! [`Config`] holds the file-backed settings of the binary and applies
//! them onto a builder.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PrivateKey;
use serde::Deserialize;

use crate::auth::{KeyboardInteractive, Permissions, PublicKey};
use crate::channel::ChannelHandler;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::pty::Pty;
use crate::request::RequestHandler;
use crate::session::{self, Session, SessionHandler};
use crate::transport::RawStream;

/// Accepts a public key with the permissions it grants, or rejects it
/// with `None`.
///
/// Also consulted when a key is merely offered; that answer only says
/// whether a signature would be welcome and grants nothing.
pub type PublicKeyHandler = Arc<dyn Fn(&Context, &PublicKey) -> Option<Permissions> + Send + Sync>;

/// Accepts a password with the permissions it grants, or rejects it with
/// `None`.
pub type PasswordHandler = Arc<dyn Fn(&Context, &str) -> Option<Permissions> + Send + Sync>;

/// Decides whether a PTY may be allocated.
pub type PtyCallback = Arc<dyn Fn(&Context, &Pty) -> bool + Send + Sync>;

/// Decides whether forwarding to or from `(host, port)` is allowed.
pub type ForwardingCallback = Arc<dyn Fn(&Context, &str, u32) -> bool + Send + Sync>;

/// Wraps the raw connection before the handshake, e.g. to add limits.
pub type ConnCallback =
    Arc<dyn Fn(&Context, Box<dyn RawStream>) -> Box<dyn RawStream> + Send + Sync>;

/// Decides whether a run request (`shell`, `exec`, `subsystem`) may start.
pub type SessionRequestCallback = Arc<dyn Fn(&Session, &str) -> bool + Send + Sync>;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:2222";
pub const DEFAULT_VERSION: &str = "sshframe";

/// Validated server configuration.
///
/// Authentication callbacks return the [`crate::Permissions`] they grant.
/// They reach the context only once the credential is verified; the
/// `none` method grants empty permissions.
#[derive(Clone)]
pub struct ServerConfig {
    pub(crate) listen_addr: SocketAddr,
    pub(crate) handler: SessionHandler,
    pub(crate) host_keys: Vec<PrivateKey>,
    pub(crate) version: String,
    pub(crate) public_key_handler: Option<PublicKeyHandler>,
    pub(crate) password_handler: Option<PasswordHandler>,
    pub(crate) keyboard_interactive: Option<KeyboardInteractive>,
    pub(crate) pty_callback: Option<PtyCallback>,
    pub(crate) local_port_forwarding_callback: Option<ForwardingCallback>,
    pub(crate) reverse_port_forwarding_callback: Option<ForwardingCallback>,
    pub(crate) conn_callback: Option<ConnCallback>,
    pub(crate) session_request_callback: Option<SessionRequestCallback>,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) max_timeout: Option<Duration>,
    pub(crate) channel_handlers: HashMap<String, Arc<dyn ChannelHandler>>,
    pub(crate) request_handlers: HashMap<String, Arc<dyn RequestHandler>>,
    pub(crate) subsystem_handlers: HashMap<String, SessionHandler>,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Software version, without the `SSH-2.0-` prefix.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Full identification string sent to clients.
    pub fn banner(&self) -> String {
        format!("SSH-2.0-{}", self.version)
    }

    pub fn host_keys(&self) -> &[PrivateKey] {
        &self.host_keys
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn max_timeout(&self) -> Option<Duration> {
        self.max_timeout
    }

    /// True when no authentication callback is set and `none` is accepted.
    pub fn allows_anonymous(&self) -> bool {
        self.public_key_handler.is_none()
            && self.password_handler.is_none()
            && self.keyboard_interactive.is_none()
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut channels: Vec<_> = self.channel_handlers.keys().collect();
        channels.sort();
        let mut requests: Vec<_> = self.request_handlers.keys().collect();
        requests.sort();
        let mut subsystems: Vec<_> = self.subsystem_handlers.keys().collect();
        subsystems.sort();
        f.debug_struct("ServerConfig")
            .field("listen_addr", &self.listen_addr)
            .field("version", &self.version)
            .field("host_keys", &self.host_keys.len())
            .field("public_key_auth", &self.public_key_handler.is_some())
            .field("password_auth", &self.password_handler.is_some())
            .field("keyboard_interactive", &self.keyboard_interactive.is_some())
            .field("idle_timeout", &self.idle_timeout)
            .field("max_timeout", &self.max_timeout)
            .field("channel_handlers", &channels)
            .field("request_handlers", &requests)
            .field("subsystem_handlers", &subsystems)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ServerConfig`].
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig {
                listen_addr: SocketAddr::from(([0, 0, 0, 0], 2222)),
                handler: session::handler(|_session| async {}),
                host_keys: Vec::new(),
                version: DEFAULT_VERSION.to_string(),
                public_key_handler: None,
                password_handler: None,
                keyboard_interactive: None,
                pty_callback: None,
                local_port_forwarding_callback: None,
                reverse_port_forwarding_callback: None,
                conn_callback: None,
                session_request_callback: None,
                idle_timeout: None,
                max_timeout: None,
                channel_handlers: HashMap::new(),
                request_handlers: HashMap::new(),
                subsystem_handlers: HashMap::new(),
            },
        }
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    pub fn handler(mut self, handler: SessionHandler) -> Self {
        self.config.handler = handler;
        self
    }

    pub fn host_key(mut self, key: PrivateKey) -> Self {
        self.config.host_keys.push(key);
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    pub fn public_key_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &PublicKey) -> Option<Permissions> + Send + Sync + 'static,
    {
        self.config.public_key_handler = Some(Arc::new(f));
        self
    }

    pub fn password_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &str) -> Option<Permissions> + Send + Sync + 'static,
    {
        self.config.password_handler = Some(Arc::new(f));
        self
    }

    pub fn keyboard_interactive(mut self, challenge: KeyboardInteractive) -> Self {
        self.config.keyboard_interactive = Some(challenge);
        self
    }

    pub fn pty_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &Pty) -> bool + Send + Sync + 'static,
    {
        self.config.pty_callback = Some(Arc::new(f));
        self
    }

    pub fn local_port_forwarding_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &str, u32) -> bool + Send + Sync + 'static,
    {
        self.config.local_port_forwarding_callback = Some(Arc::new(f));
        self
    }

    pub fn reverse_port_forwarding_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &str, u32) -> bool + Send + Sync + 'static,
    {
        self.config.reverse_port_forwarding_callback = Some(Arc::new(f));
        self
    }

    pub fn conn_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, Box<dyn RawStream>) -> Box<dyn RawStream> + Send + Sync + 'static,
    {
        self.config.conn_callback = Some(Arc::new(f));
        self
    }

    pub fn session_request_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session, &str) -> bool + Send + Sync + 'static,
    {
        self.config.session_request_callback = Some(Arc::new(f));
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    pub fn max_timeout(mut self, timeout: Duration) -> Self {
        self.config.max_timeout = Some(timeout);
        self
    }

    /// Register a handler for a channel type, replacing any previous one.
    pub fn channel_handler(
        mut self,
        channel_type: impl Into<String>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Self {
        self.config
            .channel_handlers
            .insert(channel_type.into(), handler);
        self
    }

    /// Register a handler for a request type, replacing any previous one.
    ///
    /// The table serves both global requests and unrecognized channel
    /// requests.
    pub fn request_handler(
        mut self,
        request_type: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        self.config
            .request_handlers
            .insert(request_type.into(), handler);
        self
    }

    pub fn subsystem_handler(mut self, name: impl Into<String>, handler: SessionHandler) -> Self {
        self.config.subsystem_handlers.insert(name.into(), handler);
        self
    }

    pub fn build(self) -> Result<ServerConfig> {
        if self.config.host_keys.is_empty() {
            return Err(Error::NoHostKeys);
        }
        if self.config.version.is_empty() || self.config.version.contains(['\r', '\n', ' ']) {
            return Err(Error::Config(format!(
                "invalid version string: {:?}",
                self.config.version
            )));
        }
        Ok(self.config)
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// File-backed settings for the server binary.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Host key location; resolved through [`crate::paths`] when unset.
    pub host_key_path: Option<PathBuf>,
    pub version: String,
    /// Idle timeout in seconds, 0 disables it.
    pub idle_timeout_secs: u64,
    /// Absolute connection lifetime in seconds, 0 disables it.
    pub max_timeout_secs: u64,
    pub allow_local_forwarding: bool,
    pub allow_reverse_forwarding: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 2222)),
            host_key_path: None,
            version: DEFAULT_VERSION.to_string(),
            idle_timeout_secs: 0,
            max_timeout_secs: 0,
            allow_local_forwarding: false,
            allow_reverse_forwarding: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file. A missing file yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("config not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn host_key_path(&self) -> PathBuf {
        self.host_key_path
            .clone()
            .unwrap_or_else(crate::paths::host_key_path)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn max_timeout(&self) -> Option<Duration> {
        (self.max_timeout_secs > 0).then(|| Duration::from_secs(self.max_timeout_secs))
    }

    /// Copy the file settings onto a builder.
    ///
    /// The forwarding flags are not applied here: enabling forwarding
    /// needs a destination policy, which only the caller can supply.
    pub fn apply(&self, mut builder: ServerConfigBuilder) -> ServerConfigBuilder {
        builder = builder
            .listen_addr(self.listen_addr)
            .version(self.version.clone());
        if let Some(timeout) = self.idle_timeout() {
            builder = builder.idle_timeout(timeout);
        }
        if let Some(timeout) = self.max_timeout() {
            builder = builder.max_timeout(timeout);
        }
        builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::Algorithm;

    fn host_key() -> PrivateKey {
        PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap()
    }

    #[test]
    fn test_build_requires_host_key() {
        let err = ServerConfig::builder().build().unwrap_err();
        assert!(matches!(err, Error::NoHostKeys));
    }

    #[test]
    fn test_build_rejects_bad_version() {
        let err = ServerConfig::builder()
            .host_key(host_key())
            .version("two words")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_builder_defaults() {
        let config = ServerConfig::builder().host_key(host_key()).build().unwrap();
        assert_eq!(config.banner(), "SSH-2.0-sshframe");
        assert_eq!(config.listen_addr(), DEFAULT_LISTEN_ADDR.parse().unwrap());
        assert!(config.allows_anonymous());
        assert!(config.idle_timeout().is_none());
        assert!(config.channel_handlers.is_empty());
    }

    #[test]
    fn test_auth_handler_disables_anonymous() {
        let config = ServerConfig::builder()
            .host_key(host_key())
            .password_handler(|_, password| (password == "hunter2").then(Permissions::new))
            .build()
            .unwrap();
        assert!(!config.allows_anonymous());
    }

    #[test]
    fn test_config_from_toml() {
        let config = Config::from_toml(
            r#"
            listen_addr = "127.0.0.1:2022"
            idle_timeout_secs = 30
            allow_local_forwarding = true
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:2022".parse().unwrap());
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.max_timeout(), None);
        assert!(config.allow_local_forwarding);
        assert!(!config.allow_reverse_forwarding);
        assert_eq!(config.version, DEFAULT_VERSION);
    }

    #[test]
    fn test_config_from_toml_invalid() {
        let err = Config::from_toml("listen_addr = 42").unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }

    #[test]
    fn test_config_load_missing_file() {
        let config = Config::load("/nonexistent/sshframe.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_apply() {
        let file = Config {
            idle_timeout_secs: 5,
            max_timeout_secs: 60,
            allow_local_forwarding: true,
            allow_reverse_forwarding: true,
            ..Config::default()
        };
        let config = file
            .apply(ServerConfig::builder().host_key(host_key()))
            .build()
            .unwrap();
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.max_timeout(), Some(Duration::from_secs(60)));
        // forwarding stays off until the caller passes a policy
        assert!(config.channel_handlers.is_empty());
        assert!(config.request_handlers.is_empty());
    }
}
