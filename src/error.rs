//! Error types for sshframe

use thiserror::Error;

/// Errors surfaced by the framework.
///
/// Malformed payloads and policy refusals never show up here: they are
/// answered on the wire and the connection carries on. What remains are
/// lifecycle conditions callers need to tell apart.
#[derive(Error, Debug)]
pub enum Error {
    /// Returned by `serve`/`listen_and_serve` after `close` or `shutdown`.
    #[error("ssh: server closed")]
    ServerClosed,

    /// A server needs at least one host key to accept connections.
    #[error("ssh: no host keys configured")]
    NoHostKeys,

    /// `Session::exit` was already called for this session.
    #[error("ssh: session already exited")]
    SessionExited,

    /// The channel is gone; writes can no longer reach the peer.
    #[error("ssh: channel closed")]
    ChannelClosed,

    /// `shutdown` was interrupted before every connection drained.
    #[error("ssh: shutdown interrupted with connections still open")]
    ShutdownInterrupted,

    /// Failure reported by the transport collaborator.
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using the framework [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_closed_is_distinguishable() {
        let err = Error::ServerClosed;
        assert!(matches!(err, Error::ServerClosed));
        assert_eq!(err.to_string(), "ssh: server closed");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
