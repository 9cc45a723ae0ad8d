//! sshframe - sessions and request dispatch on top of an SSH transport
//!
//! The transport (russh) does key exchange, encryption and authentication.
//! This crate takes over from there: it turns each connection into
//! sessions with their own pty, environment, signals and exit status, and
//! exposes extension tables for extra channel and request types.
//! The demo server is in `main.rs`, a test client in `bin/sshtest.rs`.

pub mod agent;
pub mod auth;
pub mod backoff;
pub mod channel;
pub mod config;
pub mod conn;
pub mod context;
pub mod error;
pub mod forward;
pub mod paths;
pub mod pty;
pub mod request;
pub mod server;
pub mod session;
pub mod transport;
pub mod wire;

mod ssh;

#[cfg(feature = "testing")]
pub mod testing;

pub use auth::{KeyboardInteractive, Permissions, PublicKey};
pub use channel::ChannelHandler;
pub use config::{Config, ServerConfig, ServerConfigBuilder};
pub use conn::Conn;
pub use context::Context;
pub use error::{Error, Result};
pub use pty::{Pty, Window};
pub use request::RequestHandler;
pub use server::Server;
pub use session::{handler, Session, SessionEvent, SessionHandler, Signal};
