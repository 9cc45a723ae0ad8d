//! Testing utilities for sshframe
//!
//! Provides an SSH test client for automated testing against an sshframe
//! server.

mod ssh_client;

pub use ssh_client::{ClientAuth, ClientHandler, SshTestClient, TestChannel};
