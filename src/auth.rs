//! Authentication results handed from the handshake to handlers

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::Context;

/// Public key type produced by the transport.
pub type PublicKey = russh::keys::PublicKey;

/// Fine-grained permissions attached to an authenticated user.
///
/// Apart from `source-address`, nothing here is enforced by the
/// framework: handlers read it after authentication and decide.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions {
    /// Critical options, e.g. `force-command`. Unknown ones must be refused.
    pub critical_options: HashMap<String, String>,
    /// Extensions such as `permit-pty`.
    pub extensions: HashMap<String, String>,
}

impl Permissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    pub fn with_critical_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.critical_options.insert(key.into(), value.into());
        self
    }

    pub fn extension(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).map(String::as_str)
    }

    pub fn critical_option(&self, key: &str) -> Option<&str> {
        self.critical_options.get(key).map(String::as_str)
    }
}

/// Compare two public keys by key material, ignoring comments.
pub fn keys_equal(a: &PublicKey, b: &PublicKey) -> bool {
    a.key_data() == b.key_data()
}

/// Verifies the answers of a keyboard-interactive exchange, returning the
/// granted permissions or `None` to reject.
pub type KeyboardInteractiveVerifier =
    Arc<dyn Fn(&Context, &[String]) -> Option<Permissions> + Send + Sync>;

/// A single-round keyboard-interactive challenge.
///
/// The prompts are sent to the client once; its answers go to `verify`
/// in prompt order.
#[derive(Clone)]
pub struct KeyboardInteractive {
    pub name: String,
    pub instructions: String,
    /// Prompt text and whether the client should echo the answer.
    pub prompts: Vec<(String, bool)>,
    pub verify: KeyboardInteractiveVerifier,
}

impl KeyboardInteractive {
    pub fn new<F>(prompts: Vec<(String, bool)>, verify: F) -> Self
    where
        F: Fn(&Context, &[String]) -> Option<Permissions> + Send + Sync + 'static,
    {
        Self {
            name: String::new(),
            instructions: String::new(),
            prompts,
            verify: Arc::new(verify),
        }
    }

    pub fn with_instructions(
        mut self,
        name: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        self.name = name.into();
        self.instructions = instructions.into();
        self
    }
}

impl std::fmt::Debug for KeyboardInteractive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyboardInteractive")
            .field("name", &self.name)
            .field("prompts", &self.prompts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::{Algorithm, PrivateKey};

    fn random_key() -> PrivateKey {
        PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap()
    }

    #[test]
    fn test_keys_equal_ignores_comment() {
        let key = random_key();
        let a = key.public_key().clone();
        let mut b = key.public_key().clone();
        b.set_comment("someone@laptop");
        assert!(keys_equal(&a, &b));
    }

    #[test]
    fn test_keys_differ() {
        let a = random_key().public_key().clone();
        let b = random_key().public_key().clone();
        assert!(!keys_equal(&a, &b));
    }

    #[test]
    fn test_permissions_builders() {
        let perms = Permissions::new()
            .with_extension("permit-pty", "")
            .with_critical_option("force-command", "uptime");
        assert_eq!(perms.extension("permit-pty"), Some(""));
        assert_eq!(perms.critical_option("force-command"), Some("uptime"));
        assert_eq!(perms.extension("permit-X11-forwarding"), None);
    }
}
