//! Per-connection metadata and extension values
//!
//! One [`Context`] exists per network connection. It is created when the
//! connection is accepted, shared by every channel worker spawned under it,
//! and cancelled when the connection closes.
//!
//! Well-known fields come in two kinds. Those known at accept time
//! (session id, server banner, addresses) are required by the constructor
//! and can always be read. Those filled in by the handshake (user, client
//! banner, permissions, public key) are written at most once and read back
//! as `Option`. User, permissions and public key are only written after
//! the transport has verified a credential; until then the name of the
//! current authentication attempt is available through
//! [`Context::attempted_user`].
//!
//! Extension values sit behind the context's own mutex. Every access goes
//! through [`Context::lock`], so a handler that needs "check, then set
//! exactly once" holds one guard across both steps.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::auth::{Permissions, PublicKey};

/// Connection metadata available as soon as the connection is accepted.
#[derive(Debug, Clone)]
pub struct ConnMeta {
    /// Identifier stable for the lifetime of the connection.
    pub session_id: String,
    /// Version banner this server announces.
    pub server_version: String,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

/// Open-ended extension values, reachable only through [`Context::lock`].
#[derive(Default)]
pub struct Values {
    map: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Values {
    /// Install or overwrite a value.
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.map.insert(key.into(), Box::new(value));
    }

    /// Typed read. Returns `None` when absent or stored with another type.
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        (**self.map.get(key)?).downcast_ref::<T>().cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

struct Inner {
    meta: ConnMeta,
    attempted_user: StdMutex<Option<String>>,
    user: OnceLock<String>,
    client_version: OnceLock<String>,
    permissions: OnceLock<Permissions>,
    public_key: OnceLock<PublicKey>,
    values: Mutex<Values>,
    cancel: CancellationToken,
}

/// Shared per-connection context. Cloning is cheap.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    pub fn new(meta: ConnMeta) -> Self {
        Self {
            inner: Arc::new(Inner {
                meta,
                attempted_user: StdMutex::new(None),
                user: OnceLock::new(),
                client_version: OnceLock::new(),
                permissions: OnceLock::new(),
                public_key: OnceLock::new(),
                values: Mutex::new(Values::default()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.meta.session_id
    }

    pub fn server_version(&self) -> &str {
        &self.inner.meta.server_version
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.meta.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.meta.remote_addr
    }

    /// Username the client authenticated as, once known.
    pub fn user(&self) -> Option<&str> {
        self.inner.user.get().map(String::as_str)
    }

    /// Version banner sent by the client, once received.
    pub fn client_version(&self) -> Option<&str> {
        self.inner.client_version.get().map(String::as_str)
    }

    /// Permissions granted by authentication, once authenticated.
    pub fn permissions(&self) -> Option<&Permissions> {
        self.inner.permissions.get()
    }

    /// Key used for public key authentication, if that method succeeded.
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.inner.public_key.get()
    }

    /// Username of the authentication attempt in progress, or of the last
    /// one. Overwritten by every attempt, so callbacks see the name the
    /// credential in front of them was offered for.
    pub fn attempted_user(&self) -> Option<String> {
        self.inner
            .attempted_user
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_attempted_user(&self, user: &str) {
        *self
            .inner
            .attempted_user
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(user.to_string());
    }

    /// Record the authenticated username. Returns false if a different one
    /// was already set.
    pub(crate) fn set_user(&self, user: &str) -> bool {
        set_once(&self.inner.user, user.to_string())
    }

    pub(crate) fn set_client_version(&self, version: &str) -> bool {
        set_once(&self.inner.client_version, version.to_string())
    }

    pub(crate) fn set_permissions(&self, permissions: Permissions) -> bool {
        set_once(&self.inner.permissions, permissions)
    }

    pub(crate) fn set_public_key(&self, key: PublicKey) -> bool {
        self.inner.public_key.set(key).is_ok()
    }

    /// Acquire the context lock, granting access to the extension values.
    pub async fn lock(&self) -> MutexGuard<'_, Values> {
        self.inner.values.lock().await
    }

    /// Install or overwrite one extension value under the lock.
    pub async fn set_value<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.lock().await.set(key, value);
    }

    /// Read one extension value under the lock.
    pub async fn value<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.lock().await.get(key)
    }

    /// Resolves once the connection is closed.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancel.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Token cancelled with the connection, for per-channel work.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }
}

fn set_once<T: PartialEq>(cell: &OnceLock<T>, value: T) -> bool {
    match cell.set(value) {
        Ok(()) => true,
        Err(value) => cell.get() == Some(&value),
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("session_id", &self.session_id())
            .field("user", &self.user())
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> Context {
    Context::new(ConnMeta {
        session_id: uuid::Uuid::new_v4().simple().to_string(),
        server_version: "SSH-2.0-sshframe_test".to_string(),
        local_addr: "127.0.0.1:2222".parse().unwrap(),
        remote_addr: "127.0.0.1:50000".parse().unwrap(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_getters() {
        let ctx = test_context();
        assert_eq!(ctx.server_version(), "SSH-2.0-sshframe_test");
        assert_eq!(ctx.local_addr().port(), 2222);
        assert_eq!(ctx.remote_addr().port(), 50000);
        assert_eq!(ctx.session_id().len(), 32);
    }

    #[test]
    fn test_unset_fields_are_none() {
        let ctx = test_context();
        assert!(ctx.user().is_none());
        assert!(ctx.client_version().is_none());
        assert!(ctx.permissions().is_none());
        assert!(ctx.public_key().is_none());
    }

    #[test]
    fn test_user_set_once() {
        let ctx = test_context();
        assert!(ctx.set_user("alice"));
        assert!(ctx.set_user("alice"));
        assert!(!ctx.set_user("mallory"));
        assert_eq!(ctx.user(), Some("alice"));
    }

    #[test]
    fn test_attempted_user_overwritten_per_attempt() {
        let ctx = test_context();
        assert_eq!(ctx.attempted_user(), None);
        ctx.set_attempted_user("root");
        ctx.set_attempted_user("bob");
        assert_eq!(ctx.attempted_user().as_deref(), Some("bob"));
        // attempts never touch the authenticated name
        assert!(ctx.user().is_none());
    }

    #[test]
    fn test_permissions_set_once() {
        let ctx = test_context();
        let perms = Permissions::new().with_extension("permit-pty", "");
        assert!(ctx.set_permissions(perms.clone()));
        assert!(!ctx.set_permissions(Permissions::new()));
        assert_eq!(ctx.permissions(), Some(&perms));
    }

    #[test]
    fn test_clones_share_state() {
        let ctx = test_context();
        let other = ctx.clone();
        ctx.set_client_version("SSH-2.0-OpenSSH_9.6");
        assert_eq!(other.client_version(), Some("SSH-2.0-OpenSSH_9.6"));
    }

    #[tokio::test]
    async fn test_set_value_overwrites() {
        let ctx = test_context();
        ctx.set_value("count", 1u32).await;
        ctx.set_value("count", 2u32).await;
        assert_eq!(ctx.value::<u32>("count").await, Some(2));
    }

    #[tokio::test]
    async fn test_value_wrong_type_is_none() {
        let ctx = test_context();
        ctx.set_value("flag", true).await;
        assert_eq!(ctx.value::<String>("flag").await, None);
        assert_eq!(ctx.value::<bool>("flag").await, Some(true));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_set_value_no_lost_updates() {
        let ctx = test_context();
        let mut tasks = Vec::new();
        for i in 0..64u32 {
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                ctx.set_value(format!("key-{}", i), i).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let values = ctx.lock().await;
        assert_eq!(values.len(), 64);
        for i in 0..64u32 {
            assert_eq!(values.get::<u32>(&format!("key-{}", i)), Some(i));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_check_then_set_under_one_guard() {
        let ctx = test_context();
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                let mut values = ctx.lock().await;
                if values.contains("winner") {
                    return false;
                }
                tokio::task::yield_now().await;
                values.set("winner", true);
                true
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let ctx = test_context();
        let child = ctx.child_token();
        assert!(!ctx.is_cancelled());
        ctx.cancel();
        ctx.cancelled().await;
        assert!(child.is_cancelled());
    }
}
