//! Anonymous identity provider.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use murmur_core::validate::truncate_chars;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

/// A signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub uid: String,
    pub is_anonymous: bool,
}

/// Identity provider contract.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Sign in (or resume) an anonymous session.
    async fn sign_in_anonymously(&self) -> Result<AuthUser, IdentityError>;

    fn current_user(&self) -> Option<AuthUser>;

    /// Auth-state changes. The current state is observable immediately.
    fn watch(&self) -> watch::Receiver<Option<AuthUser>>;
}

/// In-process identity provider.
///
/// Signing in twice returns the same user, like a persisted anonymous
/// session.
pub struct MemoryIdentity {
    uid: String,
    state: watch::Sender<Option<AuthUser>>,
    unavailable: AtomicBool,
}

impl MemoryIdentity {
    pub fn new() -> Self {
        Self::with_uid(Uuid::new_v4().simple().to_string())
    }

    pub fn with_uid(uid: impl Into<String>) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            uid: uid.into(),
            state,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make subsequent sign-ins fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn sign_out(&self) {
        self.state.send_replace(None);
    }
}

impl Default for MemoryIdentity {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentity {
    async fn sign_in_anonymously(&self) -> Result<AuthUser, IdentityError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(IdentityError::Unavailable);
        }
        if let Some(user) = self.current_user() {
            return Ok(user);
        }

        let user = AuthUser {
            uid: self.uid.clone(),
            is_anonymous: true,
        };
        self.state.send_replace(Some(user.clone()));
        info!(uid_prefix = truncate_chars(&user.uid, 6), "Signed in anonymously");
        Ok(user)
    }

    fn current_user(&self) -> Option<AuthUser> {
        self.state.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<AuthUser>> {
        self.state.subscribe()
    }
}

/// Identity errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("identity service unavailable")]
    Unavailable,

    #[error("sign-in rejected: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_in_is_stable_and_observable() {
        let identity = MemoryIdentity::with_uid("u1");
        let mut rx = identity.watch();
        assert!(rx.borrow().is_none());

        let first = identity.sign_in_anonymously().await.unwrap();
        let second = identity.sign_in_anonymously().await.unwrap();
        assert_eq!(first, second);
        assert!(first.is_anonymous);

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().map(|u| u.uid.as_str()), Some("u1"));
    }

    #[tokio::test]
    async fn unavailable_provider_fails() {
        let identity = MemoryIdentity::new();
        identity.set_unavailable(true);
        assert_eq!(
            identity.sign_in_anonymously().await,
            Err(IdentityError::Unavailable)
        );
        assert!(identity.current_user().is_none());
    }
}
