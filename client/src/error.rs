//! Client error type and the user-facing hints derived from it.

use crate::identity::IdentityError;
use crate::store::StoreError;
use murmur_core::moderation::BanKind;

/// What the user was doing when an error occurred. Selects the hint text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Post,
    Edit,
    React,
    Delete,
    Pin,
    Ban,
    Profile,
    Load,
}

/// Errors surfaced by client operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("{0}")]
    Validation(#[from] murmur_core::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("not signed in")]
    NotSignedIn,

    #[error("session is banned ({0:?})")]
    Banned(BanKind),

    #[error("access was restored; the session must be reloaded")]
    ReloadRequired,

    #[error("a username is required before posting")]
    UsernameRequired,

    #[error("username is already taken")]
    UsernameTaken,

    #[error("sending too fast, retry in {retry_in_ms} ms")]
    TooFast { retry_in_ms: u64 },

    #[error("{0}")]
    NotAllowed(&'static str),

    #[error("unknown message: {0}")]
    UnknownMessage(String),
}

impl ClientError {
    /// Toast text for this error in the context of `action`.
    pub fn user_hint(&self, action: Action) -> String {
        match self {
            ClientError::Validation(err) => err.to_string(),
            ClientError::Store(err) => store_hint(err, action),
            ClientError::Identity(_) | ClientError::NotSignedIn => {
                "Not connected. Please refresh.".to_string()
            }
            ClientError::Banned(kind) => match kind {
                BanKind::User => "You have been banned.".to_string(),
                BanKind::Device | BanKind::Ip => "Your device has been banned.".to_string(),
            },
            ClientError::ReloadRequired => "Access restored. Please reload to continue.".to_string(),
            ClientError::UsernameRequired => "Please set a username first!".to_string(),
            ClientError::UsernameTaken => "Username is already taken!".to_string(),
            ClientError::TooFast { .. } => "Slow down! You're sending messages too fast.".to_string(),
            ClientError::NotAllowed(reason) => (*reason).to_string(),
            ClientError::UnknownMessage(_) => "That message is no longer available.".to_string(),
        }
    }

    /// Whether this is a permission failure from the store.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ClientError::Store(StoreError::PermissionDenied))
    }
}

fn store_hint(err: &StoreError, action: Action) -> String {
    let text = match (err, action) {
        (StoreError::Unavailable, _) => "Server unavailable. Please try again.",

        (StoreError::Timeout, Action::Post) => "Message timed out. Please check your connection.",
        (StoreError::Timeout, _) => "Request timed out. Please try again.",

        (StoreError::PermissionDenied, Action::Post) => {
            "Permission denied. Please wait a moment and try again."
        }
        (StoreError::PermissionDenied, Action::Profile) => "Permission denied. You may be banned.",
        (StoreError::PermissionDenied, Action::React) => "Unable to add reaction.",
        (StoreError::PermissionDenied, Action::Delete) => "Permission denied.",

        (_, Action::Edit) => "Error: You can only edit your own messages.",
        (_, Action::Pin) => "Failed to pin message. Check Admin permissions.",
        (_, Action::Post) => "Failed to send message. Please try again.",
        (_, Action::Profile) => "Failed to save profile. Please try again.",
        (_, Action::Ban) => return format!("Failed to update ban: {}", err),
        (_, Action::React) => "Unable to add reaction.",
        (_, Action::Delete) => "Failed to delete message.",
        (_, Action::Load) => "Failed to load messages. Please try again.",
    };
    text.to_string()
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_hint_is_verbatim() {
        let err = ClientError::from(murmur_core::Error::EmptyMessage);
        assert_eq!(err.user_hint(Action::Post), "Message cannot be empty");
    }

    #[test]
    fn store_hints_depend_on_action() {
        let denied = ClientError::from(StoreError::PermissionDenied);
        assert!(denied.is_permission_denied());
        assert_eq!(
            denied.user_hint(Action::Post),
            "Permission denied. Please wait a moment and try again."
        );
        assert_eq!(
            denied.user_hint(Action::Profile),
            "Permission denied. You may be banned."
        );
        assert_eq!(
            denied.user_hint(Action::Edit),
            "Error: You can only edit your own messages."
        );

        let unavailable = ClientError::from(StoreError::Unavailable);
        assert_eq!(
            unavailable.user_hint(Action::React),
            "Server unavailable. Please try again."
        );

        let timeout = ClientError::from(StoreError::Timeout);
        assert_eq!(
            timeout.user_hint(Action::Post),
            "Message timed out. Please check your connection."
        );
    }

    #[test]
    fn ban_hints() {
        assert_eq!(
            ClientError::Banned(BanKind::Ip).user_hint(Action::Post),
            "Your device has been banned."
        );
        assert_eq!(
            ClientError::Banned(BanKind::User).user_hint(Action::Post),
            "You have been banned."
        );
        assert_eq!(
            ClientError::ReloadRequired.user_hint(Action::React),
            "Access restored. Please reload to continue."
        );
    }
}
