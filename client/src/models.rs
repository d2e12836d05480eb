//! Document models for the board collections.
//!
//! Field names follow the stored camelCase layout. Timestamps are
//! milliseconds since the Unix epoch; a `None` timestamp on a message means
//! the server has not assigned one yet.

use std::collections::BTreeMap;

use murmur_core::feed::{AuthorProfile, FeedMessage, ReplyRef};
use murmur_core::moderation::KnownDevice;
use murmur_core::typing::TypingEntry;
use serde::{Deserialize, Serialize};

/// Collection names.
pub mod collections {
    pub const CHAT: &str = "chat";
    pub const CONFESSIONS: &str = "confessions";
    pub const USERS: &str = "users";
    pub const USER_DEVICES: &str = "user_devices";
    pub const BANNED_USERS: &str = "banned_users";
    pub const BANNED_DEVICES: &str = "banned_devices";
    pub const BANNED_IPS: &str = "banned_ips";
    pub const PINNED_MESSAGES: &str = "pinned_messages";
    pub const TYPING_STATUS: &str = "typingStatus";
    pub const ADMINS: &str = "admins";
}

/// `bannedBy` value for automatic spam bans.
pub const SYSTEM_AUTO_BAN: &str = "SYSTEM_AUTO_BAN";

/// Reason written by admin bans.
pub const ADMIN_BAN_REASON: &str = "Admin Action";

/// Reason written on the user record of an automatic ban.
pub const AUTO_BAN_REASON: &str = "Automatic ban: Spam detection (exceeded message limit)";

/// Reason written on device and IP records of an automatic ban.
pub const AUTO_BAN_DEVICE_REASON: &str = "Automatic ban: Spam detection";

// ============================================================================
// Messages
// ============================================================================

/// Reply reference stored on a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyTo {
    pub message_id: String,
    pub user_id: String,
    #[serde(default)]
    pub text: String,
}

/// A post in `chat` or `confessions`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyTo>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hidden_for: Vec<String>,
}

impl Message {
    /// Convert into the renderer's representation.
    pub fn into_feed(self, id: String) -> FeedMessage {
        FeedMessage {
            id,
            user_id: self.user_id,
            text: self.text,
            timestamp_ms: self.timestamp,
            edited: self.edited,
            is_pinned: self.is_pinned,
            reply_to: self.reply_to.map(|r| ReplyRef {
                message_id: r.message_id,
                user_id: r.user_id,
                text: r.text,
            }),
            reactions: self.reactions,
            hidden_for: self.hidden_for,
        }
    }
}

impl From<ReplyRef> for ReplyTo {
    fn from(r: ReplyRef) -> Self {
        Self {
            message_id: r.message_id,
            user_id: r.user_id,
            text: r.text,
        }
    }
}

// ============================================================================
// Profiles
// ============================================================================

/// `users/{uid}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub username: String,
    #[serde(
        rename = "profilePhotoURL",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub profile_photo_url: Option<String>,
    #[serde(default)]
    pub banned: bool,
}

impl UserProfile {
    /// View used by the renderer. Photos off the allow-list are dropped.
    pub fn author(&self) -> AuthorProfile {
        AuthorProfile {
            username: self.username.clone(),
            photo_url: self
                .profile_photo_url
                .clone()
                .filter(|url| murmur_core::is_valid_profile_photo_url(url)),
        }
    }
}

// ============================================================================
// Devices and bans
// ============================================================================

/// `user_devices/{uid}_{fingerprint}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub user_id: String,
    pub fingerprint: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub ip_hash: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub screen_resolution: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

impl DeviceRecord {
    /// Document id for a user's device.
    pub fn doc_id(user_id: &str, fingerprint: &str) -> String {
        format!("{}_{}", user_id, fingerprint)
    }

    pub fn known_device(&self) -> KnownDevice {
        KnownDevice {
            fingerprint: Some(self.fingerprint.clone()),
            ip_hash: self.ip_hash.clone(),
        }
    }
}

/// `banned_users/{uid}`, `banned_devices/{fp}` and `banned_ips/{ipHash}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanRecord {
    pub reason: String,
    pub banned_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

// ============================================================================
// Pins and typing
// ============================================================================

/// `pinned_messages/{messageId}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinnedPointer {
    pub original_id: String,
    pub collection: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub pinned_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// `typingStatus/{uid}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStatus {
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl TypingStatus {
    pub fn into_entry(self, user_id: String) -> TypingEntry {
        TypingEntry {
            user_id,
            is_typing: self.is_typing,
            timestamp_ms: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_decodes_sparse_document() {
        let msg: Message = serde_json::from_value(json!({
            "text": "hi",
            "userId": "u1",
            "timestamp": 1_700_000_000_000i64,
            "reactions": { "heart": ["u2"] },
        }))
        .unwrap();

        assert_eq!(msg.user_id, "u1");
        assert!(!msg.edited);
        assert!(msg.hidden_for.is_empty());

        let feed = msg.into_feed("m1".into());
        assert_eq!(feed.id, "m1");
        assert_eq!(feed.reactions["heart"], vec!["u2".to_string()]);
    }

    #[test]
    fn message_encodes_camel_case() {
        let msg = Message {
            text: "yo".into(),
            user_id: "u1".into(),
            reply_to: Some(ReplyTo {
                message_id: "m0".into(),
                user_id: "u0".into(),
                text: "orig".into(),
            }),
            ..Message::default()
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["replyTo"]["messageId"], "m0");
        assert_eq!(value["isPinned"], false);
        assert!(value.get("timestamp").is_none());
        assert!(value.get("hiddenFor").is_none());
    }

    #[test]
    fn profile_photo_field_name() {
        let profile: UserProfile = serde_json::from_value(json!({
            "username": "bob",
            "profilePhotoURL": "https://evil.example/x.png",
        }))
        .unwrap();
        assert_eq!(profile.author().photo_url, None);
        assert_eq!(DeviceRecord::doc_id("u", "fp"), "u_fp");
    }
}
