//! Murmur Core - client logic for an anonymous chat and confession board.
//!
//! This library holds the parts of the board client that are pure logic:
//! - Input validation and text sanitisation
//! - Device correlation hashes (IP hash, fallback fingerprint, user colour)
//! - Sliding-window spam throttle
//! - Ban state machine and ban propagation planning
//! - Feed reconciliation, scroll decisions and notification gating
//! - Optimistic reactions with exact rollback
//! - Typing indicator, menu permissions and the character counter
//!
//! # Constraints
//!
//! This library intentionally does NOT:
//! - Access the network or the document store
//! - Read the clock (callers pass `now_ms`)
//! - Access OS randomness (callers pass random bytes)
//! - Log anything
//!
//! # Example: Throttled Post with Feed Render
//!
//! ```
//! use std::collections::HashMap;
//! use murmur_core::{
//!     feed::{reconcile, FeedKind, FeedMessage, RenderContext},
//!     validate_message_before_post, SpamThrottle, ThrottleDecision,
//! };
//!
//! let now = 1_710_072_000_000;
//! let mut throttle = SpamThrottle::default();
//!
//! // Validate and throttle before the optimistic update
//! let text = validate_message_before_post("  hello board  ").unwrap();
//! assert_eq!(throttle.check(now as u64), ThrottleDecision::Allowed);
//! throttle.record(now as u64);
//!
//! // The store echoes the message back in the next snapshot
//! let snapshot = vec![FeedMessage {
//!     id: "m1".into(),
//!     user_id: "me".into(),
//!     text: text.to_string(),
//!     timestamp_ms: Some(now),
//!     ..FeedMessage::default()
//! }];
//! let ctx = RenderContext {
//!     kind: FeedKind::Chat,
//!     me: "me",
//!     now_ms: now,
//!     tz_offset_minutes: 0,
//! };
//! let view = reconcile(&snapshot, &ctx, &HashMap::new());
//!
//! let mine = view.last_message().unwrap();
//! assert!(mine.is_mine);
//! assert_eq!(mine.text, "hello board");
//! assert_eq!(view.missing_profiles, vec!["me"]);
//! ```

#![warn(clippy::all)]

pub mod error;
pub mod feed;
pub mod hash;
pub mod menu;
pub mod moderation;
pub mod reactions;
pub mod throttle;
pub mod typing;
pub mod validate;

// Re-export main types at crate root
pub use error::{Error, Result};
pub use feed::{FeedItem, FeedKind, FeedMessage, FeedView, MessageView, ScrollDecision, ScrollTracker};
pub use hash::{fallback_fingerprint, hash_ip, raw_ip_key, user_color, FingerprintComponents};
pub use moderation::{BanCheck, BanKind, BanMonitor, BanStatus, BanTransition};
pub use reactions::{ReactionKind, ReactionMap, ReactionOp};
pub use throttle::{SpamThrottle, ThrottleConfig, ThrottleDecision};
pub use validate::{
    is_valid_message_text, is_valid_profile_photo_url, is_valid_username, sanitize_text,
    text_length, validate_message_before_post, validate_username, MESSAGE_MAX_LENGTH,
    USERNAME_MAX_LENGTH,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use moderation::{plan_ban_propagation, IpBanPolicy, KnownDevice};

    #[test]
    fn spam_burst_escalates_to_ban_state() {
        let mut throttle = SpamThrottle::new(ThrottleConfig {
            min_interval_ms: 0,
            ..ThrottleConfig::default()
        });
        let mut monitor = BanMonitor::new();
        monitor.apply_initial_check(BanCheck::default());

        let start = 50_000_000u64;
        let mut transitions = Vec::new();
        for i in 0..13u64 {
            let now = start + i * 500;
            match throttle.check(now) {
                ThrottleDecision::Banned => transitions.push(monitor.force_ban(BanKind::User)),
                decision if decision.is_allowed() => throttle.record(now),
                _ => {}
            }
        }

        assert_eq!(transitions, vec![BanTransition::Entered(BanKind::User)]);
        assert!(!monitor.can_post());
    }

    #[test]
    fn ban_then_unban_touches_same_records() {
        let devices = vec![
            KnownDevice {
                fingerprint: Some("fp_one".into()),
                ip_hash: Some(hash_ip("198.51.100.1")),
            },
            KnownDevice {
                fingerprint: Some("fp_two".into()),
                ip_hash: Some(hash_ip("198.51.100.2")),
            },
        ];

        let ban = plan_ban_propagation(&devices, &IpBanPolicy::AllKnown);
        let unban = plan_ban_propagation(&devices, &IpBanPolicy::AllKnown);

        assert_eq!(ban.fingerprints.len(), 2);
        assert_eq!(ban.ip_hashes.len(), 2);
        assert_eq!(ban, unban);
    }

    #[test]
    fn invalid_text_never_reaches_throttle() {
        let mut throttle = SpamThrottle::default();
        for bad in ["", "   ", "\u{7}beep"] {
            if validate_message_before_post(bad).is_ok() {
                throttle.record(0);
            }
        }
        assert_eq!(throttle.recent_count(), 0);
    }

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
