//! Typing indicator.

use crate::feed::ProfileSource;

/// A `true` typing status is followed by an automatic `false` after this long.
pub const TYPING_TIMEOUT_MS: u64 = 3_000;

/// Entries older than this are ignored.
pub const TYPING_STALE_THRESHOLD_MS: i64 = 5_000;

/// Bursts of typing updates collapse into one write after this quiet period.
pub const TYPING_DEBOUNCE_MS: u64 = 300;

/// Name used for typers without a cached profile.
pub const UNKNOWN_TYPER: &str = "Someone";

/// One `typingStatus/{uid}` document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    pub user_id: String,
    pub is_typing: bool,
    /// Client clock of the writer, in ms.
    pub timestamp_ms: Option<i64>,
}

/// Ids of other users whose typing status is fresh.
pub fn active_typers<'a>(
    entries: &'a [TypingEntry],
    me: &str,
    now_ms: i64,
    stale_ms: i64,
) -> Vec<&'a str> {
    entries
        .iter()
        .filter(|e| e.user_id != me && e.is_typing)
        .filter(|e| e.timestamp_ms.is_some_and(|ts| now_ms - ts < stale_ms))
        .map(|e| e.user_id.as_str())
        .collect()
}

/// Text for a list of typer names; `None` when nobody is typing.
pub fn indicator_text(names: &[String]) -> Option<String> {
    match names {
        [] => None,
        [one] => Some(format!("{} is typing...", one)),
        [a, b] => Some(format!("{} and {} are typing...", a, b)),
        many => Some(format!("{} people are typing...", many.len())),
    }
}

/// Resolve names and build the indicator for a typing snapshot.
pub fn typing_indicator(
    entries: &[TypingEntry],
    me: &str,
    now_ms: i64,
    profiles: &impl ProfileSource,
) -> Option<String> {
    let names: Vec<String> = active_typers(entries, me, now_ms, TYPING_STALE_THRESHOLD_MS)
        .into_iter()
        .map(|uid| {
            profiles
                .lookup(uid)
                .map(|p| p.username)
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| UNKNOWN_TYPER.to_string())
        })
        .collect();
    indicator_text(&names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::AuthorProfile;
    use std::collections::HashMap;

    fn entry(uid: &str, typing: bool, ts: i64) -> TypingEntry {
        TypingEntry {
            user_id: uid.into(),
            is_typing: typing,
            timestamp_ms: Some(ts),
        }
    }

    #[test]
    fn indicator_wording() {
        assert_eq!(indicator_text(&[]), None);
        assert_eq!(
            indicator_text(&["Ann".into()]).as_deref(),
            Some("Ann is typing...")
        );
        assert_eq!(
            indicator_text(&["Ann".into(), "Bo".into()]).as_deref(),
            Some("Ann and Bo are typing...")
        );
        assert_eq!(
            indicator_text(&["a".into(), "b".into(), "c".into()]).as_deref(),
            Some("3 people are typing...")
        );
    }

    #[test]
    fn stale_self_and_idle_entries_ignored() {
        let now = 100_000;
        let entries = vec![
            entry("me", true, now),
            entry("fresh", true, now - 1_000),
            entry("stale", true, now - 5_000),
            entry("idle", false, now),
            TypingEntry {
                user_id: "no-ts".into(),
                is_typing: true,
                timestamp_ms: None,
            },
        ];
        assert_eq!(
            active_typers(&entries, "me", now, TYPING_STALE_THRESHOLD_MS),
            vec!["fresh"]
        );
    }

    #[test]
    fn unknown_typer_is_someone() {
        let mut profiles = HashMap::new();
        profiles.insert(
            "ann".to_string(),
            AuthorProfile {
                username: "Ann".into(),
                photo_url: None,
            },
        );
        let entries = vec![entry("ann", true, 10), entry("zed", true, 10)];
        assert_eq!(
            typing_indicator(&entries, "me", 20, &profiles).as_deref(),
            Some("Ann and Someone are typing...")
        );
    }
}
