//! Message reactions.
//!
//! A message carries a map from reaction key to the list of user ids that
//! reacted with it. The lists have set semantics: a user appears at most once
//! per kind, and toggling twice restores the original membership.
//!
//! Reactions are applied optimistically. [`apply_optimistic`] mutates the
//! local map and returns a [`PendingReaction`] that remembers the exact
//! pre-click entry, so a failed store write can be undone with
//! [`PendingReaction::rollback`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Reaction key → user ids.
pub type ReactionMap = BTreeMap<String, Vec<String>>;

/// The five supported reactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReactionKind {
    ThumbsUp,
    Laugh,
    Surprised,
    Heart,
    Skull,
}

impl ReactionKind {
    /// All kinds in display order.
    pub const ALL: [ReactionKind; 5] = [
        ReactionKind::ThumbsUp,
        ReactionKind::Laugh,
        ReactionKind::Surprised,
        ReactionKind::Heart,
        ReactionKind::Skull,
    ];

    /// Key used in the stored `reactions` map.
    pub fn key(self) -> &'static str {
        match self {
            ReactionKind::ThumbsUp => "thumbsup",
            ReactionKind::Laugh => "laugh",
            ReactionKind::Surprised => "surprised",
            ReactionKind::Heart => "heart",
            ReactionKind::Skull => "skull",
        }
    }

    pub fn emoji(self) -> &'static str {
        match self {
            ReactionKind::ThumbsUp => "👍",
            ReactionKind::Laugh => "😂",
            ReactionKind::Surprised => "😮",
            ReactionKind::Heart => "❤️",
            ReactionKind::Skull => "💀",
        }
    }
}

impl fmt::Display for ReactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for ReactionKind {
    type Err = Error;

    /// Accepts the stored key or the emoji itself.
    fn from_str(s: &str) -> Result<Self> {
        ReactionKind::ALL
            .into_iter()
            .find(|kind| kind.key() == s || kind.emoji() == s)
            .ok_or_else(|| Error::UnknownReaction { key: s.to_string() })
    }
}

/// Direction of a toggle, mirrored by the store write (array union/remove).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOp {
    Add,
    Remove,
}

/// Whether `user_id` has reacted with `kind`.
pub fn has_reacted(map: &ReactionMap, kind: ReactionKind, user_id: &str) -> bool {
    map.get(kind.key())
        .is_some_and(|users| users.iter().any(|u| u == user_id))
}

/// Toggle membership of `user_id` under `kind` and report which way it went.
pub fn toggle(map: &mut ReactionMap, kind: ReactionKind, user_id: &str) -> ReactionOp {
    let users = map.entry(kind.key().to_string()).or_default();
    if users.iter().any(|u| u == user_id) {
        users.retain(|u| u != user_id);
        ReactionOp::Remove
    } else {
        users.push(user_id.to_string());
        ReactionOp::Add
    }
}

/// One chip under a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionChip {
    pub kind: ReactionKind,
    pub count: usize,
    pub reacted_by_me: bool,
}

/// Chips for every kind with at least one reaction, in canonical order.
///
/// Duplicate ids in a stored list are counted once; unknown keys are ignored.
pub fn chips(map: &ReactionMap, me: &str) -> Vec<ReactionChip> {
    ReactionKind::ALL
        .into_iter()
        .filter_map(|kind| {
            let users = map.get(kind.key())?;
            let mut distinct: Vec<&str> = users.iter().map(String::as_str).collect();
            distinct.sort_unstable();
            distinct.dedup();
            if distinct.is_empty() {
                return None;
            }
            Some(ReactionChip {
                kind,
                count: distinct.len(),
                reacted_by_me: distinct.contains(&me),
            })
        })
        .collect()
}

/// A local reaction change awaiting store confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReaction {
    pub message_id: String,
    pub kind: ReactionKind,
    pub op: ReactionOp,
    previous: Option<Vec<String>>,
}

impl PendingReaction {
    /// Restore the entry exactly as it was before the click.
    pub fn rollback(&self, map: &mut ReactionMap) {
        match &self.previous {
            Some(users) => {
                map.insert(self.kind.key().to_string(), users.clone());
            }
            None => {
                map.remove(self.kind.key());
            }
        }
    }
}

/// Toggle locally, remembering the previous entry for rollback.
pub fn apply_optimistic(
    map: &mut ReactionMap,
    message_id: &str,
    kind: ReactionKind,
    user_id: &str,
) -> PendingReaction {
    let previous = map.get(kind.key()).cloned();
    let op = toggle(map, kind, user_id);
    PendingReaction {
        message_id: message_id.to_string(),
        kind,
        op,
        previous,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keys_and_emoji() {
        assert_eq!("thumbsup".parse::<ReactionKind>(), Ok(ReactionKind::ThumbsUp));
        assert_eq!("💀".parse::<ReactionKind>(), Ok(ReactionKind::Skull));
        assert!(matches!(
            "wave".parse::<ReactionKind>(),
            Err(Error::UnknownReaction { .. })
        ));
    }

    #[test]
    fn toggle_twice_restores_membership() {
        let mut map = ReactionMap::new();
        map.insert("heart".into(), vec!["other".into()]);

        assert_eq!(toggle(&mut map, ReactionKind::Heart, "me"), ReactionOp::Add);
        assert!(has_reacted(&map, ReactionKind::Heart, "me"));
        assert_eq!(chips(&map, "me")[0].count, 2);

        assert_eq!(toggle(&mut map, ReactionKind::Heart, "me"), ReactionOp::Remove);
        assert!(!has_reacted(&map, ReactionKind::Heart, "me"));
        assert_eq!(map["heart"], vec!["other".to_string()]);
    }

    #[test]
    fn chips_follow_canonical_order() {
        let mut map = ReactionMap::new();
        map.insert("skull".into(), vec!["a".into()]);
        map.insert("thumbsup".into(), vec!["b".into(), "me".into()]);
        map.insert("laugh".into(), vec![]);
        map.insert("bogus".into(), vec!["c".into()]);

        let chips = chips(&map, "me");
        assert_eq!(chips.len(), 2);
        assert_eq!(chips[0].kind, ReactionKind::ThumbsUp);
        assert!(chips[0].reacted_by_me);
        assert_eq!(chips[1].kind, ReactionKind::Skull);
        assert!(!chips[1].reacted_by_me);
    }

    #[test]
    fn chips_count_distinct_users() {
        let mut map = ReactionMap::new();
        map.insert("laugh".into(), vec!["a".into(), "a".into()]);
        assert_eq!(chips(&map, "me")[0].count, 1);
    }

    #[test]
    fn rollback_restores_exact_state() {
        let mut map = ReactionMap::new();
        let pending = apply_optimistic(&mut map, "m1", ReactionKind::Laugh, "me");
        assert_eq!(pending.op, ReactionOp::Add);
        pending.rollback(&mut map);
        assert!(map.is_empty());

        map.insert("laugh".into(), vec!["x".into(), "me".into(), "y".into()]);
        let before = map.clone();
        let pending = apply_optimistic(&mut map, "m1", ReactionKind::Laugh, "me");
        assert_eq!(pending.op, ReactionOp::Remove);
        pending.rollback(&mut map);
        assert_eq!(map, before);
    }
}
