//! Feed controller: turns store snapshots into rendered feed views.

use murmur_core::feed::{
    notification_for, reconcile, FeedKind, FeedMessage, FeedView, Notification, NotifyContext,
    ProfileSource, RenderContext, ScrollDecision, ScrollPosition, ScrollTracker,
};
use murmur_core::reactions::{apply_optimistic, PendingReaction, ReactionKind};
use tracing::{debug, warn};

use crate::models::{collections, Message, PinnedPointer};
use crate::store::{Direction, Query, QuerySnapshot, StoreError};

/// Text shown in place of a feed that could not be rendered.
pub const RENDER_ERROR_TEXT: &str = "Error rendering messages. Please refresh.";

/// Subscription query for a feed.
pub fn feed_query(kind: FeedKind) -> Query {
    Query::collection(kind.collection()).order_by("timestamp", Direction::Asc)
}

/// Subscription query for pin pointers, newest first.
pub fn pinned_query() -> Query {
    Query::collection(collections::PINNED_MESSAGES).order_by("timestamp", Direction::Desc)
}

/// Most recent pin of `kind` in a pointer snapshot.
pub fn active_pin(snapshot: &QuerySnapshot, kind: FeedKind) -> Option<PinnedPointer> {
    snapshot
        .docs
        .iter()
        .filter_map(|doc| doc.decode::<PinnedPointer>().ok())
        .find(|pin| pin.collection == kind.collection())
}

/// Result of rendering a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedUpdate {
    pub view: FeedView,
    pub scroll: ScrollDecision,
    pub notifications: Vec<Notification>,
}

/// Snapshot could not be turned into a view; offer a retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", RENDER_ERROR_TEXT)]
pub struct RenderError {
    pub kind: FeedKind,
    pub cause: String,
}

/// Owns the decoded messages and scroll state of the active feed.
#[derive(Debug, Clone)]
pub struct FeedController {
    kind: FeedKind,
    messages: Vec<FeedMessage>,
    scroll: ScrollTracker,
}

impl FeedController {
    pub fn new(kind: FeedKind) -> Self {
        Self {
            kind,
            messages: Vec::new(),
            scroll: ScrollTracker::new(),
        }
    }

    pub fn kind(&self) -> FeedKind {
        self.kind
    }

    pub fn messages(&self) -> &[FeedMessage] {
        &self.messages
    }

    pub fn message(&self, id: &str) -> Option<&FeedMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn unread(&self) -> u32 {
        self.scroll.unread()
    }

    pub fn mark_read(&mut self) {
        self.scroll.mark_read();
    }

    /// Switch to another feed and forget the previous one.
    pub fn switch(&mut self, kind: FeedKind) {
        self.kind = kind;
        self.messages.clear();
        self.scroll.reset();
    }

    /// Start over on the same feed (reconnect, retry).
    pub fn reset(&mut self) {
        self.switch(self.kind);
    }

    /// Render a new snapshot of the active feed.
    ///
    /// The snapshot is authoritative: the previous message list is replaced
    /// wholesale. A snapshot that fails to decode leaves the previous list
    /// in place and yields a [`RenderError`].
    pub fn apply_snapshot(
        &mut self,
        snapshot: &QuerySnapshot,
        ctx: &RenderContext<'_>,
        notify: &NotifyContext<'_>,
        profiles: &impl ProfileSource,
        before: ScrollPosition,
    ) -> Result<FeedUpdate, RenderError> {
        let messages = snapshot
            .docs
            .iter()
            .map(|doc| {
                doc.decode::<Message>()
                    .map(|msg| msg.into_feed(doc.id.clone()))
            })
            .collect::<Result<Vec<_>, StoreError>>()
            .map_err(|e| {
                warn!(feed = %self.kind, error = %e, "Feed snapshot could not be rendered");
                RenderError {
                    kind: self.kind,
                    cause: e.to_string(),
                }
            })?;

        let mut notifications = Vec::new();
        for doc in snapshot.added() {
            if let Some(msg) = messages.iter().find(|m| m.id == doc.id) {
                notifications.extend(notification_for(self.kind, msg, notify));
            }
        }

        self.messages = messages;
        let view = reconcile(&self.messages, ctx, profiles);
        let added = snapshot.added().count();
        let scroll = self.scroll.decide(&view, added, before);

        debug!(
            feed = %self.kind,
            messages = self.messages.len(),
            added,
            "Feed rendered"
        );

        Ok(FeedUpdate {
            view,
            scroll,
            notifications,
        })
    }

    /// Re-render the current messages without a new snapshot.
    pub fn render(&self, ctx: &RenderContext<'_>, profiles: &impl ProfileSource) -> FeedView {
        reconcile(&self.messages, ctx, profiles)
    }

    /// Toggle a reaction locally. `None` if the message is unknown.
    pub fn react(&mut self, message_id: &str, kind: ReactionKind, user_id: &str) -> Option<PendingReaction> {
        let msg = self.messages.iter_mut().find(|m| m.id == message_id)?;
        Some(apply_optimistic(&mut msg.reactions, message_id, kind, user_id))
    }

    /// Undo a local reaction after its write failed.
    pub fn rollback(&mut self, pending: &PendingReaction) {
        if let Some(msg) = self.messages.iter_mut().find(|m| m.id == pending.message_id) {
            pending.rollback(&mut msg.reactions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChangeKind, DocChange, Document};
    use murmur_core::feed::{AuthorProfile, FeedItem};
    use serde_json::json;
    use std::collections::HashMap;

    const NOW: i64 = 1_710_072_000_000;

    fn doc(id: &str, user: &str, ts: i64) -> Document {
        Document {
            id: id.into(),
            data: json!({ "text": format!("msg {}", id), "userId": user, "timestamp": ts }),
        }
    }

    fn snapshot(docs: Vec<Document>, added: &[&str]) -> QuerySnapshot {
        let changes = docs
            .iter()
            .filter(|d| added.contains(&d.id.as_str()))
            .map(|d| DocChange {
                kind: ChangeKind::Added,
                doc: d.clone(),
            })
            .collect();
        QuerySnapshot { docs, changes }
    }

    fn ctx(me: &str) -> RenderContext<'_> {
        RenderContext {
            kind: FeedKind::Chat,
            me,
            now_ms: NOW,
            tz_offset_minutes: 0,
        }
    }

    fn notify(me: &str, hidden: bool) -> NotifyContext<'_> {
        NotifyContext {
            me,
            app_start_ms: NOW - 60_000,
            window_hidden: hidden,
            active_feed: FeedKind::Chat,
            enabled: true,
        }
    }

    fn profiles() -> HashMap<String, AuthorProfile> {
        HashMap::new()
    }

    #[test]
    fn first_snapshot_jumps_then_unread_accumulates() {
        let mut feed = FeedController::new(FeedKind::Chat);
        let first = snapshot(vec![doc("a", "u2", NOW - 120_000)], &["a"]);
        let update = feed
            .apply_snapshot(&first, &ctx("me"), &notify("me", false), &profiles(), ScrollPosition::default())
            .unwrap();
        assert_eq!(update.scroll, ScrollDecision::JumpToBottom);

        let reading = ScrollPosition {
            offset: 40,
            at_bottom: false,
        };
        let second = snapshot(
            vec![doc("a", "u2", NOW - 120_000), doc("b", "u2", NOW - 1_000)],
            &["b"],
        );
        let update = feed
            .apply_snapshot(&second, &ctx("me"), &notify("me", false), &profiles(), reading)
            .unwrap();
        assert!(matches!(update.scroll, ScrollDecision::ShowUnread { count: 1, .. }));
        assert_eq!(feed.unread(), 1);

        let unchanged = snapshot(second.docs.clone(), &[]);
        let update = feed
            .apply_snapshot(&unchanged, &ctx("me"), &notify("me", false), &profiles(), reading)
            .unwrap();
        assert_eq!(update.scroll, ScrollDecision::Restore { offset: 40 });
    }

    #[test]
    fn notifications_only_for_new_foreign_messages_while_hidden() {
        let mut feed = FeedController::new(FeedKind::Chat);
        let snap = snapshot(
            vec![
                doc("old", "u2", NOW - 3_600_000),
                doc("mine", "me", NOW - 1_000),
                doc("new", "u2", NOW - 500),
            ],
            &["old", "mine", "new"],
        );

        let update = feed
            .apply_snapshot(&snap, &ctx("me"), &notify("me", true), &profiles(), ScrollPosition::default())
            .unwrap();
        assert_eq!(update.notifications.len(), 1);
        assert_eq!(update.notifications[0].title, "New Chat");
        assert_eq!(update.notifications[0].body, "msg new");

        let mut visible = FeedController::new(FeedKind::Chat);
        let update = visible
            .apply_snapshot(&snap, &ctx("me"), &notify("me", false), &profiles(), ScrollPosition::default())
            .unwrap();
        assert!(update.notifications.is_empty());
    }

    #[test]
    fn undecodable_snapshot_keeps_previous_messages() {
        let mut feed = FeedController::new(FeedKind::Chat);
        let good = snapshot(vec![doc("a", "u2", NOW)], &["a"]);
        feed.apply_snapshot(&good, &ctx("me"), &notify("me", false), &profiles(), ScrollPosition::default())
            .unwrap();

        let bad = snapshot(
            vec![Document {
                id: "x".into(),
                data: json!({ "text": 42 }),
            }],
            &["x"],
        );
        let err = feed
            .apply_snapshot(&bad, &ctx("me"), &notify("me", false), &profiles(), ScrollPosition::default())
            .unwrap_err();
        assert_eq!(err.to_string(), RENDER_ERROR_TEXT);
        assert_eq!(feed.messages().len(), 1);
    }

    #[test]
    fn optimistic_reaction_and_rollback() {
        let mut feed = FeedController::new(FeedKind::Chat);
        let snap = snapshot(vec![doc("a", "u2", NOW)], &["a"]);
        feed.apply_snapshot(&snap, &ctx("me"), &notify("me", false), &profiles(), ScrollPosition::default())
            .unwrap();

        let pending = feed.react("a", ReactionKind::Heart, "me").unwrap();
        let view = feed.render(&ctx("me"), &profiles());
        let chips = &view.messages().next().unwrap().chips;
        assert!(chips.iter().any(|c| c.kind == ReactionKind::Heart && c.reacted_by_me));

        feed.rollback(&pending);
        assert!(feed.message("a").unwrap().reactions.is_empty());
        assert!(feed.react("missing", ReactionKind::Heart, "me").is_none());
    }

    #[test]
    fn empty_feed_shows_placeholder() {
        let mut feed = FeedController::new(FeedKind::Chat);
        let update = feed
            .apply_snapshot(&QuerySnapshot::default(), &ctx("me"), &notify("me", false), &profiles(), ScrollPosition::default())
            .unwrap();
        assert!(update.view.placeholder.is_some());
        assert!(!update.view.items.iter().any(|i| matches!(i, FeedItem::Message(_))));
    }

    #[test]
    fn active_pin_matches_feed() {
        let snap = QuerySnapshot {
            docs: vec![
                Document {
                    id: "c1".into(),
                    data: json!({ "originalId": "c1", "collection": "confessions", "text": "c" }),
                },
                Document {
                    id: "m1".into(),
                    data: json!({ "originalId": "m1", "collection": "chat", "text": "pinned" }),
                },
            ],
            changes: vec![],
        };
        assert_eq!(active_pin(&snap, FeedKind::Chat).unwrap().text, "pinned");
        assert_eq!(active_pin(&snap, FeedKind::Confessions).unwrap().original_id, "c1");
    }
}
