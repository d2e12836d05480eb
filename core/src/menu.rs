//! Permission logic behind the message menus and dialogs.
//!
//! Decides which actions a viewer is offered for a message, which buttons
//! the delete dialog shows, how multi-select behaves, and how the character
//! counter is styled. The store rules are the real authority; these checks
//! only keep the UI from offering actions that would be refused.

use crate::feed::ReplyRef;
use crate::validate::{text_length, truncate_chars, MESSAGE_MAX_LENGTH};

/// Authors may edit their messages for this long.
pub const EDIT_WINDOW_MS: i64 = 15 * 60 * 1_000;

/// Maximum characters of pinned-pointer text.
pub const PIN_TEXT_MAX: usize = 200;

/// Whether a message sent at `timestamp_ms` is still editable.
///
/// A pending timestamp counts as recent.
pub fn is_within_edit_window(timestamp_ms: Option<i64>, now_ms: i64) -> bool {
    timestamp_ms.map_or(true, |ts| now_ms - ts < EDIT_WINDOW_MS)
}

/// Facts about a message the menus depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFacts<'a> {
    pub author_id: &'a str,
    pub is_mine: bool,
    pub is_pinned: bool,
    pub timestamp_ms: Option<i64>,
}

/// Entries of the per-message context menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    Edit,
    Delete,
    Select,
    Pin,
    Unpin,
    Ban,
    Unban,
}

impl MenuAction {
    pub fn label(self) -> &'static str {
        match self {
            MenuAction::Edit => "Edit",
            MenuAction::Delete => "Delete",
            MenuAction::Select => "Select",
            MenuAction::Pin => "Pin Message 📌",
            MenuAction::Unpin => "Unpin Message",
            MenuAction::Ban => "Ban User 🚫",
            MenuAction::Unban => "Unban User ✅",
        }
    }
}

/// Build the context menu for a message.
///
/// `author_banned` selects between ban and unban for admins; it is ignored
/// otherwise.
pub fn context_menu(
    msg: &MessageFacts<'_>,
    is_admin: bool,
    now_ms: i64,
    author_banned: bool,
) -> Vec<MenuAction> {
    let mut actions = Vec::with_capacity(5);

    if msg.is_mine && is_within_edit_window(msg.timestamp_ms, now_ms) {
        actions.push(MenuAction::Edit);
    }
    actions.push(MenuAction::Delete);
    actions.push(MenuAction::Select);

    if is_admin {
        actions.push(if msg.is_pinned {
            MenuAction::Unpin
        } else {
            MenuAction::Pin
        });

        if !msg.is_mine && !msg.author_id.is_empty() {
            actions.push(if author_banned {
                MenuAction::Unban
            } else {
                MenuAction::Ban
            });
        }
    }

    actions
}

/// What a delete-dialog button does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteScope {
    /// Add the viewer to `hiddenFor`.
    ForMe,
    /// Remove the document.
    Everyone,
}

/// A dialog button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialogOption {
    pub scope: DeleteScope,
    pub label: &'static str,
}

/// Buttons of the single-message delete dialog.
pub fn delete_dialog(is_mine: bool, is_admin: bool) -> Vec<DialogOption> {
    if !is_mine && !is_admin {
        return vec![DialogOption {
            scope: DeleteScope::ForMe,
            label: "HIDE",
        }];
    }
    vec![
        DialogOption {
            scope: DeleteScope::ForMe,
            label: "FOR ME",
        },
        DialogOption {
            scope: DeleteScope::Everyone,
            label: if is_admin && !is_mine {
                "NUKE (ADMIN)"
            } else {
                "EVERYONE"
            },
        },
    ]
}

/// Multi-select state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    active: bool,
    ids: Vec<String>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Selected ids in selection order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|s| s == id)
    }

    /// Enter selection mode with the message the menu was opened on.
    pub fn enter(&mut self, first: &str) {
        self.active = true;
        if !self.contains(first) {
            self.ids.push(first.to_string());
        }
    }

    /// Toggle a message. Deselecting the last one leaves selection mode.
    pub fn toggle(&mut self, id: &str) {
        if !self.active {
            return;
        }
        if self.contains(id) {
            self.ids.retain(|s| s != id);
        } else {
            self.ids.push(id.to_string());
        }
        if self.ids.is_empty() {
            self.exit();
        }
    }

    pub fn exit(&mut self) {
        self.active = false;
        self.ids.clear();
    }

    pub fn count_label(&self) -> String {
        format!("{} selected", self.ids.len())
    }

    /// Question shown in the batch delete dialog.
    pub fn confirm_text(&self) -> String {
        let n = self.ids.len();
        format!("Delete {} message{}?", n, if n == 1 { "" } else { "s" })
    }

    /// Buttons of the batch delete dialog.
    pub fn dialog(&self, all_mine: bool, is_admin: bool) -> Vec<DialogOption> {
        let mut options = vec![DialogOption {
            scope: DeleteScope::ForMe,
            label: "FOR ME",
        }];
        if all_mine || is_admin {
            options.push(DialogOption {
                scope: DeleteScope::Everyone,
                label: "EVERYONE",
            });
        }
        options
    }
}

/// Reply target for the next post. Quoted text is capped at the message
/// limit.
pub fn reply_draft(message_id: &str, user_id: &str, text: &str) -> ReplyRef {
    ReplyRef {
        message_id: message_id.to_string(),
        user_id: user_id.to_string(),
        text: truncate_chars(text, MESSAGE_MAX_LENGTH).to_string(),
    }
}

/// Styling level of the character counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CounterLevel {
    Normal,
    /// At least 80% of the limit.
    Warning,
    /// At least 95% of the limit.
    Danger,
    /// At or over the limit.
    Limit,
}

/// Character counter under the composer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharCounter {
    pub len: usize,
    pub max: usize,
    pub level: CounterLevel,
    /// Hidden while the composer is empty.
    pub visible: bool,
}

impl CharCounter {
    pub fn for_text(text: &str) -> Self {
        let len = text_length(text);
        let max = MESSAGE_MAX_LENGTH;
        // integer form of len >= max * 0.95 / 0.8
        let level = if len >= max {
            CounterLevel::Limit
        } else if len * 100 >= max * 95 {
            CounterLevel::Danger
        } else if len * 10 >= max * 8 {
            CounterLevel::Warning
        } else {
            CounterLevel::Normal
        };
        Self {
            len,
            max,
            level,
            visible: len > 0,
        }
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.len, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 10_000_000;

    fn facts(is_mine: bool, ts: i64) -> MessageFacts<'static> {
        MessageFacts {
            author_id: "author",
            is_mine,
            is_pinned: false,
            timestamp_ms: Some(ts),
        }
    }

    #[test]
    fn edit_window_boundary() {
        assert!(is_within_edit_window(Some(NOW - EDIT_WINDOW_MS + 1), NOW));
        assert!(!is_within_edit_window(Some(NOW - EDIT_WINDOW_MS), NOW));
        assert!(is_within_edit_window(None, NOW));
    }

    #[test]
    fn menu_for_regular_user() {
        assert_eq!(
            context_menu(&facts(true, NOW - 1_000), false, NOW, false),
            vec![MenuAction::Edit, MenuAction::Delete, MenuAction::Select]
        );
        assert_eq!(
            context_menu(&facts(true, NOW - EDIT_WINDOW_MS), false, NOW, false),
            vec![MenuAction::Delete, MenuAction::Select]
        );
        assert_eq!(
            context_menu(&facts(false, NOW), false, NOW, false),
            vec![MenuAction::Delete, MenuAction::Select]
        );
    }

    #[test]
    fn menu_for_admin() {
        let menu = context_menu(&facts(false, NOW), true, NOW, false);
        assert!(menu.contains(&MenuAction::Pin));
        assert!(menu.contains(&MenuAction::Ban));

        let pinned = MessageFacts {
            is_pinned: true,
            ..facts(false, NOW)
        };
        let menu = context_menu(&pinned, true, NOW, true);
        assert!(menu.contains(&MenuAction::Unpin));
        assert!(menu.contains(&MenuAction::Unban));

        // never offered on own message
        let menu = context_menu(&facts(true, NOW), true, NOW, false);
        assert!(!menu.contains(&MenuAction::Ban));
    }

    #[test]
    fn delete_dialog_variants() {
        let labels = |opts: Vec<DialogOption>| opts.iter().map(|o| o.label).collect::<Vec<_>>();
        assert_eq!(labels(delete_dialog(true, false)), vec!["FOR ME", "EVERYONE"]);
        assert_eq!(labels(delete_dialog(false, true)), vec!["FOR ME", "NUKE (ADMIN)"]);
        assert_eq!(labels(delete_dialog(true, true)), vec!["FOR ME", "EVERYONE"]);
        assert_eq!(labels(delete_dialog(false, false)), vec!["HIDE"]);
        assert_eq!(delete_dialog(false, false)[0].scope, DeleteScope::ForMe);
    }

    #[test]
    fn selection_exits_on_last_toggle() {
        let mut sel = Selection::new();
        sel.toggle("ignored");
        assert!(!sel.is_active());

        sel.enter("a");
        sel.toggle("b");
        assert_eq!(sel.ids(), ["a".to_string(), "b".to_string()]);
        assert_eq!(sel.confirm_text(), "Delete 2 messages?");

        sel.toggle("a");
        assert_eq!(sel.count_label(), "1 selected");
        assert_eq!(sel.confirm_text(), "Delete 1 message?");

        sel.toggle("b");
        assert!(!sel.is_active());
        assert!(sel.ids().is_empty());
    }

    #[test]
    fn selection_everyone_needs_ownership_or_admin() {
        let mut sel = Selection::new();
        sel.enter("a");
        assert_eq!(sel.dialog(false, false).len(), 1);
        assert_eq!(sel.dialog(true, false).len(), 2);
        assert_eq!(sel.dialog(false, true).len(), 2);
    }

    #[test]
    fn reply_draft_truncates() {
        let draft = reply_draft("m", "u", &"q".repeat(600));
        assert_eq!(draft.text.chars().count(), 500);
    }

    #[test]
    fn counter_levels() {
        let at = |n: usize| CharCounter::for_text(&"x".repeat(n));
        assert!(!at(0).visible);
        assert_eq!(at(0).level, CounterLevel::Normal);
        assert_eq!(at(399).level, CounterLevel::Normal);
        assert_eq!(at(400).level, CounterLevel::Warning);
        assert_eq!(at(474).level, CounterLevel::Warning);
        assert_eq!(at(475).level, CounterLevel::Danger);
        assert_eq!(at(500).level, CounterLevel::Limit);
        assert_eq!(at(42).label(), "42/500");
        assert_eq!(CharCounter::for_text("😀😀").label(), "4/500");
    }
}
