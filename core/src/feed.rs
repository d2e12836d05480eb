//! Feed reconciliation.
//!
//! Turns an ordered snapshot of messages into a flat list of render items:
//! date separators and message views with author grouping, reply previews,
//! reaction chips and time labels. Also decides what the scroll position
//! should do after a snapshot and which new messages deserve a notification.
//!
//! Everything here is pure. The clock (`now_ms`) and the local timezone
//! offset are supplied by the caller, and author profiles come through the
//! [`ProfileSource`] trait.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::hash::user_color;
use crate::reactions::{chips, ReactionChip, ReactionMap};
use crate::validate::truncate_chars;

const MINUTE_MS: i64 = 60_000;
const DAY_MS: i64 = 24 * 60 * MINUTE_MS;

/// Name shown for authors without a profile.
pub const ANONYMOUS_NAME: &str = "Anonymous";

/// Maximum characters of a notification title.
pub const NOTIFICATION_TITLE_MAX: usize = 50;

/// Maximum characters of a notification body.
pub const NOTIFICATION_BODY_MAX: usize = 100;

/// Unread counts above this are shown as `99+`.
pub const UNREAD_LABEL_CAP: u32 = 99;

/// One of the two shared feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    Chat,
    Confessions,
}

impl FeedKind {
    /// Store collection backing the feed.
    pub fn collection(self) -> &'static str {
        match self {
            FeedKind::Chat => "chat",
            FeedKind::Confessions => "confessions",
        }
    }

    pub fn other(self) -> FeedKind {
        match self {
            FeedKind::Chat => FeedKind::Confessions,
            FeedKind::Confessions => FeedKind::Chat,
        }
    }

    /// Title used for new-message notifications.
    pub fn notification_title(self) -> &'static str {
        match self {
            FeedKind::Chat => "New Chat",
            FeedKind::Confessions => "New Confession",
        }
    }

    /// Text shown when the feed has nothing to display.
    pub fn empty_placeholder(self) -> String {
        format!("NO {} YET. BE THE FIRST!", self.collection().to_uppercase())
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

impl FromStr for FeedKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(FeedKind::Chat),
            "confessions" | "confession" => Ok(FeedKind::Confessions),
            other => Err(format!("unknown feed: {}", other)),
        }
    }
}

/// Reference to the message being replied to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyRef {
    pub message_id: String,
    pub user_id: String,
    pub text: String,
}

/// A message as delivered by the store, already decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedMessage {
    pub id: String,
    pub user_id: String,
    pub text: String,
    /// Server timestamp in ms; `None` while the write is pending.
    pub timestamp_ms: Option<i64>,
    pub edited: bool,
    pub is_pinned: bool,
    pub reply_to: Option<ReplyRef>,
    pub reactions: ReactionMap,
    pub hidden_for: Vec<String>,
}

impl FeedMessage {
    pub fn is_hidden_for(&self, user_id: &str) -> bool {
        self.hidden_for.iter().any(|u| u == user_id)
    }
}

/// What the renderer knows about an author.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorProfile {
    pub username: String,
    pub photo_url: Option<String>,
}

/// Read access to cached author profiles.
pub trait ProfileSource {
    fn lookup(&self, user_id: &str) -> Option<AuthorProfile>;
}

impl ProfileSource for HashMap<String, AuthorProfile> {
    fn lookup(&self, user_id: &str) -> Option<AuthorProfile> {
        self.get(user_id).cloned()
    }
}

/// Avatar to draw next to a message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Avatar {
    /// The author's stored photo URL.
    Photo(String),
    /// No photo; render a generated avatar from this initial.
    Initial(char),
}

/// Preview of the replied-to message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPreview {
    pub message_id: String,
    pub author_name: String,
    pub text: String,
}

/// A message ready to draw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    pub avatar: Avatar,
    pub color: &'static str,
    pub text: String,
    pub is_mine: bool,
    /// False when the previous rendered message has the same author.
    pub show_header: bool,
    pub time_label: String,
    pub timestamp_ms: Option<i64>,
    pub edited: bool,
    pub pinned: bool,
    pub reply: Option<ReplyPreview>,
    pub chips: Vec<ReactionChip>,
}

impl MessageView {
    /// Footer line: time label plus the edited marker.
    pub fn footer(&self) -> String {
        if self.edited {
            format!("{} (edited)", self.time_label)
        } else {
            self.time_label.clone()
        }
    }
}

/// One row of the rendered feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    DateSeparator { label: String },
    Message(MessageView),
}

/// Result of [`reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedView {
    pub kind: FeedKind,
    pub items: Vec<FeedItem>,
    /// Author ids (message and reply authors) with no cached profile, in
    /// first-seen order, without duplicates.
    pub missing_profiles: Vec<String>,
    /// Set when nothing is visible.
    pub placeholder: Option<String>,
}

impl FeedView {
    pub fn messages(&self) -> impl Iterator<Item = &MessageView> {
        self.items.iter().filter_map(|item| match item {
            FeedItem::Message(view) => Some(view),
            FeedItem::DateSeparator { .. } => None,
        })
    }

    pub fn last_message(&self) -> Option<&MessageView> {
        self.messages().last()
    }

    pub fn is_empty(&self) -> bool {
        self.messages().next().is_none()
    }
}

/// Inputs of a render pass that do not come from the snapshot.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub kind: FeedKind,
    /// Current user id.
    pub me: &'a str,
    pub now_ms: i64,
    /// Local offset east of UTC, in minutes.
    pub tz_offset_minutes: i32,
}

/// Build the render items for an ordered snapshot.
pub fn reconcile(
    messages: &[FeedMessage],
    ctx: &RenderContext<'_>,
    profiles: &impl ProfileSource,
) -> FeedView {
    let mut items = Vec::with_capacity(messages.len() + 4);
    let mut missing: Vec<String> = Vec::new();
    let mut want = |uid: &str, known: bool| {
        if !known && !uid.is_empty() && !missing.iter().any(|m| m == uid) {
            missing.push(uid.to_string());
        }
    };

    let mut last_day: Option<i64> = None;
    let mut last_author: Option<&str> = None;

    for msg in messages {
        if msg.is_hidden_for(ctx.me) {
            continue;
        }

        let ts = msg.timestamp_ms.unwrap_or(ctx.now_ms);
        let day = local_day(ts, ctx.tz_offset_minutes);
        if last_day != Some(day) {
            items.push(FeedItem::DateSeparator {
                label: date_label(ts, ctx.now_ms, ctx.tz_offset_minutes),
            });
            last_day = Some(day);
            last_author = None;
        }

        let profile = profiles.lookup(&msg.user_id);
        want(&msg.user_id, profile.is_some());

        let author_name = profile
            .as_ref()
            .map(|p| p.username.clone())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| ANONYMOUS_NAME.to_string());

        let avatar = match profile.and_then(|p| p.photo_url).filter(|url| !url.is_empty()) {
            Some(url) => Avatar::Photo(url),
            None => Avatar::Initial(initial(&author_name)),
        };

        let reply = msg.reply_to.as_ref().map(|reply| {
            let reply_profile = profiles.lookup(&reply.user_id);
            want(&reply.user_id, reply_profile.is_some());
            ReplyPreview {
                message_id: reply.message_id.clone(),
                author_name: reply_profile
                    .map(|p| p.username)
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| ANONYMOUS_NAME.to_string()),
                text: reply.text.clone(),
            }
        });

        let show_header = msg.user_id.is_empty() || last_author != Some(msg.user_id.as_str());
        last_author = Some(msg.user_id.as_str());

        items.push(FeedItem::Message(MessageView {
            id: msg.id.clone(),
            author_id: msg.user_id.clone(),
            author_name,
            avatar,
            color: user_color(&msg.user_id),
            text: if msg.text.is_empty() {
                "...".to_string()
            } else {
                msg.text.clone()
            },
            is_mine: !ctx.me.is_empty() && msg.user_id == ctx.me,
            show_header,
            time_label: time_label(msg.timestamp_ms, ctx.now_ms, ctx.tz_offset_minutes),
            timestamp_ms: msg.timestamp_ms,
            edited: msg.edited,
            pinned: msg.is_pinned,
            reply,
            chips: chips(&msg.reactions, ctx.me),
        }));
    }

    let placeholder = if items.is_empty() {
        Some(ctx.kind.empty_placeholder())
    } else {
        None
    };

    FeedView {
        kind: ctx.kind,
        items,
        missing_profiles: missing,
        placeholder,
    }
}

fn initial(name: &str) -> char {
    name.chars()
        .next()
        .and_then(|c| c.to_uppercase().next())
        .unwrap_or('?')
}

fn local_day(ts_ms: i64, tz_offset_minutes: i32) -> i64 {
    (ts_ms + i64::from(tz_offset_minutes) * MINUTE_MS).div_euclid(DAY_MS)
}

/// Civil date (year, month, day) from days since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// `Today`, `Yesterday`, or `dd/mm/yyyy` for the local day of `ts_ms`.
pub fn date_label(ts_ms: i64, now_ms: i64, tz_offset_minutes: i32) -> String {
    let day = local_day(ts_ms, tz_offset_minutes);
    let today = local_day(now_ms, tz_offset_minutes);
    if day == today {
        return "Today".to_string();
    }
    if day == today - 1 {
        return "Yesterday".to_string();
    }
    let (year, month, dom) = civil_from_days(day);
    format!("{:02}/{:02}/{:04}", dom, month, year)
}

/// `Just now`, `N mins ago` under five minutes, otherwise local `HH:MM`.
///
/// A pending server timestamp (`None`) reads as `Just now`.
pub fn time_label(ts_ms: Option<i64>, now_ms: i64, tz_offset_minutes: i32) -> String {
    let Some(ts) = ts_ms else {
        return "Just now".to_string();
    };
    let minutes = (now_ms - ts).div_euclid(MINUTE_MS);
    if minutes < 1 {
        return "Just now".to_string();
    }
    if minutes < 5 {
        return format!("{} mins ago", minutes);
    }
    let local = ts + i64::from(tz_offset_minutes) * MINUTE_MS;
    let minute_of_day = local.rem_euclid(DAY_MS) / MINUTE_MS;
    format!("{:02}:{:02}", minute_of_day / 60, minute_of_day % 60)
}

/// Label for the unread button.
pub fn unread_label(count: u32) -> String {
    if count > UNREAD_LABEL_CAP {
        format!("{}+", UNREAD_LABEL_CAP)
    } else {
        count.to_string()
    }
}

/// Scroll position sampled before a render.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrollPosition {
    pub offset: u64,
    pub at_bottom: bool,
}

/// What the view should do with its scroll position after a render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrollDecision {
    /// First content of a subscription: jump without animation.
    JumpToBottom,
    /// New content the user should see: scroll down.
    ScrollToBottom,
    /// New content arrived while reading history.
    ShowUnread { count: u32, label: String },
    /// Nothing new: keep the exact previous offset.
    Restore { offset: u64 },
}

/// Tracks the first-snapshot flag and the unread counter of one feed
/// subscription.
#[derive(Debug, Clone, Default)]
pub struct ScrollTracker {
    content_seen: bool,
    unread: u32,
}

impl ScrollTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unread(&self) -> u32 {
        self.unread
    }

    /// User reached the bottom or pressed the unread button.
    pub fn mark_read(&mut self) {
        self.unread = 0;
    }

    /// Start over for a new subscription (feed switch, reconnect).
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Decide the scroll action for a rendered snapshot.
    ///
    /// `added` is the number of added documents in the snapshot's changes.
    pub fn decide(&mut self, view: &FeedView, added: usize, before: ScrollPosition) -> ScrollDecision {
        if !self.content_seen && !view.is_empty() {
            self.content_seen = true;
            self.unread = 0;
            return ScrollDecision::JumpToBottom;
        }

        if added > 0 {
            let last_is_mine = view.last_message().is_some_and(|m| m.is_mine);
            if last_is_mine || before.at_bottom {
                self.unread = 0;
                return ScrollDecision::ScrollToBottom;
            }
            self.unread = self.unread.saturating_add(1);
            return ScrollDecision::ShowUnread {
                count: self.unread,
                label: unread_label(self.unread),
            };
        }

        ScrollDecision::Restore {
            offset: before.offset,
        }
    }
}

/// Session facts that gate new-message notifications.
#[derive(Debug, Clone, Copy)]
pub struct NotifyContext<'a> {
    pub me: &'a str,
    /// Messages at or before this instant are history, not news.
    pub app_start_ms: i64,
    pub window_hidden: bool,
    /// Feed currently shown to the user.
    pub active_feed: FeedKind,
    pub enabled: bool,
}

/// A notification to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

/// Decide whether an added message warrants a notification.
pub fn notification_for(
    kind: FeedKind,
    msg: &FeedMessage,
    ctx: &NotifyContext<'_>,
) -> Option<Notification> {
    if !ctx.enabled {
        return None;
    }
    let is_new = msg.timestamp_ms.unwrap_or(0) > ctx.app_start_ms;
    let unseen = ctx.window_hidden || ctx.active_feed != kind;
    if !is_new || !unseen || msg.user_id == ctx.me || msg.is_hidden_for(ctx.me) {
        return None;
    }

    let body = if msg.text.is_empty() {
        "New message"
    } else {
        truncate_chars(&msg.text, NOTIFICATION_BODY_MAX)
    };
    Some(Notification {
        title: truncate_chars(kind.notification_title(), NOTIFICATION_TITLE_MAX).to_string(),
        body: body.to_string(),
    })
}
