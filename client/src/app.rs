//! Session controller.
//!
//! [`App`] owns the session state and every live subscription. The UI feeds
//! it [`UiEvent`]s through [`App::dispatch`] and store changes through
//! [`App::next_event`] / [`App::handle`]; both return the [`UiEffect`]s to
//! apply. Nothing here draws anything.
//!
//! Startup runs in a fixed order: sign in, ban check, device registration,
//! ban watch, admin lookup, own profile, then the feed subscriptions. A ban
//! detected at any point closes every subscription except the ban watch and
//! clears the profile cache. When the ban is lifted the session stays closed
//! until the UI sends [`UiEvent::Reload`], which starts it again from scratch.

use std::sync::Arc;

use chrono::{Local, Utc};
use murmur_core::feed::{
    FeedKind, FeedView, NotifyContext, RenderContext, ReplyRef, ScrollDecision, ScrollPosition,
    ANONYMOUS_NAME,
};
use murmur_core::menu::{
    context_menu, delete_dialog, is_within_edit_window, reply_draft, CharCounter, DeleteScope,
    DialogOption, MenuAction, MessageFacts, Selection, PIN_TEXT_MAX,
};
use murmur_core::moderation::{BanKind, BanMonitor, BanStatus, BanTransition};
use murmur_core::reactions::{ReactionKind, ReactionOp};
use murmur_core::throttle::{SpamThrottle, ThrottleDecision, SPAM_WARNING};
use murmur_core::typing::{typing_indicator, TypingEntry};
use murmur_core::validate::{truncate_chars, validate_message_before_post};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::device::DeviceInfo;
use crate::error::{Action, ClientError, Result};
use crate::feed::{active_pin, feed_query, pinned_query, FeedController};
use crate::identity::IdentityProvider;
use crate::models::{collections, PinnedPointer};
use crate::moderation::{BanEvent, BanWatch, Moderation, SessionKeys};
use crate::notify::Notifier;
use crate::profiles::{ProfileCache, ProfileLoader, ProfileService};
use crate::store::{
    DocPath, DocumentStore, Fields, QuerySnapshot, QuerySubscription, StoreError, Subscription,
    WriteBatch,
};
use crate::timeout::write_timeout;
use crate::typing::{typing_entries, typing_query, TypingBroadcaster};
use crate::Clock;

// ============================================================================
// Events and effects
// ============================================================================

/// User input.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Post { text: String },
    InputChanged { text: String },
    StartReply { message_id: String },
    CancelReply,
    Edit { message_id: String, text: String },
    OpenMenu { message_id: String },
    OpenDeleteDialog { message_id: String },
    Delete { message_id: String, scope: DeleteScope },
    EnterSelection { message_id: String },
    ToggleSelection { message_id: String },
    ExitSelection,
    OpenSelectionDialog,
    DeleteSelected { scope: DeleteScope },
    React { message_id: String, kind: ReactionKind },
    TogglePin { message_id: String },
    ToggleBan { user_id: String },
    SaveUsername { username: String },
    SwitchFeed(FeedKind),
    Scrolled(ScrollPosition),
    JumpToBottom,
    WindowHidden(bool),
    SetNotifications(bool),
    Connectivity { online: bool },
    Retry,
    /// Start the session again after access was restored.
    Reload,
}

impl UiEvent {
    fn action(&self) -> Action {
        match self {
            UiEvent::Post { .. } => Action::Post,
            UiEvent::Edit { .. } => Action::Edit,
            UiEvent::Delete { .. } | UiEvent::DeleteSelected { .. } => Action::Delete,
            UiEvent::React { .. } => Action::React,
            UiEvent::TogglePin { .. } => Action::Pin,
            UiEvent::ToggleBan { .. } => Action::Ban,
            UiEvent::SaveUsername { .. } => Action::Profile,
            _ => Action::Load,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Full-screen replacement shown to a banned session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanScreen {
    Banned(BanKind),
    Spam,
}

impl BanScreen {
    pub fn title(self) -> &'static str {
        match self {
            BanScreen::Spam => "🚫 BANNED FOR SPAMMING",
            BanScreen::Banned(BanKind::User) => "🚫 BANNED",
            BanScreen::Banned(_) => "🚫 ACCESS DENIED",
        }
    }

    pub fn detail(self) -> &'static str {
        match self {
            BanScreen::Spam => "You sent too many messages too quickly.",
            BanScreen::Banned(kind) => kind.reason(),
        }
    }
}

/// Something the UI should do.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEffect {
    Render(FeedView),
    Scroll(ScrollDecision),
    /// The feed could not be shown; offer a retry.
    RenderFailed { message: String },
    Toast { level: ToastLevel, text: String },
    BanScreen(BanScreen),
    AccessRestored,
    Pinned(Option<PinnedPointer>),
    Typing(Option<String>),
    Counter(CharCounter),
    Menu { message_id: String, actions: Vec<MenuAction> },
    DeleteDialog { message_ids: Vec<String>, prompt: String, options: Vec<DialogOption> },
    Selection { active: bool, label: String },
    Reply(Option<ReplyRef>),
    ClearInput,
    FeedSwitched(FeedKind),
    Profile { username: String },
    Connection { online: bool },
}

impl UiEffect {
    fn toast(level: ToastLevel, text: impl Into<String>) -> Self {
        UiEffect::Toast {
            level,
            text: text.into(),
        }
    }
}

/// A change delivered by one of the session's subscriptions.
#[derive(Debug)]
pub enum AppEvent {
    Feed(std::result::Result<QuerySnapshot, StoreError>),
    Pinned(std::result::Result<QuerySnapshot, StoreError>),
    Typing(std::result::Result<QuerySnapshot, StoreError>),
    Profiles(std::result::Result<QuerySnapshot, StoreError>),
    Ban(BanEvent),
    ProfilesLoaded(Vec<String>),
}

// ============================================================================
// State
// ============================================================================

/// Session state visible to the UI.
#[derive(Debug)]
pub struct AppState {
    pub user_id: String,
    pub username: String,
    pub is_admin: bool,
    pub online: bool,
    pub notifications_enabled: bool,
    pub window_hidden: bool,
    pub app_start_ms: i64,
    pub tz_offset_minutes: i32,
    pub scroll: ScrollPosition,
    pub reply: Option<ReplyRef>,
    pub selection: Selection,
    pub ban: BanMonitor,
    pub throttle: SpamThrottle,
    pub feed: FeedController,
    device: Option<DeviceInfo>,
    keys: SessionKeys,
    /// Set for bans imposed locally (spam, profile flag); these last for
    /// the session regardless of ban records.
    local_ban: bool,
    /// Access was restored after a ban; cached state is stale until reload.
    reload_required: bool,
    pinned: Option<QuerySnapshot>,
    typing: Vec<TypingEntry>,
}

impl AppState {
    fn new(config: &Config) -> Self {
        Self {
            user_id: String::new(),
            username: String::new(),
            is_admin: false,
            online: true,
            notifications_enabled: config.notifications_enabled,
            window_hidden: false,
            app_start_ms: 0,
            tz_offset_minutes: Local::now().offset().local_minus_utc() / 60,
            scroll: ScrollPosition::default(),
            reply: None,
            selection: Selection::new(),
            ban: BanMonitor::new(),
            throttle: SpamThrottle::new(config.throttle),
            feed: FeedController::new(FeedKind::Chat),
            device: None,
            keys: SessionKeys::default(),
            local_ban: false,
            reload_required: false,
            pinned: None,
            typing: Vec::new(),
        }
    }

    /// Whether the user still has the placeholder name.
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty() || self.username == ANONYMOUS_NAME
    }

    /// Whether a lifted ban is waiting for [`UiEvent::Reload`].
    pub fn needs_reload(&self) -> bool {
        self.reload_required
    }

    /// Whether feed subscriptions may be open.
    fn is_live(&self) -> bool {
        !self.ban.is_banned() && !self.reload_required
    }
}

#[derive(Default)]
struct Subscriptions {
    feed: Option<QuerySubscription>,
    pinned: Option<QuerySubscription>,
    typing: Option<QuerySubscription>,
    profiles: Option<QuerySubscription>,
    bans: Option<BanWatch>,
}

enum Incoming {
    Feed(Option<std::result::Result<QuerySnapshot, StoreError>>),
    Pinned(Option<std::result::Result<QuerySnapshot, StoreError>>),
    Typing(Option<std::result::Result<QuerySnapshot, StoreError>>),
    Profiles(Option<std::result::Result<QuerySnapshot, StoreError>>),
    Ban(Option<BanEvent>),
    Loaded(Option<Vec<String>>),
}

async fn recv_opt<T>(sub: &mut Option<Subscription<T>>) -> Option<T> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_ban(watch: &mut Option<BanWatch>) -> Option<BanEvent> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// App
// ============================================================================

/// The chat client session.
pub struct App {
    store: Arc<dyn DocumentStore>,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn Notifier>,
    config: Config,
    moderation: Moderation,
    profiles: ProfileService,
    clock: Clock,
    state: AppState,
    subs: Subscriptions,
    loader: Option<ProfileLoader>,
    typing: Option<TypingBroadcaster>,
    loaded_tx: mpsc::UnboundedSender<Vec<String>>,
    loaded_rx: mpsc::UnboundedReceiver<Vec<String>>,
}

impl App {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn Notifier>,
        config: Config,
    ) -> Self {
        let (loaded_tx, loaded_rx) = mpsc::unbounded_channel();
        Self {
            moderation: Moderation::new(store.clone(), &config),
            profiles: ProfileService::new(store.clone(), ProfileCache::new(), &config),
            state: AppState::new(&config),
            store,
            identity,
            notifier,
            config,
            clock: Arc::new(|| Utc::now().timestamp_millis()),
            subs: Subscriptions::default(),
            loader: None,
            typing: None,
            loaded_tx,
            loaded_rx,
        }
    }

    /// Replace the wall clock and local offset.
    pub fn with_clock(mut self, clock: Clock, tz_offset_minutes: i32) -> Self {
        self.clock = clock;
        self.state.tz_offset_minutes = tz_offset_minutes;
        self
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn profile_cache(&self) -> &ProfileCache {
        self.profiles.cache()
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    // === Startup ===

    /// Sign in and bring the session up for `device`.
    pub async fn start(&mut self, device: DeviceInfo) -> Result<Vec<UiEffect>> {
        let user = self.identity.sign_in_anonymously().await?;
        self.state.keys = SessionKeys::new(user.uid.as_str(), Some(&device));
        self.state.user_id = user.uid;
        self.state.device = Some(device);
        self.state.app_start_ms = self.now();

        let check = self.moderation.check_bans(&self.state.keys).await;
        let transition = self.state.ban.apply_initial_check(check);
        self.subs.bans = Some(self.moderation.watch_bans(&self.state.keys).await);
        if let BanTransition::Entered(kind) = transition {
            warn!(?kind, "Session is banned");
            return Ok(self.enter_ban(BanScreen::Banned(kind)));
        }

        if let Some(device) = &self.state.device {
            if let Err(e) = self.moderation.register_device(&self.state.user_id, device).await {
                warn!(error = %e, "Device registration failed");
            }
        }

        self.state.is_admin = self.moderation.is_admin(&self.state.user_id).await;

        match self.profiles.load_own(&self.state.user_id).await {
            Ok(Some(profile)) if profile.banned => {
                warn!("Profile is flagged as banned");
                self.state.local_ban = true;
                self.state.ban.force_ban(BanKind::User);
                return Ok(self.enter_ban(BanScreen::Banned(BanKind::User)));
            }
            Ok(Some(profile)) => self.state.username = profile.username,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load own profile"),
        }
        if self.state.username.is_empty() {
            self.state.username = ANONYMOUS_NAME.to_string();
        }

        info!(admin = self.state.is_admin, "Session started");

        let mut effects = vec![UiEffect::Profile {
            username: self.state.username.clone(),
        }];
        effects.extend(self.open_session().await);
        Ok(effects)
    }

    async fn open_session(&mut self) -> Vec<UiEffect> {
        self.loader = Some(ProfileLoader::spawn(
            self.store.clone(),
            self.profiles.cache().clone(),
            &self.config,
            self.loaded_tx.clone(),
        ));
        self.typing = Some(TypingBroadcaster::spawn(
            self.store.clone(),
            self.state.user_id.clone(),
            &self.config,
        ));
        self.subs.pinned = Some(self.store.watch_query(&pinned_query()).await);
        self.open_feed().await;
        vec![UiEffect::FeedSwitched(self.state.feed.kind())]
    }

    async fn open_feed(&mut self) {
        let kind = self.state.feed.kind();
        self.subs.feed = Some(self.store.watch_query(&feed_query(kind)).await);
        self.subs.typing = match kind {
            FeedKind::Chat => Some(self.store.watch_query(&typing_query()).await),
            FeedKind::Confessions => None,
        };
        debug!(feed = %kind, "Feed subscription opened");
    }

    fn enter_ban(&mut self, screen: BanScreen) -> Vec<UiEffect> {
        self.subs.feed = None;
        self.subs.pinned = None;
        self.subs.typing = None;
        self.subs.profiles = None;
        self.loader = None;
        self.typing = None;
        self.profiles.cache().clear();
        self.state.reply = None;
        self.state.selection.exit();
        self.state.typing.clear();
        info!(?screen, "Session closed by ban");
        vec![UiEffect::BanScreen(screen)]
    }

    fn restore(&mut self) -> Vec<UiEffect> {
        info!("Access restored, waiting for reload");
        self.state.reload_required = true;
        vec![UiEffect::AccessRestored]
    }

    /// Drop everything the session holds and run [`start`](Self::start)
    /// again for the same device.
    async fn reload(&mut self) -> Result<Vec<UiEffect>> {
        let device = self.state.device.clone().ok_or(ClientError::NotSignedIn)?;
        info!("Reloading session");

        self.subs = Subscriptions::default();
        self.loader = None;
        self.typing = None;
        self.profiles.cache().clear();
        while self.loaded_rx.try_recv().is_ok() {}

        let mut state = AppState::new(&self.config);
        state.tz_offset_minutes = self.state.tz_offset_minutes;
        state.notifications_enabled = self.state.notifications_enabled;
        state.window_hidden = self.state.window_hidden;
        self.state = state;

        self.start(device).await
    }

    // === Store events ===

    /// Wait for the next subscription change. Pends forever once every
    /// subscription has closed.
    pub async fn next_event(&mut self) -> AppEvent {
        loop {
            let incoming = tokio::select! {
                s = recv_opt(&mut self.subs.feed) => Incoming::Feed(s),
                s = recv_opt(&mut self.subs.pinned) => Incoming::Pinned(s),
                s = recv_opt(&mut self.subs.typing) => Incoming::Typing(s),
                s = recv_opt(&mut self.subs.profiles) => Incoming::Profiles(s),
                b = next_ban(&mut self.subs.bans) => Incoming::Ban(b),
                l = self.loaded_rx.recv() => Incoming::Loaded(l),
            };
            match incoming {
                Incoming::Feed(Some(s)) => return AppEvent::Feed(s),
                Incoming::Pinned(Some(s)) => return AppEvent::Pinned(s),
                Incoming::Typing(Some(s)) => return AppEvent::Typing(s),
                Incoming::Profiles(Some(s)) => return AppEvent::Profiles(s),
                Incoming::Ban(Some(e)) => return AppEvent::Ban(e),
                Incoming::Loaded(Some(ids)) => return AppEvent::ProfilesLoaded(ids),
                Incoming::Feed(None) => self.subs.feed = None,
                Incoming::Pinned(None) => self.subs.pinned = None,
                Incoming::Typing(None) => self.subs.typing = None,
                Incoming::Profiles(None) => self.subs.profiles = None,
                Incoming::Ban(None) => self.subs.bans = None,
                // The app holds a sender, so the channel never closes.
                Incoming::Loaded(None) => {}
            }
        }
    }

    /// Apply a subscription change.
    pub async fn handle(&mut self, event: AppEvent) -> Vec<UiEffect> {
        match event {
            AppEvent::Feed(Ok(snapshot)) => self.on_feed(&snapshot),
            AppEvent::Feed(Err(e)) => {
                warn!(error = %e, "Feed subscription error");
                vec![
                    UiEffect::RenderFailed {
                        message: format!("Error loading messages: {}", e),
                    },
                    UiEffect::toast(ToastLevel::Error, ClientError::from(e).user_hint(Action::Load)),
                ]
            }
            AppEvent::Pinned(Ok(snapshot)) => {
                self.state.pinned = Some(snapshot);
                vec![UiEffect::Pinned(self.current_pin())]
            }
            AppEvent::Pinned(Err(e)) => {
                debug!(error = %e, "Pinned subscription error");
                Vec::new()
            }
            AppEvent::Typing(Ok(snapshot)) => {
                self.state.typing = typing_entries(&snapshot);
                if let Some(loader) = &self.loader {
                    for entry in &self.state.typing {
                        loader.request(&entry.user_id);
                    }
                }
                vec![UiEffect::Typing(self.typing_text())]
            }
            AppEvent::Typing(Err(e)) => {
                trace!(error = %e, "Typing subscription error");
                Vec::new()
            }
            AppEvent::Profiles(Ok(snapshot)) => {
                if !self.state.is_live() || snapshot.changes.is_empty() {
                    return Vec::new();
                }
                self.profiles.cache().apply_snapshot(&snapshot);
                vec![UiEffect::Render(self.render())]
            }
            AppEvent::Profiles(Err(e)) => {
                debug!(error = %e, "Profile subscription error");
                Vec::new()
            }
            AppEvent::ProfilesLoaded(ids) => {
                if ids.is_empty() || !self.state.is_live() {
                    return Vec::new();
                }
                self.subs.profiles = self.profiles.watch_cached().await;
                vec![
                    UiEffect::Render(self.render()),
                    UiEffect::Typing(self.typing_text()),
                ]
            }
            AppEvent::Ban(event) => self.on_ban_event(event).await,
        }
    }

    fn on_feed(&mut self, snapshot: &QuerySnapshot) -> Vec<UiEffect> {
        if !self.state.is_live() {
            return Vec::new();
        }
        let now = self.now();
        let state = &mut self.state;
        let ctx = RenderContext {
            kind: state.feed.kind(),
            me: &state.user_id,
            now_ms: now,
            tz_offset_minutes: state.tz_offset_minutes,
        };
        let notify = NotifyContext {
            me: &state.user_id,
            app_start_ms: state.app_start_ms,
            window_hidden: state.window_hidden,
            active_feed: state.feed.kind(),
            enabled: state.notifications_enabled,
        };

        match state
            .feed
            .apply_snapshot(snapshot, &ctx, &notify, self.profiles.cache(), state.scroll)
        {
            Ok(update) => {
                if let Some(loader) = &self.loader {
                    for id in &update.view.missing_profiles {
                        loader.request(id);
                    }
                }
                for notification in &update.notifications {
                    self.notifier.notify(notification);
                }
                vec![UiEffect::Render(update.view), UiEffect::Scroll(update.scroll)]
            }
            Err(e) => vec![UiEffect::RenderFailed {
                message: e.to_string(),
            }],
        }
    }

    async fn on_ban_event(&mut self, event: BanEvent) -> Vec<UiEffect> {
        match self.state.ban.observe(event.kind, event.exists) {
            BanTransition::Entered(kind) => {
                warn!(?kind, "Ban record appeared");
                self.enter_ban(BanScreen::Banned(kind))
            }
            BanTransition::RecheckRequired if self.state.local_ban => Vec::new(),
            BanTransition::RecheckRequired => {
                let check = self.moderation.check_bans(&self.state.keys).await;
                match self.state.ban.apply_recheck(check) {
                    BanTransition::Restored => self.restore(),
                    BanTransition::Entered(kind) => self.enter_ban(BanScreen::Banned(kind)),
                    _ => Vec::new(),
                }
            }
            BanTransition::Restored => self.restore(),
            BanTransition::None => Vec::new(),
        }
    }

    fn render(&self) -> FeedView {
        let ctx = RenderContext {
            kind: self.state.feed.kind(),
            me: &self.state.user_id,
            now_ms: self.now(),
            tz_offset_minutes: self.state.tz_offset_minutes,
        };
        self.state.feed.render(&ctx, self.profiles.cache())
    }

    fn current_pin(&self) -> Option<PinnedPointer> {
        self.state
            .pinned
            .as_ref()
            .and_then(|snapshot| active_pin(snapshot, self.state.feed.kind()))
    }

    fn typing_text(&self) -> Option<String> {
        if self.state.feed.kind() != FeedKind::Chat {
            return None;
        }
        typing_indicator(
            &self.state.typing,
            &self.state.user_id,
            self.now(),
            self.profiles.cache(),
        )
    }

    // === User events ===

    /// Apply user input. Failures come back as an error toast.
    pub async fn dispatch(&mut self, event: UiEvent) -> Vec<UiEffect> {
        let action = event.action();
        match self.handle_ui(event).await {
            Ok(effects) => effects,
            Err(e) => {
                match &e {
                    ClientError::Validation(_) | ClientError::TooFast { .. } => {
                        debug!(?action, error = %e, "Input refused")
                    }
                    _ => warn!(?action, error = %e, "Action failed"),
                }
                vec![UiEffect::toast(ToastLevel::Error, e.user_hint(action))]
            }
        }
    }

    async fn handle_ui(&mut self, event: UiEvent) -> Result<Vec<UiEffect>> {
        match event {
            UiEvent::Post { text } => self.post(&text).await,
            UiEvent::InputChanged { text } => {
                if let Some(typing) = &self.typing {
                    if self.state.feed.kind() == FeedKind::Chat {
                        typing.set_typing(!text.trim().is_empty());
                    }
                }
                Ok(vec![UiEffect::Counter(CharCounter::for_text(&text))])
            }
            UiEvent::StartReply { message_id } => {
                let msg = self.message(&message_id)?;
                let draft = reply_draft(&msg.id, &msg.user_id, &msg.text);
                self.state.reply = Some(draft.clone());
                Ok(vec![UiEffect::Reply(Some(draft))])
            }
            UiEvent::CancelReply => {
                self.state.reply = None;
                Ok(vec![UiEffect::Reply(None)])
            }
            UiEvent::Edit { message_id, text } => self.edit(&message_id, &text).await,
            UiEvent::OpenMenu { message_id } => {
                let msg = self.message(&message_id)?;
                let author_banned = self
                    .profiles
                    .cache()
                    .get(&msg.user_id)
                    .is_some_and(|p| p.banned);
                let facts = MessageFacts {
                    author_id: &msg.user_id,
                    is_mine: msg.user_id == self.state.user_id,
                    is_pinned: msg.is_pinned,
                    timestamp_ms: msg.timestamp_ms,
                };
                let actions = context_menu(&facts, self.state.is_admin, self.now(), author_banned);
                Ok(vec![UiEffect::Menu {
                    message_id,
                    actions,
                }])
            }
            UiEvent::OpenDeleteDialog { message_id } => {
                let is_mine = self.message(&message_id)?.user_id == self.state.user_id;
                Ok(vec![UiEffect::DeleteDialog {
                    message_ids: vec![message_id],
                    prompt: "Delete this message?".to_string(),
                    options: delete_dialog(is_mine, self.state.is_admin),
                }])
            }
            UiEvent::Delete { message_id, scope } => {
                self.ensure_active()?;
                let mut batch = WriteBatch::new();
                self.plan_delete(&mut batch, &[message_id], scope)?;
                self.commit("delete message", batch).await?;
                Ok(Vec::new())
            }
            UiEvent::EnterSelection { message_id } => {
                self.message(&message_id)?;
                self.state.selection.enter(&message_id);
                Ok(vec![self.selection_effect()])
            }
            UiEvent::ToggleSelection { message_id } => {
                self.state.selection.toggle(&message_id);
                Ok(vec![self.selection_effect()])
            }
            UiEvent::ExitSelection => {
                self.state.selection.exit();
                Ok(vec![self.selection_effect()])
            }
            UiEvent::OpenSelectionDialog => {
                let selection = &self.state.selection;
                if !selection.is_active() {
                    return Ok(Vec::new());
                }
                let all_mine = selection.ids().iter().all(|id| {
                    self.state
                        .feed
                        .message(id)
                        .is_some_and(|m| m.user_id == self.state.user_id)
                });
                Ok(vec![UiEffect::DeleteDialog {
                    message_ids: selection.ids().to_vec(),
                    prompt: selection.confirm_text(),
                    options: selection.dialog(all_mine, self.state.is_admin),
                }])
            }
            UiEvent::DeleteSelected { scope } => {
                self.ensure_active()?;
                let ids = self.state.selection.ids().to_vec();
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                let mut batch = WriteBatch::new();
                self.plan_delete(&mut batch, &ids, scope)?;
                self.commit("delete selected", batch).await?;
                self.state.selection.exit();
                Ok(vec![self.selection_effect()])
            }
            UiEvent::React { message_id, kind } => self.react(&message_id, kind).await,
            UiEvent::TogglePin { message_id } => self.toggle_pin(&message_id).await,
            UiEvent::ToggleBan { user_id } => self.toggle_ban(&user_id).await,
            UiEvent::SaveUsername { username } => {
                self.ensure_active()?;
                let profile = self
                    .profiles
                    .save_username(&self.state.user_id, &username)
                    .await?;
                self.state.username = profile.username.clone();
                Ok(vec![
                    UiEffect::Profile {
                        username: profile.username,
                    },
                    UiEffect::toast(ToastLevel::Success, "Profile saved successfully!"),
                    UiEffect::Render(self.render()),
                ])
            }
            UiEvent::SwitchFeed(kind) => self.switch_feed(kind).await,
            UiEvent::Scrolled(position) => {
                self.state.scroll = position;
                if position.at_bottom {
                    self.state.feed.mark_read();
                }
                Ok(Vec::new())
            }
            UiEvent::JumpToBottom => {
                self.state.feed.mark_read();
                Ok(vec![UiEffect::Scroll(ScrollDecision::ScrollToBottom)])
            }
            UiEvent::WindowHidden(hidden) => {
                self.state.window_hidden = hidden;
                Ok(Vec::new())
            }
            UiEvent::SetNotifications(enabled) => {
                self.state.notifications_enabled = enabled;
                let text = if enabled {
                    "Notifications enabled"
                } else {
                    "Notifications disabled"
                };
                Ok(vec![UiEffect::toast(ToastLevel::Info, text)])
            }
            UiEvent::Connectivity { online } => {
                self.state.online = online;
                if !online {
                    info!("Connection lost");
                    return Ok(vec![
                        UiEffect::Connection { online },
                        UiEffect::toast(ToastLevel::Warning, "You are offline."),
                    ]);
                }
                info!("Connection restored");
                if self.state.is_live() {
                    self.state.feed.reset();
                    self.open_feed().await;
                }
                Ok(vec![UiEffect::Connection { online }])
            }
            UiEvent::Retry => {
                if self.state.is_live() {
                    self.state.feed.reset();
                    self.open_feed().await;
                }
                Ok(Vec::new())
            }
            UiEvent::Reload => self.reload().await,
        }
    }

    fn message(&self, id: &str) -> Result<&murmur_core::FeedMessage> {
        self.state
            .feed
            .message(id)
            .ok_or_else(|| ClientError::UnknownMessage(id.to_string()))
    }

    /// Refuse writes from a banned session or one waiting for reload.
    fn ensure_active(&self) -> Result<()> {
        if let BanStatus::Banned(kind) = self.state.ban.status() {
            return Err(ClientError::Banned(kind));
        }
        if self.state.reload_required {
            return Err(ClientError::ReloadRequired);
        }
        Ok(())
    }

    fn selection_effect(&self) -> UiEffect {
        UiEffect::Selection {
            active: self.state.selection.is_active(),
            label: self.state.selection.count_label(),
        }
    }

    async fn post(&mut self, input: &str) -> Result<Vec<UiEffect>> {
        match self.state.ban.status() {
            BanStatus::Banned(kind) => return Err(ClientError::Banned(kind)),
            BanStatus::Unchecked => return Err(ClientError::NotSignedIn),
            BanStatus::Clear => {}
        }
        if self.state.reload_required {
            return Err(ClientError::ReloadRequired);
        }
        if self.state.is_anonymous() {
            return Err(ClientError::UsernameRequired);
        }
        let text = validate_message_before_post(input)?.to_string();

        let mut effects = Vec::new();
        let now = self.now().max(0) as u64;
        match self.state.throttle.check(now) {
            ThrottleDecision::Allowed => {}
            ThrottleDecision::AllowedWithWarning => {
                effects.push(UiEffect::toast(ToastLevel::Warning, SPAM_WARNING));
            }
            ThrottleDecision::TooFast { retry_in_ms } => {
                return Err(ClientError::TooFast { retry_in_ms });
            }
            ThrottleDecision::Banned => {
                warn!("Spam limit reached");
                let device = self.state.device.clone();
                if let Err(e) = self
                    .moderation
                    .auto_ban(&self.state.user_id, device.as_ref())
                    .await
                {
                    warn!(error = %e, "Automatic ban write failed");
                }
                self.state.local_ban = true;
                self.state.ban.force_ban(BanKind::User);
                return Ok(self.enter_ban(BanScreen::Spam));
            }
        }

        let mut fields = Fields::new()
            .set("text", text)
            .server_timestamp("timestamp")
            .set("userId", self.state.user_id.as_str());
        if let Some(reply) = &self.state.reply {
            fields = fields.set(
                "replyTo",
                json!({
                    "messageId": reply.message_id,
                    "userId": reply.user_id,
                    "text": reply.text,
                }),
            );
        }

        let collection = self.state.feed.kind().collection();
        let store = self.store.clone();
        let id = write_timeout("send message", self.config.send_timeout, async move {
            store.add(collection, fields).await
        })
        .await?;
        debug!(collection, id = %id, "Message sent");

        self.state.throttle.record(now);
        self.state.reply = None;
        if let Some(typing) = &self.typing {
            typing.set_typing(false);
        }

        effects.extend([
            UiEffect::ClearInput,
            UiEffect::Reply(None),
            UiEffect::Counter(CharCounter::for_text("")),
        ]);
        Ok(effects)
    }

    async fn edit(&mut self, message_id: &str, input: &str) -> Result<Vec<UiEffect>> {
        self.ensure_active()?;
        let msg = self.message(message_id)?;
        if msg.user_id != self.state.user_id || !is_within_edit_window(msg.timestamp_ms, self.now()) {
            return Err(ClientError::NotAllowed(
                "You can only edit your own messages within 15 minutes.",
            ));
        }
        let text = validate_message_before_post(input)?;

        let path = DocPath::new(self.state.feed.kind().collection(), message_id);
        self.update("edit message", path, Fields::new().set("text", text).set("edited", true))
            .await?;
        Ok(Vec::new())
    }

    async fn commit(&self, label: &'static str, batch: WriteBatch) -> Result<()> {
        let store = self.store.clone();
        write_timeout(label, self.config.write_timeout, async move { store.commit(batch).await })
            .await?;
        Ok(())
    }

    async fn update(&self, label: &'static str, path: DocPath, fields: Fields) -> std::result::Result<(), StoreError> {
        let store = self.store.clone();
        write_timeout(label, self.config.write_timeout, async move {
            store.update(&path, fields).await
        })
        .await
    }

    fn plan_delete(&self, batch: &mut WriteBatch, ids: &[String], scope: DeleteScope) -> Result<()> {
        let collection = self.state.feed.kind().collection();
        for id in ids {
            let msg = self.message(id)?;
            let path = DocPath::new(collection, id.as_str());
            match scope {
                DeleteScope::ForMe => {
                    batch.update(
                        path,
                        Fields::new().array_union("hiddenFor", self.state.user_id.as_str()),
                    );
                }
                DeleteScope::Everyone => {
                    if msg.user_id != self.state.user_id && !self.state.is_admin {
                        return Err(ClientError::NotAllowed(
                            "You can only delete your own messages.",
                        ));
                    }
                    batch.delete(path);
                    if msg.is_pinned {
                        batch.delete(DocPath::new(collections::PINNED_MESSAGES, id.as_str()));
                    }
                }
            }
        }
        Ok(())
    }

    async fn react(&mut self, message_id: &str, kind: ReactionKind) -> Result<Vec<UiEffect>> {
        self.ensure_active()?;
        let pending = self
            .state
            .feed
            .react(message_id, kind, &self.state.user_id)
            .ok_or_else(|| ClientError::UnknownMessage(message_id.to_string()))?;
        let mut effects = vec![UiEffect::Render(self.render())];

        let field = format!("reactions.{}", kind.key());
        let me = self.state.user_id.as_str();
        let fields = match pending.op {
            ReactionOp::Add => Fields::new().array_union(field, me),
            ReactionOp::Remove => Fields::new().array_remove(field, me),
        };
        let path = DocPath::new(self.state.feed.kind().collection(), message_id);

        if let Err(e) = self.update("react", path, fields).await {
            warn!(error = %e, "Reaction write failed; rolling back");
            self.state.feed.rollback(&pending);
            effects.push(UiEffect::Render(self.render()));
            effects.push(UiEffect::toast(
                ToastLevel::Error,
                ClientError::from(e).user_hint(Action::React),
            ));
        }
        Ok(effects)
    }

    async fn toggle_pin(&mut self, message_id: &str) -> Result<Vec<UiEffect>> {
        self.ensure_active()?;
        if !self.state.is_admin {
            return Err(ClientError::NotAllowed("Only admins can pin messages."));
        }
        let msg = self.message(message_id)?;
        let pin = !msg.is_pinned;
        let text = truncate_chars(&msg.text, PIN_TEXT_MAX).to_string();
        let collection = self.state.feed.kind().collection();

        let mut batch = WriteBatch::new();
        batch.update(
            DocPath::new(collection, message_id),
            Fields::new().set("isPinned", pin),
        );
        let pointer = DocPath::new(collections::PINNED_MESSAGES, message_id);
        if pin {
            batch.set(
                pointer,
                Fields::new()
                    .set("originalId", message_id)
                    .set("collection", collection)
                    .set("text", text)
                    .set("pinnedBy", self.state.user_id.as_str())
                    .server_timestamp("timestamp"),
            );
        } else {
            batch.delete(pointer);
        }
        self.commit("toggle pin", batch).await?;

        let text = if pin {
            "📌 Message pinned."
        } else {
            "Message unpinned."
        };
        Ok(vec![UiEffect::toast(ToastLevel::Success, text)])
    }

    async fn toggle_ban(&mut self, target_id: &str) -> Result<Vec<UiEffect>> {
        self.ensure_active()?;
        if !self.state.is_admin {
            return Err(ClientError::NotAllowed("Only admins can ban users."));
        }
        let cache = self.profiles.cache();
        let username = cache
            .get(target_id)
            .map(|p| p.username)
            .filter(|name| !name.is_empty());

        let moderation = self.moderation.clone();
        let admin_id = self.state.user_id.clone();
        let target = target_id.to_string();
        let outcome = write_timeout("toggle ban", self.config.write_timeout, async move {
            moderation
                .toggle_ban(&admin_id, &target, username.as_deref())
                .await
        })
        .await?;

        if let Some(mut profile) = cache.get(target_id) {
            profile.banned = outcome.banned;
            cache.insert(target_id, profile);
        }
        Ok(vec![UiEffect::toast(ToastLevel::Success, outcome.message())])
    }

    async fn switch_feed(&mut self, kind: FeedKind) -> Result<Vec<UiEffect>> {
        if kind == self.state.feed.kind() {
            return Ok(Vec::new());
        }
        self.state.reply = None;
        self.state.selection.exit();
        self.state.scroll = ScrollPosition::default();
        self.state.feed.switch(kind);
        self.state.typing.clear();
        if let Some(typing) = &self.typing {
            typing.set_typing(false);
        }

        if self.state.is_live() {
            self.open_feed().await;
        }
        info!(feed = %kind, "Switched feed");

        Ok(vec![
            UiEffect::FeedSwitched(kind),
            UiEffect::Reply(None),
            self.selection_effect(),
            UiEffect::Typing(None),
            UiEffect::Pinned(self.current_pin()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_screen_text() {
        assert_eq!(BanScreen::Spam.title(), "🚫 BANNED FOR SPAMMING");
        assert_eq!(BanScreen::Banned(BanKind::User).title(), "🚫 BANNED");
        assert_eq!(
            BanScreen::Banned(BanKind::Ip).detail(),
            BanKind::Ip.reason()
        );
    }

    #[test]
    fn events_map_to_hint_actions() {
        let post = UiEvent::Post { text: "x".into() };
        assert_eq!(post.action(), Action::Post);
        let ban = UiEvent::ToggleBan {
            user_id: "u".into(),
        };
        assert_eq!(ban.action(), Action::Ban);
        assert_eq!(UiEvent::Retry.action(), Action::Load);
    }

    #[test]
    fn anonymous_until_named() {
        let mut state = AppState::new(&Config::default());
        assert!(state.is_anonymous());
        state.username = ANONYMOUS_NAME.into();
        assert!(state.is_anonymous());
        state.username = "river".into();
        assert!(!state.is_anonymous());
    }
}
