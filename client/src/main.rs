//! Murmur - terminal client for the anonymous chat and confession board.
//!
//! Runs a session against the in-process document store and drives it from
//! stdin. Plain lines are posted; `/help` lists the commands.

use std::sync::Arc;

use murmur_client::app::ToastLevel;
use murmur_client::device::{DeviceIdentifier, FileStorage, HttpIpLookup, PlatformInfo};
use murmur_client::identity::MemoryIdentity;
use murmur_client::notify::TerminalNotifier;
use murmur_client::{App, BanScreen, Config, MemoryStore, UiEffect, UiEvent};
use murmur_core::feed::{FeedItem, FeedKind, FeedView, ScrollDecision};
use murmur_core::menu::{CounterLevel, DeleteScope};
use murmur_core::ReactionKind;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

const HELP: &str = "\
Commands:
  <text>                  post to the current feed
  /chat, /confessions     switch feed
  /name <username>        set your username
  /reply <id>, /cancel    reply to a message, or stop replying
  /edit <id> <text>       edit your message
  /delete <id> [me|all]   hide for you, or delete for everyone
  /select <id>            start or toggle multi-select
  /delete-selected [me|all]
  /react <id> <kind>      thumbsup, laugh, surprised, heart, skull
  /menu <id>              show the actions for a message
  /pin <id>               pin or unpin (admins)
  /ban <id>               ban or unban the author (admins)
  /notify on|off          toggle notifications
  /online, /offline       simulate connectivity changes
  /reload                 start again after access is restored
  /bottom, /retry, /quit";

#[tokio::main]
async fn main() {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    init_tracing();

    let config = Config::from_env();
    log_startup_info(&config);

    let store = Arc::new(MemoryStore::new());
    let identity = Arc::new(MemoryIdentity::new());

    let identifier = DeviceIdentifier::new(
        &config,
        Arc::new(FileStorage::open(&config.storage_path)),
        Arc::new(HttpIpLookup::new(&config)),
        PlatformInfo::detect(),
    );
    let device = identifier.resolve().await;
    info!(source = ?device.source, ip_known = device.ip_hash.is_some(), "Device resolved");

    let mut app = App::new(store, identity, Arc::new(TerminalNotifier), config);
    match app.start(device).await {
        Ok(effects) => show(&effects),
        Err(e) => {
            error!(error = %e, "Failed to start session");
            println!("Not connected. Please refresh.");
            return;
        }
    }
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if line == "/quit" {
                        break;
                    }
                    match parse_command(line, &app) {
                        Some(events) => {
                            for event in events {
                                let effects = app.dispatch(event).await;
                                show(&effects);
                            }
                        }
                        None => println!("{}", HELP),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            },
            event = app.next_event() => {
                let effects = app.handle(event).await;
                show(&effects);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Session ended");
}

/// Initialize tracing with environment-based log levels.
fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("murmur_client=debug,murmur=info")),
        )
        .init();
}

/// Log startup configuration.
fn log_startup_info(config: &Config) {
    info!(
        version = murmur_client::VERSION,
        storage = %config.storage_path,
        ip_services = config.ip_services.len(),
        notifications = config.notifications_enabled,
        spam_window_ms = config.throttle.window_ms,
        spam_max_messages = config.throttle.max_messages,
        "Starting Murmur"
    );
}

// === Commands ===

/// Full id of the message in the current feed starting with `prefix`.
fn resolve_id(app: &App, prefix: &str) -> Option<String> {
    let mut matches = app
        .state()
        .feed
        .messages()
        .iter()
        .filter(|m| m.id.starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(msg), None) => Some(msg.id.clone()),
        _ => None,
    }
}

fn parse_scope(arg: Option<&str>) -> DeleteScope {
    match arg {
        Some("all") | Some("everyone") => DeleteScope::Everyone,
        _ => DeleteScope::ForMe,
    }
}

fn parse_command(line: &str, app: &App) -> Option<Vec<UiEvent>> {
    if !line.starts_with('/') {
        return Some(vec![
            UiEvent::InputChanged {
                text: line.to_string(),
            },
            UiEvent::Post {
                text: line.to_string(),
            },
        ]);
    }

    let mut parts = line.splitn(3, ' ');
    let command = parts.next()?;
    let arg = parts.next();
    let rest = parts.next();
    let id = || arg.and_then(|prefix| resolve_id(app, prefix));

    let event = match command {
        "/chat" => UiEvent::SwitchFeed(FeedKind::Chat),
        "/confessions" => UiEvent::SwitchFeed(FeedKind::Confessions),
        "/name" => UiEvent::SaveUsername {
            username: line.trim_start_matches("/name").trim().to_string(),
        },
        "/reply" => UiEvent::StartReply { message_id: id()? },
        "/cancel" => UiEvent::CancelReply,
        "/edit" => UiEvent::Edit {
            message_id: id()?,
            text: rest?.to_string(),
        },
        "/delete" => UiEvent::Delete {
            message_id: id()?,
            scope: parse_scope(rest),
        },
        "/select" => {
            let message_id = id()?;
            if app.state().selection.is_active() {
                UiEvent::ToggleSelection { message_id }
            } else {
                UiEvent::EnterSelection { message_id }
            }
        }
        "/delete-selected" => UiEvent::DeleteSelected {
            scope: parse_scope(arg),
        },
        "/react" => UiEvent::React {
            message_id: id()?,
            kind: rest?.parse::<ReactionKind>().ok()?,
        },
        "/menu" => UiEvent::OpenMenu { message_id: id()? },
        "/pin" => UiEvent::TogglePin { message_id: id()? },
        "/ban" => {
            let message_id = id()?;
            let author = app.state().feed.message(&message_id)?.user_id.clone();
            UiEvent::ToggleBan { user_id: author }
        }
        "/notify" => UiEvent::SetNotifications(arg != Some("off")),
        "/online" => UiEvent::Connectivity { online: true },
        "/offline" => UiEvent::Connectivity { online: false },
        "/bottom" => UiEvent::JumpToBottom,
        "/retry" => UiEvent::Retry,
        "/reload" => UiEvent::Reload,
        _ => return None,
    };
    Some(vec![event])
}

// === Output ===

fn short(id: &str) -> &str {
    murmur_core::validate::truncate_chars(id, 6)
}

fn show_feed(view: &FeedView) {
    if let Some(placeholder) = &view.placeholder {
        println!("  {}", placeholder);
        return;
    }
    for item in &view.items {
        match item {
            FeedItem::DateSeparator { label } => println!("  ----- {} -----", label),
            FeedItem::Message(msg) => {
                if let Some(reply) = &msg.reply {
                    println!("    ↳ {}: {}", reply.author_name, reply.text);
                }
                let pin = if msg.pinned { " 📌" } else { "" };
                let chips: Vec<String> = msg
                    .chips
                    .iter()
                    .map(|c| format!("{}{}", c.kind.emoji(), c.count))
                    .collect();
                println!(
                    "  [{}] {}: {}  ({}){} {}",
                    short(&msg.id),
                    msg.author_name,
                    msg.text,
                    msg.footer(),
                    pin,
                    chips.join(" ")
                );
            }
        }
    }
}

fn show(effects: &[UiEffect]) {
    for effect in effects {
        match effect {
            UiEffect::Render(view) => show_feed(view),
            UiEffect::Scroll(ScrollDecision::ShowUnread { label, .. }) => {
                println!("  ⬇ {} new (/bottom)", label);
            }
            UiEffect::Scroll(_) => {}
            UiEffect::RenderFailed { message } => println!("  {} (/retry)", message),
            UiEffect::Toast { level, text } => {
                let marker = match level {
                    ToastLevel::Info => "ℹ",
                    ToastLevel::Success => "✔",
                    ToastLevel::Warning => "⚠",
                    ToastLevel::Error => "✖",
                };
                println!("{} {}", marker, text);
            }
            UiEffect::BanScreen(screen) => show_ban(*screen),
            UiEffect::AccessRestored => println!("Access restored. Type /reload to continue."),
            UiEffect::Pinned(Some(pin)) => println!("📌 {}", pin.text),
            UiEffect::Pinned(None) => {}
            UiEffect::Typing(Some(text)) => println!("  {}", text),
            UiEffect::Typing(None) => {}
            UiEffect::Counter(counter) if counter.level >= CounterLevel::Warning => {
                println!("  {}", counter.label());
            }
            UiEffect::Counter(_) => {}
            UiEffect::Menu { message_id, actions } => {
                let labels: Vec<&str> = actions.iter().map(|a| a.label()).collect();
                println!("[{}] {}", short(message_id), labels.join(" | "));
            }
            UiEffect::DeleteDialog { prompt, options, .. } => {
                let labels: Vec<&str> = options.iter().map(|o| o.label).collect();
                println!("{} [{}]", prompt, labels.join(" / "));
            }
            UiEffect::Selection { active: true, label } => println!("  {}", label),
            UiEffect::Selection { active: false, .. } => {}
            UiEffect::Reply(Some(reply)) => println!("Replying to: {}", reply.text),
            UiEffect::Reply(None) | UiEffect::ClearInput => {}
            UiEffect::FeedSwitched(kind) => println!("===== {} =====", kind.collection().to_uppercase()),
            UiEffect::Profile { username } => println!("Signed in as {}", username),
            UiEffect::Connection { online } => {
                println!("{}", if *online { "Back online." } else { "Offline." });
            }
        }
    }
}

fn show_ban(screen: BanScreen) {
    println!();
    println!("{}", screen.title());
    println!("{}", screen.detail());
}
