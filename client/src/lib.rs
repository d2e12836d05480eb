//! # Murmur Client
//!
//! Realtime client for an anonymous chat and confession board backed by a
//! hosted document store.
//!
//! ## Design Principles
//!
//! - **The store is the authority**: client checks only keep the UI from
//!   offering actions the store would refuse
//! - **Snapshots are authoritative**: each feed snapshot replaces the view
//! - **Ban first**: a banned session keeps nothing open but its ban watch
//! - **Minimal logging**: no message text, no raw IPs, uid prefixes only
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐ UiEvent  ┌─────┐  queries / batches  ┌───────────────┐
//! │   UI   │─────────▶│ App │────────────────────▶│ DocumentStore │
//! │        │◀─────────│     │◀────────────────────│               │
//! └────────┘ UiEffect └─────┘     snapshots       └───────────────┘
//!                        │
//!          ┌─────────────┼──────────────┐
//!          │             │              │
//!     Moderation     Profiles    Device identity
//! ```
//!
//! ## Collections
//!
//! | Collection | Contents |
//! |------------|----------|
//! | `chat`, `confessions` | Messages |
//! | `users` | Profiles (username, avatar, banned flag) |
//! | `user_devices` | Device records per user and fingerprint |
//! | `banned_users`, `banned_devices`, `banned_ips` | Ban records |
//! | `pinned_messages` | Pin pointers |
//! | `typingStatus` | Typing flags |
//! | `admins` | Admin markers |

use std::sync::Arc;

pub mod app;
pub mod config;
pub mod device;
pub mod error;
pub mod feed;
pub mod identity;
pub mod memory;
pub mod models;
pub mod moderation;
pub mod notify;
pub mod profiles;
pub mod store;
pub mod timeout;
pub mod typing;

pub use app::{App, AppEvent, BanScreen, UiEffect, UiEvent};
pub use config::Config;
pub use error::{Action, ClientError, Result};
pub use memory::MemoryStore;
pub use store::{DocumentStore, StoreError};

/// Source of the current time in ms since the epoch.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Client version, reported as part of the platform string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
