//! Typing status broadcast and the typing indicator subscription.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use murmur_core::typing::TypingEntry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

use crate::config::Config;
use crate::models::{collections, TypingStatus};
use crate::store::{DocPath, DocumentStore, Fields, Query, QuerySnapshot};

/// Subscription query for everyone's typing status.
pub fn typing_query() -> Query {
    Query::collection(collections::TYPING_STATUS)
}

/// Typing entries of a status snapshot. Undecodable entries are skipped.
pub fn typing_entries(snapshot: &QuerySnapshot) -> Vec<TypingEntry> {
    snapshot
        .docs
        .iter()
        .filter_map(|doc| {
            doc.decode::<TypingStatus>()
                .ok()
                .map(|status| status.into_entry(doc.id.clone()))
        })
        .collect()
}

/// Debounced writer of the current user's typing status.
///
/// Bursts of keystrokes collapse into one write after the debounce period.
/// A `true` write arms an automatic `false` after the typing timeout; any
/// later write disarms it.
pub struct TypingBroadcaster {
    signals: mpsc::UnboundedSender<bool>,
    task: JoinHandle<()>,
}

impl TypingBroadcaster {
    pub fn spawn(store: Arc<dyn DocumentStore>, user_id: String, config: &Config) -> Self {
        let (signals, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(
            store,
            DocPath::new(collections::TYPING_STATUS, user_id),
            rx,
            config.typing_debounce,
            config.typing_timeout,
        ));
        Self { signals, task }
    }

    /// Report whether the user is typing.
    pub fn set_typing(&self, typing: bool) {
        let _ = self.signals.send(typing);
    }
}

impl Drop for TypingBroadcaster {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    store: Arc<dyn DocumentStore>,
    path: DocPath,
    mut rx: mpsc::UnboundedReceiver<bool>,
    debounce: Duration,
    timeout: Duration,
) {
    let mut pending: Option<(bool, Instant)> = None;
    let mut auto_clear: Option<Instant> = None;

    loop {
        tokio::select! {
            signal = rx.recv() => match signal {
                Some(typing) => pending = Some((typing, Instant::now() + debounce)),
                None => break,
            },
            _ = sleep_until(pending.map(|(_, at)| at).unwrap_or_else(Instant::now)), if pending.is_some() => {
                if let Some((typing, _)) = pending.take() {
                    write(store.as_ref(), &path, typing).await;
                    auto_clear = typing.then(|| Instant::now() + timeout);
                }
            }
            _ = sleep_until(auto_clear.unwrap_or_else(Instant::now)), if auto_clear.is_some() => {
                auto_clear = None;
                write(store.as_ref(), &path, false).await;
            }
        }
    }
}

async fn write(store: &dyn DocumentStore, path: &DocPath, typing: bool) {
    let fields = Fields::new()
        .set("isTyping", typing)
        .set("timestamp", Utc::now().timestamp_millis());
    // Typing status is best effort.
    if let Err(e) = store.set(path, fields).await {
        trace!(error = %e, "Typing status write failed");
    }
}
