//! Delivery of new-message notifications.
//!
//! Whether a notification is due is decided by the feed controller; this
//! module only hands it to the platform.

use std::io::Write;

use murmur_core::feed::Notification;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Platform notification sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Rings the terminal bell and prints the notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn notify(&self, notification: &Notification) {
        let mut out = std::io::stdout().lock();
        if let Err(e) = writeln!(out, "\x07🔔 {}: {}", notification.title, notification.body) {
            warn!(error = %e, "Failed to print notification");
        }
    }
}

/// Logs the notification title only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) {
        debug!(title = %notification.title, "Notification");
    }
}

/// Forwards notifications to a channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: &Notification) {
        let _ = self.tx.send(notification.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_notifier_forwards() {
        let (notifier, mut rx) = ChannelNotifier::new();
        let sink: &dyn Notifier = &notifier;
        sink.notify(&Notification {
            title: "New Chat".into(),
            body: "hello".into(),
        });
        let got = rx.try_recv().unwrap();
        assert_eq!(got.body, "hello");
        assert!(rx.try_recv().is_err());
    }
}
