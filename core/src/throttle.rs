//! Client-side spam throttle.
//!
//! A sliding window of recent send times. It is a deterrent only; the store
//! enforces its own rate limit on `lastMessageAt`. State lives in memory and
//! resets with the session.
//!
//! The caller drives the clock: every method takes `now_ms` (milliseconds
//! since the Unix epoch), which keeps the throttle deterministic under test.

use std::collections::VecDeque;

/// Throttle parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Sliding window length in milliseconds.
    pub window_ms: u64,
    /// Sends inside the window at which the next attempt is refused and the
    /// sender is banned.
    pub max_messages: usize,
    /// Sends inside the window at which a one-time warning is shown.
    pub warning_threshold: usize,
    /// Minimum gap between two sends; 0 disables the check.
    pub min_interval_ms: u64,
    /// How often stale entries are purged and the warning flag re-armed.
    pub cleanup_interval_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window_ms: 20_000,
            max_messages: 10,
            warning_threshold: 7,
            min_interval_ms: 2_000,
            cleanup_interval_ms: 30_000,
        }
    }
}

/// Outcome of [`SpamThrottle::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Send may proceed.
    Allowed,
    /// Send may proceed; show the spam warning once.
    AllowedWithWarning,
    /// Sent too soon after the previous message.
    TooFast {
        /// Milliseconds until a send would pass the interval check.
        retry_in_ms: u64,
    },
    /// Window limit reached; the auto-ban path must run.
    Banned,
}

impl ThrottleDecision {
    /// Whether the post may be written.
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed | Self::AllowedWithWarning)
    }
}

/// Warning text surfaced with [`ThrottleDecision::AllowedWithWarning`].
pub const SPAM_WARNING: &str = "Spamming = Getting Banned ⚠️.";

/// Sliding-window send tracker.
#[derive(Debug, Clone)]
pub struct SpamThrottle {
    config: ThrottleConfig,
    timestamps: VecDeque<u64>,
    warning_shown: bool,
    last_cleanup_ms: u64,
    ban_triggered: bool,
}

impl SpamThrottle {
    /// Create an empty throttle.
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            timestamps: VecDeque::new(),
            warning_shown: false,
            last_cleanup_ms: 0,
            ban_triggered: false,
        }
    }

    /// Current configuration.
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Number of sends still inside the window as of the last check.
    pub fn recent_count(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the ban decision has already been returned this session.
    pub fn ban_triggered(&self) -> bool {
        self.ban_triggered
    }

    fn purge(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.config.window_ms);
        while self.timestamps.front().is_some_and(|&ts| ts <= cutoff) {
            self.timestamps.pop_front();
        }
    }

    fn cleanup(&mut self, now_ms: u64) {
        self.purge(now_ms);
        if self.timestamps.len() < self.config.warning_threshold {
            self.warning_shown = false;
        }
        self.last_cleanup_ms = now_ms;
    }

    /// Decide whether a send attempted at `now_ms` may proceed.
    ///
    /// Does not record the send; call [`record`](Self::record) once the
    /// write succeeds. [`ThrottleDecision::Banned`] is returned at most once
    /// per session; later attempts are reported as `TooFast` with no retry
    /// hint since the session is expected to be blocked by then.
    pub fn check(&mut self, now_ms: u64) -> ThrottleDecision {
        if now_ms.saturating_sub(self.last_cleanup_ms) > self.config.cleanup_interval_ms {
            self.cleanup(now_ms);
        }
        self.purge(now_ms);

        let count = self.timestamps.len();

        if count >= self.config.max_messages {
            if self.ban_triggered {
                return ThrottleDecision::TooFast { retry_in_ms: 0 };
            }
            self.ban_triggered = true;
            return ThrottleDecision::Banned;
        }

        if self.config.min_interval_ms > 0 {
            if let Some(&last) = self.timestamps.back() {
                let elapsed = now_ms.saturating_sub(last);
                if elapsed < self.config.min_interval_ms {
                    return ThrottleDecision::TooFast {
                        retry_in_ms: self.config.min_interval_ms - elapsed,
                    };
                }
            }
        }

        if count >= self.config.warning_threshold && !self.warning_shown {
            self.warning_shown = true;
            return ThrottleDecision::AllowedWithWarning;
        }

        ThrottleDecision::Allowed
    }

    /// Record a successful send.
    pub fn record(&mut self, now_ms: u64) {
        self.timestamps.push_back(now_ms);
    }
}

impl Default for SpamThrottle {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_interval() -> ThrottleConfig {
        ThrottleConfig {
            min_interval_ms: 0,
            ..ThrottleConfig::default()
        }
    }

    #[test]
    fn eleventh_message_in_window_triggers_ban_once() {
        let mut throttle = SpamThrottle::new(no_interval());
        let start = 1_000_000;

        let mut bans = 0;
        for i in 0..10 {
            let now = start + i * 1_000;
            let decision = throttle.check(now);
            assert!(decision.is_allowed(), "send {} refused: {:?}", i, decision);
            throttle.record(now);
        }

        for attempt in 0..3 {
            if throttle.check(start + 10_000 + attempt) == ThrottleDecision::Banned {
                bans += 1;
            }
        }

        assert_eq!(bans, 1);
        assert!(throttle.ban_triggered());
    }

    #[test]
    fn spaced_messages_never_ban() {
        let mut throttle = SpamThrottle::new(no_interval());
        for i in 0..10u64 {
            let now = 1_000_000 + i * 20_001;
            assert_eq!(throttle.check(now), ThrottleDecision::Allowed);
            throttle.record(now);
        }
        assert!(!throttle.ban_triggered());
        assert_eq!(throttle.recent_count(), 1);
    }

    #[test]
    fn warning_shown_once_per_window() {
        let mut throttle = SpamThrottle::new(no_interval());
        let start = 5_000_000;
        for i in 0..7 {
            throttle.record(start + i);
        }

        assert_eq!(throttle.check(start + 10), ThrottleDecision::AllowedWithWarning);
        throttle.record(start + 10);
        assert_eq!(throttle.check(start + 11), ThrottleDecision::Allowed);
    }

    #[test]
    fn warning_rearms_after_cleanup() {
        let mut throttle = SpamThrottle::new(no_interval());
        let start = 5_000_000;
        for i in 0..7 {
            throttle.record(start + i);
        }
        assert_eq!(throttle.check(start + 10), ThrottleDecision::AllowedWithWarning);

        // well past both the window and the cleanup interval
        let later = start + 60_000;
        assert_eq!(throttle.check(later), ThrottleDecision::Allowed);
        for i in 1..=7 {
            throttle.record(later + i);
        }
        assert_eq!(throttle.check(later + 10), ThrottleDecision::AllowedWithWarning);
    }

    #[test]
    fn min_interval_rejects_rapid_sends() {
        let mut throttle = SpamThrottle::default();
        assert_eq!(throttle.check(10_000), ThrottleDecision::Allowed);
        throttle.record(10_000);

        assert_eq!(
            throttle.check(10_500),
            ThrottleDecision::TooFast { retry_in_ms: 1_500 }
        );
        assert_eq!(throttle.check(12_000), ThrottleDecision::Allowed);
    }

    #[test]
    fn window_expires_old_entries() {
        let mut throttle = SpamThrottle::new(no_interval());
        throttle.record(0);
        throttle.record(19_999);
        throttle.check(20_000);
        assert_eq!(throttle.recent_count(), 1);
    }
}
