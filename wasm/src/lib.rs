//! WebAssembly bindings for the Murmur board core.
//!
//! Exposes the validation, sanitisation, hashing, throttle and composer
//! logic to the browser front-end, so both sides apply the same rules.

use wasm_bindgen::prelude::*;

use murmur_core::menu::{CharCounter, CounterLevel};
use murmur_core::throttle::{SpamThrottle, ThrottleDecision};
use murmur_core::ReactionKind;

fn js_error(e: murmur_core::Error) -> JsError {
    JsError::new(&e.to_string())
}

// === Validation ===

/// Trim and validate a message. Throws with the user-facing reason.
#[wasm_bindgen]
pub fn validate_message(text: &str) -> Result<String, JsError> {
    murmur_core::validate_message_before_post(text)
        .map(str::to_string)
        .map_err(js_error)
}

/// Trim and validate a username. Throws with the user-facing reason.
#[wasm_bindgen]
pub fn validate_username(username: &str) -> Result<String, JsError> {
    murmur_core::validate_username(username)
        .map(str::to_string)
        .map_err(js_error)
}

#[wasm_bindgen]
pub fn is_valid_profile_photo_url(url: &str) -> bool {
    murmur_core::is_valid_profile_photo_url(url)
}

/// Escape text for insertion into markup.
#[wasm_bindgen]
pub fn sanitize_text(text: &str) -> String {
    murmur_core::sanitize_text(text)
}

/// Whether a message sent at `timestamp_ms` may still be edited.
/// A negative timestamp means the server time is still pending.
#[wasm_bindgen]
pub fn is_within_edit_window(timestamp_ms: f64, now_ms: f64) -> bool {
    let timestamp = (timestamp_ms >= 0.0).then_some(timestamp_ms as i64);
    murmur_core::menu::is_within_edit_window(timestamp, now_ms as i64)
}

// === Hashing ===

/// Key of the `banned_ips` record for an IP address.
#[wasm_bindgen]
pub fn hash_ip(ip: &str) -> String {
    murmur_core::hash_ip(ip)
}

/// Display colour of a user id.
#[wasm_bindgen]
pub fn user_color(user_id: &str) -> String {
    murmur_core::user_color(user_id).to_string()
}

// === Composer ===

/// Counter label under the composer, e.g. `"412/500"`.
#[wasm_bindgen]
pub fn counter_label(text: &str) -> String {
    CharCounter::for_text(text).label()
}

/// Styling class of the counter: `""`, `"warning"`, `"danger"` or `"limit"`.
#[wasm_bindgen]
pub fn counter_level(text: &str) -> String {
    match CharCounter::for_text(text).level {
        CounterLevel::Normal => "",
        CounterLevel::Warning => "warning",
        CounterLevel::Danger => "danger",
        CounterLevel::Limit => "limit",
    }
    .to_string()
}

/// Typing indicator text for the given display names, empty if none.
#[wasm_bindgen]
pub fn typing_text(names: Vec<String>) -> String {
    murmur_core::typing::indicator_text(&names).unwrap_or_default()
}

/// Emoji of a reaction key (`"thumbsup"`, `"heart"`, ...).
#[wasm_bindgen]
pub fn reaction_emoji(key: &str) -> Result<String, JsError> {
    key.parse::<ReactionKind>()
        .map(|kind| kind.emoji().to_string())
        .map_err(js_error)
}

// === Throttle ===

/// Session spam throttle.
#[wasm_bindgen]
pub struct Throttle {
    inner: SpamThrottle,
    retry_in_ms: f64,
}

#[wasm_bindgen]
impl Throttle {
    #[wasm_bindgen(constructor)]
    pub fn new() -> Throttle {
        Throttle {
            inner: SpamThrottle::default(),
            retry_in_ms: 0.0,
        }
    }

    /// Decide a send attempt: `"allowed"`, `"warning"`, `"too_fast"` or
    /// `"banned"`. After `"too_fast"`, [`retry_in_ms`](Self::retry_in_ms)
    /// holds the wait.
    pub fn check(&mut self, now_ms: f64) -> String {
        self.retry_in_ms = 0.0;
        match self.inner.check(now_ms as u64) {
            ThrottleDecision::Allowed => "allowed",
            ThrottleDecision::AllowedWithWarning => "warning",
            ThrottleDecision::TooFast { retry_in_ms } => {
                self.retry_in_ms = retry_in_ms as f64;
                "too_fast"
            }
            ThrottleDecision::Banned => "banned",
        }
        .to_string()
    }

    /// Record a send that reached the store.
    pub fn record(&mut self, now_ms: f64) {
        self.inner.record(now_ms as u64);
    }

    #[wasm_bindgen(getter)]
    pub fn retry_in_ms(&self) -> f64 {
        self.retry_in_ms
    }

    /// Warning text to show with a `"warning"` decision.
    pub fn warning_text() -> String {
        murmur_core::throttle::SPAM_WARNING.to_string()
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_levels() {
        assert_eq!(counter_level(""), "");
        assert_eq!(counter_level(&"a".repeat(400)), "warning");
        assert_eq!(counter_level(&"a".repeat(500)), "limit");
        assert_eq!(counter_label("hey"), "3/500");
    }

    #[test]
    fn throttle_reports_wait() {
        let mut throttle = Throttle::new();
        let start = 1_710_072_000_000.0;
        assert_eq!(throttle.check(start), "allowed");
        throttle.record(start);
        assert_eq!(throttle.check(start + 500.0), "too_fast");
        assert_eq!(throttle.retry_in_ms(), 1_500.0);
    }

    #[test]
    fn edit_window_from_js_numbers() {
        let now = 1_710_072_000_000.0;
        assert!(is_within_edit_window(now - 60_000.0, now));
        assert!(!is_within_edit_window(now - 16.0 * 60_000.0, now));
        assert!(is_within_edit_window(-1.0, now));
    }

    #[test]
    fn typing_text_for_names() {
        assert_eq!(typing_text(vec![]), "");
        assert_eq!(typing_text(vec!["ana".into()]), "ana is typing...");
    }
}
