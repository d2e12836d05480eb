//! Configuration for the Murmur client.
//!
//! All configuration is loaded from environment variables (a `.env` file is
//! honoured by the binary). Every threshold has a default matching the
//! hosted board; override with `MURMUR_*` variables.

use std::str::FromStr;
use std::time::Duration;

use murmur_core::throttle::ThrottleConfig;

/// Storage key under which the device fingerprint is persisted.
pub const FINGERPRINT_STORAGE_KEY: &str = "konvo_device_fp";

/// Default IP echo services, raced against each other.
pub const DEFAULT_IP_SERVICES: [&str; 2] =
    ["https://api.ipify.org?format=json", "https://ipapi.co/json/"];

/// Client configuration
#[derive(Debug, Clone)]
pub struct Config {
    // === Device identification ===
    /// Key used in local storage for the fingerprint
    pub fingerprint_storage_key: String,

    /// Timeout for loading the fingerprint agent (default: 5s)
    pub fingerprint_load_timeout: Duration,

    /// Timeout for computing the visitor id (default: 5s)
    pub fingerprint_get_timeout: Duration,

    /// IP echo service URLs
    pub ip_services: Vec<String>,

    /// Timeout for the IP race (default: 3s)
    pub ip_lookup_timeout: Duration,

    /// Outer timeout for fingerprint + IP together (default: 8s)
    pub device_info_timeout: Duration,

    // === Moderation ===
    /// Timeout for the post-authentication ban check (default: 5s)
    pub ban_check_timeout: Duration,

    // === Profiles ===
    /// Timeout for the username availability query (default: 10s)
    pub username_check_timeout: Duration,

    /// Timeout for the profile write (default: 10s)
    pub profile_save_timeout: Duration,

    /// Quiet period before queued profile loads run (default: 100ms)
    pub profile_batch_debounce: Duration,

    /// Ids per `in` query (default: 30)
    pub profile_batch_size: usize,

    // === Posting ===
    /// Timeout for a message write (default: 15s)
    pub send_timeout: Duration,

    /// Timeout for edits, deletes, reactions, pins and bans (default: 10s)
    pub write_timeout: Duration,

    /// Spam throttle parameters
    pub throttle: ThrottleConfig,

    // === Typing ===
    /// Debounce for typing status writes (default: 300ms)
    pub typing_debounce: Duration,

    /// Delay before an automatic "stopped typing" write (default: 3s)
    pub typing_timeout: Duration,

    // === Platform ===
    /// File backing local key/value storage
    pub storage_path: String,

    /// Whether new-message notifications start enabled
    pub notifications_enabled: bool,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_ms(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_or(name, default_ms))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let throttle_defaults = ThrottleConfig::default();

        Self {
            fingerprint_storage_key: std::env::var("MURMUR_FINGERPRINT_KEY")
                .unwrap_or_else(|_| FINGERPRINT_STORAGE_KEY.to_string()),
            fingerprint_load_timeout: env_ms("MURMUR_FINGERPRINT_LOAD_TIMEOUT_MS", 5_000),
            fingerprint_get_timeout: env_ms("MURMUR_FINGERPRINT_GET_TIMEOUT_MS", 5_000),
            ip_services: std::env::var("MURMUR_IP_SERVICES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_else(|_| DEFAULT_IP_SERVICES.iter().map(|s| s.to_string()).collect()),
            ip_lookup_timeout: env_ms("MURMUR_IP_LOOKUP_TIMEOUT_MS", 3_000),
            device_info_timeout: env_ms("MURMUR_DEVICE_INFO_TIMEOUT_MS", 8_000),

            ban_check_timeout: env_ms("MURMUR_BAN_CHECK_TIMEOUT_MS", 5_000),

            username_check_timeout: env_ms("MURMUR_USERNAME_CHECK_TIMEOUT_MS", 10_000),
            profile_save_timeout: env_ms("MURMUR_PROFILE_SAVE_TIMEOUT_MS", 10_000),
            profile_batch_debounce: env_ms("MURMUR_PROFILE_BATCH_DEBOUNCE_MS", 100),
            profile_batch_size: env_or("MURMUR_PROFILE_BATCH_SIZE", 30),

            send_timeout: env_ms("MURMUR_SEND_TIMEOUT_MS", 15_000),
            write_timeout: env_ms("MURMUR_WRITE_TIMEOUT_MS", 10_000),
            throttle: ThrottleConfig {
                window_ms: env_or("MURMUR_SPAM_WINDOW_MS", throttle_defaults.window_ms),
                max_messages: env_or("MURMUR_SPAM_MAX_MESSAGES", throttle_defaults.max_messages),
                warning_threshold: env_or(
                    "MURMUR_SPAM_WARNING_THRESHOLD",
                    throttle_defaults.warning_threshold,
                ),
                min_interval_ms: env_or(
                    "MURMUR_MIN_MESSAGE_INTERVAL_MS",
                    throttle_defaults.min_interval_ms,
                ),
                cleanup_interval_ms: env_or(
                    "MURMUR_SPAM_CLEANUP_INTERVAL_MS",
                    throttle_defaults.cleanup_interval_ms,
                ),
            },

            typing_debounce: env_ms("MURMUR_TYPING_DEBOUNCE_MS", 300),
            typing_timeout: env_ms("MURMUR_TYPING_TIMEOUT_MS", 3_000),

            storage_path: std::env::var("MURMUR_STORAGE_PATH")
                .unwrap_or_else(|_| ".murmur-storage.json".to_string()),
            notifications_enabled: std::env::var("MURMUR_NOTIFICATIONS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
