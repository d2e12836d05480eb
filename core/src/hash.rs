//! Small non-cryptographic hashes used for device correlation.
//!
//! These hashes only need to be stable across sessions and platforms; they
//! are not a security boundary. All of them are built on the same 32-bit
//! rolling hash (`h = h * 31 + unit`) over UTF-16 code units, so a value
//! computed in the browser and one computed here agree.

/// Alphabet for random fingerprint suffixes.
pub const SUFFIX_ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Digits for base-36 formatting.
const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of the random part of a fallback fingerprint.
pub const FALLBACK_SUFFIX_LEN: usize = 8;

/// Palette used to colour usernames.
pub const USER_COLORS: [&str; 17] = [
    "#ff79c6", "#8be9fd", "#50fa7b", "#bd93f9", "#ffb86c", "#f1fa8c", "#ff5555", "#00e5ff",
    "#fab1a0", "#a29bfe", "#55efc4", "#fdcb6e", "#e17055", "#d63031", "#e84393", "#0984e3",
    "#00b894",
];

/// 32-bit rolling hash over the UTF-16 encoding of `input`.
pub fn rolling_hash(input: &str) -> i32 {
    input.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit))
    })
}

/// Format an unsigned value in lowercase base 36.
pub fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36_DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

/// Absolute value of the rolling hash, widened so `i32::MIN` is representable.
fn abs_hash(input: &str) -> u64 {
    i64::from(rolling_hash(input)).unsigned_abs()
}

/// Hash an IP address into the key used by the `banned_ips` collection.
///
/// Returns an empty string for an empty input so callers can treat "no IP"
/// and "no hash" the same way.
pub fn hash_ip(ip: &str) -> String {
    if ip.is_empty() {
        return String::new();
    }
    format!("ip_{}", to_base36(abs_hash(ip)))
}

/// Legacy ban key for a raw IP (dots replaced with underscores).
pub fn raw_ip_key(ip: &str) -> String {
    ip.replace('.', "_")
}

/// Browser and device attributes folded into a fallback fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintComponents {
    pub user_agent: String,
    pub language: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub color_depth: u32,
    /// Minutes behind UTC, as reported by the platform.
    pub timezone_offset_minutes: i32,
    pub hardware_concurrency: Option<u32>,
    pub device_memory_gb: Option<u32>,
    pub platform: String,
}

impl FingerprintComponents {
    /// Join the components in their canonical order.
    pub fn canonical(&self) -> String {
        let opt = |v: Option<u32>| v.map_or_else(|| "unknown".to_string(), |v| v.to_string());
        [
            self.user_agent.clone(),
            self.language.clone(),
            format!("{}x{}", self.screen_width, self.screen_height),
            self.color_depth.to_string(),
            self.timezone_offset_minutes.to_string(),
            opt(self.hardware_concurrency),
            opt(self.device_memory_gb),
            self.platform.clone(),
        ]
        .join("|||")
    }

    /// Screen resolution as `WxH`.
    pub fn screen_resolution(&self) -> String {
        format!("{}x{}", self.screen_width, self.screen_height)
    }
}

/// Map raw random bytes onto the suffix alphabet.
pub fn random_suffix(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| SUFFIX_ALPHABET[(*b as usize) % SUFFIX_ALPHABET.len()] as char)
        .collect()
}

/// Build a fallback fingerprint: `fb_{base36 hash}_{suffix}`.
///
/// The caller supplies the random suffix; it is generated once and then
/// persisted, so the fingerprint stays stable for the browser.
pub fn fallback_fingerprint(components: &FingerprintComponents, suffix: &str) -> String {
    format!("fb_{}_{}", to_base36(abs_hash(&components.canonical())), suffix)
}

/// Pick a stable display colour for a user id.
pub fn user_color(user_id: &str) -> &'static str {
    if user_id.is_empty() {
        return USER_COLORS[0];
    }
    let index = (abs_hash(user_id) % USER_COLORS.len() as u64) as usize;
    USER_COLORS[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_hash_matches_known_values() {
        assert_eq!(rolling_hash(""), 0);
        assert_eq!(rolling_hash("a"), 97);
        // "ab" = 97 * 31 + 98
        assert_eq!(rolling_hash("ab"), 3105);
        // Java's String.hashCode uses the same recurrence
        assert_eq!(rolling_hash("hello"), 99_162_322);
    }

    #[test]
    fn rolling_hash_wraps() {
        let long = "z".repeat(64);
        // must not panic on overflow
        let _ = rolling_hash(&long);
    }

    #[test]
    fn base36_formatting() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(3105), "2e9");
    }

    #[test]
    fn ip_hash_is_stable_and_prefixed() {
        let a = hash_ip("203.0.113.9");
        assert!(a.starts_with("ip_"));
        assert_eq!(a, hash_ip("203.0.113.9"));
        assert_ne!(a, hash_ip("203.0.113.10"));
        assert_eq!(hash_ip(""), "");
    }

    #[test]
    fn raw_ip_key_replaces_dots() {
        assert_eq!(raw_ip_key("10.0.0.1"), "10_0_0_1");
    }

    #[test]
    fn fallback_fingerprint_shape() {
        let components = FingerprintComponents {
            user_agent: "Mozilla/5.0".into(),
            language: "en-US".into(),
            screen_width: 1920,
            screen_height: 1080,
            color_depth: 24,
            timezone_offset_minutes: -60,
            hardware_concurrency: Some(8),
            device_memory_gb: None,
            platform: "Linux x86_64".into(),
        };
        let suffix = random_suffix(&[0, 1, 2, 3, 4, 5, 6, 35]);
        assert_eq!(suffix, "abcdefg9");

        let fp = fallback_fingerprint(&components, &suffix);
        assert!(fp.starts_with("fb_"));
        assert!(fp.ends_with("_abcdefg9"));
        assert_eq!(fp, fallback_fingerprint(&components, &suffix));
        assert!(components.canonical().contains("1920x1080|||24|||-60|||8|||unknown"));
    }

    #[test]
    fn user_color_is_deterministic() {
        assert_eq!(user_color(""), USER_COLORS[0]);
        assert_eq!(user_color("uid-1"), user_color("uid-1"));
        assert!(USER_COLORS.contains(&user_color("someone-else")));
    }
}
