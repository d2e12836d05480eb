//! Input validation and text sanitisation.
//!
//! Every piece of user-supplied text passes through here before it is shown
//! optimistically or written to the store. The checks are deliberately
//! identical on both paths so a message that renders locally is a message
//! the store will accept.

use crate::error::{Error, Result};

/// Maximum message length, in UTF-16 code units (see [`text_length`]).
pub const MESSAGE_MAX_LENGTH: usize = 500;

/// Maximum username length, in UTF-16 code units.
pub const USERNAME_MAX_LENGTH: usize = 30;

/// Maximum profile photo URL length, in UTF-16 code units.
pub const PHOTO_URL_MAX_LENGTH: usize = 500;

/// Words that may not appear anywhere in a username (case-insensitive).
pub const RESERVED_USERNAME_WORDS: &[&str] =
    &["anonymous", "admin", "moderator", "system", "konvo", "mod"];

/// Avatar generator hosts accepted for profile photos.
pub const ALLOWED_PHOTO_PREFIXES: &[&str] = &[
    "https://placehold.co/",
    "https://ui-avatars.com/",
    "https://api.dicebear.com/",
];

/// Length of `text` as the browser and the store rules measure it: UTF-16
/// code units. Characters outside the Basic Multilingual Plane (most emoji)
/// count twice.
pub fn text_length(text: &str) -> usize {
    text.encode_utf16().count()
}

/// Escape text for embedding in markup.
///
/// Replaces `& < > " '` and backtick with entities and collapses line breaks
/// to a single space, so the result contains none of the raw characters.
pub fn sanitize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '`' => out.push_str("&#x60;"),
            '\r' if chars.peek() == Some(&'\n') => {
                chars.next();
                out.push(' ');
            }
            '\n' => out.push(' '),
            other => out.push(other),
        }
    }

    out
}

/// True for C0 control characters except tab, line feed and carriage return.
fn is_forbidden_control(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{08}' | '\u{0B}' | '\u{0C}' | '\u{0E}'..='\u{1F}')
}

/// Check a username against length, charset and the reserved-word list.
///
/// The input is trimmed first. Reserved words match as substrings, so
/// `"admin2"` and `"Modern"` are both rejected.
pub fn is_valid_username(username: &str) -> bool {
    let trimmed = username.trim();
    let len = text_length(trimmed);

    if len == 0 || len > USERNAME_MAX_LENGTH {
        return false;
    }

    let lower = trimmed.to_lowercase();
    if RESERVED_USERNAME_WORDS.iter().any(|word| lower.contains(word)) {
        return false;
    }

    trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ' ')
}

/// Validate a username and return its trimmed form.
pub fn validate_username(username: &str) -> Result<&str> {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        return Err(Error::EmptyUsername);
    }
    if !is_valid_username(trimmed) {
        return Err(Error::InvalidUsername);
    }
    Ok(trimmed)
}

/// Validate message text and return the trimmed text unchanged.
pub fn validate_message_before_post(text: &str) -> Result<&str> {
    let trimmed = text.trim();

    if trimmed.is_empty() {
        return Err(Error::EmptyMessage);
    }

    let len = text_length(trimmed);
    if len > MESSAGE_MAX_LENGTH {
        return Err(Error::MessageTooLong {
            len,
            max: MESSAGE_MAX_LENGTH,
        });
    }

    if trimmed.chars().any(is_forbidden_control) {
        return Err(Error::InvalidCharacters);
    }

    Ok(trimmed)
}

/// Boolean form of [`validate_message_before_post`].
pub fn is_valid_message_text(text: &str) -> bool {
    validate_message_before_post(text).is_ok()
}

/// Check a profile photo URL against the avatar host allow-list.
pub fn is_valid_profile_photo_url(url: &str) -> bool {
    if text_length(url) > PHOTO_URL_MAX_LENGTH {
        return false;
    }

    ALLOWED_PHOTO_PREFIXES.iter().any(|prefix| {
        url.strip_prefix(prefix).is_some_and(|rest| {
            !rest.is_empty()
                && !rest
                    .chars()
                    .any(|c| matches!(c, '\n' | '\r' | '\u{2028}' | '\u{2029}'))
        })
    })
}

/// Validate a profile photo URL.
pub fn validate_profile_photo_url(url: &str) -> Result<&str> {
    if is_valid_profile_photo_url(url) {
        Ok(url)
    } else {
        Err(Error::InvalidPhotoUrl)
    }
}

/// Check that a string is a literal IPv4 or IPv6 address.
pub fn is_valid_ip(ip: &str) -> bool {
    ip.parse::<std::net::IpAddr>().is_ok()
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_examples() {
        assert!(is_valid_username("John_Doe-1"));
        assert!(is_valid_username("  spaced name  "));
        assert!(!is_valid_username("admin2"));
        assert!(!is_valid_username("TheModerator"));
        assert!(!is_valid_username("KONVO fan"));
        assert!(!is_valid_username(&"a".repeat(31)));
        assert!(is_valid_username(&"a".repeat(30)));
        assert!(!is_valid_username(""));
        assert!(!is_valid_username("   "));
        assert!(!is_valid_username("bad!name"));
        assert!(!is_valid_username("émile"));
    }

    #[test]
    fn emoji_count_as_two_units() {
        assert_eq!(text_length("héllo"), 5);
        assert_eq!(text_length("😀"), 2);

        let full = "😀".repeat(250);
        assert_eq!(validate_message_before_post(&full), Ok(full.as_str()));
        let over = "😀".repeat(251);
        assert_eq!(
            validate_message_before_post(&over),
            Err(Error::MessageTooLong { len: 502, max: 500 })
        );
    }

    #[test]
    fn reserved_word_matches_substring() {
        // "mod" catches anything containing it
        assert!(!is_valid_username("modern"));
        assert!(!is_valid_username("xXsystemXx"));
    }

    #[test]
    fn validate_username_reports_empty_separately() {
        assert_eq!(validate_username("  "), Err(Error::EmptyUsername));
        assert_eq!(validate_username("admin"), Err(Error::InvalidUsername));
        assert_eq!(validate_username(" bob "), Ok("bob"));
    }

    #[test]
    fn message_validation() {
        assert_eq!(validate_message_before_post("  hi there "), Ok("hi there"));
        assert_eq!(validate_message_before_post(""), Err(Error::EmptyMessage));
        assert_eq!(validate_message_before_post(" \n\t "), Err(Error::EmptyMessage));
        assert_eq!(
            validate_message_before_post("\x07hello"),
            Err(Error::InvalidCharacters)
        );
        assert_eq!(
            validate_message_before_post(&"x".repeat(501)),
            Err(Error::MessageTooLong { len: 501, max: 500 })
        );
        assert!(validate_message_before_post(&"x".repeat(500)).is_ok());
    }

    #[test]
    fn message_allows_tab_and_newlines_inside() {
        assert_eq!(
            validate_message_before_post("line one\nline\ttwo\r\nthree"),
            Ok("line one\nline\ttwo\r\nthree")
        );
    }

    #[test]
    fn message_length_counts_characters_not_bytes() {
        let text = "é".repeat(500);
        assert!(is_valid_message_text(&text));
    }

    #[test]
    fn sanitize_strips_markup_characters() {
        let out = sanitize_text("<script>");
        for c in ['<', '>', '&', '"', '\'', '`'] {
            let raw_count = out.matches(c).count();
            if c == '&' {
                // only the entity introducers remain
                assert_eq!(raw_count, out.matches("&lt;").count() + out.matches("&gt;").count());
            } else {
                assert_eq!(raw_count, 0, "found raw {:?}", c);
            }
        }
        assert_eq!(out, "&lt;script&gt;");
    }

    #[test]
    fn sanitize_escapes_all_specials() {
        assert_eq!(
            sanitize_text("a&b \"q\" 'x' `y`"),
            "a&amp;b &quot;q&quot; &#x27;x&#x27; &#x60;y&#x60;"
        );
        assert_eq!(sanitize_text("one\r\ntwo\nthree"), "one two three");
    }

    #[test]
    fn photo_url_allow_list() {
        assert!(is_valid_profile_photo_url(
            "https://ui-avatars.com/api/?name=bob&background=random&size=128"
        ));
        assert!(is_valid_profile_photo_url("https://api.dicebear.com/7.x/bottts/svg"));
        assert!(is_valid_profile_photo_url("https://placehold.co/64x64"));
        assert!(!is_valid_profile_photo_url("https://ui-avatars.com/"));
        assert!(!is_valid_profile_photo_url("http://ui-avatars.com/api"));
        assert!(!is_valid_profile_photo_url("https://evil.example/ui-avatars.com/x"));
        assert!(!is_valid_profile_photo_url(&format!(
            "https://placehold.co/{}",
            "x".repeat(500)
        )));
    }

    #[test]
    fn ip_validation() {
        assert!(is_valid_ip("203.0.113.9"));
        assert!(is_valid_ip("2001:db8::1"));
        assert!(is_valid_ip("::"));
        assert!(!is_valid_ip("256.1.1.1"));
        assert!(!is_valid_ip("not-an-ip"));
        assert!(!is_valid_ip(""));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
