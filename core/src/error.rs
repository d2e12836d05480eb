//! Error types for murmur-core.
//!
//! All errors are explicit and carry enough context to be shown to the
//! user directly. No external dependencies - implements `std::error::Error`
//! manually.
//!
//! # Error Categories
//!
//! - **Message errors**: `EmptyMessage`, `MessageTooLong`, `InvalidCharacters`
//! - **Profile errors**: `EmptyUsername`, `InvalidUsername`, `InvalidPhotoUrl`
//! - **Reaction errors**: `UnknownReaction`

use std::error::Error as StdError;
use std::fmt;

/// Result type alias for murmur-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while validating user input.
///
/// The `Display` output is phrased for end users; the client surfaces it
/// verbatim as a toast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ==================== Message Errors ====================
    /// Message is empty or whitespace only.
    EmptyMessage,

    /// Message exceeds the maximum length after trimming.
    MessageTooLong {
        /// Length of the trimmed message in characters.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// Message contains C0 control characters other than tab, newline and
    /// carriage return.
    InvalidCharacters,

    // ==================== Profile Errors ====================
    /// Username is empty after trimming.
    EmptyUsername,

    /// Username fails length, charset or reserved-word checks.
    InvalidUsername,

    /// Profile photo URL is not on an allowed avatar host.
    InvalidPhotoUrl,

    // ==================== Reaction Errors ====================
    /// Reaction key is not one of the known kinds.
    UnknownReaction {
        /// The rejected key.
        key: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EmptyMessage => write!(f, "Message cannot be empty"),
            Error::MessageTooLong { max, .. } => {
                write!(f, "Message too long (max {} characters)", max)
            }
            Error::InvalidCharacters => write!(f, "Message contains invalid characters"),
            Error::EmptyUsername => write!(f, "Please enter a username."),
            Error::InvalidUsername => write!(
                f,
                "Invalid username. Use letters, numbers, underscores, hyphens, and spaces only (1-30 characters)."
            ),
            Error::InvalidPhotoUrl => write!(f, "Profile photo URL is not allowed"),
            Error::UnknownReaction { key } => write!(f, "unknown reaction: {}", key),
        }
    }
}

impl StdError for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = Error::MessageTooLong { len: 501, max: 500 };
        assert_eq!(err.to_string(), "Message too long (max 500 characters)");

        assert_eq!(Error::EmptyMessage.to_string(), "Message cannot be empty");

        let err = Error::UnknownReaction { key: "wave".into() };
        assert!(err.to_string().contains("wave"));
    }

    #[test]
    fn error_implements_std_error() {
        let err = Error::InvalidCharacters;
        let _: &dyn StdError = &err;
    }

    #[test]
    fn error_is_clone_and_eq() {
        let err1 = Error::MessageTooLong { len: 600, max: 500 };
        let err2 = err1.clone();
        assert_eq!(err1, err2);
    }
}
