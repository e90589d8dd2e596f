//! Common types used throughout bwsync.

use serde::{Deserialize, Deserializer};
use std::fmt;
use zeroize::Zeroize;

/// Sensitive text wrapper that zeroizes on drop.
///
/// Used for credentials, encryption keys and session tokens. The value is
/// never shown by `Debug` or `Display`.
#[derive(Clone, Default, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveString(String);

impl SensitiveString {
    /// Create a new sensitive string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the secret value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Length in characters.
    pub fn char_count(&self) -> usize {
        self.0.chars().count()
    }

    /// Check if empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveString([REDACTED])")
    }
}

impl fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_string_redacted() {
        let secret = SensitiveString::new("hunter22");
        assert_eq!(format!("{:?}", secret), "SensitiveString([REDACTED])");
        assert_eq!(secret.to_string(), "***");
        assert_eq!(secret.expose(), "hunter22");
    }

    #[test]
    fn test_sensitive_string_blank() {
        assert!(SensitiveString::new("  ").is_blank());
        assert!(SensitiveString::default().is_blank());
        assert!(!SensitiveString::new("key").is_blank());
    }

    #[test]
    fn test_char_count_is_unicode_aware() {
        assert_eq!(SensitiveString::new("pässwörd").char_count(), 8);
    }

    #[test]
    fn test_deserialize() {
        let secret: SensitiveString = serde_json::from_str("\"s3cret\"").unwrap();
        assert_eq!(secret.expose(), "s3cret");
    }
}
