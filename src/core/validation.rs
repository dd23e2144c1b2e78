//! Validation for card names and teams
//!
//! Names and teams are cleaned (trimmed, lowercased, underscores turned into
//! hyphens) and then checked as kebab-case slugs, so that every family key is
//! a safe storage path segment.

use crate::error::{RegistryError, Result};
use regex::Regex;
use std::sync::OnceLock;

/// A cleaned, validated kebab-case identifier used for card names and teams
///
/// # Rules
/// - Lowercase letters (a-z), numbers (0-9), hyphens (-) only
/// - Must start and end with letter or number (not hyphen)
/// - No consecutive hyphens
/// - Length: 1-214 characters
///
/// # Examples
///
/// ```
/// use cardvault_rs::Slug;
///
/// let slug = Slug::new("Fraud_Model").unwrap();
/// assert_eq!(slug.as_str(), "fraud-model");
///
/// assert!(Slug::new("fraud model").is_err()); // space
/// assert!(Slug::new("fraud--model").is_err()); // consecutive hyphens
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slug(String);

impl Slug {
    const PATTERN: &'static str = r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$";

    const MAX_LENGTH: usize = 214;

    /// Clean and validate a raw name
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the cleaned value is not a valid slug.
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let cleaned = clean_string(raw.as_ref());
        Self::validate_slug(&cleaned)?;
        Ok(Slug(cleaned))
    }

    fn validate_slug(slug: &str) -> Result<()> {
        if slug.is_empty() {
            return Err(RegistryError::Validation(
                "name cannot be empty".to_string(),
            ));
        }

        if slug.len() > Self::MAX_LENGTH {
            return Err(RegistryError::Validation(format!(
                "name too long (max {} characters)",
                Self::MAX_LENGTH
            )));
        }

        if !slug_regex().is_match(slug) {
            return Err(RegistryError::Validation(format!(
                "name '{}' must be kebab-case: lowercase letters, numbers, and hyphens only",
                slug
            )));
        }

        if slug.contains("--") {
            return Err(RegistryError::Validation(format!(
                "name '{}' cannot contain consecutive hyphens",
                slug
            )));
        }

        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl AsRef<str> for Slug {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Slug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn slug_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(Slug::PATTERN).expect("slug pattern compiles"))
}

/// Normalize a user supplied name or team
///
/// Trims whitespace, lowercases, and replaces underscores with hyphens.
pub fn clean_string(raw: &str) -> String {
    raw.trim().to_lowercase().replace('_', "-")
}

/// Validate a tag key (values are free-form)
pub fn validate_tag_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(RegistryError::Validation(
            "tag keys cannot be empty".to_string(),
        ));
    }
    if key.len() > 256 {
        let head: String = key.chars().take(32).collect();
        return Err(RegistryError::Validation(format!(
            "tag key '{}...' exceeds 256 bytes",
            head
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(Slug::new("churn").is_ok());
        assert!(Slug::new("churn-model").is_ok());
        assert!(Slug::new("model123").is_ok());
        assert!(Slug::new("a").is_ok());
    }

    #[test]
    fn test_names_are_cleaned() {
        assert_eq!(Slug::new("  Churn_Model ").unwrap().as_str(), "churn-model");
        assert_eq!(Slug::new("DATA").unwrap().as_str(), "data");
    }

    #[test]
    fn test_invalid_names() {
        assert!(Slug::new("").is_err());
        assert!(Slug::new("   ").is_err());
        assert!(Slug::new("-test").is_err());
        assert!(Slug::new("test-").is_err());
        assert!(Slug::new("_test").is_err()); // cleans to "-test"
        assert!(Slug::new("my--model").is_err());
        assert!(Slug::new("my.model").is_err());
        assert!(Slug::new("my model").is_err());
        assert!(Slug::new("team/name").is_err());
        assert!(Slug::new("a".repeat(215)).is_err());
    }

    #[test]
    fn test_tag_keys() {
        assert!(validate_tag_key("owner").is_ok());
        assert!(validate_tag_key("").is_err());
        assert!(validate_tag_key(" ").is_err());
        assert!(validate_tag_key(&"k".repeat(257)).is_err());
    }

    #[test]
    fn test_long_multibyte_tag_key_is_rejected() {
        let key = "€".repeat(100);
        match validate_tag_key(&key) {
            Err(RegistryError::Validation(msg)) => assert!(msg.contains(&"€".repeat(32))),
            other => panic!("expected a validation error, got {:?}", other),
        }
        // 85 three-byte chars fit within the limit
        assert!(validate_tag_key(&"€".repeat(85)).is_ok());
    }
}
