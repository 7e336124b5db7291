//! Format checks for string schemas
//!
//! Patterns are compiled once on first use.

use crate::constraints::StringFormat;
use once_cell::sync::Lazy;
use regex::Regex;

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap()
});

static URL_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://[^\s/$.?#].[^\s]*$").unwrap());

static UUID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-4[0-9a-fA-F]{3}-[89abAB][0-9a-fA-F]{3}-[0-9a-fA-F]{12}$",
    )
    .unwrap()
});

static DATETIME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d{1,9})?(Z|[+-]\d{2}:\d{2})$").unwrap()
});

static DATE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());

impl StringFormat {
    /// Whether `value` is well-formed for this format
    pub fn matches(&self, value: &str) -> bool {
        match self {
            StringFormat::Email => EMAIL_REGEX.is_match(value),
            StringFormat::Url => URL_REGEX.is_match(value),
            StringFormat::Uuid => UUID_REGEX.is_match(value),
            StringFormat::DateTime => DATETIME_REGEX.is_match(value),
            StringFormat::Date => DATE_REGEX.is_match(value),
        }
    }

    /// Name used in error messages
    pub fn name(&self) -> &'static str {
        match self {
            StringFormat::Email => "email",
            StringFormat::Url => "url",
            StringFormat::Uuid => "uuid",
            StringFormat::DateTime => "date-time",
            StringFormat::Date => "date",
        }
    }
}
