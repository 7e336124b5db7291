//! Constraints attached to scalar and array schemas

use regex::Regex;

// ============================================================================
// String Constraints
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct StringConstraints {
    /// Minimum length in characters
    pub min_length: Option<usize>,
    /// Maximum length in characters
    pub max_length: Option<usize>,
    pub pattern: Option<Pattern>,
    pub format: Option<StringFormat>,
    /// Trim surrounding whitespace before checking and storing
    pub trim: bool,
}

impl StringConstraints {
    pub fn min_length(mut self, min: usize) -> Self {
        self.min_length = Some(min);
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(Pattern::new(pattern));
        self
    }

    pub fn format(mut self, format: StringFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn trim(mut self) -> Self {
        self.trim = true;
        self
    }
}

/// Regex compiled once, when the constraint is built. A pattern that does
/// not compile keeps its error and fails every validation that uses it.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    compiled: Result<Regex, regex::Error>,
}

impl Pattern {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let compiled = Regex::new(&source);
        Self { source, compiled }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn regex(&self) -> Result<&Regex, &regex::Error> {
        self.compiled.as_ref()
    }
}

/// Predefined string formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFormat {
    Email,
    /// http or https URL
    Url,
    /// UUID v4
    Uuid,
    /// ISO 8601 date-time with offset
    DateTime,
    /// YYYY-MM-DD
    Date,
}

// ============================================================================
// Numeric Constraints
// ============================================================================

/// Bounds for integer (`i64`) and floating point (`f64`) schemas
#[derive(Debug, Clone, Default)]
pub struct NumericConstraints<T> {
    /// Inclusive lower bound
    pub minimum: Option<T>,
    /// Inclusive upper bound
    pub maximum: Option<T>,
    pub exclusive_minimum: Option<T>,
    pub exclusive_maximum: Option<T>,
    pub multiple_of: Option<T>,
}

impl<T> NumericConstraints<T> {
    pub fn minimum(mut self, min: T) -> Self {
        self.minimum = Some(min);
        self
    }

    pub fn maximum(mut self, max: T) -> Self {
        self.maximum = Some(max);
        self
    }

    pub fn multiple_of(mut self, step: T) -> Self {
        self.multiple_of = Some(step);
        self
    }
}

// ============================================================================
// List Constraints
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ListConstraints {
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
    pub unique_items: bool,
}

impl ListConstraints {
    pub fn min_items(mut self, min: usize) -> Self {
        self.min_items = Some(min);
        self
    }

    pub fn max_items(mut self, max: usize) -> Self {
        self.max_items = Some(max);
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique_items = true;
        self
    }
}
