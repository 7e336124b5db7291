//! Validation error types
//!
//! Errors are accumulated rather than returned on the first failure, so one
//! validation pass reports every offending path of a document or update.

use std::fmt;
use thiserror::Error;

// ============================================================================
// Validation Result
// ============================================================================

/// Validation result type
pub type ValidationResult<T> = Result<T, ValidationErrors>;

// ============================================================================
// Validation Errors Collection
// ============================================================================

/// Collection of validation errors gathered during one validation pass
#[derive(Debug, Clone, Default, PartialEq, Error)]
#[error("{} validation error(s)", .errors.len())]
pub struct ValidationErrors {
    pub errors: Vec<ValidationError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn add(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Merge another collection into this one
    pub fn merge(&mut self, other: ValidationErrors) {
        self.errors.extend(other.errors);
    }

    /// Ok with `value` if nothing was recorded, otherwise the collection
    pub fn into_result<T>(self, value: T) -> ValidationResult<T> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }

    pub fn as_slice(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Dotted paths of every recorded error, in the order they were found
    pub fn paths(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.path()).collect()
    }
}

// ============================================================================
// Single Validation Error
// ============================================================================

/// A single failure at one path of the validated value
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{location} ({field}): {message} [{error_type}]")]
pub struct ValidationError {
    /// Root label of the validated value (e.g. "document", "$set", "$push")
    pub location: String,

    /// Dotted path below the location (e.g. "profile.age", "tags.[2]")
    pub field: String,

    pub message: String,

    pub error_type: ErrorType,
}

impl ValidationError {
    pub fn new(location: String, field: String, message: String, error_type: ErrorType) -> Self {
        Self {
            location,
            field,
            message,
            error_type,
        }
    }

    pub fn type_error(location: String, field: String, message: String) -> Self {
        Self::new(location, field, message, ErrorType::TypeError)
    }

    pub fn value_error(location: String, field: String, message: String) -> Self {
        Self::new(location, field, message, ErrorType::ValueError)
    }

    pub fn missing_error(location: String, field: String) -> Self {
        Self::new(
            location,
            field,
            "Field required".to_string(),
            ErrorType::Missing,
        )
    }

    pub fn extra_error(location: String, field: String) -> Self {
        Self::new(
            location,
            field,
            "Extra fields are not permitted".to_string(),
            ErrorType::ExtraForbidden,
        )
    }

    /// `location.field`, or just the location for root-level errors
    pub fn path(&self) -> String {
        if self.field.is_empty() {
            self.location.clone()
        } else {
            format!("{}.{}", self.location, self.field)
        }
    }
}

// ============================================================================
// Error Type Classification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Type mismatch (e.g. expected string, got integer)
    TypeError,

    /// Constraint violation (e.g. string too long, number out of range)
    ValueError,

    Missing,

    ExtraForbidden,

    /// Invalid string format (e.g. malformed email)
    FormatError,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeError => write!(f, "type_error"),
            Self::ValueError => write!(f, "value_error"),
            Self::Missing => write!(f, "missing"),
            Self::ExtraForbidden => write!(f, "extra_forbidden"),
            Self::FormatError => write!(f, "format_error"),
        }
    }
}

// ============================================================================
// Validation Context
// ============================================================================

/// Tracks the current position inside a nested value and the mode of the pass
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    pub path: Vec<String>,

    /// When set, array schemas also accept documents keyed by array indexes
    /// or positional operators (`0`, `$`, `$[]`, `$[id]`). Update documents
    /// address array elements this way.
    pub keyed_arrays: bool,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context rooted at `location`
    pub fn with_location(location: &str) -> Self {
        Self {
            path: vec![location.to_string()],
            keyed_arrays: false,
        }
    }

    /// Context for validating update documents
    pub fn for_update(location: &str) -> Self {
        Self {
            path: vec![location.to_string()],
            keyed_arrays: true,
        }
    }

    pub fn push(&mut self, field: &str) {
        self.path.push(field.to_string());
    }

    pub fn pop(&mut self) {
        self.path.pop();
    }

    pub fn current_path(&self) -> String {
        self.path.join(".")
    }

    /// First element of the path
    pub fn location(&self) -> String {
        self.path.first().cloned().unwrap_or_default()
    }

    /// Everything after the location
    pub fn field(&self) -> String {
        if self.path.len() > 1 {
            self.path[1..].join(".")
        } else {
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_into_result() {
        let errors = ValidationErrors::new();
        assert_eq!(errors.into_result(7).unwrap(), 7);

        let mut errors = ValidationErrors::new();
        errors.add(ValidationError::missing_error(
            "document".to_string(),
            "name".to_string(),
        ));
        let err = errors.into_result(()).unwrap_err();
        assert_eq!(err.len(), 1);
        assert_eq!(err.to_string(), "1 validation error(s)");
        assert_eq!(
            err.as_slice()[0].to_string(),
            "document (name): Field required [missing]"
        );
    }

    #[test]
    fn test_validation_context_paths() {
        let mut ctx = ValidationContext::for_update("$set");
        assert!(ctx.keyed_arrays);
        assert_eq!(ctx.location(), "$set");
        assert_eq!(ctx.field(), "");

        ctx.push("profile");
        ctx.push("age");
        assert_eq!(ctx.current_path(), "$set.profile.age");
        assert_eq!(ctx.field(), "profile.age");

        ctx.pop();
        assert_eq!(ctx.field(), "profile");
    }

    #[test]
    fn test_error_path() {
        let err = ValidationError::type_error(
            "$push".to_string(),
            "tags".to_string(),
            "Expected string".to_string(),
        );
        assert_eq!(err.path(), "$push.tags");

        let root = ValidationError::type_error(
            "document".to_string(),
            String::new(),
            "Expected object".to_string(),
        );
        assert_eq!(root.path(), "document");
    }

    #[test]
    fn test_error_type_display() {
        assert_eq!(ErrorType::TypeError.to_string(), "type_error");
        assert_eq!(ErrorType::ExtraForbidden.to_string(), "extra_forbidden");
        assert_eq!(ErrorType::Missing.to_string(), "missing");
    }
}
