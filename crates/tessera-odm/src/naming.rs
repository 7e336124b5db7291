//! Collection naming for models

use tessera_common::{Result, TesseraError};
use tracing::warn;

/// Conservative limit; the server allows longer namespaces
const MAX_COLLECTION_NAME_LENGTH: usize = 120;

/// Collection name derived from a model name and checked for safety
///
/// Rejected names: empty, longer than 120 characters, containing NUL or `$`,
/// or starting with the reserved `system.` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionName {
    name: String,
}

impl CollectionName {
    /// Pluralise `model_name` and validate the result
    pub fn for_model(model_name: &str) -> Result<Self> {
        Self::new(&pluralizer::pluralize(model_name, 2, false))
    }

    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(TesseraError::Configuration(
                "Collection name cannot be empty".to_string(),
            ));
        }

        if name.len() > MAX_COLLECTION_NAME_LENGTH {
            return Err(TesseraError::Configuration(format!(
                "Collection name exceeds maximum length of {} characters: '{}'",
                MAX_COLLECTION_NAME_LENGTH, name
            )));
        }

        if name.contains('\0') {
            return Err(TesseraError::Configuration(
                "Collection name cannot contain null bytes".to_string(),
            ));
        }

        if name.starts_with("system.") {
            return Err(TesseraError::Configuration(format!(
                "Collection name cannot start with 'system.' (reserved): '{}'",
                name
            )));
        }

        if name.contains('$') {
            return Err(TesseraError::Configuration(format!(
                "Collection name cannot contain '$' character: '{}'",
                name
            )));
        }

        if name.contains("..") {
            warn!(collection = name, "collection name contains suspicious pattern");
        }

        Ok(Self {
            name: name.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl AsRef<str> for CollectionName {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for CollectionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}
