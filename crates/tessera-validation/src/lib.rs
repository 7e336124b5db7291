//! Tessera Validation
//!
//! Schema validation for BSON documents, used by `tessera-odm` to check
//! inserted documents and the persisted values of update modifiers.
//!
//! Validation is output-producing: the value returned from [`validate`] is
//! what gets stored, with defaults applied and string forms of ObjectIds and
//! date-times coerced to their BSON types.
//!
//! # Example
//!
//! ```rust
//! use tessera_validation::{transform, validate, Schema};
//! use bson::bson;
//!
//! let user = Schema::object([
//!     ("name", Schema::string()),
//!     ("address", Schema::object([("city", Schema::string())])),
//! ]);
//!
//! assert!(validate(&bson!({ "name": "Ada" }), &user).is_err());
//! assert!(validate(&bson!({ "name": "Ada" }), &transform::deep_partial(&user)).is_ok());
//! ```

pub mod constraints;
pub mod errors;
pub mod formats;
pub mod schema;
pub mod transform;
pub mod validators;

pub use constraints::{ListConstraints, NumericConstraints, Pattern, StringConstraints, StringFormat};
pub use errors::{ErrorType, ValidationContext, ValidationError, ValidationErrors, ValidationResult};
pub use schema::{
    is_array_segment, is_positional_segment, AdditionalFields, DefaultValue, LazySchema,
    ObjectSchema, Schema,
};
pub use validators::{validate, validate_document, validate_value, validate_with_context};
