//! Schema descriptors over BSON values
//!
//! A [`Schema`] describes the persisted shape of a document. Validation
//! produces an output value: defaults filled in, object ids and date-times
//! coerced from their string forms, unknown keys rejected or stripped.

use crate::constraints::{ListConstraints, NumericConstraints, StringConstraints};
use bson::Bson;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Default Values
// ============================================================================

/// Value substituted for a missing optional field
#[derive(Clone)]
pub enum DefaultValue {
    Value(Bson),
    /// Called once per missing field (e.g. fresh ObjectIds, timestamps)
    Generator(Arc<dyn Fn() -> Bson + Send + Sync>),
}

impl DefaultValue {
    pub fn produce(&self) -> Bson {
        match self {
            DefaultValue::Value(value) => value.clone(),
            DefaultValue::Generator(generate) => generate(),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Value(value) => f.debug_tuple("Value").field(value).finish(),
            DefaultValue::Generator(_) => f.write_str("Generator(..)"),
        }
    }
}

// ============================================================================
// Object Schema
// ============================================================================

/// Policy for keys not declared by an object schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdditionalFields {
    #[default]
    Forbid,
    Allow,
    Strip,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectSchema {
    /// Declared fields in declaration order
    pub fields: Vec<(String, Schema)>,
    pub additional: AdditionalFields,
}

impl ObjectSchema {
    pub fn field(&self, name: &str) -> Option<&Schema> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, schema)| schema)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Schema> {
        self.fields
            .iter_mut()
            .find(|(key, _)| key == name)
            .map(|(_, schema)| schema)
    }

    /// Insert or replace a field, keeping the original position on replace
    pub fn set_field(&mut self, name: &str, schema: Schema) {
        match self.field_mut(name) {
            Some(slot) => *slot = schema,
            None => self.fields.push((name.to_string(), schema)),
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(key, _)| key.as_str())
    }
}

// ============================================================================
// Lazy Schema
// ============================================================================

/// Deferred schema, built on first use and memoised.
///
/// Self-referential shapes (a comment holding replies that are comments)
/// are written as a function returning the schema and wrapped here.
#[derive(Clone)]
pub struct LazySchema {
    inner: Arc<LazyInner>,
}

struct LazyInner {
    cell: OnceCell<Schema>,
    thunk: Box<dyn Fn() -> Schema + Send + Sync>,
}

impl LazySchema {
    pub fn new(thunk: impl Fn() -> Schema + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(LazyInner {
                cell: OnceCell::new(),
                thunk: Box::new(thunk),
            }),
        }
    }

    pub fn resolve(&self) -> &Schema {
        self.inner.cell.get_or_init(|| (self.inner.thunk)())
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.cell.get().is_some()
    }
}

impl fmt::Debug for LazySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazySchema")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

// ============================================================================
// Schema
// ============================================================================

#[derive(Debug, Clone)]
pub enum Schema {
    /// Accepts anything, including a missing value
    Any,
    String(StringConstraints),
    Int(NumericConstraints<i64>),
    Number(NumericConstraints<f64>),
    Bool,
    Null,
    /// Accepts an ObjectId or its 24 character hex form
    ObjectId,
    /// Accepts a BSON date-time or an RFC 3339 string
    DateTime,
    Binary,
    Enum(Vec<Bson>),
    Array {
        items: Box<Schema>,
        constraints: ListConstraints,
    },
    Object(ObjectSchema),
    /// Accepts null or a missing value; a missing value takes the default
    Optional {
        inner: Box<Schema>,
        default: Option<DefaultValue>,
    },
    /// First matching variant wins
    Union(Vec<Schema>),
    Lazy(LazySchema),
}

impl Schema {
    pub fn any() -> Self {
        Schema::Any
    }

    pub fn string() -> Self {
        Schema::String(StringConstraints::default())
    }

    pub fn string_with(constraints: StringConstraints) -> Self {
        Schema::String(constraints)
    }

    pub fn int() -> Self {
        Schema::Int(NumericConstraints::default())
    }

    pub fn int_with(constraints: NumericConstraints<i64>) -> Self {
        Schema::Int(constraints)
    }

    pub fn number() -> Self {
        Schema::Number(NumericConstraints::default())
    }

    pub fn number_with(constraints: NumericConstraints<f64>) -> Self {
        Schema::Number(constraints)
    }

    pub fn bool() -> Self {
        Schema::Bool
    }

    pub fn null() -> Self {
        Schema::Null
    }

    pub fn object_id() -> Self {
        Schema::ObjectId
    }

    pub fn date_time() -> Self {
        Schema::DateTime
    }

    pub fn binary() -> Self {
        Schema::Binary
    }

    pub fn enumeration<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        Schema::Enum(values.into_iter().map(Into::into).collect())
    }

    pub fn array(items: Schema) -> Self {
        Schema::Array {
            items: Box::new(items),
            constraints: ListConstraints::default(),
        }
    }

    pub fn array_with(items: Schema, constraints: ListConstraints) -> Self {
        Schema::Array {
            items: Box::new(items),
            constraints,
        }
    }

    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Schema)>,
        K: Into<String>,
    {
        Schema::Object(ObjectSchema {
            fields: fields
                .into_iter()
                .map(|(key, schema)| (key.into(), schema))
                .collect(),
            additional: AdditionalFields::Forbid,
        })
    }

    pub fn union(variants: Vec<Schema>) -> Self {
        Schema::Union(variants)
    }

    pub fn lazy(thunk: impl Fn() -> Schema + Send + Sync + 'static) -> Self {
        Schema::Lazy(LazySchema::new(thunk))
    }

    /// Wrap in `Optional`; already optional schemas are returned unchanged
    pub fn optional(self) -> Self {
        match self {
            Schema::Optional { .. } => self,
            other => Schema::Optional {
                inner: Box::new(other),
                default: None,
            },
        }
    }

    pub fn default_value(self, value: impl Into<Bson>) -> Self {
        self.with_default(DefaultValue::Value(value.into()))
    }

    pub fn default_with(self, generate: impl Fn() -> Bson + Send + Sync + 'static) -> Self {
        self.with_default(DefaultValue::Generator(Arc::new(generate)))
    }

    fn with_default(self, default: DefaultValue) -> Self {
        let inner = match self {
            Schema::Optional { inner, .. } => inner,
            other => Box::new(other),
        };
        Schema::Optional {
            inner,
            default: Some(default),
        }
    }

    /// Set the unknown-key policy of an object schema
    pub fn additional(self, policy: AdditionalFields) -> Self {
        match self {
            Schema::Object(mut object) => {
                object.additional = policy;
                Schema::Object(object)
            }
            other => other,
        }
    }

    /// The schema below any `Optional` wrappers and resolved `Lazy` thunks
    pub fn unwrapped(&self) -> &Schema {
        match self {
            Schema::Optional { inner, .. } => inner.unwrapped(),
            Schema::Lazy(lazy) => lazy.resolve().unwrapped(),
            other => other,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectSchema> {
        match self.unwrapped() {
            Schema::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self.unwrapped(), Schema::Array { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Schema::Any => "any",
            Schema::String(_) => "string",
            Schema::Int(_) => "integer",
            Schema::Number(_) => "number",
            Schema::Bool => "boolean",
            Schema::Null => "null",
            Schema::ObjectId => "ObjectId",
            Schema::DateTime => "date-time",
            Schema::Binary => "binary",
            Schema::Enum(_) => "enum",
            Schema::Array { .. } => "array",
            Schema::Object(_) => "object",
            Schema::Optional { inner, .. } => inner.type_name(),
            Schema::Union(_) => "union",
            Schema::Lazy(lazy) => lazy.resolve().type_name(),
        }
    }
}

// ============================================================================
// Array path segments
// ============================================================================

/// `$`, `$[]` or `$[identifier]`
pub fn is_positional_segment(segment: &str) -> bool {
    segment == "$" || (segment.starts_with("$[") && segment.ends_with(']'))
}

/// A segment addressing an array element: a numeric index or a positional operator
pub fn is_array_segment(segment: &str) -> bool {
    is_positional_segment(segment)
        || (!segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_optional_is_idempotent() {
        let schema = Schema::string().optional().optional();
        match schema {
            Schema::Optional { inner, default } => {
                assert!(matches!(*inner, Schema::String(_)));
                assert!(default.is_none());
            }
            other => panic!("expected optional, got {:?}", other),
        }
    }

    #[test]
    fn test_default_replaces_optional_wrapper() {
        let schema = Schema::int().optional().default_value(3);
        match schema {
            Schema::Optional { inner, default } => {
                assert!(matches!(*inner, Schema::Int(_)));
                assert_eq!(default.unwrap().produce(), Bson::Int32(3));
            }
            other => panic!("expected optional, got {:?}", other),
        }
    }

    #[test]
    fn test_lazy_schema_resolves_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let lazy = LazySchema::new(|| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Schema::string()
        });
        assert!(!lazy.is_resolved());
        lazy.resolve();
        lazy.clone().resolve();
        assert!(lazy.is_resolved());
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_as_object_looks_through_wrappers() {
        let schema = Schema::lazy(|| Schema::object([("name", Schema::string())])).optional();
        let object = schema.as_object().unwrap();
        assert_eq!(object.field_names().collect::<Vec<_>>(), vec!["name"]);
        assert!(Schema::string().as_object().is_none());
    }

    #[test]
    fn test_array_segments() {
        assert!(is_array_segment("0"));
        assert!(is_array_segment("12"));
        assert!(is_array_segment("$"));
        assert!(is_array_segment("$[]"));
        assert!(is_array_segment("$[elem0]"));
        assert!(!is_array_segment("name"));
        assert!(!is_array_segment(""));
        assert!(!is_positional_segment("0"));
    }
}
