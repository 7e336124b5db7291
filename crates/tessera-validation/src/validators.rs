//! Core validation engine
//!
//! Walks a BSON value alongside its [`Schema`], accumulating errors and
//! building the output value in the same pass.

use crate::constraints::{ListConstraints, NumericConstraints, StringConstraints};
use crate::errors::{ValidationContext, ValidationError, ValidationErrors, ValidationResult};
use crate::schema::{is_array_segment, AdditionalFields, ObjectSchema, Schema};
use bson::{oid::ObjectId, Bson, Document};

// ============================================================================
// Public API
// ============================================================================

/// Validate a value against a schema, returning the output value
///
/// # Example
///
/// ```
/// use tessera_validation::{validate, Schema};
/// use bson::{bson, Bson};
///
/// let schema = Schema::object([
///     ("name", Schema::string()),
///     ("age", Schema::int().optional().default_value(0)),
/// ]);
///
/// let output = validate(&bson!({ "name": "Ada" }), &schema).unwrap();
/// assert_eq!(output, bson!({ "name": "Ada", "age": 0 }));
/// ```
pub fn validate(value: &Bson, schema: &Schema) -> ValidationResult<Bson> {
    let mut ctx = ValidationContext::with_location("document");
    validate_with_context(value, schema, &mut ctx)
}

pub fn validate_with_context(
    value: &Bson,
    schema: &Schema,
    ctx: &mut ValidationContext,
) -> ValidationResult<Bson> {
    let mut errors = ValidationErrors::new();
    let output = validate_value(value, schema, ctx, &mut errors);
    errors.into_result(output)
}

/// Validate a whole document; the schema must describe an object
pub fn validate_document(
    document: &Document,
    schema: &Schema,
    ctx: &mut ValidationContext,
) -> ValidationResult<Document> {
    match validate_with_context(&Bson::Document(document.clone()), schema, ctx)? {
        Bson::Document(output) => Ok(output),
        other => {
            let mut errors = ValidationErrors::new();
            errors.add(ValidationError::type_error(
                ctx.location(),
                ctx.field(),
                format!("Expected object output, got {}", bson_type_name(&other)),
            ));
            Err(errors)
        }
    }
}

// ============================================================================
// Core Validation Function
// ============================================================================

/// Validate `value`, recording failures in `errors`.
///
/// The returned value is meaningful only when no error was recorded.
pub fn validate_value(
    value: &Bson,
    schema: &Schema,
    ctx: &mut ValidationContext,
    errors: &mut ValidationErrors,
) -> Bson {
    match schema {
        Schema::Any => value.clone(),
        Schema::String(constraints) => validate_string(value, constraints, ctx, errors),
        Schema::Int(constraints) => validate_int(value, constraints, ctx, errors),
        Schema::Number(constraints) => validate_number(value, constraints, ctx, errors),
        Schema::Bool => expect_type(value, matches!(value, Bson::Boolean(_)), "boolean", ctx, errors),
        Schema::Null => expect_type(value, matches!(value, Bson::Null), "null", ctx, errors),
        Schema::ObjectId => validate_object_id(value, ctx, errors),
        Schema::DateTime => validate_date_time(value, ctx, errors),
        Schema::Binary => expect_type(value, matches!(value, Bson::Binary(_)), "binary", ctx, errors),
        Schema::Enum(values) => validate_enum(value, values, ctx, errors),
        Schema::Array { items, constraints } => {
            validate_array(value, items, constraints, ctx, errors)
        }
        Schema::Object(object) => match value {
            Bson::Document(document) => {
                Bson::Document(validate_object(document, object, ctx, errors))
            }
            other => type_mismatch(other, "object", ctx, errors),
        },
        Schema::Optional { inner, .. } => match value {
            Bson::Null => Bson::Null,
            other => validate_value(other, inner, ctx, errors),
        },
        Schema::Union(variants) => validate_union(value, variants, ctx, errors),
        Schema::Lazy(lazy) => validate_value(value, lazy.resolve(), ctx, errors),
    }
}

fn expect_type(
    value: &Bson,
    ok: bool,
    expected: &str,
    ctx: &ValidationContext,
    errors: &mut ValidationErrors,
) -> Bson {
    if ok {
        value.clone()
    } else {
        type_mismatch(value, expected, ctx, errors)
    }
}

fn type_mismatch(
    value: &Bson,
    expected: &str,
    ctx: &ValidationContext,
    errors: &mut ValidationErrors,
) -> Bson {
    errors.add(ValidationError::type_error(
        ctx.location(),
        ctx.field(),
        format!("Expected {}, got {}", expected, bson_type_name(value)),
    ));
    value.clone()
}

pub(crate) fn bson_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Array(_) => "array",
        Bson::Document(_) => "object",
        Bson::Boolean(_) => "boolean",
        Bson::Null => "null",
        Bson::Int32(_) | Bson::Int64(_) => "integer",
        Bson::ObjectId(_) => "ObjectId",
        Bson::DateTime(_) => "date-time",
        Bson::Binary(_) => "binary",
        Bson::Decimal128(_) => "decimal",
        Bson::Undefined => "undefined",
        _ => "unsupported BSON value",
    }
}

// ============================================================================
// Scalars
// ============================================================================

fn validate_string(
    value: &Bson,
    constraints: &StringConstraints,
    ctx: &ValidationContext,
    errors: &mut ValidationErrors,
) -> Bson {
    let Bson::String(raw) = value else {
        return type_mismatch(value, "string", ctx, errors);
    };
    let s = if constraints.trim { raw.trim() } else { raw.as_str() };
    let char_count = s.chars().count();

    if let Some(min) = constraints.min_length {
        if char_count < min {
            errors.add(ValidationError::value_error(
                ctx.location(),
                ctx.field(),
                format!("String must be at least {} characters (got {})", min, char_count),
            ));
        }
    }

    if let Some(max) = constraints.max_length {
        if char_count > max {
            errors.add(ValidationError::value_error(
                ctx.location(),
                ctx.field(),
                format!("String must be at most {} characters (got {})", max, char_count),
            ));
        }
    }

    if let Some(pattern) = &constraints.pattern {
        match pattern.regex() {
            Ok(re) if !re.is_match(s) => errors.add(ValidationError::value_error(
                ctx.location(),
                ctx.field(),
                format!("String does not match pattern: {}", pattern.as_str()),
            )),
            Ok(_) => {}
            Err(e) => errors.add(ValidationError::value_error(
                ctx.location(),
                ctx.field(),
                format!("Invalid regex pattern: {}", e),
            )),
        }
    }

    if let Some(format) = constraints.format {
        if !format.matches(s) {
            errors.add(ValidationError::new(
                ctx.location(),
                ctx.field(),
                format!("Invalid {} format", format.name()),
                crate::errors::ErrorType::FormatError,
            ));
        }
    }

    Bson::String(s.to_string())
}

fn check_bounds<T>(
    n: T,
    constraints: &NumericConstraints<T>,
    ctx: &ValidationContext,
    errors: &mut ValidationErrors,
) where
    T: PartialOrd + Copy + std::fmt::Display,
{
    let mut fail = |message: String| {
        errors.add(ValidationError::value_error(ctx.location(), ctx.field(), message));
    };
    if let Some(min) = constraints.minimum {
        if n < min {
            fail(format!("Value must be >= {} (got {})", min, n));
        }
    }
    if let Some(max) = constraints.maximum {
        if n > max {
            fail(format!("Value must be <= {} (got {})", max, n));
        }
    }
    if let Some(min) = constraints.exclusive_minimum {
        if n <= min {
            fail(format!("Value must be > {} (got {})", min, n));
        }
    }
    if let Some(max) = constraints.exclusive_maximum {
        if n >= max {
            fail(format!("Value must be < {} (got {})", max, n));
        }
    }
}

fn validate_int(
    value: &Bson,
    constraints: &NumericConstraints<i64>,
    ctx: &ValidationContext,
    errors: &mut ValidationErrors,
) -> Bson {
    let (n, output) = match value {
        Bson::Int32(i) => (*i as i64, value.clone()),
        Bson::Int64(i) => (*i, value.clone()),
        // Integral doubles arrive from JSON-shaped input
        Bson::Double(f) if f.is_finite() && f.fract() == 0.0 => (*f as i64, Bson::Int64(*f as i64)),
        other => return type_mismatch(other, "integer", ctx, errors),
    };

    check_bounds(n, constraints, ctx, errors);
    if let Some(step) = constraints.multiple_of {
        // `checked_rem` is `None` for a zero step and for `i64::MIN % -1`,
        // which is a multiple
        if n.checked_rem(step).is_some_and(|rem| rem != 0) {
            errors.add(ValidationError::value_error(
                ctx.location(),
                ctx.field(),
                format!("Value must be a multiple of {} (got {})", step, n),
            ));
        }
    }
    output
}

fn validate_number(
    value: &Bson,
    constraints: &NumericConstraints<f64>,
    ctx: &ValidationContext,
    errors: &mut ValidationErrors,
) -> Bson {
    let n = match value {
        Bson::Int32(i) => *i as f64,
        Bson::Int64(i) => *i as f64,
        Bson::Double(f) => *f,
        other => return type_mismatch(other, "number", ctx, errors),
    };

    if !n.is_finite() {
        errors.add(ValidationError::value_error(
            ctx.location(),
            ctx.field(),
            "Number must be finite".to_string(),
        ));
        return value.clone();
    }

    check_bounds(n, constraints, ctx, errors);
    if let Some(step) = constraints.multiple_of {
        if step != 0.0 && (n / step).fract().abs() > f64::EPSILON {
            errors.add(ValidationError::value_error(
                ctx.location(),
                ctx.field(),
                format!("Value must be a multiple of {} (got {})", step, n),
            ));
        }
    }
    value.clone()
}

fn validate_object_id(value: &Bson, ctx: &ValidationContext, errors: &mut ValidationErrors) -> Bson {
    match value {
        Bson::ObjectId(_) => value.clone(),
        Bson::String(s) => match ObjectId::parse_str(s) {
            Ok(oid) => Bson::ObjectId(oid),
            Err(_) => {
                errors.add(ValidationError::type_error(
                    ctx.location(),
                    ctx.field(),
                    format!("Invalid ObjectId: {}", s),
                ));
                value.clone()
            }
        },
        other => type_mismatch(other, "ObjectId", ctx, errors),
    }
}

fn validate_date_time(value: &Bson, ctx: &ValidationContext, errors: &mut ValidationErrors) -> Bson {
    match value {
        Bson::DateTime(_) => value.clone(),
        Bson::String(s) => match chrono::DateTime::parse_from_rfc3339(s) {
            Ok(parsed) => Bson::DateTime(bson::DateTime::from_chrono(
                parsed.with_timezone(&chrono::Utc),
            )),
            Err(_) => {
                errors.add(ValidationError::type_error(
                    ctx.location(),
                    ctx.field(),
                    format!("Invalid date-time: {}", s),
                ));
                value.clone()
            }
        },
        other => type_mismatch(other, "date-time", ctx, errors),
    }
}

fn validate_enum(
    value: &Bson,
    values: &[Bson],
    ctx: &ValidationContext,
    errors: &mut ValidationErrors,
) -> Bson {
    if !values.contains(value) {
        let allowed: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        errors.add(ValidationError::value_error(
            ctx.location(),
            ctx.field(),
            format!("Value must be one of [{}]", allowed.join(", ")),
        ));
    }
    value.clone()
}

// ============================================================================
// Arrays
// ============================================================================

fn validate_array(
    value: &Bson,
    items: &Schema,
    constraints: &ListConstraints,
    ctx: &mut ValidationContext,
    errors: &mut ValidationErrors,
) -> Bson {
    match value {
        Bson::Array(array) => {
            if let Some(min) = constraints.min_items {
                if array.len() < min {
                    errors.add(ValidationError::value_error(
                        ctx.location(),
                        ctx.field(),
                        format!("Array must have at least {} items (got {})", min, array.len()),
                    ));
                }
            }
            if let Some(max) = constraints.max_items {
                if array.len() > max {
                    errors.add(ValidationError::value_error(
                        ctx.location(),
                        ctx.field(),
                        format!("Array must have at most {} items (got {})", max, array.len()),
                    ));
                }
            }

            let mut output = Vec::with_capacity(array.len());
            for (i, item) in array.iter().enumerate() {
                ctx.push(&format!("[{}]", i));
                output.push(validate_value(item, items, ctx, errors));
                ctx.pop();
            }

            if constraints.unique_items {
                for (i, item) in output.iter().enumerate() {
                    if output[..i].contains(item) {
                        errors.add(ValidationError::value_error(
                            ctx.location(),
                            ctx.field(),
                            format!("Array items must be unique (duplicate at index {})", i),
                        ));
                        break;
                    }
                }
            }
            Bson::Array(output)
        }
        // `{ "0": .., "$[elem]": .. }` addressing elements of an array
        Bson::Document(document)
            if ctx.keyed_arrays && document.keys().all(|k| is_array_segment(k)) =>
        {
            let mut output = Document::new();
            for (key, item) in document {
                ctx.push(key);
                output.insert(key.clone(), validate_value(item, items, ctx, errors));
                ctx.pop();
            }
            Bson::Document(output)
        }
        other => type_mismatch(other, "array", ctx, errors),
    }
}

// ============================================================================
// Objects
// ============================================================================

enum Missing {
    Required,
    Skip,
    Default(Bson),
}

fn missing_value(schema: &Schema) -> Missing {
    match schema {
        Schema::Optional {
            default: Some(default),
            ..
        } => Missing::Default(default.produce()),
        Schema::Optional { default: None, .. } | Schema::Any => Missing::Skip,
        Schema::Lazy(lazy) => missing_value(lazy.resolve()),
        _ => Missing::Required,
    }
}

fn validate_object(
    document: &Document,
    object: &ObjectSchema,
    ctx: &mut ValidationContext,
    errors: &mut ValidationErrors,
) -> Document {
    let mut output = Document::new();

    for (name, field_schema) in &object.fields {
        match document.get(name) {
            Some(value) => {
                ctx.push(name);
                let validated = validate_value(value, field_schema, ctx, errors);
                ctx.pop();
                output.insert(name.clone(), validated);
            }
            None => match missing_value(field_schema) {
                Missing::Default(value) => {
                    output.insert(name.clone(), value);
                }
                Missing::Skip => {}
                Missing::Required => {
                    ctx.push(name);
                    errors.add(ValidationError::missing_error(ctx.location(), ctx.field()));
                    ctx.pop();
                }
            },
        }
    }

    for (key, value) in document {
        if object.field(key).is_some() {
            continue;
        }
        match object.additional {
            AdditionalFields::Forbid => {
                ctx.push(key);
                errors.add(ValidationError::extra_error(ctx.location(), ctx.field()));
                ctx.pop();
            }
            AdditionalFields::Allow => {
                output.insert(key.clone(), value.clone());
            }
            AdditionalFields::Strip => {}
        }
    }

    output
}

// ============================================================================
// Unions
// ============================================================================

fn validate_union(
    value: &Bson,
    variants: &[Schema],
    ctx: &mut ValidationContext,
    errors: &mut ValidationErrors,
) -> Bson {
    for variant in variants {
        let mut attempt = ValidationErrors::new();
        let mut scratch = ctx.clone();
        let output = validate_value(value, variant, &mut scratch, &mut attempt);
        if attempt.is_empty() {
            return output;
        }
    }

    let names: Vec<&str> = variants.iter().map(Schema::type_name).collect();
    errors.add(ValidationError::type_error(
        ctx.location(),
        ctx.field(),
        format!("Value does not match any of [{}]", names.join(", ")),
    ));
    value.clone()
}
