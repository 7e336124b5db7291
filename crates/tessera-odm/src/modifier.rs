//! Schema validation of update-modifier documents
//!
//! Only the paths an update touches are validated. `$set` and `$setOnInsert`
//! run against a deep-partial schema, `$push` and `$addToSet` against the
//! element schema of the target array. Operators without a persisted value
//! shape (`$inc`, `$unset`, `$pull`, ...) pass through untouched.

use crate::path::{
    assign_deep_values, dot_notation_to_deep_object, omit_props, pick_props, split_path,
    AssignOptions,
};
use bson::{Bson, Document};
use tessera_validation::transform::{at_path, deep_partial, element, override_path};
use tessera_validation::{
    is_positional_segment, validate_document, validate_value, Schema, ValidationContext,
    ValidationError, ValidationErrors, ValidationResult,
};

const PUSH_MODIFIERS: [&str; 4] = ["$each", "$slice", "$position", "$sort"];

/// Validate every supported operator of `updates` against `schema`.
///
/// Errors from all operators are collected before failing, so one call
/// reports every bad path.
pub fn validate_modifiers(updates: &Document, schema: &Schema) -> ValidationResult<Document> {
    let mut errors = ValidationErrors::new();
    let mut output = Document::new();

    for (operator, value) in updates {
        let validated = match (operator.as_str(), value) {
            ("$set" | "$setOnInsert", Bson::Document(fields)) => validate_set(operator, fields, schema),
            ("$push" | "$addToSet", Bson::Document(fields)) => validate_push(operator, fields, schema),
            _ => {
                output.insert(operator.clone(), value.clone());
                continue;
            }
        };
        match validated {
            Ok(fields) => {
                output.insert(operator.clone(), fields);
            }
            Err(e) => errors.merge(e),
        }
    }

    errors.into_result(output)
}

/// `{ field: { $op: ... } }` values are database expressions, not data
fn is_expression(value: &Bson) -> bool {
    matches!(value, Bson::Document(doc) if doc.keys().any(|k| k.starts_with('$')))
}

fn is_push_modifier(doc: &Document) -> bool {
    doc.keys().any(|k| PUSH_MODIFIERS.contains(&k.as_str()))
}

fn validate_set(operator: &str, fields: &Document, schema: &Schema) -> ValidationResult<Document> {
    let expression_keys: Vec<&str> = fields
        .iter()
        .filter(|(_, value)| is_expression(value))
        .map(|(key, _)| key.as_str())
        .collect();
    let expressions = pick_props(fields, &expression_keys, None);
    let plain = omit_props(fields, &expression_keys, None);

    // A positional write replaces a whole element, so that element is
    // validated against its full schema.
    let mut composite = deep_partial(schema);
    for key in plain.keys() {
        let segments = split_path(key);
        if segments.last().is_some_and(|s| is_positional_segment(s)) {
            if let Some(full) = at_path(schema, &segments) {
                composite = override_path(&composite, &segments, full);
            }
        }
    }

    let mut ctx = ValidationContext::for_update(operator);
    let validated = validate_document(&dot_notation_to_deep_object(&plain), &composite, &mut ctx)?;
    let assigned = assign_deep_values(
        plain.keys().map(String::as_str),
        &validated,
        AssignOptions::default(),
    );

    let mut output = Document::new();
    for key in fields.keys() {
        if let Some(value) = expressions.get(key).or_else(|| assigned.get(key)) {
            output.insert(key.clone(), value.clone());
        }
    }
    Ok(output)
}

/// A bare array pushed without `$each` inserts its first element. Arrays of
/// arrays and untyped arrays keep the value as the element itself.
fn first_of_bare_array(value: &Bson, target: &Schema, item: &Schema) -> Bson {
    match value {
        Bson::Array(values)
            if target.is_array() && !item.is_array() && !matches!(item.unwrapped(), Schema::Any) =>
        {
            values.first().cloned().unwrap_or(Bson::Null)
        }
        other => other.clone(),
    }
}

fn validate_push(operator: &str, fields: &Document, schema: &Schema) -> ValidationResult<Document> {
    let mut errors = ValidationErrors::new();
    let mut output = Document::new();

    for (key, value) in fields {
        let segments = split_path(key);
        let mut ctx = ValidationContext::for_update(operator);
        for segment in &segments {
            ctx.push(segment);
        }

        let Some(target) = at_path(schema, &segments) else {
            errors.add(ValidationError::extra_error(ctx.location(), ctx.field()));
            continue;
        };
        let item = element(&target);

        match value {
            Bson::Document(modifier) if is_push_modifier(modifier) => {
                let mut modifier = modifier.clone();
                if let Some(each) = modifier.get("$each").cloned() {
                    ctx.push("$each");
                    let validated =
                        validate_value(&each, &Schema::array(item), &mut ctx, &mut errors);
                    modifier.insert("$each", validated);
                }
                output.insert(key.clone(), modifier);
            }
            single => {
                let single = first_of_bare_array(single, &target, &item);
                let validated = validate_value(&single, &item, &mut ctx, &mut errors);
                output.insert(key.clone(), validated);
            }
        }
    }

    errors.into_result(output)
}
