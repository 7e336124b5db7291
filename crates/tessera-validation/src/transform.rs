//! Schema transforms
//!
//! All transforms return new schemas; inputs are never mutated. Lazy schemas
//! stay lazy where the transform recurses, so recursive shapes remain finite.

use crate::schema::{is_array_segment, AdditionalFields, ObjectSchema, Schema};

/// Make every top-level field optional and drop field defaults
pub fn partial(schema: &Schema) -> Schema {
    map_object(schema, &|object| ObjectSchema {
        fields: object
            .fields
            .iter()
            .map(|(key, field)| (key.clone(), without_default(field).optional()))
            .collect(),
        additional: object.additional,
    })
}

/// [`partial`] applied at every depth, through arrays, optionals and unions
pub fn deep_partial(schema: &Schema) -> Schema {
    match schema {
        Schema::Object(object) => Schema::Object(ObjectSchema {
            fields: object
                .fields
                .iter()
                .map(|(key, field)| (key.clone(), deep_partial(field).optional()))
                .collect(),
            additional: object.additional,
        }),
        Schema::Array { items, constraints } => Schema::Array {
            items: Box::new(deep_partial(items)),
            constraints: constraints.clone(),
        },
        Schema::Optional { inner, .. } => Schema::Optional {
            inner: Box::new(deep_partial(inner)),
            default: None,
        },
        Schema::Union(variants) => Schema::Union(variants.iter().map(deep_partial).collect()),
        Schema::Lazy(lazy) => {
            let lazy = lazy.clone();
            Schema::lazy(move || deep_partial(lazy.resolve()))
        }
        other => other.clone(),
    }
}

/// Keep only the named fields
pub fn pick(schema: &Schema, keys: &[&str]) -> Schema {
    map_object(schema, &|object| ObjectSchema {
        fields: object
            .fields
            .iter()
            .filter(|(key, _)| keys.contains(&key.as_str()))
            .cloned()
            .collect(),
        additional: object.additional,
    })
}

/// Drop the named fields
pub fn omit(schema: &Schema, keys: &[&str]) -> Schema {
    map_object(schema, &|object| ObjectSchema {
        fields: object
            .fields
            .iter()
            .filter(|(key, _)| !keys.contains(&key.as_str()))
            .cloned()
            .collect(),
        additional: object.additional,
    })
}

/// Merge the fields of `extension` into `base`; `extension` wins on conflicts
pub fn extends(base: &Schema, extension: &Schema) -> Schema {
    let Some(extra) = extension.as_object() else {
        return base.clone();
    };
    map_object(base, &|object| {
        let mut merged = object.clone();
        for (key, field) in &extra.fields {
            merged.set_field(key, field.clone());
        }
        merged
    })
}

/// Array of `schema`
pub fn array(schema: &Schema) -> Schema {
    Schema::array(schema.clone())
}

/// Narrow `array<T>` to `T`; any other schema is returned unchanged
pub fn element(schema: &Schema) -> Schema {
    match schema.unwrapped() {
        Schema::Array { items, .. } => (**items).clone(),
        _ => schema.clone(),
    }
}

/// Sub-schema addressed by dotted path segments.
///
/// Numeric and positional segments (`0`, `$`, `$[]`, `$[id]`) descend into
/// array items. Unknown keys resolve to `Any` when the object allows extra
/// fields and to `None` when it forbids them.
pub fn at_path(schema: &Schema, segments: &[&str]) -> Option<Schema> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(schema.clone());
    };
    match schema {
        Schema::Optional { inner, .. } => at_path(inner, segments),
        Schema::Lazy(lazy) => at_path(lazy.resolve(), segments),
        Schema::Any => Some(Schema::Any),
        Schema::Object(object) => match object.field(head) {
            Some(field) => at_path(field, rest),
            None if object.additional == AdditionalFields::Forbid => None,
            None => Some(Schema::Any),
        },
        Schema::Array { items, .. } if is_array_segment(head) => at_path(items, rest),
        Schema::Union(variants) => variants.iter().find_map(|v| at_path(v, segments)),
        _ => None,
    }
}

/// Replace the sub-schema at `segments`. `Optional` wrappers along the path,
/// including one on the target field itself, are kept.
///
/// Paths that do not resolve leave the schema unchanged.
pub fn override_path(schema: &Schema, segments: &[&str], replacement: Schema) -> Schema {
    let Some((head, rest)) = segments.split_first() else {
        return replacement;
    };
    match schema {
        Schema::Optional { inner, default } => Schema::Optional {
            inner: Box::new(override_path(inner, segments, replacement)),
            default: default.clone(),
        },
        Schema::Lazy(lazy) => override_path(lazy.resolve(), segments, replacement),
        Schema::Object(object) => {
            let mut object = object.clone();
            if let Some(slot) = object.field_mut(head) {
                *slot = match (rest.is_empty(), &*slot) {
                    (true, Schema::Optional { default, .. }) => Schema::Optional {
                        inner: Box::new(replacement),
                        default: default.clone(),
                    },
                    _ => override_path(slot, rest, replacement),
                };
            }
            Schema::Object(object)
        }
        Schema::Array { items, constraints } if is_array_segment(head) => Schema::Array {
            items: Box::new(override_path(items, rest, replacement)),
            constraints: constraints.clone(),
        },
        other => other.clone(),
    }
}

fn without_default(schema: &Schema) -> Schema {
    match schema {
        Schema::Optional { inner, .. } => Schema::Optional {
            inner: inner.clone(),
            default: None,
        },
        other => other.clone(),
    }
}

fn map_object(schema: &Schema, f: &dyn Fn(&ObjectSchema) -> ObjectSchema) -> Schema {
    match schema {
        Schema::Object(object) => Schema::Object(f(object)),
        Schema::Optional { inner, default } => Schema::Optional {
            inner: Box::new(map_object(inner, f)),
            default: default.clone(),
        },
        Schema::Lazy(lazy) => map_object(lazy.resolve(), f),
        other => other.clone(),
    }
}
