//! Dotted-path helpers over BSON documents
//!
//! Conversions between flat `a.b.c` maps and nested documents, path walking
//! that reports when an array was crossed, and the flattened view of an
//! update-modifier document.

use bson::{Bson, Document};
use tessera_validation::is_positional_segment;

/// Operators whose values become part of the "modifications" view
const MODIFICATION_OPERATORS: [&str; 4] = ["$set", "$setOnInsert", "$push", "$addToSet"];

pub fn split_path(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

/// `{"a.b": 1, "a.c": 2}` to `{a: {b: 1, c: 2}}`.
///
/// A prefix used both as a leaf and as a branch keeps whichever was written last.
pub fn dot_notation_to_deep_object(flat: &Document) -> Document {
    let mut nested = Document::new();
    for (key, value) in flat {
        insert_deep(&mut nested, &split_path(key), value.clone());
    }
    nested
}

fn insert_deep(target: &mut Document, segments: &[&str], value: Bson) {
    match segments {
        [] => {}
        [leaf] => {
            target.insert(*leaf, value);
        }
        [head, rest @ ..] => {
            if !matches!(target.get(*head), Some(Bson::Document(_))) {
                target.insert(*head, Document::new());
            }
            if let Some(Bson::Document(child)) = target.get_mut(*head) {
                insert_deep(child, rest, value);
            }
        }
    }
}

// ============================================================================
// Deep values
// ============================================================================

/// Result of walking a path through a value
#[derive(Debug, Clone, PartialEq)]
pub struct DeepValue {
    pub exists: bool,
    /// Terminal value; one entry per element (`Null` where missing) when plural
    pub value: Bson,
    /// An array was crossed at a non-numeric segment
    pub is_plural: bool,
}

impl DeepValue {
    fn absent(is_plural: bool) -> Self {
        Self {
            exists: false,
            value: Bson::Null,
            is_plural,
        }
    }
}

/// Walk `segments` from `value`.
///
/// Numeric segments index into arrays. Any other segment applied to an array
/// maps over its elements and marks the result plural, keeping one output
/// entry per element so positions line up with the source.
pub fn deep_value(value: &Bson, segments: &[&str]) -> DeepValue {
    let Some((head, rest)) = segments.split_first() else {
        return DeepValue {
            exists: true,
            value: value.clone(),
            is_plural: false,
        };
    };

    match value {
        Bson::Document(doc) => match doc.get(*head) {
            Some(child) => deep_value(child, rest),
            None => DeepValue::absent(false),
        },
        Bson::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                return match items.get(index) {
                    Some(child) => deep_value(child, rest),
                    None => DeepValue::absent(false),
                };
            }
            let resolved: Vec<DeepValue> = items.iter().map(|item| deep_value(item, segments)).collect();
            if !resolved.iter().any(|r| r.exists) {
                return DeepValue::absent(true);
            }
            DeepValue {
                exists: true,
                value: Bson::Array(
                    resolved
                        .into_iter()
                        .map(|r| if r.exists { r.value } else { Bson::Null })
                        .collect(),
                ),
                is_plural: true,
            }
        }
        _ => DeepValue::absent(false),
    }
}

/// Replace every value addressed by `segments` with `f(old)`, mapping over
/// arrays crossed on the way. Missing keys are left missing.
pub fn map_deep_value(target: &mut Bson, segments: &[&str], f: &mut dyn FnMut(&Bson) -> Bson) {
    let Some((head, rest)) = segments.split_first() else {
        *target = f(target);
        return;
    };

    match target {
        Bson::Document(doc) => {
            if let Some(child) = doc.get_mut(*head) {
                map_deep_value(child, rest, f);
            }
        }
        Bson::Array(items) => match head.parse::<usize>() {
            Ok(index) => {
                if let Some(child) = items.get_mut(index) {
                    map_deep_value(child, rest, f);
                }
            }
            Err(_) => {
                for item in items.iter_mut() {
                    map_deep_value(item, segments, f);
                }
            }
        },
        _ => {}
    }
}

// ============================================================================
// Re-flattening
// ============================================================================

/// Rewrites one path segment given the container it is applied to
pub type SegmentResolver<'a> = &'a dyn Fn(&str, &Bson) -> String;

/// Post-processes the value extracted for one key
pub type ValueModifier<'a> = &'a dyn Fn(&str, Bson) -> Bson;

#[derive(Default, Clone, Copy)]
pub struct AssignOptions<'a> {
    pub modifier: Option<ValueModifier<'a>>,
    pub resolver: Option<SegmentResolver<'a>>,
}

/// Maps a positional segment applied to an array onto its first element
pub fn positional_resolver(segment: &str, container: &Bson) -> String {
    match container {
        Bson::Array(_) if is_positional_segment(segment) => "0".to_string(),
        _ => segment.to_string(),
    }
}

/// Read each dotted key back out of a nested `source`. Keys that do not
/// resolve are left out of the result.
pub fn assign_deep_values<'k>(
    keys: impl IntoIterator<Item = &'k str>,
    source: &Document,
    options: AssignOptions<'_>,
) -> Document {
    let root = Bson::Document(source.clone());
    let mut assigned = Document::new();
    for key in keys {
        let Some(value) = lookup(&root, &split_path(key), options.resolver) else {
            continue;
        };
        let value = match options.modifier {
            Some(modifier) => modifier(key, value),
            None => value,
        };
        assigned.insert(key, value);
    }
    assigned
}

fn lookup(value: &Bson, segments: &[&str], resolver: Option<SegmentResolver<'_>>) -> Option<Bson> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    let segment = match resolver {
        Some(resolve) => resolve(head, value),
        None => head.to_string(),
    };
    match value {
        Bson::Document(doc) => lookup(doc.get(&segment)?, rest, resolver),
        Bson::Array(items) => lookup(items.get(segment.parse::<usize>().ok()?)?, rest, resolver),
        _ => None,
    }
}

// ============================================================================
// Key filters
// ============================================================================

pub type PropTransform<'a> = &'a dyn Fn(&str, &Bson) -> Bson;

/// Shallow subset of `doc` with only `keys`, in `doc` order
pub fn pick_props(doc: &Document, keys: &[&str], transform: Option<PropTransform<'_>>) -> Document {
    filter_props(doc, |key| keys.contains(&key), transform)
}

/// Shallow subset of `doc` without `keys`, in `doc` order
pub fn omit_props(doc: &Document, keys: &[&str], transform: Option<PropTransform<'_>>) -> Document {
    filter_props(doc, |key| !keys.contains(&key), transform)
}

fn filter_props(
    doc: &Document,
    keep: impl Fn(&str) -> bool,
    transform: Option<PropTransform<'_>>,
) -> Document {
    doc.iter()
        .filter(|(key, _)| keep(key.as_str()))
        .map(|(key, value)| {
            let value = match transform {
                Some(transform) => transform(key, value),
                None => value.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}

// ============================================================================
// Modifications view
// ============================================================================

/// Flatten `$set`, `$setOnInsert`, `$push` and `$addToSet` into one dotted map.
///
/// Pushed values always appear as arrays (the `$each` payload or the single
/// pushed value). A trailing or inner `$` segment becomes `0`; array-filter
/// placeholders such as `$[elem]` are kept verbatim.
pub fn mongodb_modifiers_to_object(updates: &Document) -> Document {
    let mut flat = Document::new();
    for operator in MODIFICATION_OPERATORS {
        let Ok(fields) = updates.get_document(operator) else {
            continue;
        };
        let pushes = matches!(operator, "$push" | "$addToSet");
        for (key, value) in fields {
            let value = if pushes {
                match value {
                    Bson::Document(modifier) if modifier.contains_key("$each") => {
                        modifier.get("$each").cloned().unwrap_or(Bson::Null)
                    }
                    other => Bson::Array(vec![other.clone()]),
                }
            } else {
                value.clone()
            };
            flat.insert(normalize_positional(key), value);
        }
    }
    flat
}

fn normalize_positional(path: &str) -> String {
    split_path(path)
        .into_iter()
        .map(|segment| if segment == "$" { "0" } else { segment })
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{bson, doc, oid::ObjectId};

    #[test]
    fn test_dot_notation_to_deep_object() {
        let nested = dot_notation_to_deep_object(&doc! {
            "name": "Ada",
            "profile.city": "London",
            "profile.links.site": "ada.dev",
            "comments.$": { "body": "x" },
        });
        assert_eq!(
            nested,
            doc! {
                "name": "Ada",
                "profile": { "city": "London", "links": { "site": "ada.dev" } },
                "comments": { "$": { "body": "x" } },
            }
        );
    }

    #[test]
    fn test_deep_value_scalar_path() {
        let value = bson!({ "a": { "b": 3 } });
        let found = deep_value(&value, &["a", "b"]);
        assert!(found.exists && !found.is_plural);
        assert_eq!(found.value, Bson::Int32(3));

        let missing = deep_value(&value, &["a", "c", "d"]);
        assert!(!missing.exists);
    }

    #[test]
    fn test_deep_value_crossing_arrays_is_plural() {
        let value = bson!({
            "timeline": [
                { "user": "u1", "collaborators": ["c1", "c2"] },
                { "collaborators": ["c3"] },
                { "user": "u3" },
            ]
        });

        let users = deep_value(&value, &["timeline", "user"]);
        assert!(users.exists && users.is_plural);
        assert_eq!(users.value, bson!(["u1", null, "u3"]));

        let collaborators = deep_value(&value, &["timeline", "collaborators"]);
        assert_eq!(collaborators.value, bson!([["c1", "c2"], ["c3"], null]));

        let indexed = deep_value(&value, &["timeline", "0", "user"]);
        assert!(!indexed.is_plural);
        assert_eq!(indexed.value, bson!("u1"));
    }

    #[test]
    fn test_deep_value_over_empty_array() {
        let found = deep_value(&bson!({ "list": [] }), &["list", "ref"]);
        assert!(!found.exists);
        assert!(found.is_plural);
    }

    #[test]
    fn test_map_deep_value_keeps_positions() {
        let mut value = bson!({
            "timeline": [{ "user": 1 }, { "other": true }, { "user": 3 }]
        });
        map_deep_value(&mut value, &["timeline", "user"], &mut |old| {
            Bson::String(format!("user-{}", old))
        });
        assert_eq!(
            value,
            bson!({
                "timeline": [{ "user": "user-1" }, { "other": true }, { "user": "user-3" }]
            })
        );
    }

    #[test]
    fn test_assign_deep_values() {
        let source = doc! {
            "profile": { "city": "Oslo", "zip": "0150" },
            "tags": { "$": "rust" },
        };
        let assigned = assign_deep_values(
            ["profile.city", "tags.$", "missing.key"],
            &source,
            AssignOptions::default(),
        );
        assert_eq!(assigned, doc! { "profile.city": "Oslo", "tags.$": "rust" });
    }

    #[test]
    fn test_assign_deep_values_with_resolver_and_modifier() {
        let source = doc! { "tags": ["rust", "bson"] };
        let unwrap = |_: &str, value: Bson| match value {
            Bson::String(s) => Bson::String(s.to_uppercase()),
            other => other,
        };
        let assigned = assign_deep_values(
            ["tags.$"],
            &source,
            AssignOptions {
                modifier: Some(&unwrap),
                resolver: Some(&positional_resolver),
            },
        );
        assert_eq!(assigned, doc! { "tags.$": "RUST" });
    }

    #[test]
    fn test_pick_and_omit_props() {
        let doc = doc! { "a": 1, "b": 2, "c": 3 };
        assert_eq!(pick_props(&doc, &["c", "a"], None), doc! { "a": 1, "c": 3 });
        assert_eq!(omit_props(&doc, &["a"], None), doc! { "b": 2, "c": 3 });

        let double = |_: &str, v: &Bson| Bson::Int64(v.as_i32().map_or(0, |n| n as i64 * 2));
        assert_eq!(pick_props(&doc, &["b"], Some(&double)), doc! { "b": 4_i64 });
    }

    #[test]
    fn test_modifiers_to_object() {
        let id = ObjectId::new();
        let flat = mongodb_modifiers_to_object(&doc! {
            "$set": { "name": "Ada", "comments.$.body": "edited" },
            "$push": {
                "tags": "rust",
                "invoices.$[invoice1].items": { "$each": [{ "_id": id }], "$slice": 5 },
            },
            "$addToSet": { "roles": "admin" },
            "$inc": { "views": 1 },
        });
        assert_eq!(
            flat,
            doc! {
                "name": "Ada",
                "comments.0.body": "edited",
                "tags": ["rust"],
                "invoices.$[invoice1].items": [{ "_id": id }],
                "roles": ["admin"],
            }
        );

        let nested = dot_notation_to_deep_object(&flat);
        assert_eq!(
            nested.get_document("invoices").unwrap().get_document("$[invoice1]").unwrap(),
            &doc! { "items": [{ "_id": id }] }
        );
    }
}
