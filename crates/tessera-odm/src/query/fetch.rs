//! Out-of-band relation resolution
//!
//! A fetch runs a second query against the target model once the primary
//! documents are materialised, so the target may live on any connection.
//! The follow-up goes through the target's own `find`/`find_one` and picks
//! up its hooks.

use super::populate::PopulateOptions;
use super::Resolve;
use crate::model::Model;
use crate::path::{deep_value, map_deep_value, split_path};
use crate::transaction::SessionBinding;
use bson::{doc, Bson, Document};
use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use tessera_common::Result;
use tracing::debug;

#[derive(Clone)]
pub(crate) struct FetchConfig {
    pub(crate) field: String,
    pub(crate) model: Model,
    pub(crate) options: PopulateOptions,
    /// `fetch_one`: scalar references resolve to one document
    pub(crate) singular: bool,
}

/// Resolve every fetch in order; fields are processed one after another
pub(crate) async fn resolve_fetches(
    mut documents: Vec<Document>,
    fetches: &[FetchConfig],
    session: Option<&SessionBinding>,
) -> Result<Vec<Document>> {
    for fetch in fetches {
        let session = session.and_then(|s| s.for_index(fetch.model.connection_index()));
        documents = if crosses_array(&documents, &fetch.field) {
            fetch_batched(documents, fetch, session).await?
        } else {
            fetch_per_document(documents, fetch, session).await?
        };
    }
    Ok(documents)
}

fn crosses_array(documents: &[Document], field: &str) -> bool {
    let segments = split_path(field);
    documents
        .iter()
        .any(|d| deep_value(&Bson::Document(d.clone()), &segments).is_plural)
}

/// String form used to match references with fetched documents
fn bson_key(value: &Bson) -> String {
    match value {
        Bson::ObjectId(id) => id.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_empty_reference(value: &Bson) -> bool {
    match value {
        Bson::Null | Bson::Undefined => true,
        Bson::String(s) => s.is_empty(),
        Bson::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn collect_ids(value: &Bson, ids: &mut Vec<Bson>, seen: &mut HashSet<String>) {
    match value {
        Bson::Array(items) => {
            for item in items {
                collect_ids(item, ids, seen);
            }
        }
        Bson::Null | Bson::Undefined => {}
        id => {
            if seen.insert(bson_key(id)) {
                ids.push(id.clone());
            }
        }
    }
}

/// Replace a reference with its fetched documents, keeping its shape. Arrays
/// keep their nesting and drop ids that found nothing; each id in an array
/// becomes its first match (`fetch_one`) or all of its matches. A scalar
/// reference always becomes one document, or `Null` when nothing matched.
fn splice(reference: &Bson, groups: &HashMap<String, Vec<Document>>, singular: bool) -> Bson {
    match reference {
        Bson::Array(items) => Bson::Array(
            items
                .iter()
                .flat_map(|item| match item {
                    Bson::Array(_) => vec![splice(item, groups, singular)],
                    id => match groups.get(&bson_key(id)) {
                        Some(found) if singular => {
                            found.first().cloned().map(Bson::Document).into_iter().collect()
                        }
                        Some(found) => found.iter().cloned().map(Bson::Document).collect(),
                        None => Vec::new(),
                    },
                })
                .collect(),
        ),
        Bson::Null | Bson::Undefined => Bson::Null,
        id => groups
            .get(&bson_key(id))
            .and_then(|found| found.first().cloned())
            .map_or(Bson::Null, Bson::Document),
    }
}

/// One `$in` query for every reference of every document
async fn fetch_batched(
    documents: Vec<Document>,
    fetch: &FetchConfig,
    session: Option<SessionBinding>,
) -> Result<Vec<Document>> {
    let segments = split_path(&fetch.field);
    let foreign_field = fetch.options.foreign_field_or_id();

    let mut ids = Vec::new();
    let mut seen = HashSet::new();
    for document in &documents {
        let found = deep_value(&Bson::Document(document.clone()), &segments);
        if found.exists {
            collect_ids(&found.value, &mut ids, &mut seen);
        }
    }

    let mut groups: HashMap<String, Vec<Document>> = HashMap::new();
    if !ids.is_empty() {
        debug!(field = %fetch.field, ids = ids.len(), "fetching references");
        let mut query = fetch.model.find(doc! { foreign_field: { "$in": ids } });
        if let Some(filter) = &fetch.options.filter {
            query = query.filter(filter.clone());
        }
        if let Some(sort) = &fetch.options.sort {
            query = query.sort(sort.clone());
        }
        if let Some(project) = &fetch.options.project {
            query = query.project(project.clone());
        }
        if let Some(having) = &fetch.options.having {
            query = query.filter(having.clone());
        }
        if let Some(session) = session {
            query = query.session(session)?;
        }

        for found in query.resolve().await? {
            let keys = match found.get(foreign_field) {
                Some(Bson::Array(values)) => values.iter().map(bson_key).collect(),
                Some(value) => vec![bson_key(value)],
                None => Vec::new(),
            };
            for key in keys {
                groups.entry(key).or_default().push(found.clone());
            }
        }
    }

    Ok(documents
        .into_iter()
        .map(|document| {
            let mut root = Bson::Document(document);
            map_deep_value(&mut root, &segments, &mut |reference| {
                splice(reference, &groups, fetch.singular)
            });
            match root {
                Bson::Document(document) => document,
                _ => Document::new(),
            }
        })
        .collect())
}

/// One query per document, with every option applied as in `populate`
async fn fetch_per_document(
    documents: Vec<Document>,
    fetch: &FetchConfig,
    session: Option<SessionBinding>,
) -> Result<Vec<Document>> {
    let segments = split_path(&fetch.field);
    let foreign_field = fetch.options.foreign_field_or_id();
    let options = &fetch.options;

    try_join_all(documents.into_iter().map(|document| {
        let segments = &segments;
        let session = session.clone();
        async move {
            let found = deep_value(&Bson::Document(document.clone()), segments);
            if !found.exists || is_empty_reference(&found.value) {
                return Ok(document);
            }

            let filter = match &found.value {
                Bson::Array(ids) => doc! { foreign_field: { "$in": ids.clone() } },
                id => doc! { foreign_field: id.clone() },
            };

            let replacement = if fetch.singular {
                let mut query = fetch.model.find_one(filter);
                if let Some(f) = &options.filter {
                    query = query.filter(f.clone());
                }
                if let Some(sort) = &options.sort {
                    query = query.sort(sort.clone());
                }
                if let Some(skip) = options.skip {
                    query = query.skip(skip);
                }
                if let Some(project) = &options.project {
                    query = query.project(project.clone());
                }
                if let Some(having) = &options.having {
                    query = query.filter(having.clone());
                }
                if let Some(session) = session {
                    query = query.session(session)?;
                }
                query.resolve().await?.map_or(Bson::Null, Bson::Document)
            } else {
                let mut query = fetch.model.find(filter);
                if let Some(f) = &options.filter {
                    query = query.filter(f.clone());
                }
                if let Some(sort) = &options.sort {
                    query = query.sort(sort.clone());
                }
                if let Some(skip) = options.skip {
                    query = query.skip(skip);
                }
                if let Some(limit) = options.limit {
                    query = query.limit(limit);
                }
                if let Some(project) = &options.project {
                    query = query.project(project.clone());
                }
                if let Some(having) = &options.having {
                    query = query.filter(having.clone());
                }
                if let Some(session) = session {
                    query = query.session(session)?;
                }
                Bson::Array(query.resolve().await?.into_iter().map(Bson::Document).collect())
            };

            let mut root = Bson::Document(document);
            map_deep_value(&mut root, segments, &mut |_| replacement.clone());
            Ok(match root {
                Bson::Document(document) => document,
                _ => Document::new(),
            })
        }
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{bson, oid::ObjectId};

    fn groups(entries: &[(&ObjectId, Document)]) -> HashMap<String, Vec<Document>> {
        let mut groups: HashMap<String, Vec<Document>> = HashMap::new();
        for (id, doc) in entries {
            groups.entry(id.to_hex()).or_default().push(doc.clone());
        }
        groups
    }

    #[test]
    fn test_collect_ids_flattens_and_dedupes() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        collect_ids(&bson!([[a, b], [a], null, [b]]), &mut ids, &mut seen);
        assert_eq!(ids, vec![Bson::ObjectId(a), Bson::ObjectId(b)]);
    }

    #[test]
    fn test_splice_keeps_nesting_and_drops_unresolved() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        let missing = ObjectId::new();
        let found = groups(&[(&a, doc! { "_id": a, "n": 1 }), (&b, doc! { "_id": b, "n": 2 })]);

        let spliced = splice(&bson!([[a, missing], [b]]), &found, false);
        assert_eq!(
            spliced,
            bson!([[{ "_id": a, "n": 1 }], [{ "_id": b, "n": 2 }]])
        );

        assert_eq!(splice(&bson!(missing), &found, true), Bson::Null);
        assert_eq!(splice(&bson!(a), &found, true), bson!({ "_id": a, "n": 1 }));
        assert_eq!(splice(&Bson::Null, &found, true), Bson::Null);
    }

    #[test]
    fn test_scalar_reference_under_plural_path_stays_scalar() {
        let a = ObjectId::new();
        let missing = ObjectId::new();
        let found = groups(&[(&a, doc! { "_id": a, "n": 1 })]);

        assert_eq!(splice(&bson!(a), &found, false), bson!({ "_id": a, "n": 1 }));
        assert_eq!(splice(&bson!(missing), &found, false), Bson::Null);

        let mut post = bson!({ "comments": [{ "user": a }, { "user": missing }] });
        map_deep_value(&mut post, &["comments", "user"], &mut |reference| {
            splice(reference, &found, false)
        });
        assert_eq!(
            post,
            bson!({ "comments": [{ "user": { "_id": a, "n": 1 } }, { "user": null }] })
        );
    }

    #[test]
    fn test_empty_references() {
        assert!(is_empty_reference(&Bson::Null));
        assert!(is_empty_reference(&bson!([])));
        assert!(is_empty_reference(&bson!("")));
        assert!(!is_empty_reference(&bson!(ObjectId::new())));
    }

    #[test]
    fn test_keys_match_across_id_representations() {
        let id = ObjectId::new();
        assert_eq!(bson_key(&Bson::ObjectId(id)), id.to_hex());
        assert_eq!(bson_key(&Bson::String(id.to_hex())), id.to_hex());
    }
}
