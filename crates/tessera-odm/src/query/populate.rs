//! Embedded population through `$lookup`

use crate::model::Model;
use bson::{doc, Bson, Document};

/// Options shared by `populate` and `fetch`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PopulateOptions {
    /// Field of the target collection matched against the reference; `_id` by default
    pub foreign_field: Option<String>,
    pub filter: Option<Document>,
    pub sort: Option<Document>,
    pub project: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
    /// Applied after skip/limit
    pub having: Option<Document>,
}

impl PopulateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn foreign_field(mut self, field: impl Into<String>) -> Self {
        self.foreign_field = Some(field.into());
        self
    }

    pub fn filter(mut self, filter: Document) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn sort(mut self, sort: Document) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn project(mut self, project: Document) -> Self {
        self.project = Some(project);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn having(mut self, having: Document) -> Self {
        self.having = Some(having);
        self
    }

    pub(crate) fn foreign_field_or_id(&self) -> &str {
        self.foreign_field.as_deref().unwrap_or("_id")
    }

    /// Stages appended inside the lookup, in fixed order
    pub(crate) fn stages(&self) -> Vec<Document> {
        let mut stages = Vec::new();
        if let Some(filter) = &self.filter {
            stages.push(doc! { "$match": filter.clone() });
        }
        if let Some(sort) = &self.sort {
            stages.push(doc! { "$sort": sort.clone() });
        }
        if let Some(project) = &self.project {
            stages.push(doc! { "$project": project.clone() });
        }
        if let Some(skip) = self.skip {
            stages.push(doc! { "$skip": skip as i64 });
        }
        if let Some(limit) = self.limit {
            stages.push(doc! { "$limit": limit });
        }
        if let Some(having) = &self.having {
            stages.push(doc! { "$match": having.clone() });
        }
        stages
    }
}

/// One population step carried by a model
#[derive(Clone)]
pub struct PopulateConfig {
    pub field: String,
    pub model: Model,
    pub options: PopulateOptions,
    /// `populate_one`: collapse the joined array to its first document
    pub unwind: bool,
}

impl PopulateConfig {
    /// Stages for this step, including the target model's own population
    pub(crate) fn pipeline(&self) -> Vec<Document> {
        let mut sub_pipeline: Vec<Document> = self
            .model
            .populate_configs()
            .iter()
            .flat_map(PopulateConfig::pipeline)
            .collect();
        sub_pipeline.extend(self.options.stages());

        populate_stages(
            &self.field,
            self.model.collection_name(),
            self.options.foreign_field_or_id(),
            sub_pipeline,
            self.unwind,
        )
    }
}

/// Aggregation stages joining `from` into `field`.
///
/// For a nested field (`parent.child`) the parent is unwound first and
/// regrouped by `_id` afterwards. Whether the parent was missing/null, an
/// empty array or a scalar is recorded before the unwind and restored at the
/// end. A missing or null top-level field stays absent instead of becoming
/// an empty array.
pub fn populate_stages(
    field: &str,
    from: &str,
    foreign_field: &str,
    sub_pipeline: Vec<Document>,
    unwind: bool,
) -> Vec<Document> {
    let parent = field.split('.').next().unwrap_or(field);
    let nested = field.contains('.');
    let is_null = format!("isNull_{}", parent);
    let is_array = format!("isArray_{}", parent);
    let is_empty = format!("isEmpty_{}", parent);
    let parent_ref = format!("${}", parent);

    let mut stages = Vec::new();

    if nested {
        stages.push(doc! {
            "$addFields": { is_null.as_str(): { "$cond": [parent_ref.as_str(), false, true] } }
        });
        stages.push(doc! {
            "$addFields": {
                is_array.as_str(): { "$isArray": parent_ref.as_str() },
                is_empty.as_str(): { "$eq": [parent_ref.as_str(), []] },
            }
        });
        stages.push(doc! {
            "$unwind": { "path": parent_ref.as_str(), "preserveNullAndEmptyArrays": true }
        });
    }

    let keeps_absent = !nested && !unwind;
    if keeps_absent {
        stages.push(doc! {
            "$addFields": {
                is_null.as_str(): { "$in": [{ "$type": parent_ref.as_str() }, ["missing", "null"]] }
            }
        });
    }

    stages.push(doc! {
        "$lookup": {
            "from": from,
            "localField": field,
            "foreignField": foreign_field,
            "as": field,
            "pipeline": sub_pipeline.into_iter().map(Bson::Document).collect::<Vec<_>>(),
        }
    });

    if keeps_absent {
        stages.push(doc! {
            "$addFields": {
                field: { "$cond": [{ "$eq": [format!("${}", is_null), true] }, "$$REMOVE", parent_ref.as_str()] }
            }
        });
        stages.push(doc! { "$unset": is_null.as_str() });
    }

    if unwind {
        stages.push(doc! {
            "$unwind": { "path": format!("${}", field), "preserveNullAndEmptyArrays": true }
        });
    }

    if nested {
        stages.push(doc! {
            "$group": {
                "_id": "$_id",
                parent: { "$push": parent_ref.as_str() },
                "otherFields": { "$mergeObjects": "$$ROOT" },
            }
        });
        stages.push(doc! {
            "$replaceRoot": {
                "newRoot": {
                    "$mergeObjects": ["$otherFields", { "_id": "$_id", parent: parent_ref.as_str() }]
                }
            }
        });
        stages.push(doc! {
            "$addFields": {
                parent: {
                    "$cond": [
                        { "$eq": [format!("${}", is_null), true] },
                        "$$REMOVE",
                        {
                            "$cond": [
                                { "$eq": [format!("${}", is_empty), true] },
                                { "$literal": [] },
                                {
                                    "$cond": [
                                        { "$eq": [format!("${}", is_array), true] },
                                        parent_ref.as_str(),
                                        { "$arrayElemAt": [parent_ref.as_str(), 0] },
                                    ]
                                },
                            ]
                        },
                    ]
                }
            }
        });
        stages.push(doc! { "$unset": [is_null.as_str(), is_array.as_str(), is_empty.as_str()] });
    }

    stages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_populate() {
        let stages = populate_stages("author", "users", "_id", vec![], false);
        assert_eq!(stages.len(), 4);
        assert_eq!(
            stages[0],
            doc! {
                "$addFields": { "isNull_author": { "$in": [{ "$type": "$author" }, ["missing", "null"]] } }
            }
        );
        assert_eq!(
            stages[1],
            doc! {
                "$lookup": {
                    "from": "users",
                    "localField": "author",
                    "foreignField": "_id",
                    "as": "author",
                    "pipeline": [],
                }
            }
        );
        assert_eq!(
            stages[2],
            doc! {
                "$addFields": {
                    "author": { "$cond": [{ "$eq": ["$isNull_author", true] }, "$$REMOVE", "$author"] }
                }
            }
        );
        assert_eq!(stages[3], doc! { "$unset": "isNull_author" });
    }

    #[test]
    fn test_populate_one_unwinds_preserving_nulls() {
        let stages = populate_stages("author", "users", "_id", vec![], true);
        assert_eq!(stages.len(), 2);
        assert!(stages[0].contains_key("$lookup"));
        assert_eq!(
            stages[1],
            doc! { "$unwind": { "path": "$author", "preserveNullAndEmptyArrays": true } }
        );
    }

    #[test]
    fn test_nested_populate_restores_parent_shape() {
        let stages = populate_stages("timeline.user", "users", "_id", vec![], true);
        let names: Vec<&str> = stages
            .iter()
            .map(|s| s.keys().next().map(String::as_str).unwrap_or_default())
            .collect();
        assert_eq!(
            names,
            vec![
                "$addFields",
                "$addFields",
                "$unwind",
                "$lookup",
                "$unwind",
                "$group",
                "$replaceRoot",
                "$addFields",
                "$unset"
            ]
        );
        assert_eq!(
            stages[0],
            doc! { "$addFields": { "isNull_timeline": { "$cond": ["$timeline", false, true] } } }
        );
        assert_eq!(
            stages[5],
            doc! {
                "$group": {
                    "_id": "$_id",
                    "timeline": { "$push": "$timeline" },
                    "otherFields": { "$mergeObjects": "$$ROOT" },
                }
            }
        );
        assert_eq!(
            stages[1],
            doc! {
                "$addFields": {
                    "isArray_timeline": { "$isArray": "$timeline" },
                    "isEmpty_timeline": { "$eq": ["$timeline", []] },
                }
            }
        );
        assert_eq!(
            stages[8],
            doc! { "$unset": ["isNull_timeline", "isArray_timeline", "isEmpty_timeline"] }
        );
    }

    #[test]
    fn test_lookup_options_order() {
        let options = PopulateOptions::new()
            .having(doc! { "visible": true })
            .limit(5)
            .skip(2)
            .project(doc! { "name": 1 })
            .sort(doc! { "name": 1 })
            .filter(doc! { "active": true });
        let stages = options.stages();
        let names: Vec<&str> = stages
            .iter()
            .map(|s| s.keys().next().map(String::as_str).unwrap_or_default())
            .collect();
        assert_eq!(
            names,
            vec!["$match", "$sort", "$project", "$skip", "$limit", "$match"]
        );
        assert_eq!(stages[5], doc! { "$match": { "visible": true } });
    }

    #[test]
    fn test_sub_pipeline_is_embedded() {
        let sub = vec![doc! { "$match": { "active": true } }];
        let stages = populate_stages("posts", "posts", "author", sub.clone(), false);
        let lookup = stages[1].get_document("$lookup").unwrap();
        assert_eq!(lookup.get_str("foreignField").unwrap(), "author");
        assert_eq!(
            lookup.get_array("pipeline").unwrap(),
            &vec![Bson::Document(sub[0].clone())]
        );
    }
}
