//! Find, FindOne, Count and Exists queries over aggregation pipelines

use super::fetch::{resolve_fetches, FetchConfig};
use super::populate::{PopulateConfig, PopulateOptions};
use super::{awaitable, IdOrFilter, Resolve};
use crate::cache::{use_caching, CacheOptions};
use crate::model::Model;
use crate::transaction::SessionBinding;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::future::try_join_all;
use mongodb::options::AggregateOptions;
use tessera_common::{Result, TesseraError};

/// Execution options of find-family queries
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub cache: Option<CacheOptions>,
    pub aggregate: Option<AggregateOptions>,
}

impl FindOptions {
    pub fn cache(mut self, cache: CacheOptions) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn aggregate(mut self, options: AggregateOptions) -> Self {
        self.aggregate = Some(options);
        self
    }
}

/// State shared by every find-family builder
#[derive(Clone)]
pub struct FindBase {
    model: Model,
    stages: Vec<Document>,
    fetches: Vec<FetchConfig>,
    /// Filter supplied by a composite query, matched before every other stage
    initial_filter: Option<Document>,
    options: FindOptions,
    session: Option<SessionBinding>,
    /// Invalid filter arguments surface on execution
    pending_error: Option<TesseraError>,
}

impl FindBase {
    pub(crate) fn new(model: Model, options: FindOptions) -> Self {
        Self {
            model,
            stages: Vec::new(),
            fetches: Vec::new(),
            initial_filter: None,
            options,
            session: None,
            pending_error: None,
        }
    }

    pub(crate) fn model(&self) -> &Model {
        &self.model
    }

    pub(crate) fn set_initial_filter(&mut self, filter: Document) {
        self.initial_filter = Some(filter);
    }

    fn fail(&mut self, error: TesseraError) {
        self.pending_error.get_or_insert(error);
    }

    pub(crate) fn filter(&mut self, filter: IdOrFilter) {
        match filter.into_filter() {
            Ok(filter) if !filter.is_empty() => self.stages.push(doc! { "$match": filter }),
            Ok(_) => {}
            Err(e) => self.fail(e),
        }
    }

    pub(crate) fn sort(&mut self, sort: Document) {
        if !sort.is_empty() {
            self.stages.push(doc! { "$sort": sort });
        }
    }

    pub(crate) fn project(&mut self, project: Document) {
        if !project.is_empty() {
            self.stages.push(doc! { "$project": project });
        }
    }

    pub(crate) fn skip(&mut self, skip: u64) {
        self.stages.push(doc! { "$skip": skip as i64 });
    }

    pub(crate) fn limit(&mut self, limit: i64) {
        self.stages.push(doc! { "$limit": limit });
    }

    pub(crate) fn custom(&mut self, stages: Vec<Document>) {
        self.stages.extend(stages);
    }

    /// One document per distinct tuple of `fields`, with the group key
    /// fields and a `totalCount` merged onto it
    pub(crate) fn group_by(&mut self, fields: &[&str], select_last: bool) {
        let mut key = Document::new();
        for field in fields {
            key.insert(field.replace('.', "_"), format!("${}", field));
        }
        let pick = if select_last { "$last" } else { "$first" };
        self.stages.push(doc! {
            "$group": {
                "_id": key,
                "document": { pick: "$$ROOT" },
                "totalCount": { "$sum": 1 },
            }
        });
        self.stages.push(doc! {
            "$replaceRoot": {
                "newRoot": {
                    "$mergeObjects": ["$document", "$_id", { "totalCount": "$totalCount" }]
                }
            }
        });
    }

    pub(crate) fn populate(&mut self, field: &str, target: &Model, options: PopulateOptions, unwind: bool) -> Result<()> {
        self.model.ensure_same_connection(target, field)?;
        let config = PopulateConfig {
            field: field.to_string(),
            model: target.clone(),
            options,
            unwind,
        };
        self.stages.extend(config.pipeline());
        Ok(())
    }

    /// Later fetches of the same field replace earlier ones
    pub(crate) fn fetch(&mut self, field: &str, target: &Model, options: PopulateOptions, singular: bool) {
        self.fetches.retain(|f| f.field != field);
        self.fetches.push(FetchConfig {
            field: field.to_string(),
            model: target.clone(),
            options,
            singular,
        });
    }

    pub(crate) fn session(&mut self, binding: SessionBinding) -> Result<()> {
        binding.check(self.model.connection_index())?;
        self.session = Some(binding);
        Ok(())
    }

    pub(crate) fn cache(&mut self, cache: CacheOptions) {
        self.options.cache = Some(cache);
    }

    /// The stages that will be sent, without hooks applied
    pub(crate) fn pipeline(&self) -> Vec<Document> {
        match &self.initial_filter {
            Some(filter) if !filter.is_empty() => {
                let mut pipeline = Vec::with_capacity(self.stages.len() + 1);
                pipeline.push(doc! { "$match": filter.clone() });
                pipeline.extend(self.stages.iter().cloned());
                pipeline
            }
            _ => self.stages.clone(),
        }
    }

    /// Pre-read hooks, logging, then the aggregation and fetches through the
    /// cache. Post-read hooks are left to the caller.
    pub(crate) async fn execute(&self, method: &'static str, tail: &[Document]) -> Result<Vec<Document>> {
        if let Some(e) = &self.pending_error {
            return Err(e.clone());
        }

        let hooks = self.model.hooks_snapshot();
        let mut pipeline = self.pipeline();
        pipeline.extend(tail.iter().cloned());
        let pipeline = hooks.run_pre_read(method, pipeline).await?;

        self.model.log_query(
            method,
            &[Bson::Array(pipeline.iter().cloned().map(Bson::Document).collect())],
            self.session.as_ref(),
        );

        let session = self.model.resolve_session(self.session.as_ref()).await?;
        let provider = self.model.odm().cache_provider();

        use_caching(provider.as_ref(), self.options.cache.as_ref(), || async {
            let documents = self
                .model
                .aggregate_documents(pipeline, self.options.aggregate.clone(), session.as_ref())
                .await?;
            resolve_fetches(documents, &self.fetches, self.session.as_ref()).await
        })
        .await
    }

    pub(crate) async fn post_read(&self, method: &'static str, documents: Vec<Document>) -> Result<Vec<Document>> {
        let hooks = self.model.hooks_snapshot();
        try_join_all(documents.into_iter().map(|d| hooks.run_post_read(method, d))).await
    }
}

/// Implemented by builders that wrap a [`FindBase`]
pub trait FindStage: Resolve {
    fn base_mut(&mut self) -> &mut FindBase;
}

/// Chainable builder methods of find-family queries
macro_rules! find_builder {
    ($query:ty) => {
        impl $query {
            /// Add a `$match` stage; empty filters add nothing
            pub fn filter(mut self, filter: impl Into<IdOrFilter>) -> Self {
                self.base.filter(filter.into());
                self
            }

            pub fn sort(mut self, sort: Document) -> Self {
                self.base.sort(sort);
                self
            }

            pub fn project(mut self, project: Document) -> Self {
                self.base.project(project);
                self
            }

            pub fn skip(mut self, skip: u64) -> Self {
                self.base.skip(skip);
                self
            }

            pub fn limit(mut self, limit: i64) -> Self {
                self.base.limit(limit);
                self
            }

            /// Append raw aggregation stages
            pub fn custom(mut self, stages: Vec<Document>) -> Self {
                self.base.custom(stages);
                self
            }

            pub fn group_by(mut self, fields: &[&str], select_last: bool) -> Self {
                self.base.group_by(fields, select_last);
                self
            }

            /// Join `target` into `field` as an array. Fails when `target`
            /// lives on another connection.
            pub fn populate(mut self, field: &str, target: &Model, options: PopulateOptions) -> Result<Self> {
                self.base.populate(field, target, options, false)?;
                Ok(self)
            }

            /// Join `target` into `field` as a single document
            pub fn populate_one(mut self, field: &str, target: &Model, options: PopulateOptions) -> Result<Self> {
                self.base.populate(field, target, options, true)?;
                Ok(self)
            }

            /// Resolve `field` with a follow-up query on `target`, which may
            /// use any connection
            pub fn fetch(mut self, field: &str, target: &Model, options: PopulateOptions) -> Self {
                self.base.fetch(field, target, options, false);
                self
            }

            pub fn fetch_one(mut self, field: &str, target: &Model, options: PopulateOptions) -> Self {
                self.base.fetch(field, target, options, true);
                self
            }

            /// Run inside a transaction or a bound session
            pub fn session(mut self, binding: impl Into<SessionBinding>) -> Result<Self> {
                self.base.session(binding.into())?;
                Ok(self)
            }

            pub fn cache(mut self, cache: CacheOptions) -> Self {
                self.base.cache(cache);
                self
            }

            /// The pipeline as it stands, without hooks applied
            pub fn pipeline(&self) -> Vec<Document> {
                self.base.pipeline()
            }
        }
    };
}

// ============================================================================
// FindQuery
// ============================================================================

/// Resolves to every matching document
#[derive(Clone)]
pub struct FindQuery {
    base: FindBase,
}

impl FindQuery {
    pub(crate) fn new(model: Model, options: FindOptions) -> Self {
        Self {
            base: FindBase::new(model, options),
        }
    }
}

find_builder!(FindQuery);

#[async_trait]
impl Resolve for FindQuery {
    type Output = Vec<Document>;

    async fn resolve(&mut self) -> Result<Vec<Document>> {
        let documents = self.base.execute("find", &[]).await?;
        self.base.post_read("find", documents).await
    }
}

impl FindStage for FindQuery {
    fn base_mut(&mut self) -> &mut FindBase {
        &mut self.base
    }
}

awaitable!(FindQuery);

// ============================================================================
// FindOneQuery
// ============================================================================

/// Resolves to the first matching document.
///
/// With `error_on_null` an empty result is a `NotFound` error instead of `None`.
#[derive(Clone)]
pub struct FindOneQuery {
    base: FindBase,
    limit_applied: bool,
    error_on_null: bool,
}

impl FindOneQuery {
    pub(crate) fn new(model: Model, options: FindOptions) -> Self {
        Self {
            base: FindBase::new(model, options),
            limit_applied: false,
            error_on_null: false,
        }
    }

    pub fn error_on_null(mut self, error_on_null: bool) -> Self {
        self.error_on_null = error_on_null;
        self
    }
}

find_builder!(FindOneQuery);

#[async_trait]
impl Resolve for FindOneQuery {
    type Output = Option<Document>;

    async fn resolve(&mut self) -> Result<Option<Document>> {
        if !self.limit_applied {
            self.base.limit(1);
            self.limit_applied = true;
        }

        let mut documents = self.base.execute("findOne", &[]).await?;
        if documents.is_empty() {
            if self.error_on_null {
                return Err(TesseraError::NotFound("Record not found!".to_string()));
            }
            return Ok(None);
        }
        documents.truncate(1);
        Ok(self.base.post_read("findOne", documents).await?.pop())
    }
}

impl FindStage for FindOneQuery {
    fn base_mut(&mut self) -> &mut FindBase {
        &mut self.base
    }
}

awaitable!(FindOneQuery);

// ============================================================================
// CountQuery / ExistsQuery
// ============================================================================

/// Resolves to the number of matching documents; an empty result is `0`
#[derive(Clone)]
pub struct CountQuery {
    base: FindBase,
}

impl CountQuery {
    pub(crate) fn new(model: Model, options: FindOptions) -> Self {
        Self {
            base: FindBase::new(model, options),
        }
    }
}

find_builder!(CountQuery);

fn count_of(row: Option<&Document>) -> u64 {
    match row.and_then(|r| r.get("count")) {
        Some(Bson::Int32(n)) => (*n).max(0) as u64,
        Some(Bson::Int64(n)) => (*n).max(0) as u64,
        Some(Bson::Double(n)) => (*n).max(0.0) as u64,
        _ => 0,
    }
}

#[async_trait]
impl Resolve for CountQuery {
    type Output = u64;

    async fn resolve(&mut self) -> Result<u64> {
        let rows = self.base.execute("count", &[doc! { "$count": "count" }]).await?;
        Ok(count_of(rows.first()))
    }
}

awaitable!(CountQuery);

/// Resolves to whether any document matches
#[derive(Clone)]
pub struct ExistsQuery {
    base: FindBase,
}

impl ExistsQuery {
    pub(crate) fn new(model: Model, options: FindOptions) -> Self {
        Self {
            base: FindBase::new(model, options),
        }
    }
}

find_builder!(ExistsQuery);

#[async_trait]
impl Resolve for ExistsQuery {
    type Output = bool;

    async fn resolve(&mut self) -> Result<bool> {
        let rows = self
            .base
            .execute("exists", &[doc! { "$limit": 1 }, doc! { "$count": "count" }])
            .await?;
        Ok(count_of(rows.first()) > 0)
    }
}

awaitable!(ExistsQuery);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelOptions;
    use crate::odm::Odm;
    use tessera_validation::Schema;

    fn model_on(odm: &Odm, index: usize, name: &str) -> Model {
        odm.model_on(
            index,
            name,
            Schema::object([("name", Schema::string()), ("author", Schema::object_id().optional())]),
            ModelOptions::default(),
        )
        .unwrap()
    }

    fn stage_names(pipeline: &[Document]) -> Vec<String> {
        pipeline
            .iter()
            .filter_map(|stage| stage.keys().next().cloned())
            .collect()
    }

    #[test]
    fn test_empty_arguments_add_no_stages() {
        let odm = Odm::default();
        let posts = model_on(&odm, 0, "post");

        let query = posts.find(doc! {}).sort(doc! {}).project(doc! {});
        assert!(query.pipeline().is_empty());

        let query = posts
            .find(doc! { "name": "a" })
            .sort(doc! { "name": -1 })
            .skip(5)
            .limit(10);
        assert_eq!(stage_names(&query.pipeline()), vec!["$match", "$sort", "$skip", "$limit"]);
    }

    #[test]
    fn test_group_by_merges_keys_and_total() {
        let odm = Odm::default();
        let posts = model_on(&odm, 0, "post");
        let pipeline = posts.find(doc! {}).group_by(&["author", "meta.kind"], true).pipeline();
        assert_eq!(
            pipeline[0],
            doc! {
                "$group": {
                    "_id": { "author": "$author", "meta_kind": "$meta.kind" },
                    "document": { "$last": "$$ROOT" },
                    "totalCount": { "$sum": 1 },
                }
            }
        );
        assert_eq!(stage_names(&pipeline), vec!["$group", "$replaceRoot"]);
    }

    #[test]
    fn test_populate_on_same_connection_adds_lookup() {
        let odm = Odm::default();
        let posts = model_on(&odm, 0, "post");
        let users = model_on(&odm, 0, "user");

        let pipeline = posts
            .find(doc! {})
            .populate_one("author", &users, PopulateOptions::new())
            .unwrap()
            .pipeline();
        assert_eq!(stage_names(&pipeline), vec!["$lookup", "$unwind"]);
        let lookup = pipeline[0].get_document("$lookup").unwrap();
        assert_eq!(lookup.get_str("from").unwrap(), "users");
    }

    #[test]
    fn test_populate_across_connections_is_rejected() {
        let odm = Odm::default();
        let posts = model_on(&odm, 0, "post");
        let users = model_on(&odm, 1, "user");

        let err = posts
            .find(doc! {})
            .populate("author", &users, PopulateOptions::new())
            .err()
            .unwrap();
        assert!(matches!(err, TesseraError::CrossConnection(_)));
        assert!(posts.populate("author", &users, PopulateOptions::new()).is_err());
    }

    #[test]
    fn test_target_population_is_nested_into_the_lookup() {
        let odm = Odm::default();
        let posts = model_on(&odm, 0, "post");
        let users = model_on(&odm, 0, "user");
        let comments = model_on(&odm, 0, "comment");

        let posts_with_author = posts
            .populate_one("author", &users, PopulateOptions::new())
            .unwrap();
        assert!(posts.populate_configs().is_empty());

        let pipeline = comments
            .find(doc! {})
            .populate_one("post", &posts_with_author, PopulateOptions::new().limit(1))
            .unwrap()
            .pipeline();
        let inner = pipeline[0]
            .get_document("$lookup")
            .unwrap()
            .get_array("pipeline")
            .unwrap();
        let inner: Vec<Document> = inner
            .iter()
            .filter_map(|s| s.as_document().cloned())
            .collect();
        assert_eq!(stage_names(&inner), vec!["$lookup", "$unwind", "$limit"]);
    }

    #[test]
    fn test_later_fetch_of_a_field_replaces_earlier() {
        let odm = Odm::default();
        let posts = model_on(&odm, 0, "post");
        let users = model_on(&odm, 1, "user");

        let mut query = posts
            .find(doc! {})
            .fetch("author", &users, PopulateOptions::new())
            .fetch_one("author", &users, PopulateOptions::new());
        let base = query.base_mut();
        assert_eq!(base.fetches.len(), 1);
        assert!(base.fetches[0].singular);
    }

    #[tokio::test]
    async fn test_invalid_id_fails_before_any_io() {
        let odm = Odm::default();
        let posts = model_on(&odm, 0, "post");
        let err = posts.find_one("not-an-id").await.unwrap_err();
        assert!(matches!(err, TesseraError::Query(_)));
    }

    #[tokio::test]
    async fn test_unconnected_model_reports_configuration_error() {
        let odm = Odm::default();
        let posts = model_on(&odm, 0, "post");
        let err = posts.find(doc! {}).await.unwrap_err();
        assert!(matches!(err, TesseraError::Configuration(_)));
    }

    #[test]
    fn test_count_row_decoding() {
        assert_eq!(count_of(None), 0);
        assert_eq!(count_of(Some(&doc! { "count": 3 })), 3);
        assert_eq!(count_of(Some(&doc! { "count": 7_i64 })), 7);
        assert_eq!(count_of(Some(&doc! { "other": 1 })), 0);
    }
}
