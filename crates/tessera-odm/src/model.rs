//! Models: one schema-bound collection on one connection
//!
//! A [`Model`] is a cheap handle. Clones share the schema, the hook registry
//! and the cached database handle; `populate`/`populate_one` return a clone
//! carrying one more population step and leave the original untouched.

use crate::connection::Connection;
use crate::hooks::{HookRegistry, Hooks, ReplacePostEvent};
use crate::naming::CollectionName;
use crate::odm::{ConnectionEvent, Odm};
use crate::query::{
    Cardinality, CountQuery, DeleteQuery, ExistsQuery, FindAndDelete, FindAndDeleteManyQuery,
    FindAndDeleteOneQuery, FindAndUpdate, FindAndUpdateManyQuery, FindAndUpdateOneQuery,
    FindOneQuery, FindOptions, FindQuery, IdOrFilter, MutationOrder, PopulateConfig,
    PopulateOptions, UpdateAndFindManyQuery, UpdateAndFindOneQuery, UpdateQuery,
};
use crate::transaction::{SessionBinding, SharedSession};
use bson::{doc, Bson, Document};
use futures::future::try_join_all;
use futures::TryStreamExt;
use mongodb::change_stream::event::ChangeStreamEvent;
use mongodb::change_stream::ChangeStream;
use mongodb::options::{AggregateOptions, CollectionOptions};
use mongodb::{Collection, Database, IndexModel};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tessera_common::{Result, TesseraError};
use tessera_validation::{validate_document, Schema, ValidationContext};
use tracing::{debug, error, info, instrument, trace, Level};

/// Where a model's schema comes from
#[derive(Clone)]
pub enum SchemaSource {
    Fixed(Schema),
    /// Built on first use; lets a schema refer to models declared later
    Deferred(Arc<dyn Fn() -> Schema + Send + Sync>),
}

impl SchemaSource {
    pub fn deferred(build: impl Fn() -> Schema + Send + Sync + 'static) -> Self {
        SchemaSource::Deferred(Arc::new(build))
    }
}

impl From<Schema> for SchemaSource {
    fn from(schema: Schema) -> Self {
        SchemaSource::Fixed(schema)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelOptions {
    /// Database to use instead of the one named by the connection URL
    pub database: Option<String>,
    /// Per-model override of `OdmConfig::enable_logs`
    pub logs: Option<bool>,
    pub collection_options: Option<CollectionOptions>,
    /// Created after every connect of the model's connection
    pub indexes: Vec<IndexModel>,
}

impl ModelOptions {
    pub fn database(mut self, name: impl Into<String>) -> Self {
        self.database = Some(name.into());
        self
    }

    pub fn logs(mut self, enable: bool) -> Self {
        self.logs = Some(enable);
        self
    }

    pub fn collection_options(mut self, options: CollectionOptions) -> Self {
        self.collection_options = Some(options);
        self
    }

    pub fn index(mut self, index: IndexModel) -> Self {
        self.indexes.push(index);
        self
    }
}

/// Options of `create`, `create_many` and `replace_one`
#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub validate: bool,
    pub session: Option<SessionBinding>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            validate: true,
            session: None,
        }
    }
}

impl WriteOptions {
    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn session(mut self, binding: impl Into<SessionBinding>) -> Self {
        self.session = Some(binding.into());
        self
    }
}

/// Result of `replace_one` as left by the post-replace hooks
#[derive(Debug, Clone)]
pub struct ReplaceOutcome {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
    /// The validated replacement that was sent
    pub replacement: Document,
}

pub(crate) struct ModelInner {
    name: String,
    collection_name: CollectionName,
    source: SchemaSource,
    schema: OnceCell<Schema>,
    connection_index: usize,
    options: ModelOptions,
    hooks: HookRegistry,
    odm: Odm,
    /// Database handle and the connection it was resolved from
    db_cache: Mutex<Option<(Weak<Connection>, Database)>>,
}

#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
    populates: Arc<Vec<PopulateConfig>>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.inner.name)
            .field("collection", &self.inner.collection_name.as_str())
            .field("connection", &self.inner.connection_index)
            .field("populates", &self.populates.len())
            .finish()
    }
}

fn check_object(schema: &Schema, model: &str) -> Result<()> {
    if schema.as_object().is_none() {
        return Err(TesseraError::Configuration(format!(
            "Invalid schema for model '{}': expected an object schema, got {}",
            model,
            schema.type_name()
        )));
    }
    Ok(())
}

/// `_id` first, then the remaining fields in their original order
fn with_id(id: Bson, document: Document) -> Document {
    let mut output = Document::new();
    output.insert("_id", id);
    for (key, value) in document {
        if key != "_id" {
            output.insert(key, value);
        }
    }
    output
}

impl Model {
    pub(crate) fn new(
        odm: Odm,
        name: &str,
        connection_index: usize,
        source: SchemaSource,
        options: ModelOptions,
    ) -> Result<Self> {
        let collection_name = CollectionName::for_model(name)?;
        let schema = OnceCell::new();
        if let SchemaSource::Fixed(fixed) = &source {
            check_object(fixed, name)?;
            let _ = schema.set(fixed.clone());
        }

        let model = Self {
            inner: Arc::new(ModelInner {
                name: name.to_string(),
                collection_name,
                source,
                schema,
                connection_index,
                options,
                hooks: HookRegistry::default(),
                odm,
                db_cache: Mutex::new(None),
            }),
            populates: Arc::new(Vec::new()),
        };

        if !model.inner.options.indexes.is_empty() {
            model.register_index_creation();
        }
        Ok(model)
    }

    pub(crate) fn from_inner(inner: Arc<ModelInner>) -> Self {
        Self {
            inner,
            populates: Arc::new(Vec::new()),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ModelInner> {
        Arc::downgrade(&self.inner)
    }

    fn register_index_creation(&self) {
        let model = self.downgrade();
        self.inner
            .odm
            .on(ConnectionEvent::PostConnect, self.inner.connection_index, move |_| {
                let model = model.clone();
                async move {
                    if let Some(inner) = model.upgrade() {
                        let model = Model::from_inner(inner);
                        if let Err(e) = model.ensure_indexes().await {
                            error!(model = %model.inner.name, error = %e, "index creation failed");
                        }
                    }
                    Ok(())
                }
            });
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn collection_name(&self) -> &str {
        self.inner.collection_name.as_str()
    }

    pub fn connection_index(&self) -> usize {
        self.inner.connection_index
    }

    /// Hook registry shared with every populate clone of this model
    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    pub(crate) fn hooks_snapshot(&self) -> Hooks {
        self.inner.hooks.snapshot()
    }

    pub(crate) fn populate_configs(&self) -> &[PopulateConfig] {
        &self.populates
    }

    pub(crate) fn odm(&self) -> &Odm {
        &self.inner.odm
    }

    /// The resolved schema; deferred schemas are built on first call
    pub fn schema(&self) -> Result<&Schema> {
        let schema = self.inner.schema.get_or_init(|| match &self.inner.source {
            SchemaSource::Fixed(schema) => schema.clone(),
            SchemaSource::Deferred(build) => build(),
        });
        check_object(schema, &self.inner.name)?;
        Ok(schema)
    }

    /// Database handle, re-resolved whenever the connection was replaced
    pub fn database(&self) -> Result<Database> {
        let connection = self.inner.odm.connection(self.inner.connection_index)?;
        let mut cache = self.inner.db_cache.lock();
        if let Some((cached_from, database)) = cache.as_ref() {
            if std::ptr::eq(cached_from.as_ptr(), Arc::as_ptr(&connection)) {
                return Ok(database.clone());
            }
            debug!(model = %self.inner.name, "connection changed, refreshing database handle");
        }
        let database = connection.resolve_database(self.inner.options.database.as_deref());
        *cache = Some((Arc::downgrade(&connection), database.clone()));
        Ok(database)
    }

    pub fn collection(&self) -> Result<Collection<Document>> {
        let database = self.database()?;
        let name = self.inner.collection_name.as_str();
        Ok(match &self.inner.options.collection_options {
            Some(options) => database.collection_with_options(name, options.clone()),
            None => database.collection(name),
        })
    }

    // ------------------------------------------------------------------------
    // Execution helpers
    // ------------------------------------------------------------------------

    fn logs_enabled(&self) -> bool {
        self.inner
            .options
            .logs
            .unwrap_or(self.inner.odm.config().enable_logs)
    }

    /// Emit the `query executed` event for one operation
    pub(crate) fn log_query(&self, method: &str, args: &[Bson], session: Option<&SessionBinding>) {
        let info_level = self.logs_enabled();
        if !info_level && !tracing::enabled!(Level::TRACE) {
            return;
        }

        let database = self
            .database()
            .map(|d| d.name().to_string())
            .unwrap_or_default();
        let collection = self.inner.collection_name.as_str();
        let args = Bson::Array(args.to_vec()).into_relaxed_extjson().to_string();
        let session = session
            .map(|_| format!("ClientSession({})", self.inner.connection_index))
            .unwrap_or_default();

        if info_level {
            info!(%database, %collection, %method, %args, %session, "query executed");
        } else {
            trace!(%database, %collection, %method, %args, %session, "query executed");
        }
    }

    pub(crate) async fn resolve_session(
        &self,
        binding: Option<&SessionBinding>,
    ) -> Result<Option<SharedSession>> {
        match binding {
            Some(binding) => Ok(Some(binding.resolve(self.inner.connection_index).await?)),
            None => Ok(None),
        }
    }

    /// Run `pipeline` and materialise the results. Session cursors are closed
    /// before the session lock is released.
    pub(crate) async fn aggregate_documents(
        &self,
        pipeline: Vec<Document>,
        options: Option<AggregateOptions>,
        session: Option<&SharedSession>,
    ) -> Result<Vec<Document>> {
        let collection = self.collection()?;
        match session {
            Some(session) => {
                let mut guard = session.lock().await;
                let mut cursor = collection
                    .aggregate(pipeline)
                    .with_options(options)
                    .session(&mut *guard)
                    .await?;
                let mut documents = Vec::new();
                while cursor.advance(&mut *guard).await? {
                    documents.push(cursor.deserialize_current()?);
                }
                drop(cursor);
                Ok(documents)
            }
            None => {
                let cursor = collection.aggregate(pipeline).with_options(options).await?;
                Ok(cursor.try_collect().await?)
            }
        }
    }

    pub(crate) fn ensure_same_connection(&self, target: &Model, field: &str) -> Result<()> {
        if self.inner.connection_index != target.inner.connection_index {
            return Err(TesseraError::CrossConnection(format!(
                "Cannot populate '{}' of '{}' (connection {}) from '{}' (connection {}); use fetch instead",
                field,
                self.inner.name,
                self.inner.connection_index,
                target.inner.name,
                target.inner.connection_index
            )));
        }
        Ok(())
    }

    fn check_session(&self, session: Option<&SessionBinding>) -> Result<()> {
        match session {
            Some(binding) => binding.check(self.inner.connection_index),
            None => Ok(()),
        }
    }

    /// Validate a whole document. `_id` is carried over untouched unless the
    /// schema declares it.
    fn validate_whole(&self, mut document: Document) -> Result<Document> {
        let schema = self.schema()?;
        let declares_id = schema
            .as_object()
            .is_some_and(|object| object.field("_id").is_some());
        let id = if declares_id { None } else { document.remove("_id") };

        let mut ctx = ValidationContext::with_location("document");
        let validated = validate_document(&document, schema, &mut ctx)?;
        Ok(match id {
            Some(id) => with_id(id, validated),
            None => validated,
        })
    }

    // ------------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------------

    pub async fn create(&self, document: Document) -> Result<Document> {
        self.create_with(document, WriteOptions::default()).await
    }

    /// Insert one document; the result has `_id` as its first field
    #[instrument(level = "debug", skip_all, fields(model = %self.inner.name))]
    pub async fn create_with(&self, document: Document, options: WriteOptions) -> Result<Document> {
        self.check_session(options.session.as_ref())?;
        let hooks = self.hooks_snapshot();

        let document = hooks.run_pre_create("create", document).await?;
        let document = if options.validate {
            self.validate_whole(document)?
        } else {
            document
        };

        self.log_query("create", &[Bson::Document(document.clone())], options.session.as_ref());

        let collection = self.collection()?;
        let result = match self.resolve_session(options.session.as_ref()).await? {
            Some(session) => {
                let mut guard = session.lock().await;
                collection.insert_one(&document).session(&mut *guard).await?
            }
            None => collection.insert_one(&document).await?,
        };

        hooks
            .run_post_create("create", with_id(result.inserted_id, document))
            .await
    }

    /// Insert many documents. Pre-create hooks and validation run for every
    /// document concurrently; one failure aborts before anything is sent.
    #[instrument(level = "debug", skip_all, fields(model = %self.inner.name, count = documents.len()))]
    pub async fn create_many(&self, documents: Vec<Document>, options: WriteOptions) -> Result<Vec<Document>> {
        self.check_session(options.session.as_ref())?;
        let hooks = self.hooks_snapshot();
        let validate = options.validate;

        let prepared = try_join_all(documents.into_iter().map(|document| {
            let hooks = &hooks;
            async move {
                let document = hooks.run_pre_create("createMany", document).await?;
                if validate {
                    self.validate_whole(document)
                } else {
                    Ok(document)
                }
            }
        }))
        .await?;

        if prepared.is_empty() {
            return Ok(prepared);
        }

        self.log_query(
            "createMany",
            &[Bson::Array(prepared.iter().cloned().map(Bson::Document).collect())],
            options.session.as_ref(),
        );

        let collection = self.collection()?;
        let result = match self.resolve_session(options.session.as_ref()).await? {
            Some(session) => {
                let mut guard = session.lock().await;
                collection.insert_many(&prepared).session(&mut *guard).await?
            }
            None => collection.insert_many(&prepared).await?,
        };

        let created = prepared.into_iter().enumerate().map(|(position, document)| {
            match result.inserted_ids.get(&position) {
                Some(id) => with_id(id.clone(), document),
                None => document,
            }
        });
        try_join_all(created.map(|document| hooks.run_post_create("createMany", document))).await
    }

    // ------------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------------

    pub fn find(&self, filter: impl Into<IdOrFilter>) -> FindQuery {
        self.find_with(filter, FindOptions::default())
    }

    pub fn find_with(&self, filter: impl Into<IdOrFilter>, options: FindOptions) -> FindQuery {
        FindQuery::new(self.clone(), options).filter(filter)
    }

    /// First match, or `None`
    pub fn find_one(&self, filter: impl Into<IdOrFilter>) -> FindOneQuery {
        self.find_one_with(filter, FindOptions::default())
    }

    pub fn find_one_with(&self, filter: impl Into<IdOrFilter>, options: FindOptions) -> FindOneQuery {
        FindOneQuery::new(self.clone(), options).filter(filter)
    }

    /// First match, or a `NotFound` error
    pub fn find_one_or_fail(&self, filter: impl Into<IdOrFilter>) -> FindOneQuery {
        self.find_one(filter).error_on_null(true)
    }

    /// Full-text search over the collection's text index
    pub fn search(&self, term: &str) -> FindQuery {
        self.find(doc! { "$text": { "$search": term } })
    }

    /// Full-text search with `$language`, `$caseSensitive` and friends
    pub fn search_with(&self, text: Document) -> FindQuery {
        self.find(doc! { "$text": text })
    }

    pub fn count(&self, filter: impl Into<IdOrFilter>) -> CountQuery {
        CountQuery::new(self.clone(), FindOptions::default()).filter(filter)
    }

    pub fn exists(&self, filter: impl Into<IdOrFilter>) -> ExistsQuery {
        ExistsQuery::new(self.clone(), FindOptions::default()).filter(filter)
    }

    /// Change stream over the documents matching `filter`
    pub async fn watch(&self, filter: impl Into<IdOrFilter>) -> Result<ChangeStream<ChangeStreamEvent<Document>>> {
        let filter = filter.into().into_filter()?;
        self.log_query("watch", &[Bson::Document(filter.clone())], None);
        let stream = self
            .collection()?
            .watch()
            .pipeline([doc! { "$match": filter }])
            .await?;
        Ok(stream)
    }

    // ------------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------------

    fn update_query(&self, cardinality: Cardinality, filter: impl Into<IdOrFilter>, updates: Document) -> UpdateQuery {
        UpdateQuery::new(self.clone(), cardinality)
            .filter(filter)
            .updates(updates)
    }

    pub fn update_one(&self, filter: impl Into<IdOrFilter>, updates: Document) -> UpdateQuery {
        self.update_query(Cardinality::One, filter, updates)
    }

    pub fn update_one_or_fail(&self, filter: impl Into<IdOrFilter>, updates: Document) -> UpdateQuery {
        self.update_one(filter, updates).or_fail()
    }

    pub fn update_many(&self, filter: impl Into<IdOrFilter>, updates: Document) -> UpdateQuery {
        self.update_query(Cardinality::Many, filter, updates)
    }

    pub fn update_many_or_fail(&self, filter: impl Into<IdOrFilter>, updates: Document) -> UpdateQuery {
        self.update_many(filter, updates).or_fail()
    }

    /// Update one document, then resolve to it as updated
    pub fn update_and_find_one(&self, filter: impl Into<IdOrFilter>, updates: Document) -> UpdateAndFindOneQuery {
        FindAndUpdate::new(
            FindOneQuery::new(self.clone(), FindOptions::default()),
            self.update_one(filter, updates),
            MutationOrder::MutateThenFind,
        )
    }

    /// Resolve to one document as it was, then update it
    pub fn find_and_update_one(&self, filter: impl Into<IdOrFilter>, updates: Document) -> FindAndUpdateOneQuery {
        FindAndUpdate::new(
            FindOneQuery::new(self.clone(), FindOptions::default()),
            self.update_one(filter, updates),
            MutationOrder::FindThenMutate,
        )
    }

    pub fn update_and_find_many(&self, filter: impl Into<IdOrFilter>, updates: Document) -> UpdateAndFindManyQuery {
        FindAndUpdate::new(
            FindQuery::new(self.clone(), FindOptions::default()),
            self.update_many(filter, updates),
            MutationOrder::MutateThenFind,
        )
    }

    pub fn find_and_update_many(&self, filter: impl Into<IdOrFilter>, updates: Document) -> FindAndUpdateManyQuery {
        FindAndUpdate::new(
            FindQuery::new(self.clone(), FindOptions::default()),
            self.update_many(filter, updates),
            MutationOrder::FindThenMutate,
        )
    }

    // ------------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------------

    pub fn delete_one(&self, filter: impl Into<IdOrFilter>) -> DeleteQuery {
        DeleteQuery::new(self.clone(), Cardinality::One).filter(filter)
    }

    pub fn delete_one_or_fail(&self, filter: impl Into<IdOrFilter>) -> DeleteQuery {
        self.delete_one(filter).or_fail()
    }

    pub fn delete_many(&self, filter: impl Into<IdOrFilter>) -> DeleteQuery {
        DeleteQuery::new(self.clone(), Cardinality::Many).filter(filter)
    }

    pub fn delete_many_or_fail(&self, filter: impl Into<IdOrFilter>) -> DeleteQuery {
        self.delete_many(filter).or_fail()
    }

    pub fn find_and_delete_one(&self, filter: impl Into<IdOrFilter>) -> FindAndDeleteOneQuery {
        FindAndDelete::new(
            FindOneQuery::new(self.clone(), FindOptions::default()),
            self.delete_one(filter),
        )
    }

    pub fn find_and_delete_many(&self, filter: impl Into<IdOrFilter>) -> FindAndDeleteManyQuery {
        FindAndDelete::new(
            FindQuery::new(self.clone(), FindOptions::default()),
            self.delete_many(filter),
        )
    }

    // ------------------------------------------------------------------------
    // Replace
    // ------------------------------------------------------------------------

    /// Replace the first match with a fully validated document
    #[instrument(level = "debug", skip_all, fields(model = %self.inner.name))]
    pub async fn replace_one(
        &self,
        filter: impl Into<IdOrFilter>,
        replacement: Document,
        options: WriteOptions,
    ) -> Result<ReplaceOutcome> {
        self.check_session(options.session.as_ref())?;
        let filter = filter.into().into_filter()?;
        let hooks = self.hooks_snapshot();

        let replacement = hooks.run_pre_replace("replaceOne", &filter, replacement).await?;
        self.log_query(
            "replaceOne",
            &[Bson::Document(filter.clone()), Bson::Document(replacement.clone())],
            options.session.as_ref(),
        );
        let replacement = if options.validate {
            self.validate_whole(replacement)?
        } else {
            replacement
        };

        let collection = self.collection()?;
        let result = match self.resolve_session(options.session.as_ref()).await? {
            Some(session) => {
                let mut guard = session.lock().await;
                collection
                    .replace_one(filter, &replacement)
                    .session(&mut *guard)
                    .await?
            }
            None => collection.replace_one(filter, &replacement).await?,
        };

        let event = hooks
            .run_post_replace(ReplacePostEvent {
                method: "replaceOne",
                replacement,
                matched_count: result.matched_count,
                modified_count: result.modified_count,
                upserted_id: result.upserted_id,
            })
            .await?;
        Ok(ReplaceOutcome {
            matched_count: event.matched_count,
            modified_count: event.modified_count,
            upserted_id: event.upserted_id,
            replacement: event.replacement,
        })
    }

    // ------------------------------------------------------------------------
    // Indexes
    // ------------------------------------------------------------------------

    pub async fn create_indexes(&self, indexes: Vec<IndexModel>) -> Result<Vec<String>> {
        if indexes.is_empty() {
            return Ok(Vec::new());
        }
        self.log_query("createIndexes", &[Bson::Int64(indexes.len() as i64)], None);
        let result = self.collection()?.create_indexes(indexes).await?;
        Ok(result.index_names)
    }

    /// Create the indexes declared in `ModelOptions`. Also runs after every
    /// connect of the model's connection.
    pub async fn ensure_indexes(&self) -> Result<Vec<String>> {
        self.create_indexes(self.inner.options.indexes.clone()).await
    }

    pub async fn drop_indexes(&self, names: &[&str]) -> Result<()> {
        let collection = self.collection()?;
        for name in names {
            self.log_query("dropIndex", &[Bson::String(name.to_string())], None);
            collection.drop_index(*name).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Population config
    // ------------------------------------------------------------------------

    fn with_populate(&self, config: PopulateConfig) -> Result<Model> {
        self.ensure_same_connection(&config.model, &config.field)?;
        let mut populates = self.populates.as_ref().clone();
        populates.push(config);
        Ok(Model {
            inner: self.inner.clone(),
            populates: Arc::new(populates),
        })
    }

    /// A clone that joins `target` into `field` whenever it is itself
    /// populated from another model
    pub fn populate(&self, field: &str, target: &Model, options: PopulateOptions) -> Result<Model> {
        self.with_populate(PopulateConfig {
            field: field.to_string(),
            model: target.clone(),
            options,
            unwind: false,
        })
    }

    pub fn populate_one(&self, field: &str, target: &Model, options: PopulateOptions) -> Result<Model> {
        self.with_populate(PopulateConfig {
            field: field.to_string(),
            model: target.clone(),
            options,
            unwind: true,
        })
    }
}
