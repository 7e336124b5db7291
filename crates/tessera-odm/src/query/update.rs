//! updateOne / updateMany

use super::{awaitable, IdOrFilter, Resolve};
use crate::hooks::UpdatePostEvent;
use crate::model::Model;
use crate::modifier::validate_modifiers;
use crate::path::{dot_notation_to_deep_object, mongodb_modifiers_to_object};
use crate::transaction::SessionBinding;
use async_trait::async_trait;
use bson::{Bson, Document};
use mongodb::options::UpdateOptions;
use once_cell::sync::OnceCell;
use tessera_common::{Result, TesseraError};
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cardinality {
    One,
    Many,
}

#[derive(Debug, Clone)]
pub struct UpdateQueryOptions {
    /// Validate touched paths before sending; on by default
    pub validate: bool,
    pub upsert: bool,
    pub array_filters: Option<Vec<Document>>,
}

impl Default for UpdateQueryOptions {
    fn default() -> Self {
        Self {
            validate: true,
            upsert: false,
            array_filters: None,
        }
    }
}

/// Result of an update, with the sent update document kept for inspection
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
    /// The update document as sent, after hooks and validation
    pub updates: Document,
    modifications: OnceCell<Document>,
}

impl UpdateOutcome {
    pub(crate) fn new(matched_count: u64, modified_count: u64, upserted_id: Option<Bson>, updates: Document) -> Self {
        Self {
            matched_count,
            modified_count,
            upserted_id,
            updates,
            modifications: OnceCell::new(),
        }
    }

    /// Nested view of the values written by `$set`, `$setOnInsert`, `$push`
    /// and `$addToSet`. Computed on first access.
    pub fn modifications(&self) -> &Document {
        self.modifications
            .get_or_init(|| dot_notation_to_deep_object(&mongodb_modifiers_to_object(&self.updates)))
    }
}

/// Fold `incoming` into `target`. Operator keys merge into the existing
/// operator document, plain keys go to `$set`; the last write of a leaf wins.
pub(crate) fn merge_updates(target: &mut Document, incoming: Document) {
    for (key, value) in incoming {
        if key.starts_with('$') {
            match (target.get_mut(&key), value) {
                (Some(Bson::Document(existing)), Bson::Document(fields)) => existing.extend(fields),
                (_, value) => {
                    target.insert(key, value);
                }
            }
        } else {
            match target.get_mut("$set") {
                Some(Bson::Document(set)) => {
                    set.insert(key, value);
                }
                _ => {
                    let mut set = Document::new();
                    set.insert(key, value);
                    target.insert("$set", set);
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct UpdateQuery {
    model: Model,
    cardinality: Cardinality,
    filter: Document,
    updates: Document,
    options: UpdateQueryOptions,
    session: Option<SessionBinding>,
    or_fail: bool,
    pending_error: Option<TesseraError>,
}

impl UpdateQuery {
    pub(crate) fn new(model: Model, cardinality: Cardinality) -> Self {
        Self {
            model,
            cardinality,
            filter: Document::new(),
            updates: Document::new(),
            options: UpdateQueryOptions::default(),
            session: None,
            or_fail: false,
            pending_error: None,
        }
    }

    fn method(&self) -> &'static str {
        match self.cardinality {
            Cardinality::One => "updateOne",
            Cardinality::Many => "updateMany",
        }
    }

    /// Replace the filter; ids become `{ _id: id }`
    pub fn filter(mut self, filter: impl Into<IdOrFilter>) -> Self {
        match filter.into().into_filter() {
            Ok(filter) => self.filter = filter,
            Err(e) => {
                self.pending_error.get_or_insert(e);
            }
        }
        self
    }

    /// Merge an update document; plain keys are treated as `$set`
    pub fn updates(mut self, updates: Document) -> Self {
        merge_updates(&mut self.updates, updates);
        self
    }

    /// `$set` one dotted path
    pub fn set(mut self, path: impl Into<String>, value: impl Into<Bson>) -> Self {
        let mut field = Document::new();
        field.insert(path.into(), value.into());
        merge_updates(&mut self.updates, field);
        self
    }

    pub fn validate(mut self, validate: bool) -> Self {
        self.options.validate = validate;
        self
    }

    pub fn upsert(mut self, upsert: bool) -> Self {
        self.options.upsert = upsert;
        self
    }

    pub fn array_filters(mut self, filters: Vec<Document>) -> Self {
        self.options.array_filters = Some(filters);
        self
    }

    pub fn session(mut self, binding: impl Into<SessionBinding>) -> Result<Self> {
        let binding = binding.into();
        binding.check(self.model.connection_index())?;
        self.session = Some(binding);
        Ok(self)
    }

    /// Fail with `NotFound` when nothing was modified
    pub fn or_fail(mut self) -> Self {
        self.or_fail = true;
        self
    }

    /// The update document accumulated so far, before hooks and validation
    pub fn update_document(&self) -> &Document {
        &self.updates
    }

    pub(crate) fn filter_document(&self) -> Result<Document> {
        match &self.pending_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.filter.clone()),
        }
    }

    pub(crate) fn session_binding(&self) -> Option<&SessionBinding> {
        self.session.as_ref()
    }

    pub(crate) fn set_session(&mut self, binding: SessionBinding) {
        self.session = Some(binding);
    }
}

#[async_trait]
impl Resolve for UpdateQuery {
    type Output = UpdateOutcome;

    #[instrument(level = "debug", skip_all, fields(method = self.method()))]
    async fn resolve(&mut self) -> Result<UpdateOutcome> {
        let filter = self.filter_document()?;
        let method = self.method();
        let hooks = self.model.hooks_snapshot();

        let updates = hooks.run_pre_update(method, &filter, self.updates.clone()).await?;
        self.model.log_query(
            method,
            &[Bson::Document(filter.clone()), Bson::Document(updates.clone())],
            self.session.as_ref(),
        );

        let updates = if self.options.validate {
            validate_modifiers(&updates, self.model.schema()?)?
        } else {
            updates
        };

        let mut options = UpdateOptions::default();
        if self.options.upsert {
            options.upsert = Some(true);
        }
        options.array_filters = self.options.array_filters.clone();

        let collection = self.model.collection()?;
        let session = self.model.resolve_session(self.session.as_ref()).await?;
        let result = match (self.cardinality, session) {
            (Cardinality::One, Some(session)) => {
                let mut guard = session.lock().await;
                collection
                    .update_one(filter, updates.clone())
                    .with_options(options)
                    .session(&mut *guard)
                    .await?
            }
            (Cardinality::One, None) => {
                collection
                    .update_one(filter, updates.clone())
                    .with_options(options)
                    .await?
            }
            (Cardinality::Many, Some(session)) => {
                let mut guard = session.lock().await;
                collection
                    .update_many(filter, updates.clone())
                    .with_options(options)
                    .session(&mut *guard)
                    .await?
            }
            (Cardinality::Many, None) => {
                collection
                    .update_many(filter, updates.clone())
                    .with_options(options)
                    .await?
            }
        };

        let event = hooks
            .run_post_update(UpdatePostEvent {
                method,
                updates,
                matched_count: result.matched_count,
                modified_count: result.modified_count,
                upserted_id: result.upserted_id,
            })
            .await?;

        if self.or_fail && event.modified_count == 0 && event.upserted_id.is_none() {
            return Err(TesseraError::NotFound("Record update has been failed!".to_string()));
        }

        Ok(UpdateOutcome::new(
            event.matched_count,
            event.modified_count,
            event.upserted_id,
            event.updates,
        ))
    }
}

awaitable!(UpdateQuery);

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_plain_keys_fold_into_set() {
        let mut updates = Document::new();
        merge_updates(&mut updates, doc! { "a": 1 });
        merge_updates(&mut updates, doc! { "b": 2 });
        assert_eq!(updates, doc! { "$set": { "a": 1, "b": 2 } });
    }

    #[test]
    fn test_last_write_wins_per_leaf() {
        let mut updates = Document::new();
        merge_updates(&mut updates, doc! { "a": 1, "$inc": { "n": 1 } });
        merge_updates(&mut updates, doc! { "$set": { "a": 2 }, "$inc": { "m": 1 } });
        assert_eq!(
            updates,
            doc! { "$set": { "a": 2 }, "$inc": { "n": 1, "m": 1 } }
        );
    }

    #[test]
    fn test_modifications_view() {
        let outcome = UpdateOutcome::new(
            1,
            1,
            None,
            doc! {
                "$set": { "profile.city": "Paris", "items.$.qty": 2 },
                "$push": { "tags": "x" },
                "$inc": { "visits": 1 },
            },
        );
        assert_eq!(
            outcome.modifications(),
            &doc! {
                "profile": { "city": "Paris" },
                "items": { "0": { "qty": 2 } },
                "tags": ["x"],
            }
        );
    }
}
