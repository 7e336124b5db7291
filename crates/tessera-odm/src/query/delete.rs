//! deleteOne / deleteMany

use super::update::Cardinality;
use super::{awaitable, IdOrFilter, Resolve};
use crate::hooks::DeletePostEvent;
use crate::model::Model;
use crate::transaction::SessionBinding;
use async_trait::async_trait;
use bson::{Bson, Document};
use tessera_common::{Result, TesseraError};
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted_count: u64,
}

#[derive(Clone)]
pub struct DeleteQuery {
    model: Model,
    cardinality: Cardinality,
    filter: Document,
    session: Option<SessionBinding>,
    or_fail: bool,
    pending_error: Option<TesseraError>,
}

impl DeleteQuery {
    pub(crate) fn new(model: Model, cardinality: Cardinality) -> Self {
        Self {
            model,
            cardinality,
            filter: Document::new(),
            session: None,
            or_fail: false,
            pending_error: None,
        }
    }

    fn method(&self) -> &'static str {
        match self.cardinality {
            Cardinality::One => "deleteOne",
            Cardinality::Many => "deleteMany",
        }
    }

    pub fn filter(mut self, filter: impl Into<IdOrFilter>) -> Self {
        match filter.into().into_filter() {
            Ok(filter) => self.filter = filter,
            Err(e) => {
                self.pending_error.get_or_insert(e);
            }
        }
        self
    }

    pub fn session(mut self, binding: impl Into<SessionBinding>) -> Result<Self> {
        let binding = binding.into();
        binding.check(self.model.connection_index())?;
        self.session = Some(binding);
        Ok(self)
    }

    /// Fail with `NotFound` when nothing was deleted
    pub fn or_fail(mut self) -> Self {
        self.or_fail = true;
        self
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
impl Resolve for DeleteQuery {
    type Output = DeleteOutcome;

    #[instrument(level = "debug", skip_all, fields(method = self.method()))]
    async fn resolve(&mut self) -> Result<DeleteOutcome> {
        let method = self.method();
        let hooks = self.model.hooks_snapshot();

        let filter = hooks.run_pre_delete(method, self.filter_document()?).await?;
        self.model
            .log_query(method, &[Bson::Document(filter.clone())], self.session.as_ref());

        let collection = self.model.collection()?;
        let session = self.model.resolve_session(self.session.as_ref()).await?;
        let result = match (self.cardinality, session) {
            (Cardinality::One, Some(session)) => {
                let mut guard = session.lock().await;
                collection.delete_one(filter).session(&mut *guard).await?
            }
            (Cardinality::One, None) => collection.delete_one(filter).await?,
            (Cardinality::Many, Some(session)) => {
                let mut guard = session.lock().await;
                collection.delete_many(filter).session(&mut *guard).await?
            }
            (Cardinality::Many, None) => collection.delete_many(filter).await?,
        };

        let event = hooks
            .run_post_delete(DeletePostEvent {
                method,
                deleted_count: result.deleted_count,
            })
            .await?;

        if self.or_fail && event.deleted_count == 0 {
            return Err(TesseraError::NotFound("Record deletion has been failed!".to_string()));
        }

        Ok(DeleteOutcome {
            deleted_count: event.deleted_count,
        })
    }
}

awaitable!(DeleteQuery);
