//! Find queries paired with an update or a delete on the same filter
//!
//! The mutation's filter becomes the find's initial `$match`, so both halves
//! address the same documents. The two halves are separate round-trips;
//! bind them to a transaction when they must observe one snapshot.

use super::delete::DeleteQuery;
use super::find::FindStage;
use super::populate::PopulateOptions;
use super::update::UpdateQuery;
use super::{FindOneQuery, FindQuery, IdOrFilter, Resolve};
use crate::model::Model;
use crate::transaction::SessionBinding;
use async_trait::async_trait;
use bson::{Bson, Document};
use futures::future::BoxFuture;
use std::future::IntoFuture;
use tessera_common::Result;

/// Which half runs first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOrder {
    /// Resolve to the documents as they are after the mutation
    MutateThenFind,
    /// Resolve to the documents as they were before the mutation
    FindThenMutate,
}

/// Builder methods that forward to the find half
macro_rules! find_half {
    () => {
        pub fn sort(mut self, sort: Document) -> Self {
            self.find.base_mut().sort(sort);
            self
        }

        pub fn project(mut self, project: Document) -> Self {
            self.find.base_mut().project(project);
            self
        }

        pub fn skip(mut self, skip: u64) -> Self {
            self.find.base_mut().skip(skip);
            self
        }

        pub fn limit(mut self, limit: i64) -> Self {
            self.find.base_mut().limit(limit);
            self
        }

        pub fn populate(mut self, field: &str, target: &Model, options: PopulateOptions) -> Result<Self> {
            self.find.base_mut().populate(field, target, options, false)?;
            Ok(self)
        }

        pub fn populate_one(mut self, field: &str, target: &Model, options: PopulateOptions) -> Result<Self> {
            self.find.base_mut().populate(field, target, options, true)?;
            Ok(self)
        }

        pub fn fetch(mut self, field: &str, target: &Model, options: PopulateOptions) -> Self {
            self.find.base_mut().fetch(field, target, options, false);
            self
        }

        pub fn fetch_one(mut self, field: &str, target: &Model, options: PopulateOptions) -> Self {
            self.find.base_mut().fetch(field, target, options, true);
            self
        }
    };
}

// ============================================================================
// Find + update
// ============================================================================

pub struct FindAndUpdate<F> {
    find: F,
    update: UpdateQuery,
    order: MutationOrder,
}

pub type UpdateAndFindOneQuery = FindAndUpdate<FindOneQuery>;
pub type UpdateAndFindManyQuery = FindAndUpdate<FindQuery>;
pub type FindAndUpdateOneQuery = FindAndUpdate<FindOneQuery>;
pub type FindAndUpdateManyQuery = FindAndUpdate<FindQuery>;

impl<F: FindStage> FindAndUpdate<F> {
    pub(crate) fn new(find: F, update: UpdateQuery, order: MutationOrder) -> Self {
        Self { find, update, order }
    }

    pub fn filter(mut self, filter: impl Into<IdOrFilter>) -> Self {
        self.update = self.update.filter(filter);
        self
    }

    pub fn updates(mut self, updates: Document) -> Self {
        self.update = self.update.updates(updates);
        self
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.update = self.update.set(path, value);
        self
    }

    pub fn validate(mut self, validate: bool) -> Self {
        self.update = self.update.validate(validate);
        self
    }

    pub fn upsert(mut self, upsert: bool) -> Self {
        self.update = self.update.upsert(upsert);
        self
    }

    pub fn array_filters(mut self, filters: Vec<Document>) -> Self {
        self.update = self.update.array_filters(filters);
        self
    }

    /// Bind both halves
    pub fn session(mut self, binding: impl Into<SessionBinding>) -> Result<Self> {
        let binding = binding.into();
        self.find.base_mut().session(binding.clone())?;
        self.update.set_session(binding);
        Ok(self)
    }

    find_half!();
}

#[async_trait]
impl<F: FindStage> Resolve for FindAndUpdate<F> {
    type Output = F::Output;

    async fn resolve(&mut self) -> Result<F::Output> {
        let filter = self.update.filter_document()?;
        self.find.base_mut().set_initial_filter(filter);
        if let Some(binding) = self.update.session_binding().cloned() {
            self.find.base_mut().session(binding)?;
        }

        match self.order {
            MutationOrder::MutateThenFind => {
                self.update.resolve().await?;
                self.find.resolve().await
            }
            MutationOrder::FindThenMutate => {
                let found = self.find.resolve().await?;
                self.update.resolve().await?;
                Ok(found)
            }
        }
    }
}

impl<F: FindStage + 'static> IntoFuture for FindAndUpdate<F> {
    type Output = Result<F::Output>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(mut self) -> Self::IntoFuture {
        Box::pin(async move { self.resolve().await })
    }
}

// ============================================================================
// Find + delete
// ============================================================================

/// Reads the matching documents, then deletes them
pub struct FindAndDelete<F> {
    find: F,
    delete: DeleteQuery,
}

pub type FindAndDeleteOneQuery = FindAndDelete<FindOneQuery>;
pub type FindAndDeleteManyQuery = FindAndDelete<FindQuery>;

impl<F: FindStage> FindAndDelete<F> {
    pub(crate) fn new(find: F, delete: DeleteQuery) -> Self {
        Self { find, delete }
    }

    pub fn filter(mut self, filter: impl Into<IdOrFilter>) -> Self {
        self.delete = self.delete.filter(filter);
        self
    }

    pub fn session(mut self, binding: impl Into<SessionBinding>) -> Result<Self> {
        let binding = binding.into();
        self.find.base_mut().session(binding.clone())?;
        self.delete.set_session(binding);
        Ok(self)
    }

    find_half!();
}

#[async_trait]
impl<F: FindStage> Resolve for FindAndDelete<F> {
    type Output = F::Output;

    async fn resolve(&mut self) -> Result<F::Output> {
        let filter = self.delete.filter_document()?;
        self.find.base_mut().set_initial_filter(filter);
        if let Some(binding) = self.delete.session_binding().cloned() {
            self.find.base_mut().session(binding)?;
        }

        let found = self.find.resolve().await?;
        self.delete.resolve().await?;
        Ok(found)
    }
}

impl<F: FindStage + 'static> IntoFuture for FindAndDelete<F> {
    type Output = Result<F::Output>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(mut self) -> Self::IntoFuture {
        Box::pin(async move { self.resolve().await })
    }
}
