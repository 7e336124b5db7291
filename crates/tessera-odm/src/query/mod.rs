//! Lazy query builders
//!
//! Builders only record state. Nothing touches the database until the
//! builder is awaited (which consumes it) or [`Resolve::resolve`] is called
//! (which can be repeated and re-executes every time).

mod composite;
mod delete;
mod fetch;
mod find;
mod populate;
mod update;

pub use composite::{
    FindAndDelete, FindAndDeleteManyQuery, FindAndDeleteOneQuery, FindAndUpdate,
    FindAndUpdateManyQuery, FindAndUpdateOneQuery, MutationOrder, UpdateAndFindManyQuery,
    UpdateAndFindOneQuery,
};
pub use delete::{DeleteOutcome, DeleteQuery};
pub use find::{CountQuery, ExistsQuery, FindOneQuery, FindOptions, FindQuery};
pub use populate::{populate_stages, PopulateConfig, PopulateOptions};
pub use update::{UpdateOutcome, UpdateQuery, UpdateQueryOptions};

pub(crate) use fetch::FetchConfig;
pub(crate) use find::FindBase;
pub(crate) use update::Cardinality;

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Document};
use tessera_common::{Result, TesseraError};

/// Single execution entry point of a query builder
#[async_trait]
pub trait Resolve: Send {
    type Output: Send;

    async fn resolve(&mut self) -> Result<Self::Output>;
}

/// Implements `IntoFuture` for a builder by boxing its `resolve`
macro_rules! awaitable {
    ($query:ty) => {
        impl std::future::IntoFuture for $query {
            type Output = tessera_common::Result<<$query as $crate::query::Resolve>::Output>;
            type IntoFuture = futures::future::BoxFuture<'static, Self::Output>;

            fn into_future(self) -> Self::IntoFuture {
                Box::pin(async move {
                    let mut query = self;
                    $crate::query::Resolve::resolve(&mut query).await
                })
            }
        }
    };
}
pub(crate) use awaitable;

/// A filter argument: an id (typed or hex string) or a filter document
#[derive(Debug, Clone, PartialEq)]
pub enum IdOrFilter {
    Id(ObjectId),
    /// Must parse as an ObjectId when resolved
    IdString(String),
    Filter(Document),
}

impl IdOrFilter {
    /// The filter document; ids become `{ _id: id }`
    pub fn into_filter(self) -> Result<Document> {
        match self {
            IdOrFilter::Id(id) => Ok(doc! { "_id": id }),
            IdOrFilter::IdString(raw) => ObjectId::parse_str(&raw)
                .map(|id| doc! { "_id": id })
                .map_err(|_| TesseraError::Query(format!("Invalid ObjectId filter: '{}'", raw))),
            IdOrFilter::Filter(filter) => Ok(filter),
        }
    }
}

impl From<ObjectId> for IdOrFilter {
    fn from(id: ObjectId) -> Self {
        IdOrFilter::Id(id)
    }
}

impl From<&ObjectId> for IdOrFilter {
    fn from(id: &ObjectId) -> Self {
        IdOrFilter::Id(*id)
    }
}

impl From<&str> for IdOrFilter {
    fn from(raw: &str) -> Self {
        IdOrFilter::IdString(raw.to_string())
    }
}

impl From<String> for IdOrFilter {
    fn from(raw: String) -> Self {
        IdOrFilter::IdString(raw)
    }
}

impl From<Document> for IdOrFilter {
    fn from(filter: Document) -> Self {
        IdOrFilter::Filter(filter)
    }
}

impl From<&Document> for IdOrFilter {
    fn from(filter: &Document) -> Self {
        IdOrFilter::Filter(filter.clone())
    }
}
