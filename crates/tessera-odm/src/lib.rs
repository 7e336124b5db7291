//! Schema-validated MongoDB object-document mapper
//!
//! # Features
//! - Lazy query builders that resolve when awaited
//! - Update-modifier validation of only the touched paths
//! - Embedded population through `$lookup` and cross-connection fetches
//! - Pre/post hooks per model for create, read, update, delete and replace
//! - Transactions spanning several connections
//! - Read-through caching with a pluggable provider
//!
//! ```ignore
//! use bson::doc;
//! use tessera_odm::{ModelOptions, Odm, OdmConfig};
//! use tessera_validation::Schema;
//!
//! let odm = Odm::new(OdmConfig::from_env());
//! odm.connect(["mongodb://localhost:27017/app"]).await?;
//!
//! let users = odm.model(
//!     "user",
//!     Schema::object([("name", Schema::string()), ("age", Schema::int().optional())]),
//!     ModelOptions::default(),
//! )?;
//!
//! let created = users.create(doc! { "name": "Ada" }).await?;
//! let adults = users.find(doc! { "age": { "$gte": 18 } }).sort(doc! { "name": 1 }).await?;
//! ```

pub mod cache;
pub mod config;
pub mod connection;
pub mod hooks;
pub mod model;
pub mod modifier;
pub mod naming;
pub mod odm;
pub mod path;
pub mod query;
pub mod transaction;

pub use cache::{use_caching, CacheOptions, CacheProvider, MemoryCache};
pub use config::OdmConfig;
pub use connection::{Connection, PoolConfig};
pub use hooks::{HookEvent, HookPhase, HookRegistry};
pub use model::{Model, ModelOptions, ReplaceOutcome, SchemaSource, WriteOptions};
pub use modifier::validate_modifiers;
pub use odm::{ConnectionEvent, Odm};
pub use query::{
    CountQuery, DeleteOutcome, DeleteQuery, ExistsQuery, FindOneQuery, FindOptions, FindQuery,
    IdOrFilter, MutationOrder, PopulateOptions, Resolve, UpdateOutcome, UpdateQuery,
};
pub use tessera_common::{Result, TesseraError};
pub use transaction::{BoundSession, SessionBinding, Transaction, TransactionError, TransactionOptions};
