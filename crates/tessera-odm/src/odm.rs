//! The ODM context: connection registry, model registry and cache provider
//!
//! One [`Odm`] is usually created at startup and cloned wherever it is
//! needed. `connect*` and `disconnect*` are the only operations that change
//! the connection registry. The model registry only holds weak references,
//! see [`Odm::get_model`].

use crate::cache::CacheProvider;
use crate::config::{split_urls, OdmConfig};
use crate::connection::Connection;
use crate::model::{Model, ModelInner, ModelOptions, SchemaSource};
use crate::transaction::{BoundSession, SessionBinding, Transaction, TransactionError, TransactionOptions};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tessera_common::{Result, TesseraError};
use tracing::{debug, info, instrument};

/// Connection lifecycle points hooks can attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    PreConnect,
    PostConnect,
    PreDisconnect,
    PostDisconnect,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionEvent::PreConnect => "pre-connect",
            ConnectionEvent::PostConnect => "post-connect",
            ConnectionEvent::PreDisconnect => "pre-disconnect",
            ConnectionEvent::PostDisconnect => "post-disconnect",
        };
        f.write_str(name)
    }
}

/// Async callback receiving the connection index
pub type ConnectionHook = Arc<dyn Fn(usize) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct OdmInner {
    config: OdmConfig,
    connections: RwLock<Vec<Option<Arc<Connection>>>>,
    models: RwLock<HashMap<String, Weak<ModelInner>>>,
    cache: RwLock<Option<Arc<dyn CacheProvider>>>,
    connection_hooks: RwLock<HashMap<(ConnectionEvent, usize), Vec<ConnectionHook>>>,
}

#[derive(Clone)]
pub struct Odm {
    inner: Arc<OdmInner>,
}

impl fmt::Debug for Odm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let connected: Vec<usize> = self
            .inner
            .connections
            .read()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(index, _)| index)
            .collect();
        f.debug_struct("Odm")
            .field("connected", &connected)
            .field("models", &self.inner.models.read().len())
            .finish()
    }
}

impl Default for Odm {
    fn default() -> Self {
        Self::new(OdmConfig::default())
    }
}

impl Odm {
    pub fn new(config: OdmConfig) -> Self {
        Self {
            inner: Arc::new(OdmInner {
                config,
                connections: RwLock::new(Vec::new()),
                models: RwLock::new(HashMap::new()),
                cache: RwLock::new(None),
                connection_hooks: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Context configured from `TESSERA_*` environment variables
    pub fn from_env() -> Self {
        Self::new(OdmConfig::from_env())
    }

    pub fn config(&self) -> &OdmConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Connect indexes `0..n` to `urls` in order; entries may be comma-separated lists
    pub async fn connect<I, S>(&self, urls: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let urls: Vec<String> = urls
            .into_iter()
            .flat_map(|url| split_urls(url.as_ref()))
            .collect();
        for (index, url) in urls.iter().enumerate() {
            self.connect_index(index, url).await?;
        }
        Ok(())
    }

    /// Connect every URL of `OdmConfig::connection_urls`
    pub async fn connect_configured(&self) -> Result<()> {
        if self.inner.config.connection_urls.is_empty() {
            return Err(TesseraError::Configuration(
                "No connection URLs configured".to_string(),
            ));
        }
        let urls = self.inner.config.connection_urls.clone();
        self.connect(urls).await
    }

    /// Connect one index. Connecting an index that is already connected
    /// replaces its client; models pick up the new one on next use.
    #[instrument(level = "debug", skip(self, url))]
    pub async fn connect_index(&self, index: usize, url: &str) -> Result<()> {
        self.run_connection_hooks(ConnectionEvent::PreConnect, index).await?;

        let connection = Connection::with_config(index, url, self.inner.config.pool.clone()).await?;
        connection.ping().await?;
        let database = connection.database_name().to_string();

        let previous = {
            let mut connections = self.inner.connections.write();
            if connections.len() <= index {
                connections.resize(index + 1, None);
            }
            connections[index].replace(Arc::new(connection))
        };
        if previous.is_some() {
            debug!(connection = index, "replaced existing connection");
        }
        info!(connection = index, %database, "connected");

        self.run_connection_hooks(ConnectionEvent::PostConnect, index).await
    }

    /// Disconnect every connected index
    pub async fn disconnect(&self) -> Result<()> {
        for index in self.connected_indexes() {
            self.disconnect_index(index).await?;
        }
        Ok(())
    }

    /// Drop the client of one index; a no-op when it is not connected
    #[instrument(level = "debug", skip(self))]
    pub async fn disconnect_index(&self, index: usize) -> Result<()> {
        if !self.is_connected(index) {
            return Ok(());
        }
        self.run_connection_hooks(ConnectionEvent::PreDisconnect, index).await?;
        let removed = self
            .inner
            .connections
            .write()
            .get_mut(index)
            .and_then(Option::take);
        drop(removed);
        info!(connection = index, "disconnected");
        self.run_connection_hooks(ConnectionEvent::PostDisconnect, index).await
    }

    pub fn is_connected(&self, index: usize) -> bool {
        matches!(self.inner.connections.read().get(index), Some(Some(_)))
    }

    fn connected_indexes(&self) -> Vec<usize> {
        self.inner
            .connections
            .read()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(index, _)| index)
            .collect()
    }

    /// Current client of `index`
    pub fn connection(&self, index: usize) -> Result<Arc<Connection>> {
        self.inner
            .connections
            .read()
            .get(index)
            .cloned()
            .flatten()
            .ok_or_else(|| {
                TesseraError::Configuration(format!(
                    "Connection {} is not established; connect before using it",
                    index
                ))
            })
    }

    /// Drop the default database of `index`
    pub async fn drop_database(&self, index: usize) -> Result<()> {
        self.connection(index)?.drop_database().await
    }

    /// Drop the default database of every connected index
    pub async fn drop_all(&self) -> Result<()> {
        for index in self.connected_indexes() {
            self.drop_database(index).await?;
        }
        Ok(())
    }

    /// Register a connection hook. Hooks run in registration order and a
    /// failing pre-hook aborts the connect or disconnect. Post-connect hooks
    /// added while already connected do not fire until the next connect.
    pub fn on<F, Fut>(&self, event: ConnectionEvent, index: usize, hook: F)
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let hook: ConnectionHook = Arc::new(move |index| -> BoxFuture<'static, Result<()>> {
            Box::pin(hook(index))
        });
        self.inner
            .connection_hooks
            .write()
            .entry((event, index))
            .or_default()
            .push(hook);
    }

    async fn run_connection_hooks(&self, event: ConnectionEvent, index: usize) -> Result<()> {
        let hooks = self
            .inner
            .connection_hooks
            .read()
            .get(&(event, index))
            .cloned()
            .unwrap_or_default();
        if !hooks.is_empty() {
            debug!(%event, connection = index, count = hooks.len(), "running connection hooks");
        }
        for hook in hooks {
            hook(index).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Models
    // ------------------------------------------------------------------------

    /// Register a model on connection 0
    pub fn model(&self, name: &str, schema: impl Into<SchemaSource>, options: ModelOptions) -> Result<Model> {
        self.model_on(0, name, schema, options)
    }

    /// Register a model on connection `index`. A later registration under
    /// the same name replaces the registry entry.
    pub fn model_on(
        &self,
        index: usize,
        name: &str,
        schema: impl Into<SchemaSource>,
        options: ModelOptions,
    ) -> Result<Model> {
        let model = Model::new(self.clone(), name, index, schema.into(), options)?;
        let previous = self
            .inner
            .models
            .write()
            .insert(name.to_string(), model.downgrade());
        if previous.is_some_and(|p| p.strong_count() > 0) {
            debug!(model = name, "model registration replaced");
        }
        Ok(model)
    }

    /// A registered model that is still alive.
    ///
    /// Entries are weak: every model holds its `Odm`, so the registry never
    /// keeps a model alive. Once the last [`Model`] handle for `name` is
    /// dropped this returns `None`; keep the handle returned by
    /// [`Odm::model`] for as long as lookups by name must succeed.
    pub fn get_model(&self, name: &str) -> Option<Model> {
        self.inner
            .models
            .read()
            .get(name)
            .and_then(Weak::upgrade)
            .map(Model::from_inner)
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Run `callback` in a transaction with default options
    pub async fn transaction<T, E, F, Fut>(&self, callback: F) -> std::result::Result<T, E>
    where
        E: TransactionError,
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        Transaction::run(self, None, TransactionOptions::default(), callback).await
    }

    /// Run `callback` in a transaction, joining `parent` when given
    pub async fn transaction_with<T, E, F, Fut>(
        &self,
        parent: Option<SessionBinding>,
        options: TransactionOptions,
        callback: F,
    ) -> std::result::Result<T, E>
    where
        E: TransactionError,
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        Transaction::run(self, parent, options, callback).await
    }

    /// A plain session on connection `index`, controlled by the caller
    pub async fn start_session(&self, index: usize) -> Result<BoundSession> {
        BoundSession::start(self, index).await
    }

    // ------------------------------------------------------------------------
    // Cache
    // ------------------------------------------------------------------------

    pub fn set_cache_provider(&self, provider: Arc<dyn CacheProvider>) {
        *self.inner.cache.write() = Some(provider);
    }

    pub fn clear_cache_provider(&self) {
        *self.inner.cache.write() = None;
    }

    pub fn cache_provider(&self) -> Option<Arc<dyn CacheProvider>> {
        self.inner.cache.read().clone()
    }
}
