//! Transactions spanning one or more connections
//!
//! A [`Transaction`] opens at most one session per connection index, lazily,
//! the first time a query bound to it runs on that index. When the callback
//! succeeds every owned session is committed; when it fails every owned
//! session is aborted and the callback's error is returned as is. This is
//! not two-phase commit: a failure while committing the second of two
//! connections leaves the first committed.
//!
//! Sessions end when the last handle to the transaction is dropped.

use crate::odm::Odm;
use async_trait::async_trait;
use futures::future::join_all;
use mongodb::ClientSession;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tessera_common::{Result, TesseraError};
use tracing::{debug, warn};

/// A driver session shared between the queries of one transaction
pub type SharedSession = Arc<tokio::sync::Mutex<ClientSession>>;

/// Transaction control over one session
#[async_trait]
pub trait SessionControl: Send {
    async fn start(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn abort(&mut self) -> Result<()>;
}

#[async_trait]
impl SessionControl for ClientSession {
    async fn start(&mut self) -> Result<()> {
        self.start_transaction().await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.commit_transaction().await?;
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.abort_transaction().await?;
        Ok(())
    }
}

/// Error types a transaction callback may return
pub trait TransactionError: From<TesseraError> {
    /// Whether the whole callback may be retried
    fn is_transient(&self) -> bool;
}

impl TransactionError for TesseraError {
    fn is_transient(&self) -> bool {
        self.is_retryable()
    }
}

impl TransactionError for anyhow::Error {
    fn is_transient(&self) -> bool {
        self.downcast_ref::<TesseraError>()
            .is_some_and(TesseraError::is_retryable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Extra attempts after a transient transaction error
    pub max_retries: usize,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

// ============================================================================
// Session table
// ============================================================================

struct SessionEntry<S> {
    session: Arc<tokio::sync::Mutex<S>>,
    /// Sessions handed in by a parent are committed by the parent
    owned: bool,
}

pub(crate) struct Sessions<S> {
    entries: Mutex<BTreeMap<usize, SessionEntry<S>>>,
    /// Held while a session is being opened
    opening: tokio::sync::Mutex<()>,
}

impl<S: SessionControl> Sessions<S> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            opening: tokio::sync::Mutex::new(()),
        }
    }

    /// Session for `index`, opened with `open` when there is none yet.
    /// Openings are serialised, so concurrent first uses share one session.
    pub(crate) async fn get_or_open<F, Fut>(&self, index: usize, open: F) -> Result<Arc<tokio::sync::Mutex<S>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        if let Some(session) = self.get(index) {
            return Ok(session);
        }
        let _opening = self.opening.lock().await;
        if let Some(session) = self.get(index) {
            return Ok(session);
        }
        let session = open().await?;
        Ok(self.insert(index, session, true))
    }

    pub(crate) fn get(&self, index: usize) -> Option<Arc<tokio::sync::Mutex<S>>> {
        self.entries.lock().get(&index).map(|e| e.session.clone())
    }

    /// Insert unless another task got there first; the winner is returned
    pub(crate) fn insert(&self, index: usize, session: S, owned: bool) -> Arc<tokio::sync::Mutex<S>> {
        self.entries
            .lock()
            .entry(index)
            .or_insert_with(|| SessionEntry {
                session: Arc::new(tokio::sync::Mutex::new(session)),
                owned,
            })
            .session
            .clone()
    }

    pub(crate) fn adopt(&self, index: usize, session: Arc<tokio::sync::Mutex<S>>) {
        self.entries
            .lock()
            .insert(index, SessionEntry { session, owned: false });
    }

    fn owned(&self) -> Vec<(usize, Arc<tokio::sync::Mutex<S>>)> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, e)| e.owned)
            .map(|(index, e)| (*index, e.session.clone()))
            .collect()
    }

    /// Commit in index order. On the first failure the remaining sessions,
    /// including the failed one, are aborted.
    pub(crate) async fn commit_all(&self) -> Result<()> {
        let owned = self.owned();
        for (position, (index, session)) in owned.iter().enumerate() {
            let committed = session.lock().await.commit().await;
            match committed {
                Ok(()) => debug!(connection = index, "transaction committed"),
                Err(e) => {
                    warn!(connection = index, error = %e, "commit failed, aborting remaining sessions");
                    abort_each(&owned[position..]).await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn abort_all(&self) {
        abort_each(&self.owned()).await;
    }
}

async fn abort_each<S: SessionControl>(sessions: &[(usize, Arc<tokio::sync::Mutex<S>>)]) {
    let aborts = sessions.iter().map(|(index, session)| async move {
        match session.lock().await.abort().await {
            Ok(()) => debug!(connection = index, "transaction aborted"),
            Err(e) => warn!(connection = index, error = %e, "abort failed"),
        }
    });
    join_all(aborts).await;
}

/// Run `body`, then commit or abort every owned session of `sessions`
pub(crate) async fn bracket<S, T, E, Fut>(sessions: &Sessions<S>, body: Fut) -> std::result::Result<T, E>
where
    S: SessionControl,
    E: From<TesseraError>,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    match body.await {
        Ok(value) => {
            sessions.commit_all().await.map_err(E::from)?;
            Ok(value)
        }
        Err(e) => {
            sessions.abort_all().await;
            Err(e)
        }
    }
}

// ============================================================================
// Transaction
// ============================================================================

struct TransactionInner {
    odm: Odm,
    sessions: Sessions<ClientSession>,
}

/// Cloneable handle passed to transaction callbacks
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let indexes: Vec<usize> = self.inner.sessions.entries.lock().keys().copied().collect();
        f.debug_struct("Transaction").field("sessions", &indexes).finish()
    }
}

impl Transaction {
    fn new(odm: &Odm) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                odm: odm.clone(),
                sessions: Sessions::new(),
            }),
        }
    }

    /// Run `callback` inside a transaction.
    ///
    /// With a `Transaction` parent the callback joins it and nothing is
    /// committed here. With a `BoundSession` parent the session is reused but
    /// left for its owner to commit; sessions opened on other indexes are
    /// committed here.
    pub async fn run<T, E, F, Fut>(
        odm: &Odm,
        parent: Option<SessionBinding>,
        options: TransactionOptions,
        callback: F,
    ) -> std::result::Result<T, E>
    where
        E: TransactionError,
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        match parent {
            Some(SessionBinding::Transaction(parent)) => return callback(parent).await,
            Some(SessionBinding::Session(bound)) => {
                let txn = Self::new(odm);
                txn.inner.sessions.adopt(bound.index, bound.session);
                return bracket(&txn.inner.sessions, callback(txn.clone())).await;
            }
            None => {}
        }

        let mut attempt = 0;
        loop {
            let txn = Self::new(odm);
            match bracket(&txn.inner.sessions, callback(txn.clone())).await {
                Err(e) if e.is_transient() && attempt < options.max_retries => {
                    attempt += 1;
                    warn!(attempt, "transient transaction error, retrying");
                }
                result => return result,
            }
        }
    }

    /// Session for `index`, started with an open transaction on first use
    pub async fn session(&self, index: usize) -> Result<SharedSession> {
        let odm = &self.inner.odm;
        self.inner
            .sessions
            .get_or_open(index, move || async move {
                let connection = odm.connection(index)?;
                let mut session = connection.client().start_session().await?;
                session.start().await?;
                debug!(connection = index, "transaction started");
                Ok(session)
            })
            .await
    }

    pub fn is_active_on(&self, index: usize) -> bool {
        self.inner.sessions.get(index).is_some()
    }
}

// ============================================================================
// Session bindings
// ============================================================================

/// A session pinned to one connection index, controlled by its creator
#[derive(Clone)]
pub struct BoundSession {
    index: usize,
    session: SharedSession,
}

impl fmt::Debug for BoundSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientSession({})", self.index)
    }
}

impl BoundSession {
    /// Start a plain session on connection `index`
    pub async fn start(odm: &Odm, index: usize) -> Result<Self> {
        let session = odm.connection(index)?.client().start_session().await?;
        Ok(Self {
            index,
            session: Arc::new(tokio::sync::Mutex::new(session)),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    pub async fn start_transaction(&self) -> Result<()> {
        self.session.lock().await.start().await
    }

    pub async fn commit_transaction(&self) -> Result<()> {
        self.session.lock().await.commit().await
    }

    pub async fn abort_transaction(&self) -> Result<()> {
        self.session.lock().await.abort().await
    }
}

/// What a query can be bound to
#[derive(Clone, Debug)]
pub enum SessionBinding {
    Transaction(Transaction),
    Session(BoundSession),
}

impl From<Transaction> for SessionBinding {
    fn from(txn: Transaction) -> Self {
        SessionBinding::Transaction(txn)
    }
}

impl From<&Transaction> for SessionBinding {
    fn from(txn: &Transaction) -> Self {
        SessionBinding::Transaction(txn.clone())
    }
}

impl From<BoundSession> for SessionBinding {
    fn from(session: BoundSession) -> Self {
        SessionBinding::Session(session)
    }
}

impl From<&BoundSession> for SessionBinding {
    fn from(session: &BoundSession) -> Self {
        SessionBinding::Session(session.clone())
    }
}

impl SessionBinding {
    /// Fails when a bound session belongs to another connection
    pub(crate) fn check(&self, index: usize) -> Result<()> {
        match self {
            SessionBinding::Session(bound) if bound.index != index => {
                Err(TesseraError::CrossConnection(format!(
                    "session is bound to connection {} but the model uses connection {}",
                    bound.index, index
                )))
            }
            _ => Ok(()),
        }
    }

    pub(crate) async fn resolve(&self, index: usize) -> Result<SharedSession> {
        self.check(index)?;
        match self {
            SessionBinding::Transaction(txn) => txn.session(index).await,
            SessionBinding::Session(bound) => Ok(bound.session.clone()),
        }
    }

    /// The binding as seen by a model on `index`; bound sessions of other
    /// connections do not carry over
    pub(crate) fn for_index(&self, index: usize) -> Option<SessionBinding> {
        match self {
            SessionBinding::Session(bound) if bound.index != index => None,
            other => Some(other.clone()),
        }
    }
}
