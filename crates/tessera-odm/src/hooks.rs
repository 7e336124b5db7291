//! Per-model pre/post hooks
//!
//! Hooks live in a fixed table with one ordered list per (event, phase).
//! Every chain folds: each hook receives the previous hook's output, and the
//! last output is what the operation uses or returns. All hooks of one chain
//! run sequentially in registration order.

use bson::{Bson, Document};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tessera_common::Result;
use tracing::debug;

/// Boxed async hook taking `I` and producing `O`
pub type Hook<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Create,
    Read,
    Update,
    Delete,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Pre,
    Post,
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookEvent::Create => "create",
            HookEvent::Read => "read",
            HookEvent::Update => "update",
            HookEvent::Delete => "delete",
            HookEvent::Replace => "replace",
        };
        f.write_str(name)
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::Pre => f.write_str("pre"),
            HookPhase::Post => f.write_str("post"),
        }
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Document being inserted (pre) or just inserted (post)
#[derive(Debug, Clone)]
pub struct CreateEvent {
    pub method: &'static str,
    pub data: Document,
}

#[derive(Debug, Clone)]
pub struct ReadPreEvent {
    pub method: &'static str,
    pub pipeline: Vec<Document>,
}

#[derive(Debug, Clone)]
pub struct ReadPostEvent {
    pub method: &'static str,
    pub data: Document,
}

/// Pre-update hooks return the update document to send
#[derive(Debug, Clone)]
pub struct UpdatePreEvent {
    pub method: &'static str,
    pub filter: Document,
    pub updates: Document,
}

/// Post-update hooks return the outcome the caller receives
#[derive(Debug, Clone)]
pub struct UpdatePostEvent {
    pub method: &'static str,
    /// The validated update document that was sent
    pub updates: Document,
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

/// Pre-delete hooks return the filter to delete by
#[derive(Debug, Clone)]
pub struct DeletePreEvent {
    pub method: &'static str,
    pub filter: Document,
}

#[derive(Debug, Clone, Copy)]
pub struct DeletePostEvent {
    pub method: &'static str,
    pub deleted_count: u64,
}

/// Pre-replace hooks return the replacement to validate and send
#[derive(Debug, Clone)]
pub struct ReplacePreEvent {
    pub method: &'static str,
    pub filter: Document,
    pub replacement: Document,
}

/// Post-replace hooks return the outcome the caller receives
#[derive(Debug, Clone)]
pub struct ReplacePostEvent {
    pub method: &'static str,
    pub replacement: Document,
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

// ============================================================================
// Hook table
// ============================================================================

#[derive(Clone, Default)]
pub struct Hooks {
    pre_create: Vec<Hook<CreateEvent, Document>>,
    post_create: Vec<Hook<CreateEvent, Document>>,
    pre_read: Vec<Hook<ReadPreEvent, Vec<Document>>>,
    post_read: Vec<Hook<ReadPostEvent, Document>>,
    pre_update: Vec<Hook<UpdatePreEvent, Document>>,
    post_update: Vec<Hook<UpdatePostEvent, UpdatePostEvent>>,
    pre_delete: Vec<Hook<DeletePreEvent, Document>>,
    post_delete: Vec<Hook<DeletePostEvent, DeletePostEvent>>,
    pre_replace: Vec<Hook<ReplacePreEvent, Document>>,
    post_replace: Vec<Hook<ReplacePostEvent, ReplacePostEvent>>,
}

fn boxed<I, O, F, Fut>(hook: F) -> Hook<I, O>
where
    I: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    Arc::new(move |input| Box::pin(hook(input)))
}

fn trace_run(event: HookEvent, phase: HookPhase, count: usize) {
    if count > 0 {
        debug!(%event, %phase, count, "running hooks");
    }
}

impl Hooks {
    /// Number of hooks registered for one (event, phase)
    pub fn count(&self, event: HookEvent, phase: HookPhase) -> usize {
        match (event, phase) {
            (HookEvent::Create, HookPhase::Pre) => self.pre_create.len(),
            (HookEvent::Create, HookPhase::Post) => self.post_create.len(),
            (HookEvent::Read, HookPhase::Pre) => self.pre_read.len(),
            (HookEvent::Read, HookPhase::Post) => self.post_read.len(),
            (HookEvent::Update, HookPhase::Pre) => self.pre_update.len(),
            (HookEvent::Update, HookPhase::Post) => self.post_update.len(),
            (HookEvent::Delete, HookPhase::Pre) => self.pre_delete.len(),
            (HookEvent::Delete, HookPhase::Post) => self.post_delete.len(),
            (HookEvent::Replace, HookPhase::Pre) => self.pre_replace.len(),
            (HookEvent::Replace, HookPhase::Post) => self.post_replace.len(),
        }
    }

    pub async fn run_pre_create(&self, method: &'static str, mut data: Document) -> Result<Document> {
        trace_run(HookEvent::Create, HookPhase::Pre, self.pre_create.len());
        for hook in &self.pre_create {
            data = hook(CreateEvent { method, data }).await?;
        }
        Ok(data)
    }

    pub async fn run_post_create(&self, method: &'static str, mut data: Document) -> Result<Document> {
        trace_run(HookEvent::Create, HookPhase::Post, self.post_create.len());
        for hook in &self.post_create {
            data = hook(CreateEvent { method, data }).await?;
        }
        Ok(data)
    }

    pub async fn run_pre_read(
        &self,
        method: &'static str,
        mut pipeline: Vec<Document>,
    ) -> Result<Vec<Document>> {
        trace_run(HookEvent::Read, HookPhase::Pre, self.pre_read.len());
        for hook in &self.pre_read {
            pipeline = hook(ReadPreEvent { method, pipeline }).await?;
        }
        Ok(pipeline)
    }

    pub async fn run_post_read(&self, method: &'static str, mut data: Document) -> Result<Document> {
        for hook in &self.post_read {
            data = hook(ReadPostEvent { method, data }).await?;
        }
        Ok(data)
    }

    pub async fn run_pre_update(
        &self,
        method: &'static str,
        filter: &Document,
        mut updates: Document,
    ) -> Result<Document> {
        trace_run(HookEvent::Update, HookPhase::Pre, self.pre_update.len());
        for hook in &self.pre_update {
            updates = hook(UpdatePreEvent {
                method,
                filter: filter.clone(),
                updates,
            })
            .await?;
        }
        Ok(updates)
    }

    pub async fn run_post_update(&self, mut event: UpdatePostEvent) -> Result<UpdatePostEvent> {
        trace_run(HookEvent::Update, HookPhase::Post, self.post_update.len());
        for hook in &self.post_update {
            event = hook(event).await?;
        }
        Ok(event)
    }

    pub async fn run_pre_delete(&self, method: &'static str, mut filter: Document) -> Result<Document> {
        trace_run(HookEvent::Delete, HookPhase::Pre, self.pre_delete.len());
        for hook in &self.pre_delete {
            filter = hook(DeletePreEvent { method, filter }).await?;
        }
        Ok(filter)
    }

    pub async fn run_post_delete(&self, mut event: DeletePostEvent) -> Result<DeletePostEvent> {
        trace_run(HookEvent::Delete, HookPhase::Post, self.post_delete.len());
        for hook in &self.post_delete {
            event = hook(event).await?;
        }
        Ok(event)
    }

    pub async fn run_pre_replace(
        &self,
        method: &'static str,
        filter: &Document,
        mut replacement: Document,
    ) -> Result<Document> {
        trace_run(HookEvent::Replace, HookPhase::Pre, self.pre_replace.len());
        for hook in &self.pre_replace {
            replacement = hook(ReplacePreEvent {
                method,
                filter: filter.clone(),
                replacement,
            })
            .await?;
        }
        Ok(replacement)
    }

    pub async fn run_post_replace(&self, mut event: ReplacePostEvent) -> Result<ReplacePostEvent> {
        trace_run(HookEvent::Replace, HookPhase::Post, self.post_replace.len());
        for hook in &self.post_replace {
            event = hook(event).await?;
        }
        Ok(event)
    }
}

/// Shared, mutable hook table of one model and all of its populate clones
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Arc<RwLock<Hooks>>,
}

impl HookRegistry {
    /// Copy of the current table; hooks added afterwards do not affect it
    pub fn snapshot(&self) -> Hooks {
        self.hooks.read().clone()
    }

    pub fn pre_create<F, Fut>(&self, hook: F)
    where
        F: Fn(CreateEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Document>> + Send + 'static,
    {
        self.hooks.write().pre_create.push(boxed(hook));
    }

    pub fn post_create<F, Fut>(&self, hook: F)
    where
        F: Fn(CreateEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Document>> + Send + 'static,
    {
        self.hooks.write().post_create.push(boxed(hook));
    }

    pub fn pre_read<F, Fut>(&self, hook: F)
    where
        F: Fn(ReadPreEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Document>>> + Send + 'static,
    {
        self.hooks.write().pre_read.push(boxed(hook));
    }

    pub fn post_read<F, Fut>(&self, hook: F)
    where
        F: Fn(ReadPostEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Document>> + Send + 'static,
    {
        self.hooks.write().post_read.push(boxed(hook));
    }

    pub fn pre_update<F, Fut>(&self, hook: F)
    where
        F: Fn(UpdatePreEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Document>> + Send + 'static,
    {
        self.hooks.write().pre_update.push(boxed(hook));
    }

    pub fn post_update<F, Fut>(&self, hook: F)
    where
        F: Fn(UpdatePostEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UpdatePostEvent>> + Send + 'static,
    {
        self.hooks.write().post_update.push(boxed(hook));
    }

    pub fn pre_delete<F, Fut>(&self, hook: F)
    where
        F: Fn(DeletePreEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Document>> + Send + 'static,
    {
        self.hooks.write().pre_delete.push(boxed(hook));
    }

    pub fn post_delete<F, Fut>(&self, hook: F)
    where
        F: Fn(DeletePostEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DeletePostEvent>> + Send + 'static,
    {
        self.hooks.write().post_delete.push(boxed(hook));
    }

    pub fn pre_replace<F, Fut>(&self, hook: F)
    where
        F: Fn(ReplacePreEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Document>> + Send + 'static,
    {
        self.hooks.write().pre_replace.push(boxed(hook));
    }

    pub fn post_replace<F, Fut>(&self, hook: F)
    where
        F: Fn(ReplacePostEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ReplacePostEvent>> + Send + 'static,
    {
        self.hooks.write().post_replace.push(boxed(hook));
    }
}
