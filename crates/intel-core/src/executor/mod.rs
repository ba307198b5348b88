//! Pluggable module executors.
//!
//! The orchestrator never knows how a module gathers its data. It looks the
//! module up in an `ExecutorSet` (one executor per `ModuleId`, checked when
//! the set is built) and calls `execute` with an `ExecutionContext`.

mod http;

pub use http::{HttpExecutor, HttpExecutorConfig};

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::entity::EntityDescriptor;
use crate::error::{IntelError, Result};
use crate::registry::ModuleId;
use crate::session::SessionGuard;
use crate::tracker::{LogLevel, RunTracker};

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{0}")]
    Failed(String),

    #[error("automation session was closed")]
    SessionClosed,

    #[error("invalid result: {0}")]
    InvalidResult(String),

    #[error("http: {0}")]
    Http(String),
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Everything an executor may touch while it runs.
#[derive(Clone)]
pub struct ExecutionContext {
    pub entity: EntityDescriptor,
    module: ModuleId,
    run_id: Uuid,
    tracker: Arc<RunTracker>,
}

impl ExecutionContext {
    pub fn new(
        entity: EntityDescriptor,
        module: ModuleId,
        run_id: Uuid,
        tracker: Arc<RunTracker>,
    ) -> Self {
        Self {
            entity,
            module,
            run_id,
            tracker,
        }
    }

    pub fn entity_id(&self) -> u64 {
        self.entity.id
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Forward a progress line into the run log, tagged with the module.
    pub fn log(&self, message: impl AsRef<str>, level: LogLevel) {
        self.tracker.append_log(
            self.run_id,
            format!("{}: {}", self.module, message.as_ref()),
            level,
        );
    }

    /// Check out an automation session for the rest of this invocation.
    pub fn acquire_session(&self) -> SessionGuard {
        self.tracker.attach_session(self.run_id, self.module)
    }

    /// True once the run was cancelled or superseded.
    pub fn is_cancelled(&self) -> bool {
        self.tracker.is_cancelled(self.run_id)
    }
}

// ---------------------------------------------------------------------------
// ModuleExecutor
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ModuleExecutor: Send + Sync {
    /// Gather this module's data for `ctx.entity`. The returned value must
    /// be a JSON object.
    async fn execute(&self, ctx: &ExecutionContext)
        -> std::result::Result<serde_json::Value, ExecutorError>;
}

/// Adapts an async closure into a `ModuleExecutor`.
pub struct FnExecutor<F>(F);

impl<F, Fut> FnExecutor<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<serde_json::Value, ExecutorError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> ModuleExecutor for FnExecutor<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<serde_json::Value, ExecutorError>> + Send + 'static,
{
    async fn execute(
        &self,
        ctx: &ExecutionContext,
    ) -> std::result::Result<serde_json::Value, ExecutorError> {
        (self.0)(ctx.clone()).await
    }
}

// ---------------------------------------------------------------------------
// ExecutorSet
// ---------------------------------------------------------------------------

/// One executor per registered module. Can only be built complete.
#[derive(Clone)]
pub struct ExecutorSet {
    // Indexed by `ModuleId as usize`, i.e. catalog order.
    executors: Vec<Arc<dyn ModuleExecutor>>,
}

impl ExecutorSet {
    pub fn builder() -> ExecutorSetBuilder {
        ExecutorSetBuilder {
            slots: vec![None; ModuleId::ALL.len()],
        }
    }

    pub fn get(&self, module: ModuleId) -> &Arc<dyn ModuleExecutor> {
        &self.executors[module as usize]
    }
}

pub struct ExecutorSetBuilder {
    slots: Vec<Option<Arc<dyn ModuleExecutor>>>,
}

impl ExecutorSetBuilder {
    pub fn register(mut self, module: ModuleId, executor: Arc<dyn ModuleExecutor>) -> Self {
        self.slots[module as usize] = Some(executor);
        self
    }

    /// Register the same executor for every module that has none yet.
    pub fn fill_missing(mut self, executor: Arc<dyn ModuleExecutor>) -> Self {
        for slot in &mut self.slots {
            if slot.is_none() {
                *slot = Some(Arc::clone(&executor));
            }
        }
        self
    }

    /// Fails with `MissingExecutor` naming the first module left unassigned.
    pub fn build(self) -> Result<ExecutorSet> {
        let mut executors = Vec::with_capacity(self.slots.len());
        for (module, slot) in ModuleId::ALL.into_iter().zip(self.slots) {
            match slot {
                Some(e) => executors.push(e),
                None => return Err(IntelError::MissingExecutor(module.to_string())),
            }
        }
        Ok(ExecutorSet { executors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok_executor(tag: &'static str) -> Arc<dyn ModuleExecutor> {
        Arc::new(FnExecutor::new(move |_ctx| async move { Ok(json!({ "tag": tag })) }))
    }

    fn test_ctx(module: ModuleId) -> ExecutionContext {
        let tracker = Arc::new(RunTracker::default());
        let ticket = tracker.try_start("test", Some(1), false).unwrap();
        ExecutionContext::new(
            EntityDescriptor::new(1, "Acme", None),
            module,
            ticket.run_id,
            tracker,
        )
    }

    #[test]
    fn build_rejects_an_incomplete_set() {
        let err = ExecutorSet::builder()
            .register(ModuleId::TenderHistory, ok_executor("a"))
            .build()
            .err()
            .unwrap();
        assert!(
            matches!(err, IntelError::MissingExecutor(ref m) if m == "profile_analysis"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn dispatch_uses_the_registered_executor() {
        let set = ExecutorSet::builder()
            .register(ModuleId::News, ok_executor("news"))
            .fill_missing(ok_executor("default"))
            .build()
            .unwrap();

        let ctx = test_ctx(ModuleId::News);
        let out = set.get(ModuleId::News).execute(&ctx).await.unwrap();
        assert_eq!(out, json!({"tag": "news"}));

        let ctx = test_ctx(ModuleId::Participants);
        let out = set.get(ModuleId::Participants).execute(&ctx).await.unwrap();
        assert_eq!(out, json!({"tag": "default"}));
    }

    #[test]
    fn context_log_lines_are_tagged_with_module() {
        let ctx = test_ctx(ModuleId::DebarmentCheck);
        ctx.log("3 records", LogLevel::Info);
        let snap = ctx.tracker.snapshot();
        assert_eq!(snap.log.last().unwrap().message, "debarment_check: 3 records");
    }
}
