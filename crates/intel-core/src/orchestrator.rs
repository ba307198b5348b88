//! Phase orchestrator for entity intelligence runs.
//!
//! A run is started synchronously by `Orchestrator::start`, which performs
//! every precondition check (entity exists, single-flight guard, stale
//! takeover), repairs stale records, marks the run's modules `running`, and
//! then hands the run to a supervised background task. The caller gets an
//! immediate acknowledgment; outcomes are observed by polling the store or
//! the run tracker.
//!
//! Run-all executes three phases in strict order:
//!
//! 1. the solo-first module, alone;
//! 2. every parallel-middle module concurrently, each in its own task;
//! 3. the solo-last module, alone, with the longer synthesis timeout.
//!
//! A module failing, timing out or panicking is recorded as `error` on that
//! module only. No phase ever fails as a whole.
//!
//! Status writes are owned per module: a run writes only the records it has
//! claimed in the run tracker. A run that was cancelled keeps its claims while
//! it drains and still settles its modules, unless a newer run has claimed
//! them since.
//!
//! Timeouts drop the executor future. Any session the executor held is
//! released by its guard at that point, so a timed-out module cannot keep
//! the automation resource checked out.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entity::EntityDescriptor;
use crate::error::{IntelError, Result};
use crate::executor::{ExecutionContext, ExecutorSet};
use crate::registry::{self, ModuleId, Phase};
use crate::status::{ModuleResult, ModuleStatus, ModuleStatusRecord, StatusExtras};
use crate::store::JobStore;
use crate::tracker::{LogLevel, ProgressUpdate, RunSnapshot, RunTracker};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Timeout for solo-first and parallel-middle modules.
    pub module_timeout: Duration,
    /// Timeout for the solo-last synthesis module.
    pub synthesis_timeout: Duration,
    /// A `running` record older than this is presumed abandoned.
    pub stale_after: Duration,
    pub log_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            module_timeout: Duration::from_secs(5 * 60),
            synthesis_timeout: Duration::from_secs(8 * 60),
            stale_after: Duration::from_secs(10 * 60),
            log_capacity: crate::tracker::DEFAULT_LOG_CAPACITY,
        }
    }
}

impl OrchestratorConfig {
    pub fn timeout_for(&self, module: ModuleId) -> Duration {
        match module.phase() {
            Phase::SoloLast => self.synthesis_timeout,
            Phase::SoloFirst | Phase::ParallelMiddle => self.module_timeout,
        }
    }

    fn stale_after_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stale_after).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
    }
}

// ---------------------------------------------------------------------------
// Requests, events, reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunRequest {
    Module(ModuleId),
    All,
}

impl RunRequest {
    /// Label stored as the tracker's `run_kind`.
    pub fn kind(&self) -> String {
        match self {
            RunRequest::Module(m) => format!("module:{m}"),
            RunRequest::All => "run_all".to_string(),
        }
    }

    pub fn modules(&self) -> Vec<ModuleId> {
        match self {
            RunRequest::Module(m) => vec![*m],
            RunRequest::All => ModuleId::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Panicked,
}

/// Broadcast to `/events` subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        run_kind: String,
        entity_id: u64,
    },
    ModuleUpdated {
        run_id: Uuid,
        entity_id: u64,
        module: ModuleId,
        status: ModuleStatus,
    },
    RunFinished {
        run_id: Uuid,
        outcome: RunOutcome,
    },
}

/// Immediate acknowledgment returned by `start`.
#[derive(Debug, Clone, Serialize)]
pub struct RunAck {
    pub status: ModuleStatus,
    pub run_id: Uuid,
    pub run_kind: String,
    pub entity_id: u64,
    pub modules: Vec<ModuleId>,
    /// Stale records repaired before the run began.
    pub repaired: Vec<(ModuleId, ModuleStatus)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleOutcome {
    Done,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub settled: u32,
    pub succeeded: u32,
    pub failed: u32,
}

impl PhaseReport {
    fn tally(phase: Phase, outcomes: &[(ModuleId, ModuleOutcome)]) -> Self {
        let succeeded = outcomes
            .iter()
            .filter(|(_, o)| *o == ModuleOutcome::Done)
            .count() as u32;
        let settled = outcomes.len() as u32;
        Self {
            phase,
            settled,
            succeeded,
            failed: settled - succeeded,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub phases: Vec<PhaseReport>,
    pub modules: Vec<(ModuleId, ModuleOutcome)>,
}

/// A started run. Dropping `handle` detaches the run; awaiting it yields the
/// final report.
pub struct StartedRun {
    pub ack: RunAck,
    pub handle: JoinHandle<RunReport>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct Inner {
    store: Arc<JobStore>,
    tracker: Arc<RunTracker>,
    executors: ExecutorSet,
    config: OrchestratorConfig,
    events: broadcast::Sender<RunEvent>,
    /// Serializes the ownership check with the store write it guards.
    writes: Mutex<()>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(store: Arc<JobStore>, executors: ExecutorSet, config: OrchestratorConfig) -> Self {
        let tracker = Arc::new(RunTracker::new(config.log_capacity));
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                store,
                tracker,
                executors,
                config,
                events,
                writes: Mutex::new(()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.inner.tracker
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.inner.tracker.snapshot()
    }

    /// Cancel the active run. Returns `false` when nothing was running.
    pub fn stop(&self) -> bool {
        self.inner.tracker.request_cancel()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn entity(&self, entity_id: u64) -> Result<EntityDescriptor> {
        blocking(&self.inner.store, move |s| s.require_entity(entity_id)).await
    }

    pub async fn put_entity(&self, entity: EntityDescriptor) -> Result<()> {
        blocking(&self.inner.store, move |s| s.put_entity(&entity)).await
    }

    /// Full module set for a registered entity.
    pub async fn statuses(&self, entity_id: u64) -> Result<Vec<ModuleStatusRecord>> {
        blocking(&self.inner.store, move |s| {
            s.require_entity(entity_id)?;
            s.list_all(entity_id)
        })
        .await
    }

    pub async fn status(&self, entity_id: u64, module: ModuleId) -> Result<ModuleStatusRecord> {
        blocking(&self.inner.store, move |s| {
            s.require_entity(entity_id)?;
            s.get(entity_id, module)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Starting runs
    // -----------------------------------------------------------------------

    /// Parse `module` and start a single-module run.
    pub async fn start_module(&self, entity_id: u64, module: &str) -> Result<StartedRun> {
        let module = registry::describe(module)?.id;
        self.start(entity_id, RunRequest::Module(module)).await
    }

    /// Check preconditions, claim the single-flight slot, mark the run's
    /// modules `running`, and hand the run to a supervised background task.
    ///
    /// Errors: `EntityNotFound`, `RunConflict`, or `Store` if the entity
    /// lookup itself fails. Nothing is written before these checks pass.
    pub async fn start(&self, entity_id: u64, request: RunRequest) -> Result<StartedRun> {
        let inner = &self.inner;
        let entity = self.entity(entity_id).await?;
        let modules = request.modules();

        let takeover = self.active_run_is_stale().await;
        let run_kind = request.kind();
        let ticket = inner.tracker.try_start(&run_kind, Some(entity_id), takeover)?;
        let run_id = ticket.run_id;
        for &module in &modules {
            inner.tracker.claim(run_id, entity_id, module);
        }

        inner.tracker.update_progress(
            run_id,
            ProgressUpdate {
                current: Some(0),
                total: Some(modules.len() as u32),
                ..Default::default()
            },
        );
        inner.tracker.append_log(
            run_id,
            format!(
                "{} started for \"{}\" ({} module(s))",
                run_kind,
                entity.display_name(),
                modules.len()
            ),
            LogLevel::Info,
        );
        let _ = inner.events.send(RunEvent::RunStarted {
            run_id,
            run_kind: run_kind.clone(),
            entity_id,
        });

        let repaired = self.repair_before_run(run_id, entity_id, request).await;

        for &module in &modules {
            inner
                .persist(run_id, entity_id, module, ModuleStatus::Running, StatusExtras::none())
                .await;
        }

        let handle = spawn_supervised(Arc::clone(inner), run_id, entity, request);
        Ok(StartedRun {
            ack: RunAck {
                status: ModuleStatus::Running,
                run_id,
                run_kind,
                entity_id,
                modules,
                repaired,
            },
            handle,
        })
    }

    /// The active run is treated as abandoned when it has been silent for
    /// longer than the staleness threshold, or when every module it claimed
    /// that is still `running` has gone stale. Only the active run's own
    /// entity and modules are consulted; stale rows elsewhere are repaired by
    /// whichever run touches them next.
    async fn active_run_is_stale(&self) -> bool {
        let Some(active) = self.inner.tracker.active_run() else {
            return false;
        };
        let stale_after = self.inner.config.stale_after_chrono();
        let now = chrono::Utc::now();

        if active
            .last_activity
            .is_some_and(|at| now - at > stale_after)
        {
            return true;
        }

        let Some(entity_id) = active.entity_id else {
            return false;
        };
        if active.modules.is_empty() {
            return false;
        }
        let modules = active.modules;
        let records = blocking(&self.inner.store, move |s| {
            modules.into_iter().map(|m| s.get(entity_id, m)).collect::<Result<Vec<_>>>()
        })
        .await;
        let records = match records {
            Ok(r) => r,
            Err(e) => {
                warn!(entity_id, error = %e, "could not read records for staleness check");
                return false;
            }
        };

        let running: Vec<_> = records
            .iter()
            .filter(|r| r.status == ModuleStatus::Running)
            .collect();
        let stale = !running.is_empty() && running.iter().all(|r| r.is_stale(now, stale_after));
        if stale {
            warn!(run_id = %active.run_id, entity_id, "active run has only stale modules");
        }
        stale
    }

    async fn repair_before_run(
        &self,
        run_id: Uuid,
        entity_id: u64,
        request: RunRequest,
    ) -> Vec<(ModuleId, ModuleStatus)> {
        let stale_after = self.inner.config.stale_after_chrono();
        let _writes = self.inner.writes.lock().await;
        let result = blocking(&self.inner.store, move |s| match request {
            RunRequest::Module(m) => Ok(s
                .repair_stale(entity_id, m, stale_after)?
                .map(|st| vec![(m, st)])
                .unwrap_or_default()),
            RunRequest::All => s.repair_all_stale(entity_id, stale_after),
        })
        .await;

        match result {
            Ok(repaired) => {
                for (module, status) in &repaired {
                    self.inner.tracker.append_log(
                        run_id,
                        format!("{module}: stale run recovered as {status}"),
                        LogLevel::Warn,
                    );
                }
                repaired
            }
            Err(e) => {
                self.inner.tracker.append_log(
                    run_id,
                    format!("stale repair failed: {e}"),
                    LogLevel::Error,
                );
                Vec::new()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Supervision
// ---------------------------------------------------------------------------

fn spawn_supervised(
    inner: Arc<Inner>,
    run_id: Uuid,
    entity: EntityDescriptor,
    request: RunRequest,
) -> JoinHandle<RunReport> {
    tokio::spawn(async move {
        let entity_id = entity.id;
        let body = tokio::spawn(execute_run(Arc::clone(&inner), run_id, entity, request));

        let report = match body.await {
            Ok((phases, modules)) => RunReport {
                run_id,
                outcome: if inner.tracker.is_cancelled(run_id) {
                    RunOutcome::Cancelled
                } else {
                    RunOutcome::Completed
                },
                phases,
                modules,
            },
            Err(e) => {
                error!(run_id = %run_id, error = %e, "run task aborted");
                inner.tracker.append_log(
                    run_id,
                    format!("run aborted unexpectedly: {e}"),
                    LogLevel::Error,
                );
                inner.fail_leftover_running(run_id, entity_id, request).await;
                RunReport {
                    run_id,
                    outcome: RunOutcome::Panicked,
                    phases: Vec::new(),
                    modules: Vec::new(),
                }
            }
        };

        if report.outcome == RunOutcome::Completed {
            inner
                .tracker
                .append_log(run_id, "run finished", LogLevel::Success);
        }
        inner.tracker.finish(run_id);
        inner.tracker.release_claims(run_id);
        let _ = inner.events.send(RunEvent::RunFinished {
            run_id,
            outcome: report.outcome,
        });
        info!(run_id = %run_id, outcome = ?report.outcome, "run supervisor exiting");
        report
    })
}

async fn execute_run(
    inner: Arc<Inner>,
    run_id: Uuid,
    entity: EntityDescriptor,
    request: RunRequest,
) -> (Vec<PhaseReport>, Vec<(ModuleId, ModuleOutcome)>) {
    let counters = Arc::new(RunCounters::default());

    let module = match request {
        RunRequest::Module(m) => m,
        RunRequest::All => return run_all_phases(inner, run_id, entity, counters).await,
    };

    let outcome = run_module(&inner, run_id, &entity, module, &counters).await;
    let outcomes = vec![(module, outcome)];
    (vec![PhaseReport::tally(module.phase(), &outcomes)], outcomes)
}

async fn run_all_phases(
    inner: Arc<Inner>,
    run_id: Uuid,
    entity: EntityDescriptor,
    counters: Arc<RunCounters>,
) -> (Vec<PhaseReport>, Vec<(ModuleId, ModuleOutcome)>) {
    let mut phases = Vec::with_capacity(3);
    let mut all = Vec::with_capacity(ModuleId::ALL.len());

    // Phase 1: seeds shared context; a failure here is not fatal.
    let first = registry::solo_first();
    inner.log(run_id, "phase 1/3: solo-first", LogLevel::Info);
    let outcome = run_module(&inner, run_id, &entity, first, &counters).await;
    if outcome != ModuleOutcome::Done {
        inner.log(
            run_id,
            format!("{first} did not complete; continuing with phase 2"),
            LogLevel::Warn,
        );
    }
    let phase1 = vec![(first, outcome)];
    phases.push(PhaseReport::tally(Phase::SoloFirst, &phase1));
    all.extend(phase1);

    // Phase 2: every module in its own task, joined only once all settle.
    let middle: Vec<ModuleId> = registry::list_by_phase(Phase::ParallelMiddle)
        .into_iter()
        .map(|d| d.id)
        .collect();
    inner.log(
        run_id,
        format!("phase 2/3: {} modules in parallel", middle.len()),
        LogLevel::Info,
    );
    let tasks = middle.iter().map(|&module| {
        let inner = Arc::clone(&inner);
        let entity = entity.clone();
        let counters = Arc::clone(&counters);
        async move {
            let entity_id = entity.id;
            let task = {
                let inner = Arc::clone(&inner);
                let counters = Arc::clone(&counters);
                tokio::spawn(async move {
                    run_module(&inner, run_id, &entity, module, &counters).await
                })
            };
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = IntelError::ModuleExecution {
                        module: module.to_string(),
                        message: format!("task aborted: {e}"),
                    }
                    .to_string();
                    inner
                        .settle(run_id, entity_id, module, Err(message), &counters)
                        .await
                }
            };
            (module, outcome)
        }
    });
    let phase2 = futures::future::join_all(tasks).await;
    let report = PhaseReport::tally(Phase::ParallelMiddle, &phase2);
    inner.log(
        run_id,
        format!(
            "phase 2/3 settled: {} succeeded, {} failed",
            report.succeeded, report.failed
        ),
        if report.failed == 0 {
            LogLevel::Success
        } else {
            LogLevel::Warn
        },
    );
    phases.push(report);
    all.extend(phase2);

    // Phase 3: synthesis over everything gathered so far.
    let last = registry::solo_last();
    inner.log(run_id, "phase 3/3: solo-last", LogLevel::Info);
    let outcome = run_module(&inner, run_id, &entity, last, &counters).await;
    let phase3 = vec![(last, outcome)];
    phases.push(PhaseReport::tally(Phase::SoloLast, &phase3));
    all.extend(phase3);

    (phases, all)
}

// ---------------------------------------------------------------------------
// Module invocation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RunCounters {
    settled: AtomicU32,
    done: AtomicU32,
    failed: AtomicU32,
}

async fn run_module(
    inner: &Arc<Inner>,
    run_id: Uuid,
    entity: &EntityDescriptor,
    module: ModuleId,
    counters: &RunCounters,
) -> ModuleOutcome {
    if inner.tracker.is_cancelled(run_id) {
        let message = IntelError::ModuleExecution {
            module: module.to_string(),
            message: "run cancelled before the module started".into(),
        }
        .to_string();
        return inner
            .settle(run_id, entity.id, module, Err(message), counters)
            .await;
    }

    // Keeps the record fresh while the module is in flight; the row was
    // marked when the run started, possibly a full phase earlier.
    inner.touch_running(run_id, entity.id, module).await;

    let timeout = inner.config.timeout_for(module);
    let executor = Arc::clone(inner.executors.get(module));
    let ctx = ExecutionContext::new(entity.clone(), module, run_id, Arc::clone(&inner.tracker));
    inner.log(run_id, format!("{module}: started"), LogLevel::Info);

    let (result, timed_out) = match tokio::time::timeout(timeout, executor.execute(&ctx)).await {
        Ok(Ok(value)) => (ModuleResult::new(module, value).map(|r| r.payload), false),
        Ok(Err(e)) => {
            let message = if inner.tracker.is_cancelled(run_id) {
                format!("run cancelled: {e}")
            } else {
                e.to_string()
            };
            let err = IntelError::ModuleExecution {
                module: module.to_string(),
                message,
            };
            (Err(err.to_string()), false)
        }
        Err(_) => {
            let err = IntelError::ModuleTimeout {
                module: module.to_string(),
                timeout,
            };
            (Err(err.to_string()), true)
        }
    };

    let outcome = inner.settle(run_id, entity.id, module, result, counters).await;
    if timed_out {
        ModuleOutcome::TimedOut
    } else {
        outcome
    }
}

impl Inner {
    fn log(&self, run_id: Uuid, message: impl Into<String>, level: LogLevel) {
        self.tracker.append_log(run_id, message, level);
    }

    /// Write a module's final status and fold it into the run's progress.
    async fn settle(
        &self,
        run_id: Uuid,
        entity_id: u64,
        module: ModuleId,
        result: std::result::Result<serde_json::Value, String>,
        counters: &RunCounters,
    ) -> ModuleOutcome {
        let (outcome, status, extras) = match result {
            Ok(payload) => {
                self.log(run_id, format!("{module}: done"), LogLevel::Success);
                (ModuleOutcome::Done, ModuleStatus::Done, StatusExtras::result(payload))
            }
            Err(message) => {
                self.log(run_id, message.clone(), LogLevel::Error);
                (ModuleOutcome::Failed, ModuleStatus::Error, StatusExtras::error(message))
            }
        };
        self.persist(run_id, entity_id, module, status, extras).await;

        let settled = counters.settled.fetch_add(1, Ordering::SeqCst) + 1;
        let (done, failed) = match outcome {
            ModuleOutcome::Done => (
                counters.done.fetch_add(1, Ordering::SeqCst) + 1,
                counters.failed.load(Ordering::SeqCst),
            ),
            _ => (
                counters.done.load(Ordering::SeqCst),
                counters.failed.fetch_add(1, Ordering::SeqCst) + 1,
            ),
        };
        self.tracker.update_progress(
            run_id,
            ProgressUpdate {
                current: Some(settled),
                updated_count: Some(done),
                error_count: Some(failed),
                ..Default::default()
            },
        );
        outcome
    }

    /// Upsert a status. Store failures are logged into the run and swallowed;
    /// the tracker stays the source of truth until the next good write.
    async fn persist(
        &self,
        run_id: Uuid,
        entity_id: u64,
        module: ModuleId,
        status: ModuleStatus,
        extras: StatusExtras,
    ) {
        let written = {
            let _writes = self.writes.lock().await;
            // A newer run has claimed this record; it is no longer ours to write.
            if !self.tracker.owns(run_id, entity_id, module) {
                warn!(run_id = %run_id, module = %module, "status write skipped, module claimed by a newer run");
                return;
            }
            blocking(&self.store, move |s| s.upsert(entity_id, module, status, extras)).await
        };
        match written {
            Ok(_) => {
                let _ = self.events.send(RunEvent::ModuleUpdated {
                    run_id,
                    entity_id,
                    module,
                    status,
                });
            }
            Err(e) => {
                error!(entity_id, module = %module, error = %e, "status write failed");
                self.log(
                    run_id,
                    format!("{module}: could not persist status {status}: {e}"),
                    LogLevel::Error,
                );
            }
        }
    }

    /// Refresh `updated_at` on a claimed `running` record without emitting an
    /// event.
    async fn touch_running(&self, run_id: Uuid, entity_id: u64, module: ModuleId) {
        let _writes = self.writes.lock().await;
        if !self.tracker.owns(run_id, entity_id, module) {
            return;
        }
        let touched = blocking(&self.store, move |s| {
            s.upsert(entity_id, module, ModuleStatus::Running, StatusExtras::none())
        })
        .await;
        if let Err(e) = touched {
            warn!(entity_id, module = %module, error = %e, "could not refresh running status");
        }
    }

    /// After a panic in the run body, nothing may stay `running`.
    async fn fail_leftover_running(&self, run_id: Uuid, entity_id: u64, request: RunRequest) {
        for module in request.modules() {
            let record = blocking(&self.store, move |s| s.get(entity_id, module)).await;
            if matches!(record, Ok(ref r) if r.status == ModuleStatus::Running) {
                self.persist(
                    run_id,
                    entity_id,
                    module,
                    ModuleStatus::Error,
                    StatusExtras::error("run aborted unexpectedly"),
                )
                .await;
            }
        }
    }
}

/// Run a store operation on the blocking pool.
async fn blocking<T, F>(store: &Arc<JobStore>, f: F) -> Result<T>
where
    F: FnOnce(&JobStore) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| IntelError::Store(format!("store task failed: {e}")))?
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorError, FnExecutor, ModuleExecutor};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const ENTITY: u64 = 1;

    fn ok() -> Arc<dyn ModuleExecutor> {
        Arc::new(FnExecutor::new(|ctx: ExecutionContext| async move {
            Ok(json!({ "module": ctx.module() }))
        }))
    }

    fn failing(msg: &'static str) -> Arc<dyn ModuleExecutor> {
        Arc::new(FnExecutor::new(move |_ctx| async move {
            Err(ExecutorError::Failed(msg.into()))
        }))
    }

    fn sleeping(d: Duration) -> Arc<dyn ModuleExecutor> {
        Arc::new(FnExecutor::new(move |_ctx| async move {
            tokio::time::sleep(d).await;
            Ok(json!({ "slept": true }))
        }))
    }

    /// Holds a session until the run is cancelled.
    fn session_holder() -> Arc<dyn ModuleExecutor> {
        Arc::new(FnExecutor::new(|ctx: ExecutionContext| async move {
            let session = ctx.acquire_session();
            session
                .run(tokio::time::sleep(Duration::from_secs(30)))
                .await?;
            Ok(json!({ "finished": true }))
        }))
    }

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            module_timeout: Duration::from_secs(2),
            synthesis_timeout: Duration::from_secs(2),
            stale_after: Duration::from_secs(600),
            log_capacity: 100,
        }
    }

    fn setup(
        overrides: Vec<(ModuleId, Arc<dyn ModuleExecutor>)>,
        config: OrchestratorConfig,
    ) -> (TempDir, Orchestrator) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JobStore::open(&dir.path().join("intel.db")).unwrap());
        store
            .put_entity(&EntityDescriptor::new(ENTITY, "Acme Catering Ltd", None))
            .unwrap();
        let mut builder = ExecutorSet::builder();
        for (m, e) in overrides {
            builder = builder.register(m, e);
        }
        let executors = builder.fill_missing(ok()).build().unwrap();
        (dir, Orchestrator::new(store, executors, config))
    }

    fn status_of(orch: &Orchestrator, module: ModuleId) -> ModuleStatusRecord {
        orch.store().get(ENTITY, module).unwrap()
    }

    async fn wait_for_sessions(orch: &Orchestrator, n: usize) {
        for _ in 0..200 {
            if orch.tracker().open_sessions() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sessions never opened");
    }

    async fn wait_for_log(orch: &Orchestrator, needle: &str) {
        for _ in 0..200 {
            if orch.snapshot().log.iter().any(|l| l.message.contains(needle)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("log line {needle:?} never appeared");
    }

    #[tokio::test]
    async fn run_all_completes_every_module() {
        let (_dir, orch) = setup(vec![], test_config());
        let started = orch.start(ENTITY, RunRequest::All).await.unwrap();
        assert_eq!(started.ack.status, ModuleStatus::Running);
        assert_eq!(started.ack.modules.len(), ModuleId::ALL.len());

        let report = started.handle.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.phases.len(), 3);
        for rec in orch.store().list_all(ENTITY).unwrap() {
            assert_eq!(rec.status, ModuleStatus::Done, "{:?}", rec.module);
        }

        let snap = orch.snapshot();
        assert!(!snap.active);
        assert_eq!(snap.progress.total, 8);
        assert_eq!(snap.progress.current, 8);
        assert_eq!(snap.progress.updated_count, 8);
        assert_eq!(snap.progress.error_count, 0);
    }

    #[tokio::test]
    async fn start_marks_modules_running_before_returning() {
        let (_dir, orch) = setup(
            vec![(ModuleId::News, sleeping(Duration::from_millis(300)))],
            test_config(),
        );
        let started = orch.start(ENTITY, RunRequest::Module(ModuleId::News)).await.unwrap();
        assert_eq!(status_of(&orch, ModuleId::News).status, ModuleStatus::Running);
        assert!(orch.tracker().is_active());
        started.handle.await.unwrap();
        assert_eq!(status_of(&orch, ModuleId::News).status, ModuleStatus::Done);
    }

    #[tokio::test]
    async fn failing_solo_first_does_not_block_later_phases() {
        let (_dir, orch) = setup(
            vec![(ModuleId::TenderHistory, failing("login rejected"))],
            test_config(),
        );
        let report = orch.start(ENTITY, RunRequest::All).await.unwrap().handle.await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        let first = status_of(&orch, ModuleId::TenderHistory);
        assert_eq!(first.status, ModuleStatus::Error);
        assert!(first.error_message.unwrap().contains("login rejected"));

        for d in registry::list_by_phase(Phase::ParallelMiddle) {
            assert_eq!(status_of(&orch, d.id).status, ModuleStatus::Done);
        }
        assert_eq!(status_of(&orch, ModuleId::AiSynthesis).status, ModuleStatus::Done);
    }

    #[tokio::test]
    async fn one_parallel_timeout_does_not_affect_siblings() {
        let mut config = test_config();
        config.module_timeout = Duration::from_millis(200);
        let (_dir, orch) = setup(
            vec![(ModuleId::News, sleeping(Duration::from_secs(10)))],
            config,
        );
        let report = orch.start(ENTITY, RunRequest::All).await.unwrap().handle.await.unwrap();

        let middle = &report.phases[1];
        let size = registry::list_by_phase(Phase::ParallelMiddle).len() as u32;
        assert_eq!(middle.settled, size);
        assert_eq!(middle.failed, 1);
        assert_eq!(middle.succeeded, size - 1);
        assert!(report
            .modules
            .contains(&(ModuleId::News, ModuleOutcome::TimedOut)));

        let news = status_of(&orch, ModuleId::News);
        assert_eq!(news.status, ModuleStatus::Error);
        assert!(news.error_message.unwrap().contains("timed out after 200ms"));
        for d in registry::list_by_phase(Phase::ParallelMiddle) {
            if d.id != ModuleId::News {
                assert_eq!(status_of(&orch, d.id).status, ModuleStatus::Done);
            }
        }
        assert_eq!(status_of(&orch, ModuleId::AiSynthesis).status, ModuleStatus::Done);
    }

    #[tokio::test]
    async fn phases_run_in_order() {
        let trace: Arc<Mutex<Vec<(ModuleId, &'static str)>>> = Arc::default();
        let recording = {
            let trace = Arc::clone(&trace);
            Arc::new(FnExecutor::new(move |ctx: ExecutionContext| {
                let trace = Arc::clone(&trace);
                async move {
                    trace.lock().unwrap().push((ctx.module(), "start"));
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    trace.lock().unwrap().push((ctx.module(), "end"));
                    Ok(json!({ "ok": true }))
                }
            })) as Arc<dyn ModuleExecutor>
        };
        let overrides = ModuleId::ALL
            .into_iter()
            .map(|m| (m, Arc::clone(&recording)))
            .collect();
        let (_dir, orch) = setup(overrides, test_config());
        orch.start(ENTITY, RunRequest::All).await.unwrap().handle.await.unwrap();

        let trace = trace.lock().unwrap().clone();
        let pos = |m: ModuleId, what: &str| trace.iter().position(|e| *e == (m, what)).unwrap();
        let first_end = pos(ModuleId::TenderHistory, "end");
        let last_start = pos(ModuleId::AiSynthesis, "start");
        for d in registry::list_by_phase(Phase::ParallelMiddle) {
            assert!(pos(d.id, "start") > first_end, "{:?} started before phase 1 ended", d.id);
            assert!(pos(d.id, "end") < last_start, "{:?} ended after phase 3 began", d.id);
        }
    }

    #[tokio::test]
    async fn second_start_conflicts_while_active() {
        let (_dir, orch) = setup(
            vec![(ModuleId::TenderHistory, sleeping(Duration::from_millis(500)))],
            test_config(),
        );
        let first = orch.start(ENTITY, RunRequest::All).await.unwrap();
        let err = orch
            .start(ENTITY, RunRequest::Module(ModuleId::News))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, IntelError::RunConflict(_)), "{err}");
        first.handle.await.unwrap();
        assert!(orch.start(ENTITY, RunRequest::Module(ModuleId::News)).await.is_ok());
    }

    #[tokio::test]
    async fn stale_module_allows_takeover_and_is_repaired_first() {
        let (_dir, orch) = setup(vec![], test_config());
        // A run that is still flagged active but hung.
        let hung = orch.tracker().try_start("run_all", Some(ENTITY), false).unwrap();
        orch.tracker().claim(hung.run_id, ENTITY, ModuleId::News);

        // Fresh running record: conflict.
        orch.store()
            .upsert(ENTITY, ModuleId::News, ModuleStatus::Running, StatusExtras::none())
            .unwrap();
        let err = orch
            .start(ENTITY, RunRequest::Module(ModuleId::News))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, IntelError::RunConflict(_)));

        // Backdated past the threshold: takeover succeeds, repair happens first.
        orch.store()
            .upsert_at(
                ENTITY,
                ModuleId::News,
                ModuleStatus::Running,
                StatusExtras::none(),
                Utc::now() - chrono::Duration::minutes(11),
            )
            .unwrap();
        let started = orch
            .start(ENTITY, RunRequest::Module(ModuleId::News))
            .await
            .unwrap();
        assert_eq!(
            started.ack.repaired,
            vec![(ModuleId::News, ModuleStatus::Pending)]
        );
        assert!(orch
            .snapshot()
            .log
            .iter()
            .any(|l| l.message.contains("stale run recovered")));

        let report = started.handle.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(status_of(&orch, ModuleId::News).status, ModuleStatus::Done);
    }

    #[tokio::test]
    async fn silent_active_run_is_taken_over() {
        let mut config = test_config();
        config.stale_after = Duration::from_millis(150);
        let (_dir, orch) = setup(vec![], config);
        let hung = orch.tracker().try_start("run_all", Some(ENTITY), false).unwrap();

        let err = orch
            .start(ENTITY, RunRequest::Module(ModuleId::News))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, IntelError::RunConflict(_)), "{err}");

        // No log line or progress write since it started.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let started = orch
            .start(ENTITY, RunRequest::Module(ModuleId::News))
            .await
            .unwrap();
        assert_ne!(started.ack.run_id, hung.run_id);
        assert!(!orch.tracker().finish(hung.run_id));
        assert_eq!(orch.snapshot().run_id, Some(started.ack.run_id));

        let report = started.handle.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(status_of(&orch, ModuleId::News).status, ModuleStatus::Done);
    }

    #[tokio::test]
    async fn stale_rows_on_another_entity_do_not_allow_takeover() {
        const OTHER: u64 = 2;
        let (_dir, orch) = setup(
            vec![(ModuleId::TenderHistory, sleeping(Duration::from_millis(300)))],
            test_config(),
        );
        orch.store()
            .put_entity(&EntityDescriptor::new(OTHER, "Bosphorus Logistics", None))
            .unwrap();
        orch.store()
            .upsert_at(
                OTHER,
                ModuleId::News,
                ModuleStatus::Running,
                StatusExtras::none(),
                Utc::now() - chrono::Duration::minutes(30),
            )
            .unwrap();

        let healthy = orch.start(ENTITY, RunRequest::All).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = orch
            .start(OTHER, RunRequest::Module(ModuleId::News))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, IntelError::RunConflict(_)), "{err}");

        let report = healthy.handle.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        for rec in orch.store().list_all(ENTITY).unwrap() {
            assert_eq!(rec.status, ModuleStatus::Done, "{:?}", rec.module);
        }

        // Once idle, the other entity's stale row is repaired by its own run.
        let started = orch
            .start(OTHER, RunRequest::Module(ModuleId::News))
            .await
            .unwrap();
        assert_eq!(
            started.ack.repaired,
            vec![(ModuleId::News, ModuleStatus::Pending)]
        );
        started.handle.await.unwrap();
        assert_eq!(
            orch.store().get(OTHER, ModuleId::News).unwrap().status,
            ModuleStatus::Done
        );
    }

    #[tokio::test]
    async fn stop_then_restart_leaves_nothing_running() {
        let (_dir, orch) = setup(
            vec![(ModuleId::TenderHistory, sleeping(Duration::from_millis(300)))],
            test_config(),
        );
        let cancelled = orch.start(ENTITY, RunRequest::All).await.unwrap();
        wait_for_log(&orch, "tender_history: started").await;
        assert!(orch.stop());
        let restarted = orch
            .start(ENTITY, RunRequest::Module(ModuleId::News))
            .await
            .unwrap();

        let old = cancelled.handle.await.unwrap();
        let new = restarted.handle.await.unwrap();
        assert_eq!(old.outcome, RunOutcome::Cancelled);
        assert_eq!(new.outcome, RunOutcome::Completed);

        for rec in orch.store().list_all(ENTITY).unwrap() {
            assert_ne!(rec.status, ModuleStatus::Running, "{:?}", rec.module);
        }
        // The cancelled run still settles the modules it owns.
        assert_eq!(status_of(&orch, ModuleId::TenderHistory).status, ModuleStatus::Done);
        let synthesis = status_of(&orch, ModuleId::AiSynthesis);
        assert_eq!(synthesis.status, ModuleStatus::Error);
        assert!(synthesis.error_message.unwrap().contains("cancelled"));
        // The module the new run claimed carries the new run's result.
        assert_eq!(status_of(&orch, ModuleId::News).status, ModuleStatus::Done);
        assert!(!orch.tracker().is_active());
    }

    #[tokio::test]
    async fn run_all_repairs_stale_modules_before_phase_one() {
        let (_dir, orch) = setup(
            vec![(ModuleId::CompanyRegistry, failing("registry offline"))],
            test_config(),
        );
        let old = Utc::now() - chrono::Duration::minutes(30);
        orch.store()
            .upsert_at(
                ENTITY,
                ModuleId::CompanyRegistry,
                ModuleStatus::Done,
                StatusExtras::result(json!({"mersis": "123"})),
                old,
            )
            .unwrap();
        orch.store()
            .upsert_at(ENTITY, ModuleId::CompanyRegistry, ModuleStatus::Running, StatusExtras::none(), old)
            .unwrap();

        let started = orch.start(ENTITY, RunRequest::All).await.unwrap();
        assert_eq!(
            started.ack.repaired,
            vec![(ModuleId::CompanyRegistry, ModuleStatus::Done)]
        );
        started.handle.await.unwrap();

        // The re-run failed, but the earlier result survives the error write.
        let rec = status_of(&orch, ModuleId::CompanyRegistry);
        assert_eq!(rec.status, ModuleStatus::Error);
        assert_eq!(rec.result, Some(json!({"mersis": "123"})));
    }

    #[tokio::test]
    async fn cancel_mid_run_releases_sessions_and_errors_waiting_module() {
        let (_dir, orch) = setup(
            vec![(ModuleId::Participants, session_holder())],
            test_config(),
        );
        let started = orch
            .start(ENTITY, RunRequest::Module(ModuleId::Participants))
            .await
            .unwrap();
        wait_for_sessions(&orch, 1).await;

        assert!(orch.stop());
        assert!(!orch.tracker().is_active());
        assert_eq!(orch.tracker().open_sessions(), 0);

        let report = tokio::time::timeout(Duration::from_secs(5), started.handle)
            .await
            .expect("run did not unwind after cancel")
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        let rec = status_of(&orch, ModuleId::Participants);
        assert_eq!(rec.status, ModuleStatus::Error);
        assert!(rec.error_message.unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn cancel_during_run_all_skips_remaining_modules() {
        let (_dir, orch) = setup(
            vec![(ModuleId::TenderHistory, session_holder())],
            test_config(),
        );
        let started = orch.start(ENTITY, RunRequest::All).await.unwrap();
        wait_for_sessions(&orch, 1).await;
        orch.stop();

        let report = started.handle.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        for rec in orch.store().list_all(ENTITY).unwrap() {
            assert_eq!(rec.status, ModuleStatus::Error, "{:?}", rec.module);
        }
    }

    #[tokio::test]
    async fn stop_without_active_run_changes_nothing() {
        let (_dir, orch) = setup(vec![], test_config());
        let before = orch.snapshot();
        assert!(!orch.stop());
        let after = orch.snapshot();
        assert_eq!(before.active, after.active);
        assert_eq!(before.cancelled, after.cancelled);
        assert!(after.log.is_empty());
    }

    #[tokio::test]
    async fn timeout_releases_the_session() {
        let mut config = test_config();
        config.module_timeout = Duration::from_millis(100);
        let (_dir, orch) = setup(vec![(ModuleId::News, session_holder())], config);
        let report = orch
            .start(ENTITY, RunRequest::Module(ModuleId::News))
            .await
            .unwrap()
            .handle
            .await
            .unwrap();
        assert_eq!(report.modules, vec![(ModuleId::News, ModuleOutcome::TimedOut)]);
        assert_eq!(orch.tracker().open_sessions(), 0);
    }

    #[tokio::test]
    async fn panicking_executor_is_isolated() {
        let panicking: Arc<dyn ModuleExecutor> = Arc::new(FnExecutor::new(|_ctx| async move {
            if true {
                panic!("scraper exploded");
            }
            Ok(json!({}))
        }));
        let (_dir, orch) = setup(vec![(ModuleId::DebarmentCheck, panicking)], test_config());
        let report = orch.start(ENTITY, RunRequest::All).await.unwrap().handle.await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(status_of(&orch, ModuleId::DebarmentCheck).status, ModuleStatus::Error);
        assert_eq!(status_of(&orch, ModuleId::News).status, ModuleStatus::Done);
        assert_eq!(status_of(&orch, ModuleId::AiSynthesis).status, ModuleStatus::Done);
        assert!(!orch.tracker().is_active());
    }

    #[tokio::test]
    async fn non_object_result_is_an_error() {
        let array: Arc<dyn ModuleExecutor> =
            Arc::new(FnExecutor::new(|_ctx| async move { Ok(json!([1, 2, 3])) }));
        let (_dir, orch) = setup(vec![(ModuleId::News, array)], test_config());
        orch.start(ENTITY, RunRequest::Module(ModuleId::News))
            .await
            .unwrap()
            .handle
            .await
            .unwrap();
        let rec = status_of(&orch, ModuleId::News);
        assert_eq!(rec.status, ModuleStatus::Error);
        assert!(rec.error_message.unwrap().contains("non-object"));
    }

    #[tokio::test]
    async fn unknown_module_and_entity_are_rejected_without_side_effects() {
        let (_dir, orch) = setup(vec![], test_config());
        let err = orch.start_module(ENTITY, "horoscope").await.err().unwrap();
        assert!(matches!(err, IntelError::UnknownModule(_)));

        let err = orch.start(999, RunRequest::All).await.err().unwrap();
        assert!(matches!(err, IntelError::EntityNotFound(999)));

        assert!(!orch.tracker().is_active());
        assert!(orch.snapshot().run_id.is_none());
        for rec in orch.store().list_all(ENTITY).unwrap() {
            assert_eq!(rec.status, ModuleStatus::Pending);
        }
    }

    #[tokio::test]
    async fn events_follow_the_run_lifecycle() {
        let (_dir, orch) = setup(vec![], test_config());
        let mut rx = orch.subscribe();
        orch.start(ENTITY, RunRequest::Module(ModuleId::News))
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push(match ev {
                RunEvent::RunStarted { .. } => "started".to_string(),
                RunEvent::ModuleUpdated { status, .. } => format!("module:{status}"),
                RunEvent::RunFinished { outcome, .. } => format!("finished:{outcome:?}"),
            });
        }
        assert_eq!(
            kinds,
            vec!["started", "module:running", "module:done", "finished:Completed"]
        );
    }
}
