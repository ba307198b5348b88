//! In-memory single-flight guard and progress mirror for the active run.
//!
//! One `RunTracker` exists per orchestrator. It is not persisted: after a
//! restart it starts inactive, and the job state store is the only record of
//! what ran. Every mutating call that belongs to a run takes that run's id,
//! so a run that was cancelled or taken over can keep unwinding without
//! touching its successor's state.
//!
//! Status records are guarded separately through module claims. A run claims
//! each `(entity, module)` it marks `running`, and only the claim holder may
//! write that record. Claims outlive the single-flight slot: a cancelled run
//! still owns its modules while it drains, until a newer run claims them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{IntelError, Result};
use crate::registry::ModuleId;
use crate::session::{AutomationSession, SessionGuard};

pub const DEFAULT_LOG_CAPACITY: usize = 100;

// ---------------------------------------------------------------------------
// Log entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Success,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u32,
    pub total: u32,
    pub created_count: u32,
    pub updated_count: u32,
    pub error_count: u32,
}

/// Partial progress write. `None` fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub current: Option<u32>,
    pub total: Option<u32>,
    pub created_count: Option<u32>,
    pub updated_count: Option<u32>,
    pub error_count: Option<u32>,
}

impl Progress {
    fn apply(&mut self, update: ProgressUpdate) {
        if let Some(v) = update.current {
            self.current = v;
        }
        if let Some(v) = update.total {
            self.total = v;
        }
        if let Some(v) = update.created_count {
            self.created_count = v;
        }
        if let Some(v) = update.updated_count {
            self.updated_count = v;
        }
        if let Some(v) = update.error_count {
            self.error_count = v;
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Public view of the tracker. Session handles are never exposed.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub active: bool,
    pub run_id: Option<Uuid>,
    pub run_kind: Option<String>,
    pub entity_id: Option<u64>,
    pub cancelled: bool,
    pub progress: Progress,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: i64,
    pub log: Vec<LogEntry>,
}

/// What the staleness check needs to know about the active run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRun {
    pub run_id: Uuid,
    pub entity_id: Option<u64>,
    pub modules: Vec<ModuleId>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Returned by a successful `try_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTicket {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// RunTracker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TrackerState {
    active: bool,
    run_id: Option<Uuid>,
    run_kind: Option<String>,
    entity_id: Option<u64>,
    cancelled: bool,
    progress: Progress,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_activity: Option<DateTime<Utc>>,
    log: VecDeque<LogEntry>,
    sessions: HashMap<Uuid, AutomationSession>,
    /// Modules claimed by the current run, in claim order.
    modules: Vec<ModuleId>,
    /// Record ownership across runs. Survives `try_start`.
    claims: HashMap<(u64, ModuleId), Uuid>,
}

impl TrackerState {
    fn is_current(&self, run_id: Uuid) -> bool {
        self.run_id == Some(run_id)
    }

    fn close_sessions(&mut self) -> usize {
        let n = self.sessions.len();
        for (_, session) in self.sessions.drain() {
            session.close();
        }
        n
    }
}

pub struct RunTracker {
    state: Mutex<TrackerState>,
    log_capacity: usize,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl RunTracker {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            log_capacity: log_capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check-and-set the single-flight flag.
    ///
    /// With `takeover`, an active run is treated as abandoned: its sessions
    /// are closed and its state replaced. Without it, an active run is a
    /// `RunConflict`.
    pub fn try_start(
        &self,
        run_kind: &str,
        entity_id: Option<u64>,
        takeover: bool,
    ) -> Result<RunTicket> {
        let mut st = self.lock();
        if st.active {
            let current = st.run_kind.clone().unwrap_or_default();
            if !takeover {
                return Err(IntelError::RunConflict(format!(
                    "'{current}' has been running since {}",
                    st.started_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "an unknown time".into())
                )));
            }
            let closed = st.close_sessions();
            warn!(previous = %current, closed_sessions = closed, "taking over stale run");
        }

        let now = Utc::now();
        let run_id = Uuid::new_v4();
        let claims = std::mem::take(&mut st.claims);
        *st = TrackerState {
            claims,
            active: true,
            run_id: Some(run_id),
            run_kind: Some(run_kind.to_string()),
            entity_id,
            started_at: Some(now),
            last_activity: Some(now),
            ..TrackerState::default()
        };
        info!(run_id = %run_id, run_kind, "run started");
        Ok(RunTicket {
            run_id,
            started_at: now,
        })
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// True once `run_id` was cancelled or replaced by a newer run.
    pub fn is_cancelled(&self, run_id: Uuid) -> bool {
        let st = self.lock();
        !st.is_current(run_id) || st.cancelled
    }

    /// Time of the last log line or progress write of the active run.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.lock().last_activity
    }

    /// The active run, if any, with the modules it has claimed.
    pub fn active_run(&self) -> Option<ActiveRun> {
        let st = self.lock();
        if !st.active {
            return None;
        }
        Some(ActiveRun {
            run_id: st.run_id?,
            entity_id: st.entity_id,
            modules: st.modules.clone(),
            last_activity: st.last_activity,
        })
    }

    /// Take ownership of a module record for `run_id`, replacing any earlier
    /// holder. Fails if `run_id` is not the current run.
    pub fn claim(&self, run_id: Uuid, entity_id: u64, module: ModuleId) -> bool {
        let mut st = self.lock();
        if !st.is_current(run_id) {
            return false;
        }
        if let Some(prev) = st.claims.insert((entity_id, module), run_id) {
            if prev != run_id {
                warn!(run_id = %run_id, previous = %prev, module = %module, "module claim taken over");
            }
        }
        if !st.modules.contains(&module) {
            st.modules.push(module);
        }
        true
    }

    /// True while `run_id` holds the claim on this module record.
    pub fn owns(&self, run_id: Uuid, entity_id: u64, module: ModuleId) -> bool {
        self.lock().claims.get(&(entity_id, module)) == Some(&run_id)
    }

    /// Drop every claim still held by `run_id`.
    pub fn release_claims(&self, run_id: Uuid) {
        self.lock().claims.retain(|_, holder| *holder != run_id);
    }

    pub fn update_progress(&self, run_id: Uuid, update: ProgressUpdate) {
        let mut st = self.lock();
        if !st.is_current(run_id) {
            return;
        }
        st.progress.apply(update);
        st.last_activity = Some(Utc::now());
    }

    pub fn append_log(&self, run_id: Uuid, message: impl Into<String>, level: LogLevel) {
        let message = message.into();
        match level {
            LogLevel::Warn => warn!(run_id = %run_id, "{message}"),
            LogLevel::Error => error!(run_id = %run_id, "{message}"),
            LogLevel::Info | LogLevel::Success => {}
        }

        let mut st = self.lock();
        if !st.is_current(run_id) {
            return;
        }
        let now = Utc::now();
        while st.log.len() >= self.log_capacity {
            st.log.pop_front();
        }
        st.log.push_back(LogEntry {
            timestamp: now,
            message,
            level,
        });
        st.last_activity = Some(now);
    }

    /// Open a session for `module` and register it with `run_id`.
    ///
    /// If the run is already cancelled or superseded the session comes back
    /// closed, so the executor's first operation fails.
    pub fn attach_session(self: &Arc<Self>, run_id: Uuid, module: ModuleId) -> SessionGuard {
        let session = AutomationSession::open(module);
        {
            let mut st = self.lock();
            if st.is_current(run_id) && !st.cancelled {
                st.sessions.insert(session.id(), session.clone());
            } else {
                session.close();
            }
        }
        SessionGuard::new(session, Arc::clone(self), run_id)
    }

    pub(crate) fn release_session(&self, run_id: Uuid, session_id: Uuid) {
        let mut st = self.lock();
        if st.is_current(run_id) {
            st.sessions.remove(&session_id);
        }
    }

    /// Number of sessions currently checked out by the active run.
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Single finalization path. Clears the active flag and releases any
    /// sessions still registered. Log and progress stay readable until the
    /// next `try_start`. Returns `false` if `run_id` is no longer current.
    pub fn finish(&self, run_id: Uuid) -> bool {
        let mut st = self.lock();
        if !st.is_current(run_id) {
            return false;
        }
        st.close_sessions();
        st.active = false;
        st.finished_at = Some(Utc::now());
        info!(run_id = %run_id, "run finished");
        true
    }

    /// Flag the active run as cancelled and close its sessions immediately.
    /// Returns `false` (and changes nothing) when no run is active.
    pub fn request_cancel(&self) -> bool {
        let mut st = self.lock();
        if !st.active {
            return false;
        }
        st.cancelled = true;
        st.active = false;
        let closed = st.close_sessions();
        let now = Utc::now();
        while st.log.len() >= self.log_capacity {
            st.log.pop_front();
        }
        st.log.push_back(LogEntry {
            timestamp: now,
            message: "Run stopped by user".into(),
            level: LogLevel::Warn,
        });
        st.last_activity = Some(now);
        warn!(run_id = ?st.run_id, closed_sessions = closed, "run cancelled");
        true
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let st = self.lock();
        let elapsed_seconds = match (st.started_at, st.active, st.finished_at) {
            (Some(start), true, _) => (Utc::now() - start).num_seconds(),
            (Some(start), false, Some(end)) => (end - start).num_seconds(),
            (Some(start), false, None) => (Utc::now() - start).num_seconds(),
            (None, _, _) => 0,
        };
        RunSnapshot {
            active: st.active,
            run_id: st.run_id,
            run_kind: st.run_kind.clone(),
            entity_id: st.entity_id,
            cancelled: st.cancelled,
            progress: st.progress,
            started_at: st.started_at,
            finished_at: st.finished_at,
            elapsed_seconds: elapsed_seconds.max(0),
            log: st.log.iter().cloned().collect(),
        }
    }
}
