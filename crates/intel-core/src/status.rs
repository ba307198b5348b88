//! Per-(entity, module) status records and module result payloads.

use crate::registry::ModuleId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ModuleStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of one module for one entity.
///
/// Transitions: `Pending → Running → Done | Error`, and back to `Running` on
/// every re-run. A record stuck in `Running` past the staleness threshold is
/// reclassified by `ModuleStatusRecord::repaired_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl ModuleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleStatus::Pending => "pending",
            ModuleStatus::Running => "running",
            ModuleStatus::Done => "done",
            ModuleStatus::Error => "error",
        }
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ModuleResult
// ---------------------------------------------------------------------------

/// Result payload produced by one module's executor.
///
/// Each module owns the shape of its payload; the orchestrator only requires
/// a JSON object so results can be merged and inspected uniformly.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleResult {
    pub module: ModuleId,
    pub payload: serde_json::Value,
}

impl ModuleResult {
    /// Validate `payload` at the executor boundary.
    pub fn new(module: ModuleId, payload: serde_json::Value) -> Result<Self, String> {
        if !payload.is_object() {
            return Err(format!(
                "module '{module}' returned a non-object result ({})",
                json_kind(&payload)
            ));
        }
        Ok(Self { module, payload })
    }
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// StatusExtras
// ---------------------------------------------------------------------------

/// Optional fields merged into a record by `JobStore::upsert`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusExtras {
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl StatusExtras {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn result(value: serde_json::Value) -> Self {
        Self {
            result: Some(value),
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error_message: Some(message.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// ModuleStatusRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleStatusRecord {
    pub module: ModuleId,
    pub status: ModuleStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub last_completed_at: Option<DateTime<Utc>>,
    /// `None` only for the implicit pending default of a module with no row.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ModuleStatusRecord {
    /// The record a module has before it was ever run.
    pub fn pending(module: ModuleId) -> Self {
        Self {
            module,
            status: ModuleStatus::Pending,
            result: None,
            error_message: None,
            last_completed_at: None,
            updated_at: None,
        }
    }

    /// Apply an upsert on top of this record.
    ///
    /// `error_message` is cleared on `Done`, and on `Running` unless the
    /// caller supplies one explicitly. `result` is kept when none is supplied.
    pub fn merge(&mut self, status: ModuleStatus, extras: StatusExtras, now: DateTime<Utc>) {
        let StatusExtras {
            result,
            error_message,
        } = extras;

        if let Some(result) = result {
            self.result = Some(result);
        }
        self.error_message = match status {
            ModuleStatus::Done => None,
            ModuleStatus::Running => error_message,
            ModuleStatus::Error | ModuleStatus::Pending => error_message.or(self.error_message.take()),
        };
        if status == ModuleStatus::Done {
            self.last_completed_at = Some(now);
        }
        self.status = status;
        self.updated_at = Some(now);
    }

    pub fn has_result(&self) -> bool {
        match &self.result {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::Object(m)) => !m.is_empty(),
            Some(serde_json::Value::Array(a)) => !a.is_empty(),
            Some(serde_json::Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }

    /// True when the record claims `Running` but has not been written for
    /// longer than `stale_after`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.status == ModuleStatus::Running
            && self.updated_at.is_some_and(|at| now - at > stale_after)
    }

    /// The status a stale `Running` record should fall back to.
    pub fn repaired_status(&self) -> ModuleStatus {
        if self.has_result() {
            ModuleStatus::Done
        } else if self
            .error_message
            .as_deref()
            .is_some_and(|m| !m.is_empty())
        {
            ModuleStatus::Error
        } else {
            ModuleStatus::Pending
        }
    }
}
