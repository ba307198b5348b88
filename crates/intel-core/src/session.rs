//! The exclusive automation resource checked out by module executors.
//!
//! A session is opened per module invocation through
//! `ExecutionContext::acquire_session`, which registers it with the run
//! tracker and hands back a `SessionGuard`. Dropping the guard closes the
//! session and deregisters it, so release happens on every exit path:
//! success, error, timeout (the executor future is dropped) and panic.
//!
//! Cancelling a run closes every registered session. Executors never get a
//! direct stop signal; their next session operation fails with
//! `ExecutorError::SessionClosed` instead.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::executor::ExecutorError;
use crate::registry::ModuleId;
use crate::tracker::RunTracker;

#[derive(Debug)]
struct SessionInner {
    id: Uuid,
    module: ModuleId,
    closed: AtomicBool,
    notify: Notify,
}

/// Cheap, cloneable handle to one automation session.
#[derive(Debug, Clone)]
pub struct AutomationSession {
    inner: Arc<SessionInner>,
}

impl AutomationSession {
    pub(crate) fn open(module: ModuleId) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                module,
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn module(&self) -> ModuleId {
        self.inner.module
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the session and wake everything waiting on it.
    /// Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let was_open = !self.inner.closed.swap(true, Ordering::AcqRel);
        if was_open {
            self.inner.notify.notify_waiters();
        }
        was_open
    }

    /// Fail fast if the session has been closed.
    pub fn ensure_open(&self) -> Result<(), ExecutorError> {
        if self.is_closed() {
            Err(ExecutorError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Drive `op` while holding the session. If the session is closed
    /// before `op` finishes, `op` is dropped and `SessionClosed` returned.
    pub async fn run<F, T>(&self, op: F) -> Result<T, ExecutorError>
    where
        F: Future<Output = T>,
    {
        self.ensure_open()?;
        tokio::select! {
            biased;
            _ = self.closed() => Err(ExecutorError::SessionClosed),
            out = op => Ok(out),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionGuard
// ---------------------------------------------------------------------------

/// Scoped ownership of a session registered with the run tracker.
pub struct SessionGuard {
    session: AutomationSession,
    tracker: Arc<RunTracker>,
    run_id: Uuid,
}

impl SessionGuard {
    pub(crate) fn new(session: AutomationSession, tracker: Arc<RunTracker>, run_id: Uuid) -> Self {
        Self {
            session,
            tracker,
            run_id,
        }
    }
}

impl std::ops::Deref for SessionGuard {
    type Target = AutomationSession;

    fn deref(&self) -> &AutomationSession {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.close();
        self.tracker.release_session(self.run_id, self.session.id());
    }
}
