use crate::logging::RunLogger;
use crate::session::SessionSummary;
use crate::types::{SessionKind, StepResult};
use serde::Serialize;
use serde_json::json;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub type Listener<E> = Arc<dyn Fn(&E) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callback registry where one misbehaving listener cannot starve the rest.
pub struct ListenerSet<E> {
    scope: &'static str,
    logger: Arc<RunLogger>,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener<E>)>>,
}

impl<E> ListenerSet<E> {
    pub fn new(scope: &'static str, logger: Arc<RunLogger>) -> Self {
        Self {
            scope,
            logger,
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&E) -> Result<(), String> + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to every listener and returns how many of them failed.
    pub fn emit(&self, event: &E) -> usize {
        let snapshot = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut failures = 0;
        for (id, listener) in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(event)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(message)) => message,
                Err(_) => "listener panicked".to_string(),
            };
            failures += 1;
            self.logger.append(
                "warn",
                &format!("{}.listener_failed", self.scope),
                json!({ "listener_id": id.0, "error": error }),
            );
        }
        failures
    }
}

/// Lifecycle notifications published by the engine for UI or logging consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Started {
        kind: SessionKind,
        session_id: String,
        project_id: i64,
        target_id: String,
    },
    Paused {
        kind: SessionKind,
        session_id: String,
    },
    Resumed {
        kind: SessionKind,
        session_id: String,
        paused_ms: u64,
    },
    StepRecorded {
        session_id: String,
        project_id: i64,
        step_id: String,
        ordinal: usize,
    },
    StepResult {
        session_id: String,
        result: StepResult,
        progress: f64,
    },
    Completed {
        kind: SessionKind,
        session_id: String,
        summary: SessionSummary,
    },
    Failed {
        kind: SessionKind,
        session_id: String,
        error: String,
    },
}
