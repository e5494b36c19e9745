//! Retrying execution of remote actions with a per-(target, action) status cache.

use crate::errors::ReplayError;
use crate::events::ListenerSet;
use crate::logging::RunLogger;
use crate::runtime::Clock;
use crate::surface::{ActionSurface, RemoteAction};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub retry: bool,
    pub max_retries: u32,
    /// Base delay; the wait before retry `n` is `delay * n`.
    pub delay: Duration,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            retry: true,
            max_retries: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl ExecuteOptions {
    pub fn without_retry() -> Self {
        Self {
            retry: false,
            ..Self::default()
        }
    }

    fn allowed_retries(&self) -> u32 {
        if self.retry {
            self.max_retries
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
    pub retry_count: u32,
}

impl ActionResult {
    /// Turns a terminal failure into `ReplayError::Action` for callers that propagate.
    pub fn into_result(self, action_id: &str) -> Result<Self, ReplayError> {
        if self.success {
            return Ok(self);
        }
        Err(ReplayError::Action(format!(
            "{action_id} failed after {} retries: {}",
            self.retry_count,
            self.error.as_deref().unwrap_or("unknown error")
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionStatus {
    pub active: bool,
    pub last_error: Option<String>,
    pub use_count: u64,
    pub last_used_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ActionEvent {
    Attempt {
        target_id: String,
        action_id: String,
        attempt: u32,
    },
    Retry {
        target_id: String,
        action_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    Succeeded {
        target_id: String,
        action_id: String,
        retry_count: u32,
    },
    Failed {
        target_id: String,
        action_id: String,
        retry_count: u32,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchResult {
    pub succeeded: usize,
    pub failed: usize,
    pub stopped_early: bool,
    pub results: Vec<ActionResult>,
}

impl BatchResult {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && !self.stopped_early
    }
}

type StatusKey = (String, String);

pub struct RetryingActionExecutor {
    surface: Arc<dyn ActionSurface>,
    clock: Arc<dyn Clock>,
    logger: Arc<RunLogger>,
    statuses: Mutex<HashMap<StatusKey, ActionStatus>>,
    listeners: ListenerSet<ActionEvent>,
}

impl RetryingActionExecutor {
    pub fn new(surface: Arc<dyn ActionSurface>, clock: Arc<dyn Clock>, logger: Arc<RunLogger>) -> Self {
        Self {
            surface,
            clock,
            listeners: ListenerSet::new("action", logger.clone()),
            logger,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn listeners(&self) -> &ListenerSet<ActionEvent> {
        &self.listeners
    }

    pub async fn execute(
        &self,
        target_id: &str,
        action: &RemoteAction,
        options: ExecuteOptions,
    ) -> ActionResult {
        let action_id = action.action_id();
        let started = Instant::now();
        let allowed = options.allowed_retries();
        let mut attempt: u32 = 0;
        loop {
            self.listeners.emit(&ActionEvent::Attempt {
                target_id: target_id.to_string(),
                action_id: action_id.clone(),
                attempt,
            });
            let outcome = self.surface.perform_action(target_id, action).await;
            if outcome.success {
                self.record_status(target_id, &action_id, None);
                self.logger.append(
                    "debug",
                    "action.succeeded",
                    json!({ "target_id": target_id, "action_id": action_id, "retry_count": attempt }),
                );
                self.listeners.emit(&ActionEvent::Succeeded {
                    target_id: target_id.to_string(),
                    action_id,
                    retry_count: attempt,
                });
                return ActionResult {
                    success: true,
                    error: None,
                    duration: started.elapsed(),
                    retry_count: attempt,
                };
            }

            let error = outcome
                .error
                .unwrap_or_else(|| "action failed without an error message".to_string());
            if attempt >= allowed {
                self.record_status(target_id, &action_id, Some(error.clone()));
                self.logger.append(
                    "warn",
                    "action.failed",
                    json!({
                        "target_id": target_id,
                        "action_id": action_id,
                        "retry_count": attempt,
                        "error": error,
                    }),
                );
                self.listeners.emit(&ActionEvent::Failed {
                    target_id: target_id.to_string(),
                    action_id,
                    retry_count: attempt,
                    error: error.clone(),
                });
                return ActionResult {
                    success: false,
                    error: Some(error),
                    duration: started.elapsed(),
                    retry_count: attempt,
                };
            }

            attempt += 1;
            let delay = options.delay.saturating_mul(attempt);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            self.logger.append(
                "info",
                "action.retry",
                json!({
                    "target_id": target_id,
                    "action_id": action_id,
                    "attempt": attempt,
                    "delay_ms": delay_ms,
                    "error": error,
                }),
            );
            self.listeners.emit(&ActionEvent::Retry {
                target_id: target_id.to_string(),
                action_id: action_id.clone(),
                attempt,
                delay_ms,
                error,
            });
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Runs `actions` in order. With `stop_on_failure` the first failure ends the batch.
    pub async fn execute_batch(
        &self,
        target_id: &str,
        actions: &[RemoteAction],
        options: ExecuteOptions,
        stop_on_failure: bool,
    ) -> BatchResult {
        let mut batch = BatchResult::default();
        for (index, action) in actions.iter().enumerate() {
            let result = self.execute(target_id, action, options).await;
            let success = result.success;
            batch.results.push(result);
            if success {
                batch.succeeded += 1;
            } else {
                batch.failed += 1;
                if stop_on_failure {
                    batch.stopped_early = index + 1 < actions.len();
                    break;
                }
            }
        }
        batch
    }

    pub fn is_active(&self, target_id: &str, action_id: &str) -> bool {
        self.get_status(target_id, action_id)
            .is_some_and(|status| status.active)
    }

    pub fn get_status(&self, target_id: &str, action_id: &str) -> Option<ActionStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(target_id.to_string(), action_id.to_string()))
            .cloned()
    }

    /// Clears one cached status, or every status for the target when `action_id` is `None`.
    pub fn clear_status(&self, target_id: &str, action_id: Option<&str>) -> usize {
        let mut statuses = self.statuses.lock().unwrap_or_else(PoisonError::into_inner);
        let before = statuses.len();
        match action_id {
            Some(action_id) => {
                statuses.remove(&(target_id.to_string(), action_id.to_string()));
            }
            None => statuses.retain(|(target, _), _| target != target_id),
        }
        before - statuses.len()
    }

    fn record_status(&self, target_id: &str, action_id: &str, error: Option<String>) {
        let now = self.clock.now_unix_ms();
        let mut statuses = self.statuses.lock().unwrap_or_else(PoisonError::into_inner);
        let status = statuses
            .entry((target_id.to_string(), action_id.to_string()))
            .or_insert(ActionStatus {
                active: false,
                last_error: None,
                use_count: 0,
                last_used_ms: now,
            });
        status.last_used_ms = now;
        match error {
            None => {
                status.active = true;
                status.last_error = None;
                status.use_count += 1;
            }
            Some(error) => {
                status.active = false;
                status.last_error = Some(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeClock;
    use crate::surface::{ActionOutcome, ScriptedSurface};

    fn executor(surface: &ScriptedSurface) -> RetryingActionExecutor {
        RetryingActionExecutor::new(
            Arc::new(surface.clone()),
            Arc::new(FakeClock::new(1_000)),
            Arc::new(RunLogger::in_memory()),
        )
    }

    fn inject() -> RemoteAction {
        RemoteAction::InjectScript {
            script: "recorder.js".to_string(),
        }
    }

    fn fast(max_retries: u32) -> ExecuteOptions {
        ExecuteOptions {
            retry: true,
            max_retries,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn terminal_failures_convert_to_action_errors() {
        let surface = ScriptedSurface::new();
        surface.fail_by_default("tab gone");
        let exec = executor(&surface);
        let err = exec
            .execute("t", &inject(), fast(1))
            .await
            .into_result("inject_script")
            .expect_err("always fails");
        assert_eq!(err.code(), "action_failed");
        assert_eq!(
            err.to_string(),
            "action failed: inject_script failed after 1 retries: tab gone"
        );

        let surface = ScriptedSurface::new();
        let ok = executor(&surface)
            .execute("t", &inject(), fast(1))
            .await
            .into_result("inject_script")
            .expect("succeeds");
        assert_eq!(ok.retry_count, 0);
    }

    #[tokio::test]
    async fn succeeds_after_two_failures() {
        let surface = ScriptedSurface::new();
        surface.push_outcome("inject_script", ActionOutcome::failed("boom 1"));
        surface.push_outcome("inject_script", ActionOutcome::failed("boom 2"));
        let executor = executor(&surface);
        let phases = Arc::new(Mutex::new(Vec::new()));
        let seen = phases.clone();
        executor.listeners().subscribe(move |event: &ActionEvent| {
            let phase = match event {
                ActionEvent::Attempt { .. } => "attempt",
                ActionEvent::Retry { .. } => "retry",
                ActionEvent::Succeeded { .. } => "succeeded",
                ActionEvent::Failed { .. } => "failed",
            };
            seen.lock().expect("lock").push(phase);
            Ok(())
        });

        let result = executor.execute("tab", &inject(), fast(2)).await;
        assert!(result.success);
        assert_eq!(result.retry_count, 2);
        assert_eq!(surface.calls_for("inject_script"), 3);
        assert!(executor.is_active("tab", "inject_script"));
        assert_eq!(
            *phases.lock().expect("lock"),
            vec!["attempt", "retry", "attempt", "retry", "attempt", "succeeded"]
        );
    }

    #[tokio::test]
    async fn exhausts_retries_and_reports_last_error() {
        let surface = ScriptedSurface::new();
        surface.push_outcome("inject_script", ActionOutcome::failed("first"));
        surface.push_outcome("inject_script", ActionOutcome::failed("second"));
        surface.push_outcome("inject_script", ActionOutcome::failed("third"));
        let executor = executor(&surface);

        let result = executor.execute("tab", &inject(), fast(2)).await;
        assert!(!result.success);
        assert_eq!(result.retry_count, 2);
        assert_eq!(result.error.as_deref(), Some("third"));
        let status = executor.get_status("tab", "inject_script").expect("status");
        assert!(!status.active);
        assert_eq!(status.last_error.as_deref(), Some("third"));
        assert_eq!(status.use_count, 0);
    }

    #[tokio::test]
    async fn retry_disabled_makes_single_attempt() {
        let surface = ScriptedSurface::new();
        surface.fail_by_default("down");
        let executor = executor(&surface);
        let result = executor
            .execute("tab", &inject(), ExecuteOptions::without_retry())
            .await;
        assert!(!result.success);
        assert_eq!(result.retry_count, 0);
        assert_eq!(surface.calls_for("inject_script"), 1);
    }

    #[tokio::test]
    async fn linear_backoff_waits_base_times_attempt() {
        let surface = ScriptedSurface::new();
        surface.push_outcome("inject_script", ActionOutcome::failed("a"));
        surface.push_outcome("inject_script", ActionOutcome::failed("b"));
        let executor = executor(&surface);
        let options = ExecuteOptions {
            retry: true,
            max_retries: 2,
            delay: Duration::from_millis(20),
        };
        let result = executor.execute("tab", &inject(), options).await;
        assert!(result.success);
        // 20ms before the first retry, 40ms before the second.
        assert!(result.duration >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn batch_counts_and_stops_on_failure() {
        let surface = ScriptedSurface::new();
        surface.push_outcome("start_capture", ActionOutcome::failed("no tab"));
        let executor = executor(&surface);
        let actions = vec![
            inject(),
            RemoteAction::StartCapture {
                session_id: "s".to_string(),
                project_id: 1,
            },
            RemoteAction::StopCapture {
                session_id: "s".to_string(),
            },
        ];

        let batch = executor
            .execute_batch("tab", &actions, ExecuteOptions::without_retry(), true)
            .await;
        assert_eq!(batch.succeeded, 1);
        assert_eq!(batch.failed, 1);
        assert!(batch.stopped_early);
        assert!(!batch.all_succeeded());

        surface.push_outcome("start_capture", ActionOutcome::failed("no tab"));
        let batch = executor
            .execute_batch("tab", &actions, ExecuteOptions::without_retry(), false)
            .await;
        assert_eq!(batch.succeeded, 2);
        assert_eq!(batch.failed, 1);
        assert_eq!(batch.results.len(), 3);
    }

    #[tokio::test]
    async fn clear_status_by_action_or_target() {
        let surface = ScriptedSurface::new();
        let executor = executor(&surface);
        executor
            .execute("tab", &inject(), ExecuteOptions::without_retry())
            .await;
        executor
            .execute(
                "tab",
                &RemoteAction::StopCapture {
                    session_id: "s".to_string(),
                },
                ExecuteOptions::without_retry(),
            )
            .await;
        executor
            .execute("other", &inject(), ExecuteOptions::without_retry())
            .await;

        assert_eq!(executor.clear_status("tab", Some("inject_script")), 1);
        assert!(!executor.is_active("tab", "inject_script"));
        assert_eq!(executor.clear_status("tab", None), 1);
        assert!(executor.is_active("other", "inject_script"));
    }
}
