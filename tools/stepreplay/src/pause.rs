//! Cooperative suspension for the replay loop.
//!
//! The loop calls [`PauseController::wait_if_suspended`] between units of
//! work. While paused (or while step mode has no pending step grant) the call
//! parks on a oneshot continuation; `resume`, `step` and `disable_step_mode`
//! complete every parked continuation exactly once and clear the list. A woken
//! waiter re-evaluates the state, so it only proceeds when it is actually
//! allowed to.

use crate::events::{ListenerId, ListenerSet};
use crate::logging::RunLogger;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    UserRequested,
    Breakpoint,
    ErrorPause,
    StepMode,
    External,
    Debug,
}

impl PauseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserRequested => "user_requested",
            Self::Breakpoint => "breakpoint",
            Self::ErrorPause => "error_pause",
            Self::StepMode => "step_mode",
            Self::External => "external",
            Self::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseEventKind {
    Paused,
    Resumed,
    StepExecuted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PauseEvent {
    pub kind: PauseEventKind,
    pub reason: Option<PauseReason>,
    pub message: Option<String>,
    /// Length of the pause that just ended; zero for other kinds.
    pub paused_ms: u64,
    pub total_paused_ms: u64,
}

#[derive(Debug, Default)]
struct PauseState {
    paused: bool,
    reason: Option<PauseReason>,
    message: Option<String>,
    paused_at: Option<Instant>,
    total_paused: Duration,
    step_mode: bool,
    step_started: bool,
    step_credit: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

impl PauseState {
    fn current_pause(&self) -> Duration {
        self.paused_at.map(|at| at.elapsed()).unwrap_or_default()
    }

    /// Decides whether a caller must park, consuming a step grant when it may pass.
    fn admit(&mut self) -> bool {
        if self.paused {
            return false;
        }
        if !self.step_mode {
            return true;
        }
        if !self.step_started {
            self.step_started = true;
            return true;
        }
        if self.step_credit {
            self.step_credit = false;
            return true;
        }
        false
    }

    fn release_waiters(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

pub struct PauseController {
    state: Mutex<PauseState>,
    listeners: ListenerSet<PauseEvent>,
    logger: Arc<RunLogger>,
}

impl PauseController {
    pub fn new(logger: Arc<RunLogger>) -> Self {
        Self {
            state: Mutex::new(PauseState::default()),
            listeners: ListenerSet::new("pause", logger.clone()),
            logger,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PauseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&PauseEvent) -> Result<(), String> + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Returns `false` when already paused; a second pause keeps the first reason.
    pub fn pause(&self, reason: PauseReason, message: impl Into<String>) -> bool {
        let message = message.into();
        let event = {
            let mut state = self.lock();
            if state.paused {
                return false;
            }
            state.paused = true;
            state.reason = Some(reason);
            state.message = Some(message.clone());
            state.paused_at = Some(Instant::now());
            PauseEvent {
                kind: PauseEventKind::Paused,
                reason: Some(reason),
                message: Some(message),
                paused_ms: 0,
                total_paused_ms: duration_ms(state.total_paused),
            }
        };
        self.logger.append(
            "info",
            "pause.paused",
            json!({ "reason": reason.as_str(), "message": event.message }),
        );
        self.listeners.emit(&event);
        true
    }

    /// Returns `false` when not paused.
    pub fn resume(&self, message: Option<String>) -> bool {
        let event = {
            let mut state = self.lock();
            if !state.paused {
                return false;
            }
            let elapsed = state.current_pause();
            state.total_paused += elapsed;
            state.paused = false;
            state.paused_at = None;
            let reason = state.reason.take();
            state.message = message.clone();
            state.release_waiters();
            PauseEvent {
                kind: PauseEventKind::Resumed,
                reason,
                message,
                paused_ms: duration_ms(elapsed),
                total_paused_ms: duration_ms(state.total_paused),
            }
        };
        self.logger.append(
            "info",
            "pause.resumed",
            json!({ "paused_ms": event.paused_ms, "total_paused_ms": event.total_paused_ms }),
        );
        self.listeners.emit(&event);
        true
    }

    /// Flips between paused and running; returns the new paused flag.
    pub fn toggle(&self) -> bool {
        if self.is_paused() {
            self.resume(None);
            false
        } else {
            self.pause(PauseReason::UserRequested, "toggled");
            true
        }
    }

    pub async fn wait_if_suspended(&self) {
        loop {
            let parked = {
                let mut state = self.lock();
                if state.admit() {
                    return;
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                rx
            };
            // A dropped sender means the controller was reset; re-check either way.
            let _ = parked.await;
        }
    }

    /// Whether the next `wait_if_suspended` call would park.
    pub fn should_wait(&self) -> bool {
        let state = self.lock();
        state.paused || (state.step_mode && state.step_started && !state.step_credit)
    }

    pub fn enable_step_mode(&self) {
        let mut state = self.lock();
        state.step_mode = true;
        state.step_started = false;
        state.step_credit = false;
        drop(state);
        self.logger
            .append("info", "pause.step_mode.enabled", json!({}));
    }

    pub fn disable_step_mode(&self) {
        let mut state = self.lock();
        state.step_mode = false;
        state.step_started = false;
        state.step_credit = false;
        state.release_waiters();
        drop(state);
        self.logger
            .append("info", "pause.step_mode.disabled", json!({}));
    }

    /// Grants exactly one unit of work in step mode. No-op outside step mode.
    pub fn step(&self) -> bool {
        let event = {
            let mut state = self.lock();
            if !state.step_mode {
                return false;
            }
            state.step_credit = true;
            if !state.paused {
                state.release_waiters();
            }
            PauseEvent {
                kind: PauseEventKind::StepExecuted,
                reason: Some(PauseReason::StepMode),
                message: None,
                paused_ms: 0,
                total_paused_ms: duration_ms(state.total_paused),
            }
        };
        self.logger.append("debug", "pause.step", json!({}));
        self.listeners.emit(&event);
        true
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_step_mode(&self) -> bool {
        self.lock().step_mode
    }

    pub fn reason(&self) -> Option<PauseReason> {
        self.lock().reason
    }

    /// Accumulated pause time, including the pause in progress.
    pub fn total_pause_duration(&self) -> Duration {
        let state = self.lock();
        state.total_paused + state.current_pause()
    }

    /// Returns to the initial un-paused state, releasing any parked caller.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.release_waiters();
        *state = PauseState::default();
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
