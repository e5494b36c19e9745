use super::{ResultStore, RunRecordStore, SessionStateStore, StepStore, StoreResult};
use crate::errors::ReplayError;
use crate::run_record::RunRecord;
use crate::session::SessionSnapshot;
use crate::types::{SessionKind, Step, StepResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MemoryState {
    sessions: HashMap<SessionKind, SessionSnapshot>,
    steps: HashMap<i64, Vec<Step>>,
    results: HashMap<String, BTreeMap<(usize, usize), StepResult>>,
    runs: Vec<(String, RunRecord)>,
    fail_snapshots: bool,
    fail_flush: bool,
    snapshot_writes: usize,
}

/// In-process store with switchable failures for exercising degraded paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every snapshot save fail until cleared.
    pub fn fail_snapshots(&self, fail: bool) {
        self.lock().fail_snapshots = fail;
    }

    /// Makes result and run-record writes fail until cleared.
    pub fn fail_flush(&self, fail: bool) {
        self.lock().fail_flush = fail;
    }

    pub fn snapshot_writes(&self) -> usize {
        self.lock().snapshot_writes
    }

    pub fn run_ids(&self) -> Vec<String> {
        self.lock().runs.iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl SessionStateStore for MemoryStore {
    async fn save(&self, kind: SessionKind, snapshot: Option<&SessionSnapshot>) -> StoreResult<()> {
        let mut state = self.lock();
        if state.fail_snapshots {
            return Err(ReplayError::Persistence(
                "snapshot store unavailable".to_string(),
            ));
        }
        state.snapshot_writes += 1;
        match snapshot {
            Some(snapshot) => {
                state.sessions.insert(kind, snapshot.clone());
            }
            None => {
                state.sessions.remove(&kind);
            }
        }
        Ok(())
    }

    async fn load(&self, kind: SessionKind) -> StoreResult<Option<SessionSnapshot>> {
        Ok(self.lock().sessions.get(&kind).cloned())
    }
}

#[async_trait]
impl StepStore for MemoryStore {
    async fn add_step(&self, project_id: i64, step: &Step) -> StoreResult<()> {
        let mut state = self.lock();
        let steps = state.steps.entry(project_id).or_default();
        match steps.iter_mut().find(|existing| existing.id == step.id) {
            Some(existing) => *existing = step.clone(),
            None => steps.push(step.clone()),
        }
        Ok(())
    }

    async fn get_steps(&self, project_id: i64) -> StoreResult<Vec<Step>> {
        Ok(self.lock().steps.get(&project_id).cloned().unwrap_or_default())
    }

    async fn clear_steps(&self, project_id: i64) -> StoreResult<usize> {
        Ok(self
            .lock()
            .steps
            .remove(&project_id)
            .map(|steps| steps.len())
            .unwrap_or(0))
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn add_result(&self, run_id: &str, result: &StepResult) -> StoreResult<()> {
        self.add_results(run_id, std::slice::from_ref(result)).await
    }

    async fn add_results(&self, run_id: &str, results: &[StepResult]) -> StoreResult<()> {
        let mut state = self.lock();
        if state.fail_flush {
            return Err(ReplayError::Persistence("result store unavailable".to_string()));
        }
        let cells = state.results.entry(run_id.to_string()).or_default();
        for result in results {
            cells.insert((result.row_index, result.step_index), result.clone());
        }
        Ok(())
    }

    async fn get_results(&self, run_id: &str) -> StoreResult<Vec<StepResult>> {
        Ok(self
            .lock()
            .results
            .get(run_id)
            .map(|cells| cells.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_results(&self, run_id: &str) -> StoreResult<usize> {
        Ok(self
            .lock()
            .results
            .remove(run_id)
            .map(|cells| cells.len())
            .unwrap_or(0))
    }
}

#[async_trait]
impl RunRecordStore for MemoryStore {
    async fn save_run(&self, run_id: &str, record: &RunRecord) -> StoreResult<i64> {
        let mut state = self.lock();
        if state.fail_flush {
            return Err(ReplayError::Persistence("run store unavailable".to_string()));
        }
        if let Some(position) = state.runs.iter().position(|(id, _)| id == run_id) {
            state.runs[position].1 = record.clone();
            return Ok(i64::try_from(position + 1).unwrap_or(i64::MAX));
        }
        state.runs.push((run_id.to_string(), record.clone()));
        Ok(i64::try_from(state.runs.len()).unwrap_or(i64::MAX))
    }

    async fn list_runs(&self, project_id: i64) -> StoreResult<Vec<RunRecord>> {
        Ok(self
            .lock()
            .runs
            .iter()
            .filter(|(_, record)| record.project_id == project_id)
            .map(|(_, record)| record.clone())
            .collect())
    }
}
