//! Persistence collaborators: session snapshots, recorded steps, step results
//! and finished run records.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::errors::ReplayError;
use crate::run_record::RunRecord;
use crate::session::SessionSnapshot;
use crate::types::{SessionKind, Step, StepResult};
use async_trait::async_trait;

pub type StoreResult<T> = Result<T, ReplayError>;

#[async_trait]
pub trait SessionStateStore: Send + Sync {
    /// `None` clears the persisted snapshot for `kind`.
    async fn save(&self, kind: SessionKind, snapshot: Option<&SessionSnapshot>) -> StoreResult<()>;
    async fn load(&self, kind: SessionKind) -> StoreResult<Option<SessionSnapshot>>;
}

#[async_trait]
pub trait StepStore: Send + Sync {
    /// Upserts by step id; re-adding an existing step keeps its original position.
    async fn add_step(&self, project_id: i64, step: &Step) -> StoreResult<()>;
    async fn get_steps(&self, project_id: i64) -> StoreResult<Vec<Step>>;
    async fn clear_steps(&self, project_id: i64) -> StoreResult<usize>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Results are keyed by (run, row, step); writing the same cell twice replaces it.
    async fn add_result(&self, run_id: &str, result: &StepResult) -> StoreResult<()>;
    async fn add_results(&self, run_id: &str, results: &[StepResult]) -> StoreResult<()>;
    async fn get_results(&self, run_id: &str) -> StoreResult<Vec<StepResult>>;
    async fn clear_results(&self, run_id: &str) -> StoreResult<usize>;
}

#[async_trait]
pub trait RunRecordStore: Send + Sync {
    /// Returns the stored record id.
    async fn save_run(&self, run_id: &str, record: &RunRecord) -> StoreResult<i64>;
    async fn list_runs(&self, project_id: i64) -> StoreResult<Vec<RunRecord>>;
}

/// The full persistence surface the engine depends on.
pub trait Store: SessionStateStore + StepStore + ResultStore + RunRecordStore {}

impl<T> Store for T where T: SessionStateStore + StepStore + ResultStore + RunRecordStore {}
