use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use super::{ResultStore, RunRecordStore, SessionStateStore, StepStore, StoreResult};
use crate::errors::ReplayError;
use crate::logging::RunLogger;
use crate::run_record::{RunRecord, RunStatus};
use crate::runtime::system_time_unix_ms;
use crate::session::SessionSnapshot;
use crate::types::{SessionKind, Step, StepResult, StepStatus};

const READ_POOL_SIZE: usize = 4;

#[derive(Debug)]
enum WriteCmd {
    SaveSession {
        kind: SessionKind,
        session: Option<(String, String)>,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    AddStep {
        project_id: i64,
        step_id: String,
        step_json: String,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    ClearSteps {
        project_id: i64,
        reply: oneshot::Sender<StoreResult<usize>>,
    },
    AddResults {
        run_id: String,
        results: Vec<StepResult>,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    ClearResults {
        run_id: String,
        reply: oneshot::Sender<StoreResult<usize>>,
    },
    SaveRun {
        run_id: String,
        record: Box<RunRecord>,
        results_json: String,
        reply: oneshot::Sender<StoreResult<i64>>,
    },
}

/// SQLite-backed store: one writer thread fed over a channel plus a read-only pool.
pub struct SqliteStore {
    write_tx: Option<mpsc::Sender<WriteCmd>>,
    read_pool: ReadPool,
    writer_join: Option<thread::JoinHandle<()>>,
    db_path: PathBuf,
    logger: Arc<RunLogger>,
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        // Closing the sender ends the writer loop; joining flushes in-flight writes.
        drop(self.write_tx.take());
        if let Some(handle) = self.writer_join.take() {
            let _ = handle.join();
        }
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, logger: Arc<RunLogger>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        logger.append(
            "info",
            "store.open",
            json!({ "path": path.display().to_string() }),
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ReplayError::Database(e.to_string()))?;
        }

        let existed_before_open = path.exists();
        if existed_before_open {
            let meta =
                std::fs::metadata(&path).map_err(|e| ReplayError::Database(e.to_string()))?;
            if meta.len() == 0 {
                return Err(ReplayError::Database(format!(
                    "engine database is 0 bytes (corrupt): {}",
                    path.display()
                )));
            }
        }

        let mut write_conn = Connection::open(&path).map_err(db_err)?;
        configure_write_connection(&write_conn)?;
        if existed_before_open {
            let integrity: String = write_conn
                .pragma_query_value(None, "quick_check", |row| row.get(0))
                .map_err(db_err)?;
            if integrity != "ok" {
                return Err(ReplayError::Database(format!(
                    "engine database failed integrity check: {integrity}"
                )));
            }
        }
        run_migrations(&mut write_conn, &logger)?;

        let (write_tx, mut write_rx) = mpsc::channel(128);
        let writer_join = thread::spawn(move || {
            while let Some(cmd) = write_rx.blocking_recv() {
                match cmd {
                    WriteCmd::SaveSession {
                        kind,
                        session,
                        reply,
                    } => {
                        let _ = reply.send(save_session(&write_conn, kind, session));
                    }
                    WriteCmd::AddStep {
                        project_id,
                        step_id,
                        step_json,
                        reply,
                    } => {
                        let _ = reply.send(add_step(&write_conn, project_id, &step_id, &step_json));
                    }
                    WriteCmd::ClearSteps { project_id, reply } => {
                        let result = write_conn
                            .execute("DELETE FROM steps WHERE project_id = ?1", [project_id])
                            .map_err(db_err);
                        let _ = reply.send(result);
                    }
                    WriteCmd::AddResults {
                        run_id,
                        results,
                        reply,
                    } => {
                        let _ = reply.send(add_results(&mut write_conn, &run_id, &results));
                    }
                    WriteCmd::ClearResults { run_id, reply } => {
                        let result = write_conn
                            .execute("DELETE FROM step_results WHERE run_id = ?1", [&run_id])
                            .map_err(db_err);
                        let _ = reply.send(result);
                    }
                    WriteCmd::SaveRun {
                        run_id,
                        record,
                        results_json,
                        reply,
                    } => {
                        let _ = reply.send(save_run(&write_conn, &run_id, &record, &results_json));
                    }
                }
            }
        });

        let read_pool = ReadPool::open(&path, READ_POOL_SIZE)?;
        logger.append(
            "info",
            "store.opened",
            json!({ "path": path.display().to_string() }),
        );
        Ok(Self {
            write_tx: Some(write_tx),
            read_pool,
            writer_join: Some(writer_join),
            db_path: path,
            logger,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn sender(&self) -> StoreResult<&mpsc::Sender<WriteCmd>> {
        self.write_tx
            .as_ref()
            .ok_or_else(|| ReplayError::Database("store is closed".to_string()))
    }

    async fn write<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<StoreResult<T>>) -> WriteCmd,
    ) -> StoreResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender()?
            .send(build(reply_tx))
            .await
            .map_err(|e| ReplayError::Database(e.to_string()))?;
        reply_rx
            .await
            .map_err(|e| ReplayError::Database(e.to_string()))?
    }

    async fn read<T: Send + 'static>(
        &self,
        f: impl FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    ) -> StoreResult<T> {
        let pool = self.read_pool.clone();
        tokio::task::spawn_blocking(move || pool.with_conn(f))
            .await
            .map_err(|e| ReplayError::Database(format!("read task failed: {e}")))?
    }

    fn log_write_failure(&self, event_type: &str, error: &ReplayError) {
        self.logger.append(
            "error",
            event_type,
            json!({ "path": self.db_path.display().to_string(), "error": error.to_string() }),
        );
    }
}

#[async_trait]
impl SessionStateStore for SqliteStore {
    async fn save(&self, kind: SessionKind, snapshot: Option<&SessionSnapshot>) -> StoreResult<()> {
        let session = match snapshot {
            Some(snapshot) => Some((
                snapshot.session_id.clone(),
                serde_json::to_string(snapshot).map_err(|e| ReplayError::Persistence(e.to_string()))?,
            )),
            None => None,
        };
        let result = self
            .write(|reply| WriteCmd::SaveSession {
                kind,
                session,
                reply,
            })
            .await;
        if let Err(err) = &result {
            self.log_write_failure("store.session.save_failed", err);
        }
        result
    }

    async fn load(&self, kind: SessionKind) -> StoreResult<Option<SessionSnapshot>> {
        let raw = self
            .read(move |conn| {
                conn.query_row(
                    "SELECT snapshot_json FROM session_state WHERE kind = ?1",
                    [kind.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(db_err)
            })
            .await?;
        raw.map(|text| {
            serde_json::from_str(&text).map_err(|e| {
                ReplayError::Persistence(format!("corrupt {} snapshot: {e}", kind.as_str()))
            })
        })
        .transpose()
    }
}

#[async_trait]
impl StepStore for SqliteStore {
    async fn add_step(&self, project_id: i64, step: &Step) -> StoreResult<()> {
        if step.id.is_empty() {
            return Err(ReplayError::Validation(
                "steps must carry an id before they are stored".to_string(),
            ));
        }
        let step_json =
            serde_json::to_string(step).map_err(|e| ReplayError::Persistence(e.to_string()))?;
        let step_id = step.id.clone();
        self.write(|reply| WriteCmd::AddStep {
            project_id,
            step_id,
            step_json,
            reply,
        })
        .await
    }

    async fn get_steps(&self, project_id: i64) -> StoreResult<Vec<Step>> {
        let rows = self
            .read(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT step_json FROM steps WHERE project_id = ?1 ORDER BY ordinal ASC",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map([project_id], |row| row.get::<_, String>(0))
                    .map_err(db_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
            })
            .await?;
        rows.iter()
            .map(|text| {
                serde_json::from_str(text)
                    .map_err(|e| ReplayError::Persistence(format!("corrupt step row: {e}")))
            })
            .collect()
    }

    async fn clear_steps(&self, project_id: i64) -> StoreResult<usize> {
        self.write(|reply| WriteCmd::ClearSteps { project_id, reply })
            .await
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn add_result(&self, run_id: &str, result: &StepResult) -> StoreResult<()> {
        self.add_results(run_id, std::slice::from_ref(result)).await
    }

    async fn add_results(&self, run_id: &str, results: &[StepResult]) -> StoreResult<()> {
        let run_id = run_id.to_string();
        let results = results.to_vec();
        let outcome = self
            .write(|reply| WriteCmd::AddResults {
                run_id,
                results,
                reply,
            })
            .await;
        if let Err(err) = &outcome {
            self.log_write_failure("store.results.write_failed", err);
        }
        outcome
    }

    async fn get_results(&self, run_id: &str) -> StoreResult<Vec<StepResult>> {
        let run_id = run_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT step_index, row_index, step_id, status, duration_ms, error, timestamp
                     FROM step_results
                     WHERE run_id = ?1
                     ORDER BY row_index ASC, step_index ASC",
                )
                .map_err(db_err)?;
            let rows = stmt.query_map([&run_id], row_to_result).map_err(db_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
        })
        .await
    }

    async fn clear_results(&self, run_id: &str) -> StoreResult<usize> {
        let run_id = run_id.to_string();
        self.write(|reply| WriteCmd::ClearResults { run_id, reply })
            .await
    }
}

#[async_trait]
impl RunRecordStore for SqliteStore {
    async fn save_run(&self, run_id: &str, record: &RunRecord) -> StoreResult<i64> {
        let results_json = serde_json::to_string(&record.results)
            .map_err(|e| ReplayError::Persistence(e.to_string()))?;
        let run_id = run_id.to_string();
        let record = Box::new(record.clone());
        let outcome = self
            .write(|reply| WriteCmd::SaveRun {
                run_id,
                record,
                results_json,
                reply,
            })
            .await;
        if let Err(err) = &outcome {
            self.log_write_failure("store.run.write_failed", err);
        }
        outcome
    }

    async fn list_runs(&self, project_id: i64) -> StoreResult<Vec<RunRecord>> {
        self.read(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT project_id, status, started_at, ended_at, total_steps, passed_steps,
                            failed_steps, results_json, logs
                     FROM run_records
                     WHERE project_id = ?1
                     ORDER BY started_at ASC, id ASC",
                )
                .map_err(db_err)?;
            let rows = stmt.query_map([project_id], row_to_run).map_err(db_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
        })
        .await
    }
}

#[derive(Clone)]
struct ReadPool {
    conns: Arc<Vec<Mutex<Connection>>>,
    next: Arc<AtomicUsize>,
}

impl ReadPool {
    fn open(path: &Path, size: usize) -> StoreResult<Self> {
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(db_err)?;
            conn.busy_timeout(std::time::Duration::from_secs(3))
                .map_err(db_err)?;
            conns.push(Mutex::new(conn));
        }
        Ok(Self {
            conns: Arc::new(conns),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        let guard = self.conns[idx]
            .lock()
            .map_err(|_| ReplayError::Database("read connection lock poisoned".to_string()))?;
        f(&guard)
    }
}

fn configure_write_connection(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(db_err)?;
    Ok(())
}

fn run_migrations(conn: &mut Connection, logger: &RunLogger) -> StoreResult<()> {
    let migrations = [
        (1_i64, include_str!("../../migrations/0001_engine.sql")),
        (2_i64, include_str!("../../migrations/0002_run_records.sql")),
    ];

    conn.execute_batch("BEGIN IMMEDIATE; CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL); COMMIT;")
        .map_err(db_err)?;

    for (version, sql) in migrations {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();
        if exists {
            continue;
        }

        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, system_time_unix_ms()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        logger.append(
            "info",
            "store.migration.applied",
            json!({ "version": version }),
        );
    }
    Ok(())
}

fn save_session(
    conn: &Connection,
    kind: SessionKind,
    session: Option<(String, String)>,
) -> StoreResult<()> {
    match session {
        Some((session_id, snapshot_json)) => conn
            .execute(
                "INSERT INTO session_state (kind, session_id, snapshot_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(kind) DO UPDATE SET
                    session_id = excluded.session_id,
                    snapshot_json = excluded.snapshot_json,
                    updated_at = excluded.updated_at",
                params![kind.as_str(), session_id, snapshot_json, system_time_unix_ms()],
            )
            .map(|_| ())
            .map_err(db_err),
        None => conn
            .execute("DELETE FROM session_state WHERE kind = ?1", [kind.as_str()])
            .map(|_| ())
            .map_err(db_err),
    }
}

fn add_step(conn: &Connection, project_id: i64, step_id: &str, step_json: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO steps (project_id, step_id, ordinal, step_json)
         VALUES (
            ?1, ?2,
            (SELECT COALESCE(MAX(ordinal) + 1, 0) FROM steps WHERE project_id = ?1),
            ?3
         )
         ON CONFLICT(project_id, step_id) DO UPDATE SET step_json = excluded.step_json",
        params![project_id, step_id, step_json],
    )
    .map(|_| ())
    .map_err(db_err)
}

fn add_results(conn: &mut Connection, run_id: &str, results: &[StepResult]) -> StoreResult<()> {
    let tx = conn.transaction().map_err(db_err)?;
    for result in results {
        tx.execute(
            "INSERT INTO step_results (
                run_id, row_index, step_index, step_id, status, duration_ms, error, timestamp
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(run_id, row_index, step_index) DO UPDATE SET
                step_id = excluded.step_id,
                status = excluded.status,
                duration_ms = excluded.duration_ms,
                error = excluded.error,
                timestamp = excluded.timestamp",
            params![
                run_id,
                to_db_int(result.row_index),
                to_db_int(result.step_index),
                result.step_id,
                result.status.as_str(),
                to_db_int(result.duration_ms),
                result.error,
                result.timestamp,
            ],
        )
        .map_err(db_err)?;
    }
    tx.commit().map_err(db_err)
}

fn save_run(
    conn: &Connection,
    run_id: &str,
    record: &RunRecord,
    results_json: &str,
) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO run_records (
            run_id, project_id, status, started_at, ended_at, total_steps, passed_steps,
            failed_steps, results_json, logs
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(run_id) DO UPDATE SET
            status = excluded.status,
            ended_at = excluded.ended_at,
            total_steps = excluded.total_steps,
            passed_steps = excluded.passed_steps,
            failed_steps = excluded.failed_steps,
            results_json = excluded.results_json,
            logs = excluded.logs",
        params![
            run_id,
            record.project_id,
            record.status.as_str(),
            record.started_at,
            record.ended_at,
            record.total_steps,
            record.passed_steps,
            record.failed_steps,
            results_json,
            record.logs,
        ],
    )
    .map_err(db_err)?;
    conn.query_row(
        "SELECT id FROM run_records WHERE run_id = ?1",
        [run_id],
        |row| row.get(0),
    )
    .map_err(db_err)
}

fn to_db_int<T: TryInto<i64>>(value: T) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

fn row_to_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepResult> {
    let status = row.get::<_, String>(3)?;
    Ok(StepResult {
        step_index: usize::try_from(row.get::<_, i64>(0)?)
            .map_err(|_| invalid_column(0, "negative index"))?,
        row_index: usize::try_from(row.get::<_, i64>(1)?)
            .map_err(|_| invalid_column(1, "negative index"))?,
        step_id: row.get(2)?,
        status: step_status_from_db(&status).ok_or_else(|| invalid_column(3, "invalid status"))?,
        duration_ms: u64::try_from(row.get::<_, i64>(4)?).unwrap_or(0),
        error: row.get(5)?,
        timestamp: row.get(6)?,
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let status = row.get::<_, String>(1)?;
    let results_json = row.get::<_, String>(7)?;
    Ok(RunRecord {
        project_id: row.get(0)?,
        status: RunStatus::parse(&status).ok_or_else(|| invalid_column(1, "invalid run status"))?,
        started_at: row.get(2)?,
        ended_at: row.get(3)?,
        total_steps: row.get(4)?,
        passed_steps: row.get(5)?,
        failed_steps: row.get(6)?,
        results: serde_json::from_str(&results_json)
            .map_err(|_| invalid_column(7, "invalid results json"))?,
        logs: row.get(8)?,
    })
}

fn step_status_from_db(value: &str) -> Option<StepStatus> {
    match value {
        "pending" => Some(StepStatus::Pending),
        "running" => Some(StepStatus::Running),
        "passed" => Some(StepStatus::Passed),
        "failed" => Some(StepStatus::Failed),
        "skipped" => Some(StepStatus::Skipped),
        _ => None,
    }
}

fn invalid_column(index: usize, message: &'static str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn db_err(error: rusqlite::Error) -> ReplayError {
    ReplayError::Database(error.to_string())
}
