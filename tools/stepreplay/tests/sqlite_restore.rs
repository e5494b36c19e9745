use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use stepreplay::config::EngineConfig;
use stepreplay::engine::Engine;
use stepreplay::logging::RunLogger;
use stepreplay::runtime::FakeClock;
use stepreplay::session::SessionStatus;
use stepreplay::store::{ResultStore, RunRecordStore, SqliteStore};
use stepreplay::surface::ScriptedSurface;

fn open_engine(db: &Path) -> (Engine, Arc<SqliteStore>) {
    let mut config = EngineConfig::default();
    config.replay.auto_run = false;
    config.retry.base_delay_ms = 1;
    let logger = Arc::new(RunLogger::in_memory());
    let store = Arc::new(SqliteStore::open(db, logger.clone()).expect("open store"));
    let engine = Engine::new(
        &config,
        store.clone(),
        Arc::new(ScriptedSurface::new()),
        Arc::new(FakeClock::new(1_700_000_000_000)),
        logger,
    );
    (engine, store)
}

async fn send(engine: &Engine, command: Value) -> Value {
    let response = engine.handle_line(&command.to_string()).await;
    assert!(response.success, "{command} -> {response:?}");
    response.data.unwrap_or(Value::Null)
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupted_replay_resumes_from_the_persisted_cursor() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("state").join("engine.sqlite");

    {
        let (engine, _store) = open_engine(&db);
        send(
            &engine,
            json!({
                "type": "start",
                "mode": "replay",
                "project_id": 11,
                "target_id": "tab-1",
                "steps": [
                    {"id": "a", "event": "input", "path": "#q", "label": "Query"},
                    {"id": "b", "event": "enter", "path": "#q"}
                ],
                "rows": [{"Query": "rust"}, {"Query": "sqlite"}]
            }),
        )
        .await;
        for _ in 0..3 {
            send(&engine, json!({"type": "executeStep"})).await;
        }
    }

    let (engine, store) = open_engine(&db);
    let restored = engine.restore().await;
    assert!(restored.recording.is_none());
    let replay = restored.replay.expect("replay restored");
    assert_eq!(replay.status, SessionStatus::Paused);
    assert_eq!((replay.current_row, replay.current_step), (1, 1));
    assert_eq!(replay.counts.passed, 3);

    send(&engine, json!({"type": "resume"})).await;
    let last = send(&engine, json!({"type": "executeStep"})).await;
    assert_eq!(last["row_index"], 1);
    assert_eq!(last["step_index"], 1);

    let session_id = replay.session_id;
    assert_eq!(store.get_results(&session_id).await.expect("results").len(), 4);
    let runs = store.list_runs(11).await.expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status.as_str(), "completed");
    assert_eq!((runs[0].total_steps, runs[0].passed_steps), (4, 4));

    let status = send(&engine, json!({"type": "getStatus"})).await;
    assert!(status["replay"].is_null());
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_sessions_leave_nothing_to_restore() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("engine.sqlite");

    {
        let (engine, _store) = open_engine(&db);
        send(
            &engine,
            json!({"type": "start", "mode": "recording", "project_id": 5, "target_id": "t"}),
        )
        .await;
        send(
            &engine,
            json!({"type": "recordStep", "step": {"event": "click", "path": "#ok"}}),
        )
        .await;
        send(&engine, json!({"type": "stop"})).await;
    }

    let (engine, _store) = open_engine(&db);
    let restored = engine.restore().await;
    assert!(restored.recording.is_none());
    assert!(restored.replay.is_none());
}
