use serde_json::{json, Value};
use std::sync::Arc;
use stepreplay::config::EngineConfig;
use stepreplay::engine::Engine;
use stepreplay::logging::RunLogger;
use stepreplay::run_record::RunStatus;
use stepreplay::runtime::FakeClock;
use stepreplay::store::{MemoryStore, ResultStore, RunRecordStore, StepStore};
use stepreplay::surface::{ActionOutcome, RemoteAction, ScriptedSurface};

struct Fixture {
    engine: Engine,
    store: Arc<MemoryStore>,
    surface: ScriptedSurface,
}

fn fixture() -> Fixture {
    let mut config = EngineConfig::default();
    config.replay.auto_run = false;
    config.retry.max_retries = 1;
    config.retry.base_delay_ms = 1;
    let store = Arc::new(MemoryStore::new());
    let surface = ScriptedSurface::new();
    let engine = Engine::new(
        &config,
        store.clone(),
        Arc::new(surface.clone()),
        Arc::new(FakeClock::new(1_700_000_000_000)),
        Arc::new(RunLogger::in_memory()),
    );
    Fixture {
        engine,
        store,
        surface,
    }
}

async fn send(engine: &Engine, command: Value) -> Value {
    let response = engine.handle_line(&command.to_string()).await;
    assert!(response.success, "{command} -> {response:?}");
    response.data.unwrap_or(Value::Null)
}

fn executed_values(surface: &ScriptedSurface) -> Vec<Option<String>> {
    surface
        .calls()
        .into_iter()
        .filter_map(|(_, action)| match action {
            RemoteAction::ExecuteStep { step, .. } => Some(step.value),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn mapped_column_value_reaches_the_surface() {
    let f = fixture();
    send(
        &f.engine,
        json!({
            "type": "start",
            "mode": "replay",
            "project_id": 7,
            "target_id": "tab-1",
            "steps": [
                {"event": "open", "path": "https://example.test/signup"},
                {"event": "input", "path": "//input[@name='email']", "label": "Email", "value": "recorded@x.io"},
                {"event": "click", "path": "//button[1]", "label": "Submit"}
            ],
            "rows": [{"E-mail Address": "a@b.com"}],
            "mappings": [
                {"field_name": "E-mail Address", "mapped": true, "inputvarfields": "Email"}
            ]
        }),
    )
    .await;

    for _ in 0..3 {
        let result = send(&f.engine, json!({"type": "executeStep"})).await;
        assert_eq!(result["status"], "passed");
    }
    assert_eq!(
        executed_values(&f.surface),
        vec![None, Some("a@b.com".to_string()), None]
    );

    // The last cell of the grid closes the session on its own.
    let status = send(&f.engine, json!({"type": "getStatus"})).await;
    assert!(status["replay"].is_null());
    let runs = f.store.list_runs(7).await.expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert_eq!((runs[0].passed_steps, runs[0].failed_steps), (3, 0));
    assert!(runs[0].logs.contains("session.replay.started"));

    let run_ids = f.store.run_ids();
    assert_eq!(run_ids.len(), 1);
    assert_eq!(f.store.get_results(&run_ids[0]).await.expect("results").len(), 3);
}

#[tokio::test]
async fn recorded_steps_replay_when_start_carries_none() {
    let f = fixture();
    send(
        &f.engine,
        json!({"type": "start", "mode": "recording", "project_id": 3, "target_id": "tab-9"}),
    )
    .await;
    let first = send(
        &f.engine,
        json!({"type": "recordStep", "step": {"event": "input", "path": "#name", "label": "Name", "value": "Ada"}}),
    )
    .await;
    assert!(!first["id"].as_str().unwrap_or_default().is_empty());
    send(
        &f.engine,
        json!({"type": "recordStep", "step": {"event": "click", "path": "#go", "label": "Go"}}),
    )
    .await;
    let recorded = send(&f.engine, json!({"type": "stop"})).await;
    assert_eq!(recorded["steps"].as_array().map(Vec::len), Some(2));
    assert_eq!(f.store.get_steps(3).await.expect("steps").len(), 2);

    send(
        &f.engine,
        json!({
            "type": "start",
            "mode": "replay",
            "project_id": 3,
            "target_id": "tab-9",
            "rows": [{"Name": "Grace"}, {"Name": "Linus"}]
        }),
    )
    .await;
    for _ in 0..4 {
        send(&f.engine, json!({"type": "executeStep"})).await;
    }
    assert_eq!(
        executed_values(&f.surface),
        vec![
            Some("Grace".to_string()),
            None,
            Some("Linus".to_string()),
            None
        ]
    );
    let runs = f.store.list_runs(3).await.expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].passed_steps, 4);
}

#[tokio::test]
async fn failing_step_marks_the_run_failed() {
    let f = fixture();
    send(
        &f.engine,
        json!({
            "type": "start",
            "mode": "replay",
            "project_id": 2,
            "target_id": "tab-2",
            "steps": [
                {"id": "s-open", "event": "open"},
                {"id": "s-click", "event": "click", "path": "#missing"},
                {"id": "s-next", "event": "click", "path": "#next"}
            ]
        }),
    )
    .await;
    for _ in 0..2 {
        f.surface
            .push_outcome("execute_step:s-click", ActionOutcome::failed("no such element"));
    }

    send(&f.engine, json!({"type": "executeStep"})).await;
    let failed = send(&f.engine, json!({"type": "executeStep"})).await;
    assert_eq!(failed["status"], "failed");
    assert_eq!(failed["error"], "no such element");

    let outcome = send(&f.engine, json!({"type": "stop"})).await;
    assert_eq!(outcome["summary"]["status"], "failed");
    assert_eq!(outcome["record"]["status"], "failed");
    assert_eq!(outcome["record"]["failed_steps"], 1);
    assert_eq!(outcome["summary"]["rows_failed"], 1);
}

#[tokio::test]
async fn pause_and_resume_round_trip_through_the_command_bus() {
    let f = fixture();
    send(
        &f.engine,
        json!({
            "type": "start",
            "mode": "replay",
            "project_id": 4,
            "target_id": "tab-4",
            "steps": [{"event": "open"}]
        }),
    )
    .await;
    let paused = send(
        &f.engine,
        json!({"type": "pause", "reason": "user_requested"}),
    )
    .await;
    assert_eq!(paused["status"], "paused");

    let blocked = f
        .engine
        .handle_line(r#"{"type":"pause","mode":"replay"}"#)
        .await;
    assert!(!blocked.success);

    let resumed = send(&f.engine, json!({"type": "resume"})).await;
    assert_eq!(resumed["status"], "running");
}
