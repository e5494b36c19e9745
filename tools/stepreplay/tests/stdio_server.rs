use serde_json::Value;
use std::sync::Arc;
use stepreplay::config::EngineConfig;
use stepreplay::engine::Engine;
use stepreplay::logging::RunLogger;
use stepreplay::runtime::FakeClock;
use stepreplay::serve;
use stepreplay::store::MemoryStore;
use stepreplay::surface::ScriptedSurface;
use tokio::io::AsyncReadExt;

#[tokio::test(flavor = "multi_thread")]
async fn serve_answers_each_line_in_order() {
    let mut config = EngineConfig::default();
    config.replay.auto_run = false;
    let engine = Arc::new(Engine::new(
        &config,
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedSurface::new()),
        Arc::new(FakeClock::new(1_700_000_000_000)),
        Arc::new(RunLogger::in_memory()),
    ));

    let input = concat!(
        r#"{"id":1,"type":"start","mode":"recording","project_id":1,"target_id":"t"}"#,
        "\n\n",
        "not json\n",
        r#"{"id":"x","type":"getStatus"}"#,
        "\n",
        r#"{"id":3,"type":"warp"}"#,
        "\n",
    );
    let (writer, mut reader) = tokio::io::duplex(64 * 1024);
    serve(engine, input.as_bytes(), writer)
        .await
        .expect("serve");

    let mut raw = String::new();
    reader.read_to_string(&mut raw).await.expect("read output");
    let responses: Vec<Value> = raw
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).expect("json line"))
        .filter(|value| value.get("event").is_none())
        .collect();

    assert_eq!(responses.len(), 4, "{raw}");
    assert_eq!(responses[0]["id"], 1);
    assert_eq!(responses[0]["success"], true);
    assert_eq!(responses[1]["success"], false);
    assert_eq!(responses[1]["code"], "validation_error");
    assert_eq!(responses[2]["id"], "x");
    assert_eq!(responses[2]["data"]["recording"]["status"], "recording");
    assert_eq!(responses[3]["id"], 3);
    assert_eq!(responses[3]["success"], false);
}
