use brainsurgeon::bus::{Bus, BusMessage};
use brainsurgeon::config::{Config, TriggerRule};
use brainsurgeon::service::Engine;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn thinking_config() -> Config {
    let mut rule = TriggerRule::new("thinking");
    rule.min_length = Some(500);
    rule.keep_recent = Some(3);
    let mut c = Config::default();
    c.enabled = true;
    c.trigger_rules = vec![rule];
    c
}

fn engine(dir: &Path) -> Arc<Engine> {
    let engine = Arc::new(
        Engine::with_parts(
            dir.join("agents"),
            dir.join("data/bus.db"),
            dir.join("config.json"),
            thinking_config(),
            false,
        )
        .unwrap(),
    );
    Engine::wire(&engine);
    engine
}

fn seed(dir: &Path, agent: &str, session: &str, lines: &[Value]) {
    let sessions = dir.join("agents").join(agent).join("sessions");
    std::fs::create_dir_all(&sessions).unwrap();
    let mut content = String::new();
    for line in lines {
        content.push_str(&serde_json::to_string(line).unwrap());
        content.push('\n');
    }
    std::fs::write(sessions.join(format!("{session}.jsonl")), content).unwrap();
}

fn collect_type(engine: &Arc<Engine>, msg_type: &str) -> Arc<Mutex<Vec<BusMessage>>> {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let sink2 = Arc::clone(&sink);
    engine.bus.subscribe(
        msg_type,
        Arc::new(move |message| {
            let sink = Arc::clone(&sink2);
            Box::pin(async move {
                sink.lock().unwrap().push(message);
                Ok(())
            })
        }),
    );
    sink
}

// A message published while the engine was down is delivered after restart.
#[tokio::test]
async fn unprocessed_messages_replay_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    seed(
        dir.path(),
        "main",
        "s1",
        &(1..=5)
            .map(|i| {
                json!({
                    "__id": format!("e{i}"),
                    "customType": "thinking",
                    "thinking": "a".repeat(600),
                })
            })
            .collect::<Vec<_>>(),
    );

    // a peer drops a request into the queue while nothing is listening
    {
        let bus = Bus::open(&dir.path().join("data/bus.db")).unwrap();
        bus.publish(
            "prune.request",
            &json!({ "agentId": "main", "sessionId": "s1" }),
        )
        .unwrap();
    }

    let engine = engine(dir.path());
    let responses = collect_type(&engine, "prune.response");
    Bus::start(&engine.bus);

    // replay happens on the first poll; the response lands on the next one
    tokio::time::sleep(Duration::from_millis(600)).await;
    engine.bus.stop().await;

    let got = responses.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload["success"], true);
    assert_eq!(got[0].payload["externalized"], 2);
}

// FIFO per type: three requests produce three responses in order.
#[tokio::test]
async fn responses_follow_publication_order() {
    let dir = tempfile::tempdir().unwrap();
    for s in ["s1", "s2", "s3"] {
        seed(
            dir.path(),
            "main",
            s,
            &[json!({ "__id": "e1", "customType": "thinking", "thinking": "a".repeat(600) })],
        );
    }
    let engine = engine(dir.path());
    let responses = collect_type(&engine, "prune.response");

    for s in ["s1", "s2", "s3"] {
        engine
            .bus
            .publish("prune.request", &json!({ "agentId": "main", "sessionId": s }))
            .unwrap();
    }
    engine.bus.drain_pending().await.unwrap();
    engine.bus.drain_pending().await.unwrap();

    let got = responses.lock().unwrap();
    let order: Vec<&str> = got
        .iter()
        .map(|m| m.payload["sessionId"].as_str().unwrap())
        .collect();
    assert_eq!(order, vec!["s1", "s2", "s3"]);
}

// A malformed request retries three times, then dead-letters in place.
#[tokio::test]
async fn malformed_request_dead_letters() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());

    let id = engine
        .bus
        .publish("restore.request", &json!({ "agentId": "main" }))
        .unwrap();

    for _ in 0..4 {
        engine.bus.drain_pending().await.unwrap();
    }

    let status = engine.bus.status(&id).unwrap().unwrap();
    assert!(!status.processed);
    assert_eq!(status.retry_count, 3);
    assert!(status.error.unwrap().contains("sessionId"));
    assert_eq!(engine.bus.dead_letter_count().unwrap(), 1);
}

// Advisory traffic never piles up as pending.
#[tokio::test]
async fn advisory_types_drain_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());

    for msg_type in ["session.created", "session.updated", "message_written"] {
        engine
            .bus
            .publish(msg_type, &json!({ "sessionId": "s1" }))
            .unwrap();
    }
    engine.bus.drain_pending().await.unwrap();
    assert_eq!(engine.bus.pending_count().unwrap(), 0);
    assert_eq!(engine.bus.dead_letter_count().unwrap(), 0);
}

// Restore over the bus: request → restored transcript → response with keys.
#[tokio::test]
async fn bus_driven_restore_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    seed(
        dir.path(),
        "main",
        "s1",
        &[json!({ "__id": "e1", "thinking": "[[extracted-e1]]" })],
    );
    engine
        .payloads
        .store(
            "main",
            "s1",
            "e1",
            &json!({ "thinking": "the long lost reasoning", "__meta": {} }),
        )
        .unwrap();
    let responses = collect_type(&engine, "restore.response");

    engine
        .bus
        .publish(
            "restore.request",
            &json!({ "agentId": "main", "sessionId": "s1", "entryId": "e1" }),
        )
        .unwrap();
    engine.bus.drain_pending().await.unwrap();
    engine.bus.drain_pending().await.unwrap();

    let got = responses.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload["success"], true);
    assert_eq!(got[0].payload["restoredKeys"], json!(["thinking"]));
    drop(got);

    let entries = engine.sessions.load("main", "s1").await.unwrap();
    assert_eq!(
        entries[0].get("thinking"),
        Some(&json!("the long lost reasoning"))
    );
}
