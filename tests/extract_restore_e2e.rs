use brainsurgeon::config::{Config, TriggerRule};
use brainsurgeon::lock::Locks;
use brainsurgeon::pass::{run_extract_pass, run_retention_pass};
use brainsurgeon::payloads::PayloadStore;
use brainsurgeon::restore::{restore, RestoreOutcome};
use brainsurgeon::sessions::SessionStore;
use serde_json::{json, Value};
use std::path::Path;

fn stores(dir: &Path) -> (SessionStore, PayloadStore) {
    (
        SessionStore::with_root(dir.to_path_buf(), Locks::new()),
        PayloadStore::with_root(dir.to_path_buf()),
    )
}

fn thinking_config() -> Config {
    let mut rule = TriggerRule::new("thinking");
    rule.min_length = Some(500);
    rule.keep_recent = Some(3);
    let mut c = Config::default();
    c.enabled = true;
    c.trigger_rules = vec![rule];
    c.keep_recent = 3;
    c.min_value_length = 500;
    c.keep_after_restore_seconds = 600;
    c
}

fn seed(dir: &Path, agent: &str, session: &str, lines: &[Value]) {
    let sessions = dir.join(agent).join("sessions");
    std::fs::create_dir_all(&sessions).unwrap();
    let mut content = String::new();
    for line in lines {
        content.push_str(&serde_json::to_string(line).unwrap());
        content.push('\n');
    }
    std::fs::write(sessions.join(format!("{session}.jsonl")), content).unwrap();
}

fn thinking_entry(id: &str, len: usize) -> Value {
    json!({
        "__id": id,
        "customType": "thinking",
        "thinking": "a".repeat(len),
    })
}

fn five_thinking_entries() -> Vec<Value> {
    (1..=5).map(|i| thinking_entry(&format!("e{i}"), 600)).collect()
}

// S1: two oldest of five entries move to payload files, the rest stay put.
#[tokio::test]
async fn basic_extract_pass() {
    let dir = tempfile::tempdir().unwrap();
    let (sessions, payloads) = stores(dir.path());
    seed(dir.path(), "main", "s1", &five_thinking_entries());

    let report = run_extract_pass(&sessions, &payloads, &thinking_config(), None, None, false)
        .await
        .unwrap();
    assert_eq!(report.sessions_scanned, 1);
    assert_eq!(report.entries_extracted, 2);

    let entries = sessions.load("main", "s1").await.unwrap();
    assert_eq!(entries.len(), 5);
    assert_eq!(entries[0].get("thinking"), Some(&json!("[[extracted-e1]]")));
    assert_eq!(entries[1].get("thinking"), Some(&json!("[[extracted-e2]]")));
    for e in &entries[2..] {
        assert_eq!(e.get("thinking"), Some(&json!("a".repeat(600))));
    }

    for id in ["e1", "e2"] {
        let payload = payloads.read("main", "s1", id).unwrap().unwrap();
        assert_eq!(payload["thinking"], json!("a".repeat(600)));
        assert_eq!(payload["__meta"]["trigger_type"], "thinking");
    }
}

// S2: keep_recent 0 lets even the single newest entry go.
#[tokio::test]
async fn keep_recent_zero_extracts_lone_entry() {
    let dir = tempfile::tempdir().unwrap();
    let (sessions, payloads) = stores(dir.path());
    seed(dir.path(), "main", "s1", &[thinking_entry("only", 800)]);

    let mut config = thinking_config();
    config.trigger_rules[0].keep_recent = Some(0);

    let report = run_extract_pass(&sessions, &payloads, &config, None, None, false)
        .await
        .unwrap();
    assert_eq!(report.entries_extracted, 1);

    let entries = sessions.load("main", "s1").await.unwrap();
    assert!(entries[0].has_placeholder());
}

// S3: an explicit opt-out always wins.
#[tokio::test]
async fn extractable_false_is_never_extracted() {
    let dir = tempfile::tempdir().unwrap();
    let (sessions, payloads) = stores(dir.path());
    let mut entry = thinking_entry("pinned", 800);
    entry["_extractable"] = json!(false);
    let mut lines = vec![entry];
    lines.extend(five_thinking_entries());
    seed(dir.path(), "main", "s1", &lines);

    let report = run_extract_pass(&sessions, &payloads, &thinking_config(), None, None, false)
        .await
        .unwrap();
    assert!(report.skipped.get("_extractable_false").copied().unwrap_or(0) >= 1);

    let entries = sessions.load("main", "s1").await.unwrap();
    assert_eq!(entries[0].get("thinking"), Some(&json!("a".repeat(800))));
}

// S4: an integer _extractable defers extraction until the entry is deep enough.
#[tokio::test]
async fn extractable_integer_waits_for_depth() {
    let dir = tempfile::tempdir().unwrap();
    let (sessions, payloads) = stores(dir.path());

    let mut gated = thinking_entry("gated", 800);
    gated["_extractable"] = json!(10);
    let mut lines = vec![gated];
    lines.extend((1..=5).map(|i| thinking_entry(&format!("f{i}"), 10)));
    seed(dir.path(), "main", "s1", &lines); // "gated" sits at position 5

    let config = thinking_config();
    let report = run_extract_pass(&sessions, &payloads, &config, None, None, false)
        .await
        .unwrap();
    assert_eq!(report.entries_extracted, 0);
    assert!(report.skipped.get("_extractable_false").copied().unwrap_or(0) >= 1);

    // the conversation grows; "gated" drops to position 12
    sessions
        .update("main", "s1", |entries| {
            for i in 6..=12 {
                entries.push(
                    brainsurgeon::entry::Entry::from_value(thinking_entry(&format!("f{i}"), 10))
                        .unwrap(),
                );
            }
            true
        })
        .await
        .unwrap();

    let report = run_extract_pass(&sessions, &payloads, &config, None, None, false)
        .await
        .unwrap();
    assert_eq!(report.entries_extracted, 1);
    let entries = sessions.load("main", "s1").await.unwrap();
    assert!(entries[0].has_placeholder());
    assert!(payloads.read("main", "s1", "gated").unwrap().is_some());
}

// S5: restore puts the content back and stamps _restored; the payload stays.
#[tokio::test]
async fn restore_round_trip_after_extract() {
    let dir = tempfile::tempdir().unwrap();
    let (sessions, payloads) = stores(dir.path());
    seed(dir.path(), "main", "s1", &five_thinking_entries());

    run_extract_pass(&sessions, &payloads, &thinking_config(), None, None, false)
        .await
        .unwrap();

    let outcome = restore(&sessions, &payloads, "main", "s1", "e1", None)
        .await
        .unwrap();
    let RestoreOutcome::Restored {
        keys_restored,
        total_size,
        ..
    } = outcome
    else {
        panic!("expected Restored");
    };
    assert_eq!(keys_restored, vec!["thinking"]);
    assert!(total_size > 0);

    let entries = sessions.load("main", "s1").await.unwrap();
    assert_eq!(entries[0].get("thinking"), Some(&json!("a".repeat(600))));
    assert!(entries[0].restored_at().is_some());
    assert!(payloads.read("main", "s1", "e1").unwrap().is_some());
}

// S6: a fresh restore is protected from re-extraction; an old one is not.
#[tokio::test]
async fn restore_protection_window() {
    let dir = tempfile::tempdir().unwrap();
    let (sessions, payloads) = stores(dir.path());
    seed(dir.path(), "main", "s1", &five_thinking_entries());
    let config = thinking_config();

    run_extract_pass(&sessions, &payloads, &config, None, None, false)
        .await
        .unwrap();
    restore(&sessions, &payloads, "main", "s1", "e1", None)
        .await
        .unwrap();

    let report = run_extract_pass(&sessions, &payloads, &config, None, None, false)
        .await
        .unwrap();
    assert_eq!(report.entries_extracted, 0);
    let protected = report
        .skipped
        .keys()
        .any(|reason| reason.starts_with("recently_restored"));
    assert!(protected, "skip reasons: {:?}", report.skipped);

    // push _restored back past the 600 s window
    sessions
        .update("main", "s1", |entries| {
            let eleven_min_ago = chrono::Utc::now() - chrono::Duration::minutes(11);
            entries[0]
                .as_map_mut()
                .insert("_restored".into(), json!(eleven_min_ago.to_rfc3339()));
            true
        })
        .await
        .unwrap();

    let report = run_extract_pass(&sessions, &payloads, &config, None, None, false)
        .await
        .unwrap();
    assert_eq!(report.entries_extracted, 1);

    // _restored survives the re-extraction
    let entries = sessions.load("main", "s1").await.unwrap();
    assert!(entries[0].has_placeholder());
    assert!(entries[0].restored_at().is_some());
}

// S7: keep_chars leaves a readable prefix; restore recovers the full text.
#[tokio::test]
async fn keep_chars_truncation_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (sessions, payloads) = stores(dir.path());
    seed(dir.path(), "main", "s1", &[thinking_entry("e7", 2000)]);

    let mut rule = TriggerRule::new("thinking");
    rule.min_length = Some(500);
    rule.keep_recent = Some(0);
    rule.keep_chars = Some(75);
    let mut config = Config::default();
    config.enabled = true;
    config.trigger_rules = vec![rule];

    run_extract_pass(&sessions, &payloads, &config, None, None, false)
        .await
        .unwrap();

    let entries = sessions.load("main", "s1").await.unwrap();
    let expected = format!("{}... [[extracted-e7]]", "a".repeat(75));
    assert_eq!(entries[0].get("thinking"), Some(&json!(expected)));

    let outcome = restore(&sessions, &payloads, "main", "s1", "e7", None)
        .await
        .unwrap();
    assert!(matches!(outcome, RestoreOutcome::Restored { .. }));
    let entries = sessions.load("main", "s1").await.unwrap();
    assert_eq!(entries[0].get("thinking"), Some(&json!("a".repeat(2000))));
}

// S8: a payload past the retention window is found and deleted.
#[tokio::test]
async fn retention_removes_old_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let (_, payloads) = stores(dir.path());
    let (path, bytes) = payloads
        .store("main", "s1", "e1", &json!({ "thinking": "old", "__meta": {} }))
        .unwrap();

    let old = filetime::FileTime::from_unix_time(chrono::Utc::now().timestamp() - 25 * 3600, 0);
    filetime::set_file_mtime(&path, old).unwrap();

    let expired = payloads.find_expired(24 * 3600 * 1000).unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].entry, "e1");

    let report = run_retention_pass(&payloads, "24h", false).unwrap();
    assert_eq!(report.files_deleted, 1);
    assert_eq!(report.bytes_reclaimed, bytes);
    assert!(!path.exists());
}

// Structural fields, entry order, and entry count survive any extract pass.
#[tokio::test]
async fn extraction_preserves_structure() {
    let dir = tempfile::tempdir().unwrap();
    let (sessions, payloads) = stores(dir.path());
    let lines: Vec<Value> = (1..=5)
        .map(|i| {
            json!({
                "__id": format!("e{i}"),
                "customType": "thinking",
                "parentId": format!("p{}", i - 1),
                "timestamp": format!("2026-03-01T00:00:0{i}Z"),
                "thinking": "a".repeat(600),
            })
        })
        .collect();
    seed(dir.path(), "main", "s1", &lines);

    run_extract_pass(&sessions, &payloads, &thinking_config(), None, None, false)
        .await
        .unwrap();

    let entries = sessions.load("main", "s1").await.unwrap();
    assert_eq!(entries.len(), 5);
    for (i, e) in entries.iter().enumerate() {
        assert_eq!(e.id(), Some(format!("e{}", i + 1).as_str()));
        assert_eq!(e.get("parentId"), Some(&json!(format!("p{i}"))));
        assert_eq!(
            e.get("timestamp"),
            Some(&json!(format!("2026-03-01T00:00:0{}Z", i + 1)))
        );
    }
}

// Every placeholder written by a pass has a payload file behind it.
#[tokio::test]
async fn placeholders_always_have_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let (sessions, payloads) = stores(dir.path());
    seed(dir.path(), "main", "s1", &five_thinking_entries());

    run_extract_pass(&sessions, &payloads, &thinking_config(), None, None, false)
        .await
        .unwrap();

    let entries = sessions.load("main", "s1").await.unwrap();
    let stored = payloads.list("main", "s1").unwrap();
    for e in &entries {
        if e.has_placeholder() {
            let id = e.id().unwrap().to_string();
            assert!(stored.contains(&id), "no payload for placeholder {id}");
        }
    }
}
