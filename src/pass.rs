use crate::config::Config;
use crate::errors::{EngineError, Result};
use crate::payloads::PayloadStore;
use crate::sessions::SessionStore;
use crate::transform;
use crate::trigger;
use std::collections::HashMap;

/// Aggregate result of one extract pass.
#[derive(Debug, Default)]
pub struct ExtractReport {
    pub sessions_scanned: usize,
    pub entries_extracted: usize,
    pub bytes_extracted: u64,
    /// skip_reason → count, across all scanned entries.
    pub skipped: HashMap<String, usize>,
    pub session_errors: usize,
}

#[derive(Debug, Default)]
pub struct RetentionReport {
    pub files_deleted: usize,
    pub bytes_reclaimed: u64,
    pub errors: usize,
}

/// Run the extract pass over every matching session. Each session is
/// read-modified-written under its own lock; a failing session (including
/// one whose lock is busy) is logged and skipped, never fatal.
pub async fn run_extract_pass(
    sessions: &SessionStore,
    payloads: &PayloadStore,
    config: &Config,
    agent: Option<&str>,
    session: Option<&str>,
    readonly: bool,
) -> Result<ExtractReport> {
    let mut report = ExtractReport::default();

    let summaries = sessions.list(agent)?;
    for summary in summaries {
        if let Some(wanted) = session {
            if summary.session != wanted {
                continue;
            }
        }
        report.sessions_scanned += 1;

        let result = extract_one_session(
            sessions,
            payloads,
            config,
            &summary.agent,
            &summary.session,
            readonly,
            &mut report,
        )
        .await;

        match result {
            Ok(()) => {}
            Err(EngineError::LockUnavailable(path)) => {
                eprintln!(
                    "[brainsurgeon] extract: {} busy, skipping this pass",
                    path.display()
                );
                report.session_errors += 1;
            }
            Err(e) => {
                eprintln!(
                    "[brainsurgeon] extract: session {}/{} failed: {e}",
                    summary.agent, summary.session
                );
                report.session_errors += 1;
            }
        }
    }

    Ok(report)
}

async fn extract_one_session(
    sessions: &SessionStore,
    payloads: &PayloadStore,
    config: &Config,
    agent: &str,
    session: &str,
    readonly: bool,
    report: &mut ExtractReport,
) -> Result<()> {
    let mut extracted = 0usize;
    let mut bytes = 0u64;
    let mut skipped: Vec<String> = Vec::new();

    sessions
        .update(agent, session, |entries| {
            let len = entries.len();
            let mut changed = false;

            for i in 0..len {
                let position_from_end = len - 1 - i;
                let decision = trigger::decide(&entries[i], position_from_end, config);

                if !decision.should_extract {
                    if let Some(reason) = decision.skip_reason {
                        skipped.push(reason);
                    }
                    continue;
                }

                let trigger_type = decision
                    .trigger_type
                    .as_deref()
                    .unwrap_or("assistant");
                let keep_chars = decision
                    .matched_rule
                    .and_then(|idx| config.trigger_rules.get(idx))
                    .and_then(|rule| rule.keep_chars)
                    .unwrap_or(0);

                let result = transform::extract_entry(&entries[i], trigger_type, keep_chars);
                if !result.success {
                    let id = entries[i].id().unwrap_or("unknown");
                    eprintln!(
                        "[brainsurgeon] extract: encoding failed for entry {id} in {agent}/{session}"
                    );
                    skipped.push("extraction_failed".to_string());
                    continue;
                }
                if result.extracted_keys.is_empty() {
                    skipped.push("no_candidate_keys".to_string());
                    continue;
                }

                if readonly {
                    extracted += 1;
                    bytes += result.extracted_size;
                    continue;
                }

                // Payload hits disk before the placeholder does, so a
                // placeholder never exists without its payload file.
                let entry_id = entries[i].id().unwrap_or("unknown").to_string();
                match payloads.store(agent, session, &entry_id, &result.extracted_data) {
                    Ok(_) => {
                        entries[i] = result.modified_entry;
                        extracted += 1;
                        bytes += result.extracted_size;
                        changed = true;
                    }
                    Err(e) => {
                        eprintln!(
                            "[brainsurgeon] extract: payload write failed for {entry_id}: {e}"
                        );
                        skipped.push("payload_write_failed".to_string());
                    }
                }
            }

            changed && !readonly
        })
        .await?;

    report.entries_extracted += extracted;
    report.bytes_extracted += bytes;
    for reason in skipped {
        *report.skipped.entry(reason).or_insert(0) += 1;
    }
    Ok(())
}

/// Delete payload files older than the configured retention window.
pub fn run_retention_pass(
    payloads: &PayloadStore,
    retention: &str,
    readonly: bool,
) -> Result<RetentionReport> {
    let max_age_ms = crate::config::parse_duration_ms(retention)?;
    let mut report = RetentionReport::default();

    for expired in payloads.find_expired(max_age_ms)? {
        if readonly {
            report.files_deleted += 1;
            report.bytes_reclaimed += expired.size_bytes;
            continue;
        }
        match payloads.delete(&expired.agent, &expired.session, &expired.entry) {
            Ok(true) => {
                report.files_deleted += 1;
                report.bytes_reclaimed += expired.size_bytes;
            }
            Ok(false) => {}
            Err(e) => {
                eprintln!(
                    "[brainsurgeon] retention: failed to delete {}: {e}",
                    expired.path.display()
                );
                report.errors += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TriggerRule;
    use crate::lock::Locks;
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

    fn thinking_entries(n: usize) -> Vec<Value> {
        (1..=n)
            .map(|i| {
                json!({
                    "__id": format!("e{i}"),
                    "customType": "thinking",
                    "thinking": "a".repeat(600),
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn basic_extract_respects_keep_recent() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, payloads) = stores(dir.path());
        seed(dir.path(), "main", "s1", &thinking_entries(5));

        let report = run_extract_pass(&sessions, &payloads, &thinking_config(), None, None, false)
            .await
            .unwrap();
        assert_eq!(report.sessions_scanned, 1);
        assert_eq!(report.entries_extracted, 2);

        let entries = sessions.load("main", "s1").await.unwrap();
        assert_eq!(entries[0].get("thinking"), Some(&json!("[[extracted-e1]]")));
        assert_eq!(entries[1].get("thinking"), Some(&json!("[[extracted-e2]]")));
        for e in &entries[2..] {
            assert_eq!(e.get("thinking"), Some(&json!("a".repeat(600))));
        }

        for id in ["e1", "e2"] {
            let payload = payloads.read("main", "s1", id).unwrap().unwrap();
            assert_eq!(payload["thinking"], json!("a".repeat(600)));
        }
        assert!(payloads.read("main", "s1", "e3").unwrap().is_none());
    }

    #[tokio::test]
    async fn second_pass_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, payloads) = stores(dir.path());
        seed(dir.path(), "main", "s1", &thinking_entries(5));
        let config = thinking_config();

        run_extract_pass(&sessions, &payloads, &config, None, None, false)
            .await
            .unwrap();
        let path = sessions.session_path("main", "s1");
        let after_first = std::fs::read(&path).unwrap();

        let report = run_extract_pass(&sessions, &payloads, &config, None, None, false)
            .await
            .unwrap();
        assert_eq!(report.entries_extracted, 0);
        assert_eq!(report.skipped.get("already_extracted"), Some(&2));
        assert_eq!(std::fs::read(&path).unwrap(), after_first);
    }

    #[tokio::test]
    async fn disabled_config_scans_but_never_extracts() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, payloads) = stores(dir.path());
        seed(dir.path(), "main", "s1", &thinking_entries(5));
        let mut config = thinking_config();
        config.enabled = false;

        let report = run_extract_pass(&sessions, &payloads, &config, None, None, false)
            .await
            .unwrap();
        assert_eq!(report.entries_extracted, 0);
        assert_eq!(report.skipped.get("smart_pruning_disabled"), Some(&5));
    }

    #[tokio::test]
    async fn session_filter_limits_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, payloads) = stores(dir.path());
        seed(dir.path(), "main", "s1", &thinking_entries(5));
        seed(dir.path(), "main", "s2", &thinking_entries(5));

        let report = run_extract_pass(
            &sessions,
            &payloads,
            &thinking_config(),
            Some("main"),
            Some("s2"),
            false,
        )
        .await
        .unwrap();
        assert_eq!(report.sessions_scanned, 1);
        assert_eq!(report.entries_extracted, 2);

        // s1 untouched
        let entries = sessions.load("main", "s1").await.unwrap();
        assert!(!entries[0].has_placeholder());
    }

    #[tokio::test]
    async fn readonly_counts_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, payloads) = stores(dir.path());
        seed(dir.path(), "main", "s1", &thinking_entries(5));

        let report = run_extract_pass(&sessions, &payloads, &thinking_config(), None, None, true)
            .await
            .unwrap();
        assert_eq!(report.entries_extracted, 2);

        let entries = sessions.load("main", "s1").await.unwrap();
        assert!(!entries[0].has_placeholder());
        assert!(payloads.list("main", "s1").unwrap().is_empty());
    }

    // paused clock: the 200-attempt backoff elapses virtually
    #[tokio::test(start_paused = true)]
    async fn busy_session_is_a_transient_skip() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, payloads) = stores(dir.path());
        seed(dir.path(), "main", "s1", &thinking_entries(5));

        // someone else holds the lock; give it a live pid so it is not stale
        let lock_path = dir.path().join("main/sessions/s1.jsonl.lock");
        std::fs::write(
            &lock_path,
            format!(
                "{{\n  \"pid\": {},\n  \"createdAt\": \"2099-01-01T00:00:00Z\"\n}}",
                std::process::id()
            ),
        )
        .unwrap();

        // the pass survives, reporting the session as errored
        let report = run_extract_pass(&sessions, &payloads, &thinking_config(), None, None, false)
            .await
            .unwrap();
        assert_eq!(report.session_errors, 1);
        assert_eq!(report.entries_extracted, 0);
        std::fs::remove_file(&lock_path).unwrap();
    }

    #[tokio::test]
    async fn keep_chars_flows_from_matched_rule() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, payloads) = stores(dir.path());
        seed(
            dir.path(),
            "main",
            "s1",
            &[json!({ "__id": "e1", "customType": "thinking", "thinking": "x".repeat(2000) })],
        );

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
        let expected = format!("{}... [[extracted-e1]]", "x".repeat(75));
        assert_eq!(entries[0].get("thinking"), Some(&json!(expected)));
    }

    #[test]
    fn retention_deletes_expired_and_reports_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let payloads = PayloadStore::with_root(dir.path().to_path_buf());
        let (path, bytes) = payloads
            .store("main", "s1", "e1", &json!({ "thinking": "old", "__meta": {} }))
            .unwrap();
        payloads.store("main", "s1", "e2", &json!({})).unwrap();

        let old = filetime::FileTime::from_unix_time(
            chrono::Utc::now().timestamp() - 25 * 3600,
            0,
        );
        filetime::set_file_mtime(&path, old).unwrap();

        let report = run_retention_pass(&payloads, "24h", false).unwrap();
        assert_eq!(report.files_deleted, 1);
        assert_eq!(report.bytes_reclaimed, bytes);
        assert_eq!(payloads.list("main", "s1").unwrap(), vec!["e2"]);
    }

    #[test]
    fn retention_rejects_bad_duration() {
        let dir = tempfile::tempdir().unwrap();
        let payloads = PayloadStore::with_root(dir.path().to_path_buf());
        assert!(matches!(
            run_retention_pass(&payloads, "sometime", false),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn retention_readonly_reports_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let payloads = PayloadStore::with_root(dir.path().to_path_buf());
        let (path, _) = payloads.store("main", "s1", "e1", &json!({})).unwrap();
        let old = filetime::FileTime::from_unix_time(
            chrono::Utc::now().timestamp() - 25 * 3600,
            0,
        );
        filetime::set_file_mtime(&path, old).unwrap();

        let report = run_retention_pass(&payloads, "24h", true).unwrap();
        assert_eq!(report.files_deleted, 1);
        assert!(path.exists());
    }
}
