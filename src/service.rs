use crate::bus::{Bus, BusMessage};
use crate::config::Config;
use crate::errors::Result;
use crate::lock::Locks;
use crate::pass;
use crate::payloads::PayloadStore;
use crate::paths;
use crate::restore::{self, RestoreOutcome};
use crate::scheduler::{Scheduler, AUTO_TRIGGER, RETENTION_CLEANUP};
use crate::sessions::SessionStore;
use chrono::Utc;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// The long-lived engine: stores, bus, scheduler, and the wiring between
/// them. Construct once, wrap in an `Arc`, call `wire` then `run`.
pub struct Engine {
    pub sessions: Arc<SessionStore>,
    pub payloads: Arc<PayloadStore>,
    pub bus: Arc<Bus>,
    pub scheduler: Scheduler,
    config: Mutex<Config>,
    config_path: PathBuf,
    readonly: bool,
}

impl Engine {
    pub fn new() -> Result<Engine> {
        let config = Config::load()?;
        config.validate()?;
        Engine::with_parts(
            paths::agents_dir(),
            paths::bus_db_path(),
            paths::config_path(),
            config,
            paths::env_truthy("BRAINSURGEON_READONLY"),
        )
    }

    pub fn with_parts(
        root: PathBuf,
        bus_db: PathBuf,
        config_path: PathBuf,
        config: Config,
        readonly: bool,
    ) -> Result<Engine> {
        let locks = Locks::new();
        Ok(Engine {
            sessions: Arc::new(SessionStore::with_root(root.clone(), locks)),
            payloads: Arc::new(PayloadStore::with_root(root)),
            bus: Arc::new(Bus::open(&bus_db)?),
            scheduler: Scheduler::new(),
            config: Mutex::new(config),
            config_path,
            readonly,
        })
    }

    pub fn config_snapshot(&self) -> Config {
        self.config
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// Validate, persist, and reschedule from a new configuration.
    pub fn reload_config(&self, new: Config) -> Result<()> {
        new.validate()?;
        new.save_to(&self.config_path)?;
        self.scheduler.reload(&new)?;
        if let Ok(mut config) = self.config.lock() {
            *config = new;
        }
        Ok(())
    }

    /// Register scheduler tasks and bus subscriptions. Separate from
    /// construction because the closures need the `Arc`.
    pub fn wire(this: &Arc<Engine>) {
        let engine = Arc::clone(this);
        this.scheduler.register(
            AUTO_TRIGGER,
            Arc::new(move || {
                let engine = Arc::clone(&engine);
                Box::pin(async move { engine.auto_trigger_run().await })
            }),
        );

        let engine = Arc::clone(this);
        this.scheduler.register(
            RETENTION_CLEANUP,
            Arc::new(move || {
                let engine = Arc::clone(&engine);
                Box::pin(async move { engine.retention_run().await })
            }),
        );

        let engine = Arc::clone(this);
        this.bus.subscribe(
            "prune.request",
            Arc::new(move |message| {
                let engine = Arc::clone(&engine);
                Box::pin(async move { engine.on_prune_request(message).await })
            }),
        );

        let engine = Arc::clone(this);
        this.bus.subscribe(
            "restore.request",
            Arc::new(move |message| {
                let engine = Arc::clone(&engine);
                Box::pin(async move { engine.on_restore_request(message).await })
            }),
        );

        for advisory in ["session.updated", "session.created", "message_written"] {
            this.bus.subscribe(
                advisory,
                Arc::new(|message: BusMessage| {
                    Box::pin(async move {
                        eprintln!(
                            "[brainsurgeon bus] {} from {} acknowledged",
                            message.msg_type, message.source
                        );
                        Ok(())
                    })
                }),
            );
        }
    }

    /// Run until interrupted: bus polling plus scheduled jobs, then a
    /// cooperative shutdown.
    pub async fn run(this: &Arc<Engine>) -> Result<()> {
        let config = this.config_snapshot();
        this.scheduler.start(&config)?;
        Bus::start(&this.bus);
        eprintln!(
            "[brainsurgeon] engine up — extraction {}, jobs: {:?}",
            if config.enabled { "enabled" } else { "disabled" },
            this.scheduler.scheduled_jobs()
        );
        if this.readonly {
            eprintln!("[brainsurgeon] BRAINSURGEON_READONLY set — passes will not write");
        }

        wait_for_shutdown().await;

        eprintln!("[brainsurgeon] shutting down");
        this.scheduler.stop();
        this.bus.stop().await;
        Ok(())
    }

    pub async fn auto_trigger_run(&self) {
        let config = self.config_snapshot();
        let report = match pass::run_extract_pass(
            &self.sessions,
            &self.payloads,
            &config,
            None,
            None,
            self.readonly,
        )
        .await
        {
            Ok(report) => report,
            Err(e) => {
                eprintln!("[brainsurgeon sched] extract pass failed: {e}");
                return;
            }
        };

        if report.entries_extracted > 0 || report.session_errors > 0 {
            eprintln!(
                "[brainsurgeon sched] extract: {} sessions, {} entries, {} bytes, {} errors",
                report.sessions_scanned,
                report.entries_extracted,
                report.bytes_extracted,
                report.session_errors
            );
        }
        self.stamp(|config| config.last_run_at = Some(Utc::now().to_rfc3339()));
    }

    pub async fn retention_run(&self) {
        let config = self.config_snapshot();
        match pass::run_retention_pass(&self.payloads, &config.retention, self.readonly) {
            Ok(report) => {
                if report.files_deleted > 0 {
                    eprintln!(
                        "[brainsurgeon sched] retention: {} payloads deleted, {} bytes reclaimed",
                        report.files_deleted, report.bytes_reclaimed
                    );
                }
            }
            Err(e) => {
                eprintln!("[brainsurgeon sched] retention pass failed: {e}");
                return;
            }
        }
        self.stamp(|config| config.last_retention_run_at = Some(Utc::now().to_rfc3339()));
    }

    fn stamp<F: FnOnce(&mut Config)>(&self, f: F) {
        if self.readonly {
            return;
        }
        let Ok(mut config) = self.config.lock() else {
            return;
        };
        f(&mut config);
        if let Err(e) = config.save_to(&self.config_path) {
            eprintln!("[brainsurgeon] config save failed: {e}");
        }
    }

    async fn on_prune_request(&self, message: BusMessage) -> anyhow::Result<()> {
        let agent = str_field(&message.payload, "agentId")?;
        let session = str_field(&message.payload, "sessionId")?;

        let mut config = self.config_snapshot();
        if let Some(threshold) = message.payload.get("threshold").and_then(|v| v.as_u64()) {
            config.min_value_length = threshold as usize;
        }

        let result = pass::run_extract_pass(
            &self.sessions,
            &self.payloads,
            &config,
            Some(&agent),
            Some(&session),
            self.readonly,
        )
        .await;

        let response = match &result {
            Ok(report) => json!({
                "agentId": agent,
                "sessionId": session,
                "externalized": report.entries_extracted,
                "success": true,
            }),
            Err(e) => json!({
                "agentId": agent,
                "sessionId": session,
                "externalized": 0,
                "success": false,
                "error": e.to_string(),
            }),
        };
        self.bus.publish("prune.response", &response)?;
        Ok(())
    }

    async fn on_restore_request(&self, message: BusMessage) -> anyhow::Result<()> {
        let agent = str_field(&message.payload, "agentId")?;
        let session = str_field(&message.payload, "sessionId")?;
        let entry_id = str_field(&message.payload, "entryId")?;
        let tool_call_id = message
            .payload
            .get("toolCallId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let keys: Option<Vec<String>> = message.payload.get("keys").and_then(|v| {
            v.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(|k| k.as_str().map(|s| s.to_string()))
                    .collect()
            })
        });

        let outcome = restore::restore(
            &self.sessions,
            &self.payloads,
            &agent,
            &session,
            &entry_id,
            keys.as_deref(),
        )
        .await;

        let response = match &outcome {
            Ok(RestoreOutcome::Restored { keys_restored, .. }) => json!({
                "agentId": agent,
                "sessionId": session,
                "toolCallId": tool_call_id,
                "success": true,
                "restoredKeys": keys_restored,
            }),
            Ok(other) => json!({
                "agentId": agent,
                "sessionId": session,
                "toolCallId": tool_call_id,
                "success": false,
                "error": other.error_code(),
            }),
            Err(e) => json!({
                "agentId": agent,
                "sessionId": session,
                "toolCallId": tool_call_id,
                "success": false,
                "error": e.to_string(),
            }),
        };

        // rewrite the originating tool call so the transcript won't replay it
        if matches!(outcome, Ok(RestoreOutcome::Restored { .. })) {
            if let Some(tool_call_id) = &tool_call_id {
                if !self.config_snapshot().keep_restore_remote_calls {
                    if let Err(e) = restore::redact_restore_call(
                        &self.sessions,
                        &agent,
                        &session,
                        tool_call_id,
                    )
                    .await
                    {
                        eprintln!("[brainsurgeon bus] redact failed for {tool_call_id}: {e}");
                    }
                }
            }
        }

        self.bus.publish("restore.response", &response)?;
        Ok(())
    }
}

fn str_field(payload: &Value, key: &str) -> anyhow::Result<String> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("missing field '{key}'"))
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
