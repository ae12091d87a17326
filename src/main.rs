use anyhow::Result;
use brainsurgeon::cli::{self, get_flag, get_list_flag};
use brainsurgeon::restore::{self, RestoreOutcome};
use brainsurgeon::service::Engine;
use brainsurgeon::{doctor, pass, paths};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h")
        || args.first().map(|s| s.as_str()) == Some("help")
    {
        cli::print_help();
        return Ok(());
    }

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("brainsurgeon {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    match args.first().map(|s| s.as_str()) {
        None => run_engine().await,
        Some("extract") => run_extract(&args[1..]).await,
        Some("restore") => run_restore(&args[1..]).await,
        Some("retention") => run_retention().await,
        Some("sessions") => run_sessions(&args[1..]),
        Some("config") => run_config(),
        Some("doctor") => {
            doctor::run();
            Ok(())
        }
        Some(other) => {
            eprintln!("brainsurgeon: unknown command '{other}'\n");
            eprintln!("Run 'brainsurgeon help' for usage.");
            std::process::exit(1);
        }
    }
}

async fn run_engine() -> Result<()> {
    if std::env::var("PORT").is_ok() {
        eprintln!("[brainsurgeon] PORT is set — the HTTP surface lives outside this engine");
    }
    let engine = Arc::new(Engine::new()?);
    Engine::wire(&engine);
    Engine::run(&engine).await?;
    Ok(())
}

async fn run_extract(args: &[String]) -> Result<()> {
    let engine = Arc::new(Engine::new()?);
    let agent = get_flag(args, "--agent");
    let session = get_flag(args, "--session");

    let config = engine.config_snapshot();
    let report = pass::run_extract_pass(
        &engine.sessions,
        &engine.payloads,
        &config,
        agent.as_deref(),
        session.as_deref(),
        engine.readonly(),
    )
    .await?;

    println!(
        "scanned {} session(s), extracted {} entrie(s), {} byte(s)",
        report.sessions_scanned, report.entries_extracted, report.bytes_extracted
    );
    let mut reasons: Vec<(&String, &usize)> = report.skipped.iter().collect();
    reasons.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    for (reason, count) in reasons {
        println!("  skipped {count}: {reason}");
    }
    if report.session_errors > 0 {
        println!("  {} session(s) failed or were busy", report.session_errors);
    }
    Ok(())
}

async fn run_restore(args: &[String]) -> Result<()> {
    let (Some(agent), Some(session), Some(entry)) = (
        get_flag(args, "--agent"),
        get_flag(args, "--session"),
        get_flag(args, "--entry"),
    ) else {
        eprintln!("brainsurgeon: restore requires --agent, --session and --entry");
        std::process::exit(1);
    };
    let keys = get_list_flag(args, "--keys");

    let engine = Arc::new(Engine::new()?);
    let outcome = restore::restore(
        &engine.sessions,
        &engine.payloads,
        &agent,
        &session,
        &entry,
        keys.as_deref(),
    )
    .await?;

    match outcome {
        RestoreOutcome::Restored {
            keys_restored,
            total_size,
            ..
        } => {
            println!(
                "restored {} key(s) ({total_size} bytes): {}",
                keys_restored.len(),
                keys_restored.join(", ")
            );
            if let Some(tool_call_id) = get_flag(args, "--redact") {
                let redacted =
                    restore::redact_restore_call(&engine.sessions, &agent, &session, &tool_call_id)
                        .await?;
                if redacted {
                    println!("redacted tool call {tool_call_id}");
                } else {
                    println!("tool call {tool_call_id} not found or not a restore_remote call");
                }
            }
        }
        RestoreOutcome::PreviouslyRestored {
            previous_restored_at,
        } => {
            println!("already restored at {previous_restored_at}");
            println!("tip: set _extractable: false on the entry to keep it inline long-term");
        }
        other => {
            eprintln!("restore failed: {}", other.error_code().unwrap_or("unknown"));
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn run_retention() -> Result<()> {
    let engine = Arc::new(Engine::new()?);
    let config = engine.config_snapshot();
    let report = pass::run_retention_pass(&engine.payloads, &config.retention, engine.readonly())?;
    println!(
        "deleted {} payload(s), reclaimed {} byte(s)",
        report.files_deleted, report.bytes_reclaimed
    );
    Ok(())
}

fn run_sessions(args: &[String]) -> Result<()> {
    let engine = Engine::new()?;
    let agent = get_flag(args, "--agent");
    let summaries = engine.sessions.list(agent.as_deref())?;
    if summaries.is_empty() {
        println!("no sessions found under {}", paths::agents_dir().display());
        return Ok(());
    }
    for s in summaries {
        let modified = chrono::DateTime::from_timestamp_millis(s.modified_ms)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let label = s.label.unwrap_or_default();
        println!(
            "{:<12} {:<40} {:>9}  {}  {}",
            s.agent,
            s.session,
            format!("{}B", s.size_bytes),
            modified,
            label
        );
    }
    Ok(())
}

fn run_config() -> Result<()> {
    let engine = Engine::new()?;
    let config = engine.config_snapshot();
    println!("# {}", paths::config_path().display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
