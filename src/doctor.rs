use crate::config::Config;
use crate::paths;
use std::path::Path;

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const CYAN: &str = "\x1b[36m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";

pub fn run() {
    println!();
    println!("{DIM}── brainsurgeon doctor ─────────────────────────{RESET}");
    println!();

    let mut pass = 0;
    let mut fail = 0;

    check_agents_dir(&mut pass, &mut fail);
    check_disk_space();
    check_config(&mut pass, &mut fail);
    check_bus_db(&mut pass, &mut fail);
    check_stale_locks(&mut pass);
    check_payload_tree();

    println!();
    println!(
        "  {BOLD}{pass}{RESET} passed  {}{fail}{} failed",
        if fail > 0 { RED } else { DIM },
        RESET
    );
    println!();
}

fn check_agents_dir(pass: &mut u32, fail: &mut u32) {
    let dir = paths::agents_dir();
    if !dir.exists() {
        err(&format!("agents dir missing: {}", short_path(&dir)), fail);
        return;
    }

    let mut agents = 0usize;
    let mut sessions = 0usize;
    if let Ok(read) = std::fs::read_dir(&dir) {
        for dent in read.filter_map(|e| e.ok()) {
            if !dent.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            agents += 1;
            if let Ok(inner) = std::fs::read_dir(dent.path().join("sessions")) {
                sessions += inner
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_string_lossy().ends_with(".jsonl"))
                    .count();
            }
        }
    }
    ok(
        &format!(
            "agents dir {} ({agents} agent(s), {sessions} session(s))",
            short_path(&dir)
        ),
        pass,
    );
}

fn check_disk_space() {
    let dir = paths::agents_dir();
    let dir = if dir.exists() {
        dir
    } else {
        std::path::PathBuf::from(".")
    };

    let dir_cstr = match std::ffi::CString::new(dir.to_string_lossy().as_bytes().to_vec()) {
        Ok(c) => c,
        Err(_) => return,
    };

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(dir_cstr.as_ptr(), &mut stat) };
    if ret == 0 {
        #[allow(clippy::unnecessary_cast)]
        let avail = stat.f_bavail as u64 * stat.f_frsize as u64;
        if avail < 100 * 1024 * 1024 {
            println!(
                "  {RED}!{RESET}  low disk space: {} available on agents filesystem",
                format_size(avail)
            );
        }
    }
}

fn check_config(pass: &mut u32, fail: &mut u32) {
    let path = paths::config_path();
    if !path.exists() {
        println!(
            "  {DIM}-{RESET}  no config file ({}) — defaults apply, extraction disabled",
            short_path(&path)
        );
        return;
    }

    match Config::load() {
        Ok(config) => match config.validate() {
            Ok(()) => {
                ok(
                    &format!(
                        "config valid (extraction {}, {} rule(s), retention {})",
                        if config.enabled { "enabled" } else { "disabled" },
                        config.trigger_rules.len(),
                        config.retention
                    ),
                    pass,
                );
                if let Some(at) = &config.last_run_at {
                    println!("  {CYAN}i{RESET}  last extract run: {at}");
                }
            }
            Err(e) => err(&format!("config invalid: {e}"), fail),
        },
        Err(e) => err(&format!("config unreadable: {e}"), fail),
    }
}

fn check_bus_db(pass: &mut u32, fail: &mut u32) {
    let path = paths::bus_db_path();
    if !path.exists() {
        println!(
            "  {DIM}-{RESET}  no bus database yet ({})",
            short_path(&path)
        );
        return;
    }

    match crate::bus::Bus::open(&path) {
        Ok(bus) => {
            let pending = bus.pending_count().unwrap_or(-1);
            let dead = bus.dead_letter_count().unwrap_or(-1);
            ok(
                &format!("bus database open ({pending} pending, {dead} dead-lettered)"),
                pass,
            );
            if dead > 0 {
                println!("  {RED}!{RESET}  {dead} message(s) exhausted retries");
            }
        }
        Err(e) => err(&format!("bus database unopenable: {e}"), fail),
    }
}

/// Leftover lock files point at crashed holders. A dead pid will be swept
/// by the next acquisition; a live one means work is in flight right now.
fn check_stale_locks(pass: &mut u32) {
    let mut live = 0usize;
    let mut dead = 0usize;

    let Ok(agents) = std::fs::read_dir(paths::agents_dir()) else {
        return;
    };
    for agent in agents.filter_map(|e| e.ok()) {
        let Ok(read) = std::fs::read_dir(agent.path().join("sessions")) else {
            continue;
        };
        for dent in read.filter_map(|e| e.ok()) {
            let name = dent.file_name().to_string_lossy().to_string();
            if !name.ends_with(".lock") {
                continue;
            }
            let holder_alive = std::fs::read_to_string(dent.path())
                .ok()
                .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
                .and_then(|v| v["pid"].as_u64())
                .map(|pid| Path::new(&format!("/proc/{pid}")).exists())
                .unwrap_or(false);
            if holder_alive {
                live += 1;
            } else {
                dead += 1;
            }
        }
    }

    if live == 0 && dead == 0 {
        ok("no leftover session locks", pass);
    } else {
        if live > 0 {
            println!("  {CYAN}i{RESET}  {live} session lock(s) held by live processes");
        }
        if dead > 0 {
            println!("  {RED}!{RESET}  {dead} stale session lock(s) from dead holders");
        }
    }
}

fn check_payload_tree() {
    let mut files = 0usize;
    let mut bytes = 0u64;

    let Ok(agents) = std::fs::read_dir(paths::agents_dir()) else {
        return;
    };
    for agent in agents.filter_map(|e| e.ok()) {
        let extracted = agent.path().join("sessions").join("extracted");
        let Ok(read) = std::fs::read_dir(&extracted) else {
            continue;
        };
        for session in read.filter_map(|e| e.ok()) {
            let Ok(inner) = std::fs::read_dir(session.path()) else {
                continue;
            };
            for dent in inner.filter_map(|e| e.ok()) {
                let name = dent.file_name().to_string_lossy().to_string();
                if name.starts_with('.') || !name.ends_with(".json") {
                    continue;
                }
                files += 1;
                bytes += dent.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
    }

    if files > 0 {
        println!(
            "  {CYAN}i{RESET}  {files} extraction payload(s), {} total",
            format_size(bytes)
        );
    }
}

fn format_size(size: u64) -> String {
    if size >= 1_048_576 {
        format!("{:.1}MB", size as f64 / 1_048_576.0)
    } else if size >= 1024 {
        format!("{}KB", size / 1024)
    } else {
        format!("{size}B")
    }
}

fn short_path(path: &Path) -> String {
    paths::shorten_home(&path.to_string_lossy())
}

fn ok(msg: &str, pass: &mut u32) {
    println!("  {GREEN}✓{RESET}  {msg}");
    *pass += 1;
}

fn err(msg: &str, fail: &mut u32) {
    println!("  {RED}✗{RESET}  {msg}");
    *fail += 1;
}
