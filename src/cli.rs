pub fn print_help() {
    println!("brainsurgeon {}", env!("CARGO_PKG_VERSION"));
    println!("Keep agent transcripts lean — oversized content moves to side files, restorable on demand.\n");
    print_usage();
    print_options();
}

fn print_usage() {
    println!("USAGE:");
    println!("  brainsurgeon                     Run the engine (scheduled passes + message bus)");
    println!("  brainsurgeon extract  [OPTIONS]  Run the extract pass once, now");
    println!("  brainsurgeon restore  [OPTIONS]  Restore one entry's extracted content");
    println!("  brainsurgeon retention           Run the retention pass once, now");
    println!("  brainsurgeon sessions [OPTIONS]  List known sessions");
    println!("  brainsurgeon config              Print the effective configuration");
    println!("  brainsurgeon doctor              Check directories, config, bus, and locks");
    println!("  brainsurgeon help | --help | -h  Show this message");
    println!("  brainsurgeon --version | -V      Show version\n");
}

fn print_options() {
    println!("EXTRACT / SESSIONS OPTIONS:");
    println!("  --agent <id>      Limit to one agent");
    println!("  --session <id>    Limit to one session (extract only)\n");
    println!("RESTORE OPTIONS:");
    println!("  --agent <id>      Agent owning the session (required)");
    println!("  --session <id>    Session containing the entry (required)");
    println!("  --entry <id>      Entry to restore (required)");
    println!("  --keys <k1,k2>    Restore only these payload keys");
    println!("  --redact <id>     Also redact this restore_remote tool-call entry\n");
    println!("ENVIRONMENT:");
    println!("  AGENTS_DIR              Agents root (default: ~/agents)");
    println!("  DATA_DIR                Engine data dir, bus database (default: ~/.brainsurgeon)");
    println!("  BRAINSURGEON_READONLY   Compute and report passes without writing");
    println!("  PORT                    Accepted for the HTTP layer; unused by the engine");
}

pub fn get_flag(args: &[String], flag: &str) -> Option<String> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone())
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Comma-separated list flag, e.g. `--keys thinking,data.result`.
pub fn get_list_flag(args: &[String], flag: &str) -> Option<Vec<String>> {
    get_flag(args, flag).map(|value| {
        value
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
