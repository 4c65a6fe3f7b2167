mod config;
mod core;
mod daemon;
mod db;
mod error;
mod fire_handlers;
mod monitor;
mod reconciler;
mod scheduler;
mod status;
mod telemetry;
mod traits;
mod worker;

#[cfg(test)]
mod testing;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr so one-shot command output stays clean on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::var("INVOCATION_MONITOR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    let args: Vec<String> = std::env::args().collect();
    let command = match args.get(1).map(String::as_str) {
        None => None,
        Some("--version") | Some("-V") => {
            println!("invocation-monitor {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some("--help") | Some("-h") => {
            print_help();
            return Ok(());
        }
        Some(_) => Some(crate::core::Command::parse(&args[1..])?),
    };

    let config = config::AppConfig::load_or_default(&config_path)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match command {
        None => runtime.block_on(crate::core::run(config)),
        Some(command) => {
            let output = runtime.block_on(crate::core::execute(&config, command))?;
            if !output.is_empty() {
                println!("{}", output);
            }
            Ok(())
        }
    }
}

fn print_help() {
    println!("invocation-monitor {}", env!("CARGO_PKG_VERSION"));
    println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
    println!("Usage: invocation-monitor [COMMAND]\n");
    println!("Without a command the monitor runs as a daemon.\n");
    println!("Commands:");
    println!("  report <invocation> <status>              Append a status event");
    println!("  schedule <task> <invocation> <delay-secs> Schedule a watchdog task");
    println!("  unschedule <task> <invocation>            Cancel a watchdog task");
    println!("  status <invocation>                       Print the effective status");
    println!("  tasks                                     List live watchdog tasks");
    println!("  consolidate                               Run one consolidation cycle");
    println!("  reconcile                                 Run one reconciliation cycle");
    println!("\nStatuses: SCHEDULED, IN_PROGRESS, SUCCESSFUL, FAILED, CANCELLED");
    println!("\nConfig is read from ./config.toml or $INVOCATION_MONITOR_CONFIG.");
    println!("\nOptions:");
    println!("  -h, --help       Print help");
    println!("  -V, --version    Print version");
}
