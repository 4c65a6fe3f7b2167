use assert_cmd::Command;

pub fn invocation_monitor_bin() -> Command {
    #[allow(deprecated)]
    {
        Command::cargo_bin("invocation-monitor")
            .expect("invocation-monitor test binary should build")
    }
}

/// Binary running in `dir`, with no inherited config override.
pub fn invocation_monitor_in(dir: &std::path::Path) -> Command {
    let mut cmd = invocation_monitor_bin();
    cmd.current_dir(dir)
        .env_remove("INVOCATION_MONITOR_CONFIG")
        .env("RUST_LOG", "warn");
    cmd
}
