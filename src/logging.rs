//! One shared `tracing_subscriber` initializer for every binary in this
//! toolkit, so log formatting stays consistent across the monitor,
//! scanner, line-logger and CLI.

pub fn init(program: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_target(false)
        .with_ansi(atty_stderr())
        .try_init();
    tracing::debug!(program, "logging initialized");
}

fn atty_stderr() -> bool {
    nix::unistd::isatty(std::io::stderr()).unwrap_or(false)
}
