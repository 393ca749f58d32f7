//! Process environment probes.

use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;

/// Optional gate file: `Config` blocks until this path exists.
pub fn wait_file() -> Option<PathBuf> {
    std::env::var_os("COG_WAIT_FILE").map(PathBuf::from)
}

/// Log level passed down to workers. `trace` is downgraded to `debug`; the
/// trace firehose is for the supervisor only.
pub fn worker_log_level() -> String {
    let level = std::env::var("COG_LOG_LEVEL")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase();
    if level == "trace" {
        "debug".to_string()
    } else {
        level
    }
}

/// Optional POST target for one-shot runner boot metrics.
pub fn metrics_endpoint() -> Option<String> {
    std::env::var("COG_METRICS_ENDPOINT")
        .ok()
        .filter(|s| !s.is_empty())
}

pub fn running_in_container() -> bool {
    std::env::var_os("KUBERNETES_SERVICE_HOST").is_some() || Path::new("/.dockerenv").exists()
}

/// setUID isolation requires both a container environment and root.
pub fn isolation_enabled() -> bool {
    running_in_container() && nix::unistd::geteuid().is_root()
}

/// Install a tracing subscriber for embedding processes.
///
/// `RUST_LOG` wins when set; otherwise the level comes from `COG_LOG_LEVEL`.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("COG_LOG_LEVEL").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("coglet_manager={level}"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
