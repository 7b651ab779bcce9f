use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "agentchat.logs.jsonl";

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn enabled_from(lookup: impl Fn(&str) -> Option<String>) -> bool {
    ["AGENTCHAT_OBSERVABILITY_ENABLED", "AGENTCHAT_OBSERVABILITY"]
        .into_iter()
        .find_map(|key| lookup(key))
        .map(|value| parse_flag(&value).unwrap_or(true))
        .unwrap_or(true)
}

const DEFAULT_FILTER: &str = "info";

/// First parseable directive of `AGENTCHAT_LOG_LEVEL`, then `RUST_LOG`.
fn filter_directive_from(lookup: impl Fn(&str) -> Option<String>) -> String {
    ["AGENTCHAT_LOG_LEVEL", EnvFilter::DEFAULT_ENV]
        .into_iter()
        .filter_map(|key| lookup(key))
        .find(|value| EnvFilter::try_new(value).is_ok())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

fn resolve_env_filter() -> EnvFilter {
    let directive = filter_directive_from(|key| std::env::var(key).ok());
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn split_log_path(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    (dir, file_name)
}

/// Initialize logging once per process.
///
/// Environment variables:
/// - `AGENTCHAT_OBSERVABILITY_ENABLED` / `AGENTCHAT_OBSERVABILITY`: optional enable/disable flag (default enabled).
/// - `AGENTCHAT_LOG_LEVEL`: optional level/filter override (`info`, `debug`, etc.).
/// - `AGENTCHAT_JSON_LOG_PATH`: optional log file path. If set, logs are JSONL in that file.
///   If unset, logs go to stderr in a compact console format.
/// - `RUST_LOG`: optional filter override. The default filter is `info`.
pub fn init_observability() {
    INIT.get_or_init(|| {
        if !enabled_from(|key| std::env::var(key).ok()) {
            return;
        }

        let env_filter = resolve_env_filter();
        if let Ok(path_raw) = std::env::var("AGENTCHAT_JSON_LOG_PATH") {
            let (dir, file_name) = split_log_path(Path::new(&path_raw));
            let _ = std::fs::create_dir_all(&dir);
            let writer = tracing_appender::rolling::never(dir, file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init();
        } else {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
        }
    });
}
