use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "chat-stream.logs.jsonl";

/// Where log records go.
#[derive(Clone, Debug, PartialEq, Eq)]
enum LogTarget {
    Disabled,
    /// Compact console lines on stderr, keeping stdout for streamed text.
    Console,
    /// JSON lines appended to a file.
    JsonFile { dir: PathBuf, file_name: String },
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn resolve_target(lookup: impl Fn(&str) -> Option<String>) -> LogTarget {
    let enabled = lookup("CHAT_STREAM_OBSERVABILITY")
        .map(|v| parse_flag(&v).unwrap_or(true))
        .unwrap_or(true);
    if !enabled {
        return LogTarget::Disabled;
    }
    let Some(raw) = lookup("CHAT_STREAM_JSON_LOG_PATH").filter(|p| !p.trim().is_empty()) else {
        return LogTarget::Console;
    };
    let path = PathBuf::from(raw.trim());
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    LogTarget::JsonFile { dir, file_name }
}

fn resolve_env_filter(lookup: impl Fn(&str) -> Option<String>) -> tracing_subscriber::EnvFilter {
    if let Some(level) = lookup("CHAT_STREAM_LOG_LEVEL")
        && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
    {
        return filter;
    }
    lookup("RUST_LOG")
        .and_then(|rust_log| tracing_subscriber::EnvFilter::try_new(rust_log).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"))
}

/// Installs the process-wide `tracing` subscriber. Later calls are no-ops.
///
/// Environment variables:
/// - `CHAT_STREAM_OBSERVABILITY`: set to `false`/`off` to disable logging.
/// - `CHAT_STREAM_LOG_LEVEL`: filter override (`info`, `chat_stream=debug`, ...).
/// - `RUST_LOG`: fallback filter (default `info`).
/// - `CHAT_STREAM_JSON_LOG_PATH`: write JSON lines to this file instead of
///   the console.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let env = |key: &str| std::env::var(key).ok();
        let filter = resolve_env_filter(env);
        match resolve_target(env) {
            LogTarget::Disabled => {}
            LogTarget::JsonFile { dir, file_name } => {
                let _ = std::fs::create_dir_all(&dir);
                let writer = tracing_appender::rolling::never(dir, file_name);
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(false)
                    .with_writer(writer);
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(json_layer)
                    .try_init();
            }
            LogTarget::Console => {
                let console_layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(console_layer)
                    .try_init();
            }
        }
    });
}
