//! Server configuration.
//!
//! Two layers, per the deployment contract: a `config.json` file read once
//! at startup whose values populate **unset** environment variables, and
//! the environment itself, which always wins. Every knob has a default so
//! the server runs with no configuration at all.

use std::path::Path;
use std::time::Duration;

use kiln_core::serving::{SchedulerLimits, SessionManagerOptions};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port for the HTTP listener.
    pub http_port: u16,
    /// Model used when a request does not name one.
    pub default_model: String,

    /// Worker pool size for blocking engine executions.
    pub worker_threads: usize,
    /// Per-model queue capacity.
    pub max_model_queue: usize,
    /// Per-session pending-queue capacity.
    pub max_session_pending: usize,
    /// Queue-wait deadline in milliseconds.
    pub max_queue_wait_ms: u64,

    /// Token-cache safety margin before a context is rebuilt.
    pub kv_reset_margin: u32,
    /// Generation budget when the request carries no `max_tokens`.
    pub default_max_tokens: u32,

    /// Session idle TTL in seconds.
    pub session_idle_ttl_secs: u64,
    /// Live-session cap (LRU eviction beyond it).
    pub max_sessions: usize,
    /// Removals per gc pass.
    pub gc_batch: usize,

    /// Path to the model weights, if a token backend is compiled in.
    pub model_path: Option<String>,
    /// Context window requested from the backend.
    pub model_ctx_tokens: u32,
    /// Backend compute threads.
    pub model_threads: usize,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,
    /// Emit log records as newline-delimited JSON.
    pub log_json: bool,
    /// Serve the Swagger UI (disable in production deployments).
    pub enable_swagger: bool,
}

impl Config {
    /// Load `config.json` (path from `KILN_CONFIG`, default `config.json`),
    /// seed unset environment variables from it, then read everything from
    /// the environment.
    pub fn load() -> Self {
        let path = std::env::var("KILN_CONFIG").unwrap_or_else(|_| "config.json".to_owned());
        if let Err(e) = seed_env_from_file(Path::new(&path)) {
            warn!(path = %path, error = %e, "config file not applied");
        }
        Self::from_env()
    }

    /// Build [`Config`] from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        Self {
            http_port: parse_env("HTTP_PORT", 8080),
            default_model: env_or("DEFAULT_MODEL", "dummy"),
            worker_threads: parse_env("WORKER_THREADS", 4),
            max_model_queue: parse_env("MAX_MODEL_QUEUE", 8),
            max_session_pending: parse_env("MAX_SESSION_PENDING", 64),
            max_queue_wait_ms: parse_env("MAX_QUEUE_WAIT_MS", 2000),
            kv_reset_margin: parse_env("KV_RESET_MARGIN", 256),
            default_max_tokens: parse_env("DEFAULT_MAX_TOKENS", 512),
            session_idle_ttl_secs: parse_env("SESSION_IDLE_TTL_SECS", 30 * 60),
            max_sessions: parse_env("MAX_SESSIONS", 1024),
            gc_batch: parse_env("GC_BATCH", 64),
            model_path: std::env::var("MODEL_PATH").ok().filter(|s| !s.is_empty()),
            model_ctx_tokens: parse_env("MODEL_CTX_TOKENS", 4096),
            model_threads: parse_env("MODEL_THREADS", 0),
            log_level: env_or("LOG_LEVEL", "info"),
            log_json: flag_env("LOG_JSON"),
            enable_swagger: std::env::var("ENABLE_SWAGGER")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
        }
    }

    pub fn scheduler_limits(&self) -> SchedulerLimits {
        SchedulerLimits {
            max_model_queue: self.max_model_queue,
            max_session_pending: self.max_session_pending,
            max_queue_wait: Duration::from_millis(self.max_queue_wait_ms),
        }
    }

    pub fn session_options(&self) -> SessionManagerOptions {
        SessionManagerOptions {
            idle_ttl: Duration::from_secs(self.session_idle_ttl_secs),
            max_sessions: self.max_sessions,
            gc_batch: self.gc_batch,
            pending_capacity: self.max_session_pending,
            ..SessionManagerOptions::default()
        }
    }
}

/// Copy top-level scalar keys of the JSON object into unset environment
/// variables, uppercased (`http_port` → `HTTP_PORT`).
fn seed_env_from_file(path: &Path) -> std::io::Result<()> {
    let raw = std::fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let Some(object) = parsed.as_object() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "config root must be a JSON object",
        ));
    };

    for (key, value) in object {
        let env_key = key.to_uppercase();
        if std::env::var_os(&env_key).is_some() {
            continue; // environment wins
        }
        let text = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        std::env::set_var(env_key, text);
    }
    Ok(())
}

// ── private helpers ───────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn flag_env(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_apply_without_environment() {
        let cfg = Config::from_env();
        assert_eq!(cfg.worker_threads, 4);
        assert_eq!(cfg.max_queue_wait_ms, 2000);
        assert_eq!(cfg.default_max_tokens, 512);
        assert_eq!(cfg.session_options().gc_batch, 64);
    }

    #[test]
    fn scheduler_limits_mirror_config() {
        let mut cfg = Config::from_env();
        cfg.max_model_queue = 3;
        cfg.max_queue_wait_ms = 150;
        let limits = cfg.scheduler_limits();
        assert_eq!(limits.max_model_queue, 3);
        assert_eq!(limits.max_queue_wait, Duration::from_millis(150));
    }
}
