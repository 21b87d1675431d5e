//! Supervisor-level configuration.
//!
//! Three layers, lowest to highest precedence: built-in defaults, an
//! optional user-scoped `config.toml`, then environment variables / CLI
//! flags (bound directly onto [`crate::cli::Cli`] via clap's `env` feature).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// The literal completion token an agent writes to signal the PRD is finished.
pub const COMPLETION_PROMISE: &str = "<promise>COMPLETE</promise>";

/// Default progress-log rotation threshold, in lines.
pub const DEFAULT_ROTATION_THRESHOLD: usize = 500;

/// Default size of the in-memory recent-output tail buffer.
pub const DEFAULT_RECENT_OUTPUT_CAPACITY: usize = 200;

/// Default pacing delay between iterations.
pub const DEFAULT_ITERATION_PACING_SECS: u64 = 2;

/// Default grace period before escalating SIGTERM to SIGKILL.
pub const DEFAULT_STOP_GRACE_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RalphConfig {
    /// Default backend order, tried in this sequence when the caller
    /// doesn't pin one explicitly.
    pub default_agent_order: Vec<String>,

    /// Progress-log rotation threshold, in lines.
    pub rotation_threshold: usize,

    /// Recent-output tail buffer capacity, in lines.
    pub recent_output_capacity: usize,

    /// Delay between iterations, in seconds.
    pub iteration_pacing_secs: u64,

    /// Grace period before SIGKILL on stop, in seconds.
    pub stop_grace_secs: u64,

    /// Maximum registry I/O retry attempts before giving up silently.
    pub registry_retry_attempts: u32,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            default_agent_order: vec!["claude".to_string(), "opencode".to_string()],
            rotation_threshold: DEFAULT_ROTATION_THRESHOLD,
            recent_output_capacity: DEFAULT_RECENT_OUTPUT_CAPACITY,
            iteration_pacing_secs: DEFAULT_ITERATION_PACING_SECS,
            stop_grace_secs: DEFAULT_STOP_GRACE_SECS,
            registry_retry_attempts: 5,
        }
    }
}

impl RalphConfig {
    /// Load configuration, merging a user-scoped `config.toml` over the
    /// built-in defaults. Missing or unreadable config files fall back to
    /// defaults silently (this is an ambient convenience file, not a
    /// required one).
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(path) = Self::user_config_path() {
            if let Ok(text) = std::fs::read_to_string(&path) {
                match toml::from_str::<RalphConfig>(&text) {
                    Ok(parsed) => config = parsed,
                    Err(e) => {
                        log::warn!("ignoring malformed config at {:?}: {}", path, e);
                    }
                }
            }
        }

        config
    }

    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ralph").join("config.toml"))
    }

    /// Base directory for persisted daemon state (registry db, sockets).
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ralph")
    }

    pub fn registry_db_path() -> PathBuf {
        Self::data_dir().join("registry.db")
    }

    pub fn sockets_dir() -> PathBuf {
        Self::data_dir().join("sockets")
    }

    pub fn socket_path(task_name: &str) -> PathBuf {
        Self::sockets_dir().join(format!("{task_name}.sock"))
    }

    /// Resolve the prompt template path in the order specified by the spec:
    /// `-p FILE` > `$RALPH_PROMPT` > `./prompt.md` > user-scoped default >
    /// built-in fallback (handled by the caller when this returns `None`).
    pub fn resolve_prompt_template(cli_flag: Option<&Path>) -> Option<PathBuf> {
        if let Some(p) = cli_flag {
            if p.exists() {
                return Some(p.to_path_buf());
            }
        }
        if let Ok(env_path) = std::env::var("RALPH_PROMPT") {
            let p = PathBuf::from(env_path);
            if p.exists() {
                return Some(p);
            }
        }
        let local = PathBuf::from("./prompt.md");
        if local.exists() {
            return Some(local);
        }
        if let Some(user_default) = dirs::config_dir().map(|d| d.join("ralph").join("prompt.md")) {
            if user_default.exists() {
                return Some(user_default);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_agent_order_has_claude_first() {
        let config = RalphConfig::default();
        assert_eq!(config.default_agent_order[0], "claude");
    }

    #[test]
    fn resolve_prompt_template_falls_through_to_none() {
        // No cli flag, no env var, no local prompt.md in this test's cwd.
        std::env::remove_var("RALPH_PROMPT");
        let path = std::env::temp_dir().join("definitely-not-a-real-prompt.md");
        let result = RalphConfig::resolve_prompt_template(Some(&path));
        assert!(result.is_none() || result.unwrap() != path);
    }
}
