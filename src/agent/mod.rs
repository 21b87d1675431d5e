//! Uniform contract over the coding-agent CLIs the loop runner can drive.

mod claude;
pub mod classify;
pub mod completion;
mod opencode;
pub mod pty;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

pub use claude::ClaudeBackend;
pub use classify::FailureCategory;
pub use opencode::OpenCodeBackend;
pub use pty::PtySession;

/// Parameters for one iteration's spawn, assembled by the loop runner from
/// the PRD, the prompt template, and the active `RalphConfig`.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub worktree_path: PathBuf,
    pub prompt: String,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub extra_env: Vec<(String, String)>,
}

/// Outcome of a completed iteration, after the backend's own output
/// classification has run.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub category: FailureCategory,
    pub exit_code: Option<i32>,
    pub completion_promised: bool,
    /// Last portion of combined output, retained for progress-log entries
    /// and RPC `get_status` snapshots.
    pub tail: String,
}

/// A handle to a spawned iteration: the live PTY plus whatever bookkeeping
/// (idle-signal watcher, HTTP server child) the backend needs to detect
/// completion.
pub struct Handle {
    pub pty: Arc<PtySession>,
}

/// Uniform contract over agent CLIs. Each backend knows how to build its
/// own command line, stream its own output format, and recognize its own
/// completion/failure signals; the loop runner only calls through this
/// trait.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Stable identifier used in PRDs, config, and CLI flags (e.g. "claude").
    fn name(&self) -> &'static str;

    /// Human-readable name for logs and status output.
    fn display_name(&self) -> &'static str;

    /// Whether the backend's CLI is installed and resolvable on `PATH`.
    fn is_available(&self) -> bool;

    /// Spawn one iteration and drive it to completion, returning the
    /// classified outcome. Implementations own the full iteration
    /// lifecycle: spawning the PTY, streaming output onto the event bus,
    /// waiting for a completion/failure signal, and returning.
    async fn spawn_iteration(&self, config: SpawnConfig) -> Result<IterationOutcome>;
}

/// Resolve a named backend, used when a PRD or CLI flag pins a specific
/// agent rather than following the configured fallback order.
pub fn backend_by_name(name: &str) -> Option<Arc<dyn AgentBackend>> {
    match name {
        "claude" => Some(Arc::new(ClaudeBackend::new())),
        "opencode" => Some(Arc::new(OpenCodeBackend::new())),
        _ => None,
    }
}

/// The full set of backends this build knows about, in no particular
/// order; `RalphConfig::default_agent_order` decides fallback sequencing.
pub fn all_backends() -> Vec<Arc<dyn AgentBackend>> {
    vec![Arc::new(ClaudeBackend::new()), Arc::new(OpenCodeBackend::new())]
}
