//! Claude Code CLI backend.
//!
//! Completion is detected by tailing the PTY's combined output for the
//! configured promise token (stream-parsing strategy); failures are
//! classified from the same tail once the process exits or the promise is
//! seen.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::time::timeout;

use crate::config::COMPLETION_PROMISE;

use super::classify::{classify, FailureCategory};
use super::completion::CompletionDetector;
use super::pty::PtySession;
use super::{AgentBackend, IterationOutcome, SpawnConfig};

pub struct ClaudeBackend;

impl ClaudeBackend {
    pub fn new() -> Self {
        Self
    }

    fn resolve_path() -> Option<std::path::PathBuf> {
        which::which("claude").ok()
    }
}

impl Default for ClaudeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentBackend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn display_name(&self) -> &'static str {
        "Claude Code"
    }

    fn is_available(&self) -> bool {
        Self::resolve_path().is_some()
    }

    async fn spawn_iteration(&self, config: SpawnConfig) -> Result<IterationOutcome> {
        let path = Self::resolve_path()
            .ok_or_else(|| anyhow!("claude CLI not found; install @anthropic-ai/claude-code"))?;

        if config.prompt.trim().is_empty() {
            return Err(anyhow!("claude requires a non-empty prompt"));
        }

        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];
        if let Some(max_turns) = config.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }
        if let Some(model) = &config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push(config.prompt.clone());

        let pty = PtySession::spawn(
            path.to_string_lossy().as_ref(),
            &args,
            &config.worktree_path,
            &config.extra_env,
            120,
            40,
        )?;

        run_until_exit_or_promise(pty, COMPLETION_PROMISE).await
    }
}

/// Shared iteration driver: tail the PTY's output for the completion
/// promise while the process runs, classify whatever we have once it exits
/// (or the promise fires, whichever comes first).
async fn run_until_exit_or_promise(
    pty: std::sync::Arc<PtySession>,
    promise: &str,
) -> Result<IterationOutcome> {
    let detector = CompletionDetector::new(promise);
    let mut rx = pty.subscribe();
    let mut collected = String::new();
    let mut completion_promised = false;

    loop {
        if let Some(exit_code) = pty.try_wait()? {
            let category = classify(&collected);
            return Ok(IterationOutcome {
                category,
                exit_code: Some(exit_code),
                completion_promised: completion_promised || detector.check(&collected),
                tail: tail_lines(&collected, 200),
            });
        }

        match timeout(Duration::from_millis(250), rx.recv()).await {
            Ok(Ok(chunk)) => {
                collected.push_str(&String::from_utf8_lossy(&chunk));
                if detector.check(&collected) {
                    completion_promised = true;
                }
            }
            Ok(Err(_)) => {
                // Sender dropped without the child reporting exit yet; loop
                // back around to try_wait, which will catch the exit.
            }
            Err(_) => {
                // No output within the poll window, keep checking liveness.
            }
        }

        if completion_promised {
            return Ok(IterationOutcome {
                category: FailureCategory::Success,
                exit_code: None,
                completion_promised: true,
                tail: tail_lines(&collected, 200),
            });
        }
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
