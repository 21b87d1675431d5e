//! OpenCode CLI backend.
//!
//! OpenCode doesn't print a clean linear transcript the way Claude's
//! `stream-json` does; instead we ask it to write a completion promise to a
//! well-known signal file once it considers itself done, and watch that
//! file with `notify` rather than scraping PTY output for the token. This
//! strategy is this implementation's own addition (OpenCode's own provider
//! upstream has no idle-signal convention to ground on), built from the
//! write-then-rename durability idiom used elsewhere for PRD and progress
//! log writes.

use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use notify::{Event, RecursiveMode, Watcher};
use uuid::Uuid;

use crate::config::COMPLETION_PROMISE;

use super::classify::{classify, FailureCategory};
use super::pty::PtySession;
use super::{AgentBackend, IterationOutcome, SpawnConfig};

pub struct OpenCodeBackend;

impl OpenCodeBackend {
    pub fn new() -> Self {
        Self
    }

    fn resolve_path() -> Option<PathBuf> {
        which::which("opencode").ok()
    }
}

impl Default for OpenCodeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentBackend for OpenCodeBackend {
    fn name(&self) -> &'static str {
        "opencode"
    }

    fn display_name(&self) -> &'static str {
        "OpenCode"
    }

    fn is_available(&self) -> bool {
        Self::resolve_path().is_some()
    }

    async fn spawn_iteration(&self, config: SpawnConfig) -> Result<IterationOutcome> {
        let path = Self::resolve_path()
            .ok_or_else(|| anyhow!("opencode CLI not found; install opencode-ai"))?;

        if config.prompt.trim().is_empty() {
            return Err(anyhow!("opencode requires a non-empty prompt"));
        }

        let session_id = Uuid::new_v4().to_string();
        let signal_file = std::env::temp_dir().join(format!("ralph-opencode-{session_id}.signal"));
        if signal_file.exists() {
            let _ = std::fs::remove_file(&signal_file);
        }

        let mut args = vec!["run".to_string()];
        if let Some(model) = &config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push(config.prompt.clone());

        let mut envs = config.extra_env.clone();
        envs.push((
            "RALPH_SIGNAL_FILE".to_string(),
            signal_file.to_string_lossy().into_owned(),
        ));
        envs.push(("RALPH_SESSION_ID".to_string(), session_id.clone()));

        let pty = PtySession::spawn(
            path.to_string_lossy().as_ref(),
            &args,
            &config.worktree_path,
            &envs,
            120,
            40,
        )?;

        let result = wait_for_signal_or_exit(pty, &signal_file).await;
        let _ = std::fs::remove_file(&signal_file);
        result
    }
}

/// Watch `signal_file` for creation while polling the PTY for exit,
/// whichever happens first. The signal file is written via a temp-then-
/// rename so a watcher firing on file creation never observes a partial
/// write.
async fn wait_for_signal_or_exit(
    pty: std::sync::Arc<PtySession>,
    signal_file: &std::path::Path,
) -> Result<IterationOutcome> {
    let (tx, rx) = std_mpsc::channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })
    .context("failed to create filesystem watcher")?;

    let watch_dir = signal_file
        .parent()
        .ok_or_else(|| anyhow!("signal file has no parent directory"))?;
    watcher
        .watch(watch_dir, RecursiveMode::NonRecursive)
        .context("failed to watch signal directory")?;

    let mut collected = String::new();
    let mut output_rx = pty.subscribe();

    loop {
        if signal_file.exists() {
            if let Ok(text) = std::fs::read_to_string(signal_file) {
                collected.push('\n');
                collected.push_str(&text);
            }
            let category = classify(&collected);
            return Ok(IterationOutcome {
                category: if category == FailureCategory::Success {
                    FailureCategory::Success
                } else {
                    category
                },
                exit_code: None,
                completion_promised: true,
                tail: tail_lines(&collected, 200),
            });
        }

        if let Some(exit_code) = pty.try_wait()? {
            let category = classify(&collected);
            return Ok(IterationOutcome {
                category,
                exit_code: Some(exit_code),
                completion_promised: collected.contains(COMPLETION_PROMISE),
                tail: tail_lines(&collected, 200),
            });
        }

        match output_rx.try_recv() {
            Ok(chunk) => collected.push_str(&String::from_utf8_lossy(&chunk)),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty) => {}
            Err(_) => {}
        }
        // Drain any filesystem events so the poll loop reflects current state
        // on the next iteration; we don't branch on event kind here because
        // the `signal_file.exists()` check above already covers creation.
        while rx.try_recv().is_ok() {}

        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
