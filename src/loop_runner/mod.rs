//! The iteration state machine: the heart of the orchestrator.

mod checkpoint;
mod prompt;

pub mod progress_log;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::agent::{self, AgentBackend, FailureCategory, IterationOutcome, SpawnConfig};
use crate::config::RalphConfig;
use crate::events::EventBus;
use crate::interactive::InteractiveController;
use crate::prd::{self, Prd};
use crate::registry::{SessionRecord, SessionRegistry, SessionStatus};
use crate::rpc::session_state::{SessionState, SharedSessionState};
use crate::rpc::{LoopCommand, RpcContext, RpcServer};

/// Terminal and non-terminal states the loop can be in; mirrors
/// `SessionStatus` but distinguishes the live `Iterating` state and carries
/// a reason string for terminal transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoopStatus {
    Iterating,
    Stopped,
    Completed,
    Failed { reason: String },
    Checkpointed { reason: String },
}

/// Everything the CLI `run` command gathers before handing off to the
/// loop runner.
pub struct LoopConfig {
    pub task_dir: PathBuf,
    pub max_iterations: u32,
    pub preferred_agent: Option<String>,
    pub model: Option<String>,
    pub prompt_template_path: Option<PathBuf>,
    pub config: RalphConfig,
    pub non_interactive: bool,
}

pub struct LoopRunner {
    config: LoopConfig,
    registry: SessionRegistry,
    events: EventBus,
    interactive: InteractiveController,
    state: SharedSessionState,
    commands_rx: mpsc::UnboundedReceiver<LoopCommand>,
    commands_tx: mpsc::UnboundedSender<LoopCommand>,
    pty_slot: Arc<AsyncMutex<Option<Arc<agent::PtySession>>>>,
    injected_prompt: Option<String>,
    stop_requested: bool,
    checkpoint_requested: bool,
}

impl LoopRunner {
    pub fn new(config: LoopConfig, registry: SessionRegistry) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let now = Utc::now().to_rfc3339();
        let task_name = task_name_from_dir(&config.task_dir);
        let state = SharedSessionState::new(SessionState::new(
            task_name,
            config.task_dir.to_string_lossy().into_owned(),
            config.preferred_agent.clone().unwrap_or_default(),
            config.max_iterations,
            now,
        ));

        Self {
            config,
            registry,
            events: EventBus::new(),
            interactive: InteractiveController::new(),
            state,
            commands_rx,
            commands_tx,
            pty_slot: Arc::new(AsyncMutex::new(None)),
            injected_prompt: None,
            stop_requested: false,
            checkpoint_requested: false,
        }
    }

    /// Run the loop to a terminal status, blocking the calling task.
    /// Foreground/background dispatch happens one level up, in `cli`: this
    /// always runs in the current process.
    pub async fn run(mut self) -> Result<LoopStatus> {
        let task_name = task_name_from_dir(&self.config.task_dir);
        let mut prd = prd::load(&self.config.task_dir).context("loading prd.json")?;

        let resume_from = checkpoint::consume_resume_point(&mut prd).unwrap_or(1);
        if resume_from > 1 || prd.checkpointed.is_some() {
            prd::save(&self.config.task_dir, &prd)?;
        }

        self.ensure_branch(&prd)?;
        progress_log::ensure_initialized(
            &self.config.task_dir,
            &prd.project,
            prd_type_label(&prd),
            &Utc::now().to_rfc3339(),
        )?;

        let backend_order = self.build_fallback_order(&prd)?;
        let socket_path = RalphConfig::socket_path(&task_name);
        let rpc_server = RpcServer::bind(&socket_path)?;

        let record = SessionRecord {
            task_name: task_name.clone(),
            task_dir: self.config.task_dir.to_string_lossy().into_owned(),
            pid: std::process::id(),
            socket_path: socket_path.to_string_lossy().into_owned(),
            status: SessionStatus::Running,
            agent: backend_order[0].name().to_string(),
            current_iteration: resume_from.saturating_sub(1),
            max_iterations: self.config.max_iterations,
            created_at: Utc::now().to_rfc3339(),
            updated_at: Utc::now().to_rfc3339(),
        };
        self.registry.register(&record)?;

        let ctx = RpcContext {
            state: self.state.clone(),
            events: self.events.clone(),
            interactive: self.interactive.clone(),
            commands: self.commands_tx.clone(),
            pty: self.pty_slot.clone(),
        };
        tokio::spawn(rpc_server.serve(ctx));

        let outcome = self
            .iterate(&mut prd, resume_from, &backend_order, &task_name)
            .await;

        let (status, reason) = match &outcome {
            Ok(LoopStatus::Completed) => (SessionStatus::Completed, None),
            Ok(LoopStatus::Stopped) => (SessionStatus::Stopped, None),
            Ok(LoopStatus::Checkpointed { reason }) => {
                (SessionStatus::Checkpointed, Some(reason.clone()))
            }
            Ok(LoopStatus::Failed { reason }) => (SessionStatus::Failed, Some(reason.clone())),
            Ok(LoopStatus::Iterating) => (SessionStatus::Failed, Some("unreachable".to_string())),
            Err(e) => (SessionStatus::Failed, Some(e.to_string())),
        };
        let _ = self.registry.update_status(
            &task_name,
            status,
            self.state.snapshot().await.iteration,
            &Utc::now().to_rfc3339(),
        );
        if let Some(reason) = &reason {
            log::warn!("loop {task_name} ended with reason: {reason}");
        }

        outcome
    }

    fn ensure_branch(&self, prd: &Prd) -> Result<()> {
        let repo_root = self
            .config
            .task_dir
            .parent()
            .ok_or_else(|| anyhow!("task directory has no parent to locate the git repo"))?;
        let repo = git2::Repository::discover(repo_root)
            .with_context(|| format!("discovering git repository from {:?}", repo_root))?;

        let branch_name = &prd.branch_name;
        match repo.find_branch(branch_name, git2::BranchType::Local) {
            Ok(branch) => {
                let reference = branch.into_reference();
                let refname = reference.name().ok_or_else(|| anyhow!("branch has no name"))?;
                repo.set_head(refname)?;
                repo.checkout_head(Some(git2::build::CheckoutBuilder::new().safe()))?;
            }
            Err(_) => {
                let head = repo.head().context("resolving HEAD to branch from")?;
                let commit = head.peel_to_commit()?;
                repo.branch(branch_name, &commit, false)
                    .with_context(|| format!("creating branch {branch_name}"))?;
                repo.set_head(&format!("refs/heads/{branch_name}"))?;
                repo.checkout_head(Some(git2::build::CheckoutBuilder::new().safe()))?;
            }
        }
        Ok(())
    }

    /// Chosen backend first (CLI flag > PRD's `agent` > configured default
    /// order), then every other available backend in configured order.
    fn build_fallback_order(&self, prd: &Prd) -> Result<Vec<Arc<dyn AgentBackend>>> {
        let preferred_name = self
            .config
            .preferred_agent
            .clone()
            .or_else(|| prd.agent.clone())
            .or_else(|| self.config.config.default_agent_order.first().cloned());

        let mut order: Vec<Arc<dyn AgentBackend>> = Vec::new();
        if let Some(name) = &preferred_name {
            if let Some(backend) = agent::backend_by_name(name) {
                order.push(backend);
            }
        }
        for name in &self.config.config.default_agent_order {
            if order.iter().any(|b| b.name() == name) {
                continue;
            }
            if let Some(backend) = agent::backend_by_name(name) {
                order.push(backend);
            }
        }

        order.retain(|b| b.is_available());
        if order.is_empty() {
            bail!("no configured agent backend is available on this machine");
        }
        Ok(order)
    }

    async fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands_rx.try_recv() {
            match cmd {
                LoopCommand::Stop => self.stop_requested = true,
                LoopCommand::Checkpoint => self.checkpoint_requested = true,
                LoopCommand::InjectPrompt(p) => self.injected_prompt = Some(p),
            }
        }
    }

    async fn iterate(
        &mut self,
        prd: &mut Prd,
        resume_from: u32,
        backend_order: &[Arc<dyn AgentBackend>],
        task_name: &str,
    ) -> Result<LoopStatus> {
        let mut iteration = resume_from;
        let prd_path = self.config.task_dir.join(prd::make_prd_filename());
        let progress_path = progress_log::progress_log_path(&self.config.task_dir);

        loop {
            self.drain_commands().await;

            // Step 1: gate checks.
            if self.stop_requested {
                return Ok(LoopStatus::Stopped);
            }
            if self.checkpoint_requested {
                let (completed, _) = prd.counts();
                let _ = completed;
                checkpoint::write(
                    &self.config.task_dir,
                    prd,
                    iteration.saturating_sub(1),
                    self.config.max_iterations,
                    "checkpoint requested",
                    backend_order[0].name(),
                    &Utc::now().to_rfc3339(),
                )?;
                return Ok(LoopStatus::Checkpointed {
                    reason: "checkpoint requested".to_string(),
                });
            }

            // Step 2: PRD refresh.
            *prd = prd::load(&self.config.task_dir)?;
            if prd.all_stories_pass() {
                self.finalize_completion(prd)?;
                return Ok(LoopStatus::Completed);
            }

            if iteration > self.config.max_iterations {
                return Ok(LoopStatus::Failed {
                    reason: "max_iterations".to_string(),
                });
            }

            // Step 3: story selection.
            let eligible = prd.eligible_stories();
            let selected = match eligible.first() {
                Some(story) => (*story).clone(),
                None => {
                    let pending = prd.pending_decision_files();
                    if !pending.is_empty() {
                        checkpoint::write(
                            &self.config.task_dir,
                            prd,
                            iteration.saturating_sub(1),
                            self.config.max_iterations,
                            "awaiting_decision",
                            backend_order[0].name(),
                            &Utc::now().to_rfc3339(),
                        )?;
                        return Ok(LoopStatus::Checkpointed {
                            reason: "awaiting_decision".to_string(),
                        });
                    }
                    return Ok(LoopStatus::Failed {
                        reason: "no_eligible_stories".to_string(),
                    });
                }
            };

            // Step 4: prompt assembly.
            let template = prompt::load_template(self.config.prompt_template_path.as_deref());
            let injected = self.injected_prompt.take();
            let assembled_prompt = prompt::assemble(
                &template,
                &self.config.task_dir,
                &prd_path,
                &progress_path,
                injected.as_deref(),
                &selected,
            );

            // Step 5: progress-log maintenance.
            progress_log::rotate_if_needed(
                &self.config.task_dir,
                self.config.config.rotation_threshold,
                &Utc::now().to_rfc3339(),
            )?;

            self.events.publish(
                "iteration:started",
                serde_json::json!({"iteration": iteration, "story": selected.id}),
            );

            // Step 6: spawn through the fallback list.
            let outcome = self
                .spawn_with_failover(backend_order, &assembled_prompt, task_name)
                .await?;

            let outcome = match outcome {
                Some(o) => o,
                None => {
                    return Ok(LoopStatus::Failed {
                        reason: "agents_exhausted".to_string(),
                    });
                }
            };

            // Step 7 + 8: completion-signal inspection and PRD reconciliation.
            *prd = prd::load(&self.config.task_dir)?;
            let candidate_complete = outcome.completion_promised && !has_error_markers(&outcome.tail);
            if prd.all_stories_pass() && candidate_complete {
                self.finalize_completion(prd)?;
                return Ok(LoopStatus::Completed);
            }
            if candidate_complete {
                self.events.publish(
                    "warning",
                    serde_json::json!({"message": "agent signaled completion but stories remain"}),
                );
            }

            // Step 9: state advance.
            self.state
                .mutate(|s| {
                    s.iteration = iteration;
                    s.current_story = Some(selected.id.clone());
                    s.updated_at = Utc::now().to_rfc3339();
                })
                .await;
            self.events.publish(
                "state_change",
                serde_json::json!({"iteration": iteration}),
            );
            let _ = self.registry.update_status(
                task_name,
                SessionStatus::Running,
                iteration,
                &Utc::now().to_rfc3339(),
            );

            // Step 10: pacing.
            tokio::time::sleep(Duration::from_secs(self.config.config.iteration_pacing_secs)).await;
            iteration += 1;
        }
    }

    async fn spawn_with_failover(
        &mut self,
        backend_order: &[Arc<dyn AgentBackend>],
        prompt: &str,
        task_name: &str,
    ) -> Result<Option<IterationOutcome>> {
        for backend in backend_order {
            self.events.publish(
                "agent:selected",
                serde_json::json!({"agent": backend.name()}),
            );

            let spawn_config = SpawnConfig {
                worktree_path: self.config.task_dir.clone(),
                prompt: prompt.to_string(),
                model: self.config.model.clone(),
                max_turns: None,
                extra_env: vec![],
            };

            match backend.spawn_iteration(spawn_config).await {
                Ok(outcome) => {
                    for line in outcome.tail.lines() {
                        self.state.mutate(|s| s.push_output_line(line.to_string())).await;
                        self.events.publish("output", serde_json::json!({"line": line}));
                    }
                    if self.interactive.should_suppress_completion() {
                        continue;
                    }
                    match outcome.category {
                        FailureCategory::Success => return Ok(Some(outcome)),
                        other => {
                            log::warn!(
                                "{task_name}: backend {} reported {:?}, trying next backend",
                                backend.name(),
                                other
                            );
                            continue;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("{task_name}: backend {} failed to spawn: {e:#}", backend.name());
                    continue;
                }
            }
        }
        Ok(None)
    }

    fn finalize_completion(&self, prd: &Prd) -> Result<()> {
        if let Some(target) = &prd.merge_target {
            if prd.auto_merge {
                if let Err(e) = self.merge_into(target, &prd.branch_name) {
                    log::warn!("auto-merge into {target} failed: {e:#}");
                    progress_log::append_note(
                        &self.config.task_dir,
                        &format!("Auto-merge into {target} failed: {e}"),
                    )?;
                }
            } else {
                progress_log::append_note(
                    &self.config.task_dir,
                    &format!("Ready to merge into {target}."),
                )?;
            }
        }
        Ok(())
    }

    fn merge_into(&self, target_branch: &str, source_branch: &str) -> Result<()> {
        let repo_root = self
            .config
            .task_dir
            .parent()
            .ok_or_else(|| anyhow!("task directory has no parent"))?;
        let repo = git2::Repository::discover(repo_root)?;

        let target_ref = repo.find_branch(target_branch, git2::BranchType::Local)?;
        let target_commit = target_ref.get().peel_to_commit()?;
        let source_ref = repo.find_branch(source_branch, git2::BranchType::Local)?;
        let source_commit = source_ref.get().peel_to_commit()?;

        let target_annotated = repo.find_annotated_commit(target_commit.id())?;
        let source_annotated = repo.find_annotated_commit(source_commit.id())?;
        let analysis = repo.merge_analysis(&[&source_annotated])?;

        if analysis.0.is_fast_forward() {
            let mut reference = repo.find_reference(&format!("refs/heads/{target_branch}"))?;
            reference.set_target(source_commit.id(), "fast-forward merge")?;
        } else if analysis.0.is_normal() {
            repo.merge(&[&source_annotated], None, None)?;
            let mut index = repo.index()?;
            let tree_id = index.write_tree()?;
            let tree = repo.find_tree(tree_id)?;
            let signature = repo.signature()?;
            repo.commit(
                Some(&format!("refs/heads/{target_branch}")),
                &signature,
                &signature,
                &format!("Merge {source_branch} into {target_branch}"),
                &tree,
                &[&target_commit, &source_commit],
            )?;
            repo.cleanup_state()?;
        }
        let _ = target_annotated;
        Ok(())
    }
}

/// `is_error: true`, `error_during_execution`, or `subtype: "error"` in the
/// final payload invalidate an otherwise-matched completion promise.
fn has_error_markers(tail: &str) -> bool {
    if tail.contains("error_during_execution") {
        return true;
    }
    for line in tail.lines() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            if value.get("is_error").and_then(|v| v.as_bool()) == Some(true) {
                return true;
            }
            if value.get("subtype").and_then(|v| v.as_str()) == Some("error") {
                return true;
            }
        }
    }
    false
}

fn task_name_from_dir(task_dir: &Path) -> String {
    task_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "task".to_string())
}

fn prd_type_label(prd: &Prd) -> &'static str {
    match prd.prd_type {
        prd::PrdType::Feature => "feature",
        prd::PrdType::BugInvestigation => "bug-investigation",
        prd::PrdType::Investigation => "investigation",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_markers_detected_in_json_lines() {
        assert!(has_error_markers(r#"{"type":"result","is_error":true}"#));
        assert!(has_error_markers(r#"{"subtype":"error"}"#));
        assert!(has_error_markers("fatal: error_during_execution occurred"));
        assert!(!has_error_markers(r#"{"type":"result","is_error":false}"#));
    }

    #[test]
    fn task_name_from_dir_uses_leaf_component() {
        assert_eq!(task_name_from_dir(Path::new("tasks/demo")), "demo");
    }
}
