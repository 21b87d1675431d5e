//! Checkpoint write path: progress-log entry plus PRD top-level fields.

use std::path::Path;

use anyhow::Result;

use crate::prd::{self, Prd};

use super::progress_log;

/// Write a checkpoint: append a summary block to the progress log and set
/// the PRD's checkpoint fields so a subsequent `run` resumes from here.
pub fn write(
    task_dir: &Path,
    prd: &mut Prd,
    iteration: u32,
    max_iterations: u32,
    reason: &str,
    agent: &str,
    now: &str,
) -> Result<()> {
    let (completed, total) = prd.counts();
    let current_story_title = prd
        .eligible_stories()
        .first()
        .map(|s| s.title.as_str());

    progress_log::append_checkpoint_block(
        task_dir,
        iteration,
        max_iterations,
        completed,
        total,
        current_story_title,
        agent,
        reason,
        now,
    )?;

    prd.checkpointed = Some(true);
    prd.last_iteration = Some(iteration);
    prd.checkpoint_reason = Some(reason.to_string());
    prd::save(task_dir, prd)?;
    Ok(())
}

/// Consume checkpoint fields left by a previous run, returning the
/// iteration to resume from if one was pending.
pub fn consume_resume_point(prd: &mut Prd) -> Option<u32> {
    if prd.checkpointed.take() == Some(true) {
        let last = prd.last_iteration.take().unwrap_or(0);
        prd.checkpoint_reason = None;
        Some(last + 1)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_prd() -> Prd {
        Prd::parse(
            r#"{
                "schemaVersion": "2.0",
                "project": "demo",
                "taskDir": "tasks/demo",
                "branchName": "ralph/demo",
                "type": "feature",
                "description": "demo",
                "autoMerge": false,
                "checkpointed": true,
                "lastIteration": 4,
                "checkpointReason": "stop requested",
                "userStories": [
                    {"id": "US-001", "title": "a", "acceptanceCriteria": ["ok"]}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn consume_resume_point_clears_fields_and_returns_next_iteration() {
        let mut prd = sample_prd();
        let resume = consume_resume_point(&mut prd);
        assert_eq!(resume, Some(5));
        assert!(prd.checkpointed.is_none());
        assert!(prd.last_iteration.is_none());
        assert!(prd.checkpoint_reason.is_none());
    }

    #[test]
    fn consume_resume_point_is_none_when_not_checkpointed() {
        let mut prd = sample_prd();
        prd.checkpointed = None;
        assert_eq!(consume_resume_point(&mut prd), None);
    }

    #[test]
    fn write_updates_prd_and_appends_progress_log_block() {
        let dir = TempDir::new().unwrap();
        progress_log::ensure_initialized(dir.path(), "demo", "feature", "now").unwrap();
        let mut prd = sample_prd();
        prd.checkpointed = None;
        prd.last_iteration = None;
        prd.checkpoint_reason = None;

        write(dir.path(), &mut prd, 3, 50, "stop requested", "claude", "now").unwrap();

        assert_eq!(prd.checkpointed, Some(true));
        assert_eq!(prd.last_iteration, Some(3));
        let log_text = std::fs::read_to_string(progress_log::progress_log_path(dir.path())).unwrap();
        assert!(log_text.contains("stop requested"));
    }
}
