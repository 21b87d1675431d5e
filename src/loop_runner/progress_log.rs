//! Progress log maintenance: creation, rotation, and checkpoint entries.
//!
//! The progress log is a plain text file (`progress.txt` under the task
//! directory) that the agent and the loop runner both append to across
//! iterations, carrying forward a "Codebase Patterns" section so an agent
//! starting a fresh context still has a summary of prior decisions.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const CODEBASE_PATTERNS_HEADER: &str = "## Codebase Patterns";

pub fn progress_log_path(task_dir: &Path) -> PathBuf {
    task_dir.join("progress.txt")
}

/// Create the progress log with a header if it doesn't already exist.
pub fn ensure_initialized(task_dir: &Path, effort_name: &str, prd_type: &str, now: &str) -> Result<()> {
    let path = progress_log_path(task_dir);
    if path.exists() {
        return Ok(());
    }
    let header = format!(
        "# Progress Log: {effort_name}\n\
         Type: {prd_type}\n\
         Started: {now}\n\n\
         {CODEBASE_PATTERNS_HEADER}\n\n(none yet)\n\n---\n\n"
    );
    write_atomic(&path, &header)
}

/// Count lines in the current progress log.
pub fn line_count(task_dir: &Path) -> Result<usize> {
    let path = progress_log_path(task_dir);
    let text = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
    Ok(text.lines().count())
}

/// If the progress log exceeds `threshold` lines, rotate it to
/// `progress-N.txt` (smallest unused N) and start a fresh log carrying
/// forward the "Codebase Patterns" section plus a pointer to the rotated
/// file.
pub fn rotate_if_needed(task_dir: &Path, threshold: usize, now: &str) -> Result<Option<PathBuf>> {
    let path = progress_log_path(task_dir);
    let text = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
    if text.lines().count() <= threshold {
        return Ok(None);
    }

    let patterns_section = extract_codebase_patterns(&text);

    let mut n = 1;
    let rotated_path = loop {
        let candidate = task_dir.join(format!("progress-{n}.txt"));
        if !candidate.exists() {
            break candidate;
        }
        n += 1;
    };
    fs::rename(&path, &rotated_path)
        .with_context(|| format!("rotating {:?} to {:?}", path, rotated_path))?;

    let fresh = format!(
        "# Progress Log (continued)\n\
         Rotated from: {}\n\
         Continued: {now}\n\n\
         {CODEBASE_PATTERNS_HEADER}\n\n{patterns_section}\n\n---\n\n",
        rotated_path.file_name().unwrap_or_default().to_string_lossy(),
    );
    write_atomic(&path, &fresh)?;
    Ok(Some(rotated_path))
}

fn extract_codebase_patterns(text: &str) -> String {
    let Some(start) = text.find(CODEBASE_PATTERNS_HEADER) else {
        return "(none yet)".to_string();
    };
    let after_header = &text[start + CODEBASE_PATTERNS_HEADER.len()..];
    let end = after_header.find("\n---").unwrap_or(after_header.len());
    after_header[..end].trim().to_string()
}

/// Append a checkpoint summary block to the progress log.
pub fn append_checkpoint_block(
    task_dir: &Path,
    iteration: u32,
    max_iterations: u32,
    completed: usize,
    total: usize,
    current_story_title: Option<&str>,
    agent: &str,
    reason: &str,
    now: &str,
) -> Result<()> {
    let path = progress_log_path(task_dir);
    let block = format!(
        "\n## Checkpoint ({now})\n\
         Iteration: {iteration}/{max_iterations}\n\
         Stories: {completed}/{total} passing\n\
         Current story: {}\n\
         Agent: {agent}\n\
         Reason: {reason}\n",
        current_story_title.unwrap_or("(none selected)"),
    );
    append(&path, &block)
}

/// Append a free-form line (used for "ready to merge" markers, warnings).
pub fn append_note(task_dir: &Path, note: &str) -> Result<()> {
    let path = progress_log_path(task_dir);
    append(&path, &format!("\n{note}\n"))
}

fn append(path: &Path, text: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {:?} for append", path))?;
    file.write_all(text.as_bytes())?;
    Ok(())
}

fn write_atomic(path: &Path, text: &str) -> Result<()> {
    let tmp = path.with_extension("txt.tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ensure_initialized_is_idempotent() {
        let dir = TempDir::new().unwrap();
        ensure_initialized(dir.path(), "demo", "feature", "2026-07-28T00:00:00Z").unwrap();
        let first = fs::read_to_string(progress_log_path(dir.path())).unwrap();
        ensure_initialized(dir.path(), "demo", "feature", "2026-07-28T01:00:00Z").unwrap();
        let second = fs::read_to_string(progress_log_path(dir.path())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rotation_skipped_at_threshold_triggered_above_it() {
        let dir = TempDir::new().unwrap();
        let path = progress_log_path(dir.path());
        let exactly_at_threshold: String = (0..10).map(|i| format!("line {i}\n")).collect();
        fs::write(&path, &exactly_at_threshold).unwrap();

        assert!(rotate_if_needed(dir.path(), 10, "now").unwrap().is_none());

        fs::write(&path, format!("{exactly_at_threshold}line 10\n")).unwrap();
        let rotated = rotate_if_needed(dir.path(), 10, "now").unwrap();
        assert!(rotated.is_some());
        assert!(progress_log_path(dir.path()).exists());
    }

    #[test]
    fn rotation_carries_forward_codebase_patterns() {
        let dir = TempDir::new().unwrap();
        let path = progress_log_path(dir.path());
        let mut text = format!("{CODEBASE_PATTERNS_HEADER}\n\nUse Arc<RwLock<_>> for shared state.\n\n---\n\n");
        for i in 0..20 {
            text.push_str(&format!("line {i}\n"));
        }
        fs::write(&path, &text).unwrap();

        rotate_if_needed(dir.path(), 5, "now").unwrap();
        let fresh = fs::read_to_string(&path).unwrap();
        assert!(fresh.contains("Use Arc<RwLock<_>> for shared state."));
    }
}
