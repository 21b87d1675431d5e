//! Prompt assembly for one iteration.

use std::path::Path;

use crate::prd::UserStory;

const BUILTIN_FALLBACK_TEMPLATE: &str = "\
You are working autonomously against a PRD. Read the PRD and progress log, \
pick the next eligible story, make it pass, then update the PRD's \
`passes` field. When every story in the PRD passes, emit the literal line \
`<promise>COMPLETE</promise>` and nothing else on that line.\n";

/// Load the prompt template text, given the path resolved by
/// `RalphConfig::resolve_prompt_template`, falling back to the built-in
/// template when no file was found.
pub fn load_template(resolved_path: Option<&Path>) -> String {
    match resolved_path {
        Some(path) => std::fs::read_to_string(path).unwrap_or_else(|e| {
            log::warn!("failed to read prompt template at {:?}: {}", path, e);
            BUILTIN_FALLBACK_TEMPLATE.to_string()
        }),
        None => BUILTIN_FALLBACK_TEMPLATE.to_string(),
    }
}

/// Build the final prompt: per-iteration header, the template body, any
/// pending injected prompt (consumed by the caller before this is called),
/// and a note about the selected story.
pub fn assemble(
    template: &str,
    task_dir: &Path,
    prd_path: &Path,
    progress_log_path: &Path,
    injected_prompt: Option<&str>,
    selected_story: &UserStory,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "Task directory: {}\nPRD: {}\nProgress log: {}\n\n",
        task_dir.display(),
        prd_path.display(),
        progress_log_path.display(),
    ));
    prompt.push_str(template);
    prompt.push('\n');

    if let Some(injected) = injected_prompt {
        prompt.push_str("\nAdditional instructions from the operator:\n");
        prompt.push_str(injected);
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "\nCurrent story: {} — {}\n",
        selected_story.id, selected_story.title
    ));
    if !selected_story.description.is_empty() {
        prompt.push_str(&selected_story.description);
        prompt.push('\n');
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prd::UserStory;
    use std::path::PathBuf;

    fn sample_story() -> UserStory {
        UserStory {
            id: "US-001".to_string(),
            title: "Add login form".to_string(),
            description: "Implement email/password login.".to_string(),
            priority: 1,
            passes: false,
            notes: String::new(),
            acceptance_criteria: vec![],
            phase: None,
            story_type: None,
            blocked_by: vec![],
            blocks: vec![],
            can_spawn_stories: None,
            spawn_config: None,
            decision_config: None,
        }
    }

    #[test]
    fn assemble_includes_paths_and_story() {
        let prompt = assemble(
            "base instructions",
            &PathBuf::from("tasks/demo"),
            &PathBuf::from("tasks/demo/prd.json"),
            &PathBuf::from("tasks/demo/progress.txt"),
            None,
            &sample_story(),
        );
        assert!(prompt.contains("tasks/demo/prd.json"));
        assert!(prompt.contains("US-001"));
        assert!(prompt.contains("base instructions"));
    }

    #[test]
    fn assemble_includes_injected_prompt_when_present() {
        let prompt = assemble(
            "base",
            &PathBuf::from("tasks/demo"),
            &PathBuf::from("tasks/demo/prd.json"),
            &PathBuf::from("tasks/demo/progress.txt"),
            Some("focus on edge cases"),
            &sample_story(),
        );
        assert!(prompt.contains("focus on edge cases"));
    }

    #[test]
    fn load_template_falls_back_when_path_missing() {
        let text = load_template(Some(Path::new("/definitely/not/a/real/path.md")));
        assert!(text.contains("promise"));
    }
}
