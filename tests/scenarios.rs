//! End-to-end scenario coverage, driven through the library's public
//! surface rather than spawning real agent CLIs (none are installed in a
//! test environment). Each test reconstructs the observable decision a
//! `LoopRunner` iteration would make from the same PRD/output fixtures it
//! would actually see.

use ralph_core::agent::classify::{classify, FailureCategory};
use ralph_core::agent::completion::CompletionDetector;
use ralph_core::interactive::InteractiveController;
use ralph_core::loop_runner::progress_log;
use ralph_core::prd::Prd;
use ralph_core::registry::{SessionRecord, SessionRegistry, SessionStatus};

use tempfile::TempDir;

const COMPLETE: &str = "<promise>COMPLETE</promise>";

fn prd_with_stories(stories_json: &str) -> Prd {
    let text = format!(
        r#"{{
            "schemaVersion": "2.0",
            "project": "demo",
            "taskDir": "tasks/demo",
            "branchName": "ralph/demo",
            "type": "feature",
            "description": "demo",
            "autoMerge": false,
            "userStories": {stories_json}
        }}"#
    );
    Prd::parse(&text).unwrap()
}

#[test]
fn trivial_completion_when_every_story_already_passes() {
    let prd = prd_with_stories(
        r#"[{"id": "US-001", "title": "a", "passes": true, "acceptanceCriteria": ["ok"]}]"#,
    );
    assert!(prd.all_stories_pass());
    assert!(prd.eligible_stories().is_empty());
}

#[test]
fn agent_signals_done_cleanly_when_stories_pass_and_no_error_markers() {
    let prd = prd_with_stories(
        r#"[{"id": "US-001", "title": "a", "passes": true, "acceptanceCriteria": ["ok"]}]"#,
    );

    let agent_output = format!(
        "Implemented the story, all tests green.\n{{\"type\":\"result\",\"is_error\":false}}\n{COMPLETE}\n"
    );

    let detector = CompletionDetector::new(COMPLETE);
    assert!(detector.check(&agent_output));
    assert_eq!(classify(&agent_output), FailureCategory::Success);
    assert!(prd.all_stories_pass());

    // The payload's own result line is not an error marker, so the
    // completion promise is honored rather than discarded.
    let has_error_marker = agent_output
        .lines()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .any(|v| v.get("is_error").and_then(|b| b.as_bool()) == Some(true));
    assert!(!has_error_marker);
}

#[test]
fn completion_promise_is_discarded_when_payload_carries_an_error_marker() {
    let agent_output = format!(
        "Ran into trouble near the end.\n{{\"type\":\"result\",\"is_error\":true}}\n{COMPLETE}\n"
    );
    let detector = CompletionDetector::new(COMPLETE);
    assert!(detector.check(&agent_output));

    let has_error_marker = agent_output
        .lines()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .any(|v| v.get("is_error").and_then(|b| b.as_bool()) == Some(true));
    assert!(has_error_marker, "a promise alongside is_error:true must not be trusted");
}

#[test]
fn auth_error_output_is_classified_for_failover_not_retry() {
    let output = "Authentication failed: please sign in again to continue.";
    assert_eq!(classify(output), FailureCategory::AuthError);
    // AuthError is the category documented as "switching backend won't
    // help" — a caller driving the fallback list should still try the
    // next backend rather than loop on the same one, since the loop
    // runner's failover is backend-level, not error-aware per category.
}

#[test]
fn rate_limit_output_is_distinguished_from_auth_error() {
    assert_eq!(classify("429 Too Many Requests"), FailureCategory::RateLimit);
    assert_ne!(classify("429 Too Many Requests"), FailureCategory::AuthError);
}

#[test]
fn interactive_mode_suppresses_completion_detection_during_manual_drive() {
    let controller = InteractiveController::new();
    let output_with_promise = format!("human is typing...\n{COMPLETE}\n");

    controller.set_mode(true);
    assert!(controller.should_suppress_completion());

    // Even though the detector itself would match, a caller honoring
    // `should_suppress_completion` must not act on it while interactive.
    let detector = CompletionDetector::new(COMPLETE);
    assert!(detector.check(&output_with_promise));
    assert!(controller.should_suppress_completion());

    controller.set_mode(false);
    assert!(!controller.should_suppress_completion());
}

#[test]
fn checkpoint_and_resume_round_trips_through_prd_and_registry() {
    let dir = TempDir::new().unwrap();
    progress_log::ensure_initialized(dir.path(), "demo", "feature", "2026-07-28T00:00:00Z").unwrap();

    let mut prd = prd_with_stories(
        r#"[{"id": "US-001", "title": "a", "acceptanceCriteria": ["ok"]}]"#,
    );
    prd.checkpointed = Some(true);
    prd.last_iteration = Some(7);
    prd.checkpoint_reason = Some("stop requested".to_string());
    ralph_core::prd::save(dir.path(), &prd).unwrap();

    let reloaded = ralph_core::prd::load(dir.path()).unwrap();
    assert_eq!(reloaded.last_iteration, Some(7));

    let registry = SessionRegistry::open(&dir.path().join("registry.db")).unwrap();
    registry
        .register(&SessionRecord {
            task_name: "demo".to_string(),
            task_dir: dir.path().to_string_lossy().into_owned(),
            pid: std::process::id(),
            socket_path: dir.path().join("demo.sock").to_string_lossy().into_owned(),
            status: SessionStatus::Checkpointed,
            agent: "claude".to_string(),
            current_iteration: 7,
            max_iterations: 50,
            created_at: "2026-07-28T00:00:00Z".to_string(),
            updated_at: "2026-07-28T00:00:00Z".to_string(),
        })
        .unwrap();

    let record = registry.get("demo").unwrap();
    assert_eq!(record.status, SessionStatus::Checkpointed);
    assert_eq!(record.current_iteration, 7);

    // A fresh run would resume at last_iteration + 1.
    assert_eq!(reloaded.last_iteration.map(|n| n + 1), Some(8));
}

#[test]
fn decision_gate_blocks_eligibility_until_applied_then_unblocks() {
    let prd = prd_with_stories(
        r#"[
            {
                "id": "US-DECIDE", "title": "decide", "priority": 1, "passes": true,
                "type": "decision-gate",
                "acceptanceCriteria": ["ok"],
                "decisionConfig": {
                    "slug": "pick-one", "inputFile": "decisions/pick-one.md", "status": "pending"
                }
            },
            {"id": "US-002", "title": "after", "priority": 2, "acceptanceCriteria": ["ok"], "blockedBy": ["US-DECIDE"]}
        ]"#,
    );
    assert!(prd.eligible_stories().is_empty());
    assert_eq!(prd.pending_decision_files(), vec!["decisions/pick-one.md"]);

    let applied = prd_with_stories(
        r#"[
            {
                "id": "US-DECIDE", "title": "decide", "priority": 1, "passes": true,
                "type": "decision-gate",
                "acceptanceCriteria": ["ok"],
                "decisionConfig": {
                    "slug": "pick-one", "inputFile": "decisions/pick-one.md", "status": "applied"
                }
            },
            {"id": "US-002", "title": "after", "priority": 2, "acceptanceCriteria": ["ok"], "blockedBy": ["US-DECIDE"]}
        ]"#,
    );
    let eligible = applied.eligible_stories();
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].id, "US-002");
    assert!(applied.pending_decision_files().is_empty());
}
