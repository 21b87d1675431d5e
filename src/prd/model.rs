//! PRD (Product Requirements Document) data model.
//!
//! This mirrors the JSON file an agent reads and edits across iterations.
//! See `.ralph/tasks/{task}/prd.json` on disk.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::PrdError;

/// PRD type — shapes which phases/decision-gate machinery applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrdType {
    Feature,
    BugInvestigation,
    Investigation,
}

/// A phase grouping for investigation-style PRDs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expands_to: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dynamic: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_all_previous: bool,
}

/// Status of a decision gate's human decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Answered,
    Applied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionConfig {
    pub slug: String,
    pub input_file: String,
    pub status: DecisionStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_recommendation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_selection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnConfig {
    pub id_prefix: String,
    pub target_phase: String,
}

/// One acceptance criterion. Schema v1 PRDs store these as bare strings;
/// schema >=2.0 stores `{description, passes}` objects. We read through a
/// sum type and remember which shape the source used so writing back
/// preserves it without inference (see `was_bare` below).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AcceptanceCriterion {
    Structured { description: String, passes: bool },
    Bare(String),
}

impl AcceptanceCriterion {
    pub fn description(&self) -> &str {
        match self {
            AcceptanceCriterion::Structured { description, .. } => description,
            AcceptanceCriterion::Bare(s) => s,
        }
    }

    pub fn passes(&self) -> bool {
        match self {
            AcceptanceCriterion::Structured { passes, .. } => *passes,
            // Bare criteria carry no pass state of their own; the story's
            // `passes` flag is authoritative for schema v1 PRDs.
            AcceptanceCriterion::Bare(_) => false,
        }
    }

    pub fn is_bare(&self) -> bool {
        matches!(self, AcceptanceCriterion::Bare(_))
    }
}

fn default_priority() -> i64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStory {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "type")]
    pub story_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_spawn_stories: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawn_config: Option<SpawnConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_config: Option<DecisionConfig>,
}

impl UserStory {
    pub fn is_decision_gate(&self) -> bool {
        self.story_type.as_deref() == Some("decision-gate")
    }

    /// Recompute `passes` from acceptance criteria for schema >= 2.0 PRDs
    /// (invariant 2). Schema v1 PRDs leave `passes` as the sole source of
    /// truth and this is a no-op when every criterion is bare.
    pub fn recompute_passes(&mut self) {
        if self.acceptance_criteria.is_empty() {
            return;
        }
        if self.acceptance_criteria.iter().all(|c| c.is_bare()) {
            // Schema v1 shape: `passes` is authoritative by itself.
            return;
        }
        self.passes = self.acceptance_criteria.iter().all(|c| c.passes());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prd {
    pub schema_version: String,
    pub project: String,
    pub task_dir: String,
    pub branch_name: String,
    #[serde(rename = "type")]
    pub prd_type: PrdType,
    #[serde(default)]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_target: Option<String>,
    #[serde(default)]
    pub auto_merge: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<Phase>,
    pub user_stories: Vec<UserStory>,

    /// Present only while a checkpoint is pending resumption; cleared by
    /// `LoopRunner` initialization step 2 once consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpointed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_reason: Option<String>,

    /// Preserves any fields this implementation doesn't model yet so a
    /// round-trip write doesn't drop agent-authored extensions.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Prd {
    /// Parse and validate a PRD document: unique ids, acyclic
    /// `blockedBy`/`blocks` graph, and no dangling blocker references
    /// (invariants 1 and 7).
    pub fn parse(text: &str) -> Result<Self, PrdError> {
        let mut prd: Prd =
            serde_json::from_str(text).map_err(|source| PrdError::InvalidJson {
                path: Default::default(),
                source,
            })?;
        for story in &mut prd.user_stories {
            story.recompute_passes();
        }
        prd.validate()?;
        Ok(prd)
    }

    fn validate(&self) -> Result<(), PrdError> {
        let mut seen = HashSet::new();
        let ids: HashSet<&str> = self.user_stories.iter().map(|s| s.id.as_str()).collect();
        for story in &self.user_stories {
            if !seen.insert(story.id.as_str()) {
                return Err(PrdError::DuplicateStoryId(story.id.clone()));
            }
            for blocker in &story.blocked_by {
                if !ids.contains(blocker.as_str()) {
                    return Err(PrdError::UnknownBlocker {
                        story: story.id.clone(),
                        blocker: blocker.clone(),
                    });
                }
            }
        }
        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<(), PrdError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let by_id: HashMap<&str, &UserStory> =
            self.user_stories.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        fn visit<'a>(
            id: &'a str,
            by_id: &HashMap<&'a str, &'a UserStory>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), PrdError> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(PrdError::CyclicDependency(id.to_string()));
                }
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            if let Some(story) = by_id.get(id) {
                for dep in &story.blocked_by {
                    visit(dep, by_id, marks)?;
                }
            }
            marks.insert(id, Mark::Done);
            Ok(())
        }

        for story in &self.user_stories {
            visit(&story.id, &by_id, &mut marks)?;
        }
        Ok(())
    }

    /// Whether every story in the PRD passes (the Completed transition
    /// condition).
    pub fn all_stories_pass(&self) -> bool {
        self.user_stories.iter().all(|s| s.passes)
    }

    pub fn counts(&self) -> (usize, usize) {
        let total = self.user_stories.len();
        let passed = self.user_stories.iter().filter(|s| s.passes).count();
        (passed, total)
    }

    /// A story is blocked-satisfied when every blocker passes, unless the
    /// blocker is a decision gate, in which case `passes` alone is never
    /// enough: the gate keeps blocking until its decision is applied
    /// (invariant 4), regardless of its own `passes` flag.
    fn blockers_satisfied(&self, story: &UserStory) -> bool {
        story.blocked_by.iter().all(|blocker_id| {
            self.user_stories
                .iter()
                .find(|s| &s.id == blocker_id)
                .map(|blocker| {
                    if blocker.is_decision_gate() {
                        blocker
                            .decision_config
                            .as_ref()
                            .map(|d| d.status == DecisionStatus::Applied)
                            .unwrap_or(false)
                    } else {
                        blocker.passes
                    }
                })
                .unwrap_or(false)
        })
    }

    /// Eligible stories: `passes=false` and every blocker satisfied
    /// (invariant 3), ordered by ascending priority then id.
    pub fn eligible_stories(&self) -> Vec<&UserStory> {
        let mut eligible: Vec<&UserStory> = self
            .user_stories
            .iter()
            .filter(|s| !s.passes && self.blockers_satisfied(s))
            .collect();
        eligible.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        eligible
    }

    /// Pending stories whose blockers include an unapplied decision gate —
    /// used to report `awaiting_decision` when no story is eligible.
    pub fn pending_decision_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        for story in &self.user_stories {
            if story.passes {
                continue;
            }
            for blocker_id in &story.blocked_by {
                if let Some(blocker) = self.user_stories.iter().find(|s| &s.id == blocker_id) {
                    if let Some(decision) = &blocker.decision_config {
                        if decision.status != DecisionStatus::Applied {
                            files.push(decision.input_file.clone());
                        }
                    }
                }
            }
        }
        files.sort();
        files.dedup();
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_prd(stories_json: &str) -> String {
        format!(
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
        )
    }

    #[test]
    fn rejects_duplicate_ids() {
        let text = sample_prd(
            r#"[
                {"id": "US-001", "title": "a", "acceptanceCriteria": ["ok"]},
                {"id": "US-001", "title": "b", "acceptanceCriteria": ["ok"]}
            ]"#,
        );
        let err = Prd::parse(&text).unwrap_err();
        assert!(matches!(err, PrdError::DuplicateStoryId(_)));
    }

    #[test]
    fn rejects_cycles() {
        let text = sample_prd(
            r#"[
                {"id": "US-001", "title": "a", "acceptanceCriteria": ["ok"], "blockedBy": ["US-002"]},
                {"id": "US-002", "title": "b", "acceptanceCriteria": ["ok"], "blockedBy": ["US-001"]}
            ]"#,
        );
        let err = Prd::parse(&text).unwrap_err();
        assert!(matches!(err, PrdError::CyclicDependency(_)));
    }

    #[test]
    fn eligible_excludes_blocked_stories() {
        let text = sample_prd(
            r#"[
                {"id": "US-001", "title": "a", "priority": 1, "acceptanceCriteria": ["ok"]},
                {"id": "US-002", "title": "b", "priority": 2, "acceptanceCriteria": ["ok"], "blockedBy": ["US-001"]}
            ]"#,
        );
        let prd = Prd::parse(&text).unwrap();
        let eligible = prd.eligible_stories();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, "US-001");
    }

    #[test]
    fn decision_gate_unblocks_only_when_applied() {
        let text = sample_prd(
            r#"[
                {
                    "id": "US-DECIDE", "title": "decide", "priority": 1, "passes": true,
                    "type": "decision-gate",
                    "acceptanceCriteria": ["ok"],
                    "decisionConfig": {
                        "slug": "pick-one", "inputFile": "decisions/pick-one.md", "status": "pending"
                    }
                },
                {"id": "US-011", "title": "after", "priority": 2, "acceptanceCriteria": ["ok"], "blockedBy": ["US-DECIDE"]}
            ]"#,
        );
        let prd = Prd::parse(&text).unwrap();
        assert!(prd.eligible_stories().is_empty());
        assert_eq!(prd.pending_decision_files(), vec!["decisions/pick-one.md"]);
    }

    #[test]
    fn structured_criteria_recompute_story_passes() {
        let text = sample_prd(
            r#"[
                {"id": "US-001", "title": "a", "passes": true, "acceptanceCriteria": [
                    {"description": "x", "passes": true},
                    {"description": "y", "passes": false}
                ]}
            ]"#,
        );
        let prd = Prd::parse(&text).unwrap();
        assert!(!prd.user_stories[0].passes);
    }
}
