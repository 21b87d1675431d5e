//! Session record shape persisted in the registry database.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Checkpointed,
    Stopped,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Checkpointed => "checkpointed",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Stopped | SessionStatus::Completed | SessionStatus::Failed
        )
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SessionStatus::Running),
            "checkpointed" => Some(SessionStatus::Checkpointed),
            "stopped" => Some(SessionStatus::Stopped),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }
}

/// One row in the session registry: a task name, the supervisor process
/// that owns it, and enough bookkeeping for `ralph status`/`ralph attach`
/// to find a running loop without re-reading its PRD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub task_name: String,
    pub task_dir: String,
    pub pid: u32,
    pub socket_path: String,
    pub status: SessionStatus,
    pub agent: String,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub created_at: String,
    pub updated_at: String,
}
