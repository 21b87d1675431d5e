//! In-memory snapshot of one loop's live state, shared between the
//! LoopRunner (sole writer) and RPC `get_status` readers.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::registry::SessionStatus;

const RECENT_OUTPUT_CAPACITY: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub task_name: String,
    pub task_dir: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub current_story: Option<String>,
    pub agent: String,
    pub status: SessionStatus,
    pub interactive_mode: bool,
    pub started_at: String,
    pub updated_at: String,
    pub recent_output: VecDeque<String>,
}

impl SessionState {
    pub fn new(task_name: String, task_dir: String, agent: String, max_iterations: u32, now: String) -> Self {
        Self {
            task_name,
            task_dir,
            iteration: 0,
            max_iterations,
            current_story: None,
            agent,
            status: SessionStatus::Running,
            interactive_mode: false,
            started_at: now.clone(),
            updated_at: now,
            recent_output: VecDeque::with_capacity(RECENT_OUTPUT_CAPACITY),
        }
    }

    /// Append a line to the bounded output FIFO, dropping the oldest entry
    /// once at capacity.
    pub fn push_output_line(&mut self, line: String) {
        if self.recent_output.len() >= RECENT_OUTPUT_CAPACITY {
            self.recent_output.pop_front();
        }
        self.recent_output.push_back(line);
    }
}

/// Thread-safe handle shared by the loop runner and the RPC server.
#[derive(Clone)]
pub struct SharedSessionState {
    inner: Arc<RwLock<SessionState>>,
}

impl SharedSessionState {
    pub fn new(state: SessionState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn snapshot(&self) -> SessionState {
        self.inner.read().await.clone()
    }

    pub async fn mutate(&self, f: impl FnOnce(&mut SessionState)) {
        let mut guard = self.inner.write().await;
        f(&mut guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_output_drops_oldest_past_capacity() {
        let mut state = SessionState::new(
            "demo".into(),
            "tasks/demo".into(),
            "claude".into(),
            50,
            "2026-07-28T00:00:00Z".into(),
        );
        for i in 0..(RECENT_OUTPUT_CAPACITY + 10) {
            state.push_output_line(format!("line {i}"));
        }
        assert_eq!(state.recent_output.len(), RECENT_OUTPUT_CAPACITY);
        assert_eq!(state.recent_output.front().unwrap(), "line 10");
    }

    #[tokio::test]
    async fn shared_state_mutate_is_visible_to_snapshot() {
        let shared = SharedSessionState::new(SessionState::new(
            "demo".into(),
            "tasks/demo".into(),
            "claude".into(),
            50,
            "2026-07-28T00:00:00Z".into(),
        ));
        shared.mutate(|s| s.iteration = 3).await;
        assert_eq!(shared.snapshot().await.iteration, 3);
    }
}
