//! SQLite-backed catalog of known loop sessions.
//!
//! One database file under the user's local data directory
//! (`RalphConfig::registry_db_path`) tracks every session this machine has
//! ever started, regardless of which shell spawned it, so `ralph status`
//! and `ralph attach` can find a running loop by task name alone.

use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use rusqlite::{params, Connection};

use crate::error::RegistryError;

use super::record::{SessionRecord, SessionStatus};

/// Whether `pid` still names a live process, used to distinguish a genuine
/// running-session conflict from a stale row left by a crashed supervisor.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

const SCHEMA_VERSION: i64 = 1;

/// Advisory lock file guarding the narrow read-modify-write windows
/// (conflict checks, multi-row cleans) that a single SQLite transaction
/// doesn't already serialize for us across process boundaries.
pub struct SessionRegistry {
    conn: Connection,
    lock_path: PathBuf,
}

impl SessionRegistry {
    pub fn open(db_path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let registry = Self {
            conn,
            lock_path: db_path.with_extension("lock"),
        };
        registry.migrate()?;
        Ok(registry)
    }

    fn with_lock<T>(&self, f: impl FnOnce(&Connection) -> Result<T, RegistryError>) -> Result<T, RegistryError> {
        let lock_file = File::create(&self.lock_path)?;
        lock_file.lock_exclusive()?;
        let result = f(&self.conn);
        fs2::FileExt::unlock(&lock_file)?;
        result
    }

    fn migrate(&self) -> Result<(), RegistryError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        )?;
        let current: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .ok();
        let current_version: i64 = current.and_then(|v| v.parse().ok()).unwrap_or(0);

        if current_version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS sessions (
                    task_name TEXT PRIMARY KEY,
                    task_dir TEXT NOT NULL,
                    pid INTEGER NOT NULL,
                    socket_path TEXT NOT NULL,
                    status TEXT NOT NULL,
                    agent TEXT NOT NULL,
                    current_iteration INTEGER NOT NULL,
                    max_iterations INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );",
            )?;
        }
        // Forward-only migrations land here as `if current_version < N`
        // blocks. A column drop renames the old table, creates the new
        // shape, copies surviving columns across by rowid, then drops the
        // shadow table, so existing rows keep their identity instead of
        // being deleted and reinserted.

        self.conn.execute(
            "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SCHEMA_VERSION.to_string()],
        )?;
        Ok(())
    }

    /// Register a new running session (`upsert` in the spec). Fails with
    /// `Conflict` only if a record with the same task name exists with
    /// status `running` and its `pid` is still alive, unless `force` is
    /// set. A dead-supervisor row never blocks a fresh start.
    pub fn register(&self, record: &SessionRecord) -> Result<(), RegistryError> {
        self.register_with(record, false)
    }

    pub fn register_with(&self, record: &SessionRecord, force: bool) -> Result<(), RegistryError> {
        self.with_lock(|conn| {
            let existing: Option<(String, u32)> = conn
                .query_row(
                    "SELECT status, pid FROM sessions WHERE task_name = ?1",
                    params![record.task_name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .ok();
            if !force {
                if let Some((status, pid)) = existing {
                    if SessionStatus::from_str(&status) == Some(SessionStatus::Running)
                        && pid_alive(pid)
                    {
                        return Err(RegistryError::Conflict(record.task_name.clone()));
                    }
                }
            }
            conn.execute(
                "INSERT INTO sessions (
                    task_name, task_dir, pid, socket_path, status, agent,
                    current_iteration, max_iterations, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(task_name) DO UPDATE SET
                    task_dir = excluded.task_dir,
                    pid = excluded.pid,
                    socket_path = excluded.socket_path,
                    status = excluded.status,
                    agent = excluded.agent,
                    current_iteration = excluded.current_iteration,
                    max_iterations = excluded.max_iterations,
                    updated_at = excluded.updated_at",
                params![
                    record.task_name,
                    record.task_dir,
                    record.pid,
                    record.socket_path,
                    record.status.as_str(),
                    record.agent,
                    record.current_iteration,
                    record.max_iterations,
                    record.created_at,
                    record.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_status(
        &self,
        task_name: &str,
        status: SessionStatus,
        current_iteration: u32,
        updated_at: &str,
    ) -> Result<(), RegistryError> {
        self.with_lock(|conn| {
            let rows = conn.execute(
                "UPDATE sessions SET status = ?1, current_iteration = ?2, updated_at = ?3
                 WHERE task_name = ?4",
                params![status.as_str(), current_iteration, updated_at, task_name],
            )?;
            if rows == 0 {
                return Err(RegistryError::NotFound(task_name.to_string()));
            }
            Ok(())
        })
    }

    pub fn get(&self, task_name: &str) -> Result<SessionRecord, RegistryError> {
        self.with_lock(|conn| {
            conn.query_row(
                "SELECT task_name, task_dir, pid, socket_path, status, agent,
                        current_iteration, max_iterations, created_at, updated_at
                 FROM sessions WHERE task_name = ?1",
                params![task_name],
                row_to_record,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    RegistryError::NotFound(task_name.to_string())
                }
                other => RegistryError::Db(other),
            })
        })
    }

    pub fn list(&self) -> Result<Vec<SessionRecord>, RegistryError> {
        self.with_lock(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_name, task_dir, pid, socket_path, status, agent,
                        current_iteration, max_iterations, created_at, updated_at
                 FROM sessions ORDER BY updated_at DESC",
            )?;
            let rows = stmt
                .query_map([], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Orphan sweep: records are never deleted. Every non-terminal row
    /// whose supervisor `pid` no longer exists is marked `failed` with
    /// reason `"orphaned"`; terminal rows and rows with a live pid are
    /// left untouched. Returns the number of rows orphaned.
    pub fn clean(&self) -> Result<usize, RegistryError> {
        self.with_lock(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_name, pid, status FROM sessions",
            )?;
            let candidates: Vec<(String, u32, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);

            let mut orphaned = 0usize;
            for (task_name, pid, status) in candidates {
                let is_terminal = SessionStatus::from_str(&status)
                    .map(|s| s.is_terminal())
                    .unwrap_or(true);
                if is_terminal || pid_alive(pid) {
                    continue;
                }
                conn.execute(
                    "UPDATE sessions SET status = 'failed' WHERE task_name = ?1",
                    params![task_name],
                )?;
                orphaned += 1;
            }
            Ok(orphaned)
        })
    }

}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<SessionRecord> {
    let status_str: String = row.get(4)?;
    Ok(SessionRecord {
        task_name: row.get(0)?,
        task_dir: row.get(1)?,
        pid: row.get(2)?,
        socket_path: row.get(3)?,
        status: SessionStatus::from_str(&status_str).unwrap_or(SessionStatus::Failed),
        agent: row.get(5)?,
        current_iteration: row.get(6)?,
        max_iterations: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(task_name: &str) -> SessionRecord {
        SessionRecord {
            task_name: task_name.to_string(),
            task_dir: "tasks/demo".to_string(),
            pid: 1234,
            socket_path: "/tmp/demo.sock".to_string(),
            status: SessionStatus::Running,
            agent: "claude".to_string(),
            current_iteration: 0,
            max_iterations: 50,
            created_at: "2026-07-28T00:00:00Z".to_string(),
            updated_at: "2026-07-28T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn register_and_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::open(&dir.path().join("registry.db")).unwrap();
        registry.register(&sample("demo")).unwrap();

        let fetched = registry.get("demo").unwrap();
        assert_eq!(fetched.pid, 1234);
        assert_eq!(fetched.status, SessionStatus::Running);
    }

    fn sample_with_pid(task_name: &str, pid: u32) -> SessionRecord {
        let mut record = sample(task_name);
        record.pid = pid;
        record
    }

    #[test]
    fn register_conflicts_on_live_duplicate() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::open(&dir.path().join("registry.db")).unwrap();
        let live_pid = std::process::id();
        registry.register(&sample_with_pid("demo", live_pid)).unwrap();

        let err = registry.register(&sample_with_pid("demo", live_pid)).unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
    }

    #[test]
    fn register_does_not_conflict_on_dead_pid() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::open(&dir.path().join("registry.db")).unwrap();
        // A pid vanishingly unlikely to be alive in any test environment.
        registry.register(&sample_with_pid("demo", 999_999)).unwrap();

        registry.register(&sample_with_pid("demo", std::process::id())).unwrap();
        assert_eq!(registry.get("demo").unwrap().pid, std::process::id());
    }

    #[test]
    fn register_force_overrides_live_conflict() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::open(&dir.path().join("registry.db")).unwrap();
        let live_pid = std::process::id();
        registry.register(&sample_with_pid("demo", live_pid)).unwrap();

        registry
            .register_with(&sample_with_pid("demo", live_pid), true)
            .unwrap();
    }

    #[test]
    fn register_reuses_slot_after_terminal_status() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::open(&dir.path().join("registry.db")).unwrap();
        registry.register(&sample("demo")).unwrap();
        registry
            .update_status("demo", SessionStatus::Completed, 10, "2026-07-28T01:00:00Z")
            .unwrap();

        registry.register(&sample("demo")).unwrap();
        assert_eq!(registry.get("demo").unwrap().status, SessionStatus::Running);
    }

    #[test]
    fn clean_orphans_dead_non_terminal_sessions_without_deleting() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::open(&dir.path().join("registry.db")).unwrap();
        registry
            .register(&sample_with_pid("alive", std::process::id()))
            .unwrap();
        registry.register(&sample_with_pid("dead", 999_999)).unwrap();
        registry.register(&sample_with_pid("done", 999_999)).unwrap();
        registry
            .update_status("done", SessionStatus::Completed, 10, "2026-07-28T01:00:00Z")
            .unwrap();

        let orphaned = registry.clean().unwrap();
        assert_eq!(orphaned, 1);
        assert_eq!(registry.get("alive").unwrap().status, SessionStatus::Running);
        assert_eq!(registry.get("dead").unwrap().status, SessionStatus::Failed);
        assert_eq!(registry.get("done").unwrap().status, SessionStatus::Completed);
    }
}
