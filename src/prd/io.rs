//! Loading and durably persisting PRD documents on disk.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::PrdError;

use super::model::Prd;

pub fn make_prd_filename() -> &'static str {
    "prd.json"
}

/// Read and validate the PRD at `task_dir/prd.json`.
pub fn load(task_dir: &Path) -> Result<Prd, PrdError> {
    let path = task_dir.join(make_prd_filename());
    if !path.exists() {
        return Err(PrdError::NotFound(path));
    }
    let text = fs::read_to_string(&path).map_err(|source| PrdError::Io {
        path: path.clone(),
        source,
    })?;
    Prd::parse(&text).map_err(|e| match e {
        PrdError::InvalidJson { source, .. } => PrdError::InvalidJson {
            path: path.clone(),
            source,
        },
        other => other,
    })
}

/// Write the PRD back to `task_dir/prd.json`, via a temp file in the same
/// directory followed by an atomic rename, so a crash mid-write never
/// leaves a truncated or partially-written PRD on disk.
pub fn save(task_dir: &Path, prd: &Prd) -> Result<(), PrdError> {
    let path = task_dir.join(make_prd_filename());
    let json = serde_json::to_string_pretty(prd).map_err(|source| PrdError::InvalidJson {
        path: path.clone(),
        source,
    })?;

    let tmp_path: PathBuf = path.with_extension("json.tmp");
    {
        let mut tmp_file = fs::File::create(&tmp_path).map_err(|source| PrdError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        tmp_file
            .write_all(json.as_bytes())
            .map_err(|source| PrdError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        tmp_file.sync_all().map_err(|source| PrdError::Io {
            path: tmp_path.clone(),
            source,
        })?;
    }
    fs::rename(&tmp_path, &path).map_err(|source| PrdError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(())
}

/// Scan `./tasks/*/prd.json` for every PRD the current working directory
/// knows about, used by `ralph status` with no task argument.
pub fn discover_tasks(root: &Path) -> Vec<PathBuf> {
    let tasks_dir = root.join("tasks");
    if !tasks_dir.is_dir() {
        return Vec::new();
    }
    walkdir::WalkDir::new(&tasks_dir)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name() == make_prd_filename())
        .filter_map(|entry| entry.path().parent().map(Path::to_path_buf))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_sample(dir: &Path) {
        fs::write(
            dir.join("prd.json"),
            r#"{
                "schemaVersion": "2.0",
                "project": "demo",
                "taskDir": "tasks/demo",
                "branchName": "ralph/demo",
                "type": "feature",
                "description": "demo",
                "autoMerge": false,
                "userStories": [
                    {"id": "US-001", "title": "a", "acceptanceCriteria": ["ok"]}
                ]
            }"#,
        )
        .unwrap();
    }

    #[test]
    fn load_missing_prd_errors() {
        let dir = TempDir::new().unwrap();
        let err = load(dir.path()).unwrap_err();
        assert!(matches!(err, PrdError::NotFound(_)));
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = TempDir::new().unwrap();
        write_sample(dir.path());
        let mut prd = load(dir.path()).unwrap();
        prd.user_stories[0].passes = true;
        save(dir.path(), &prd).unwrap();

        let reloaded = load(dir.path()).unwrap();
        assert!(reloaded.user_stories[0].passes);
        assert!(!dir.path().join("prd.json.tmp").exists());
    }

    #[test]
    fn discover_tasks_finds_nested_prds() {
        let dir = TempDir::new().unwrap();
        let task_dir = dir.path().join("tasks").join("demo");
        fs::create_dir_all(&task_dir).unwrap();
        write_sample(&task_dir);

        let found = discover_tasks(dir.path());
        assert_eq!(found, vec![task_dir]);
    }
}
