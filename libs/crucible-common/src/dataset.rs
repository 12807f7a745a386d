use crate::types::Task;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Dataset store semantics - the single durable owner of all tasks.
/// One writer (the round orchestrator), whole-file rewrites at round
/// boundaries, no partial updates.

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to access dataset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse dataset {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize dataset: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Clone)]
pub struct DatasetStore {
    path: PathBuf,
}

impl DatasetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the ordered task list
    pub fn load(&self) -> DatasetResult<Vec<Task>> {
        let content = fs::read_to_string(&self.path).map_err(|source| DatasetError::Io {
            path: self.path.clone(),
            source,
        })?;

        let tasks: Vec<Task> = serde_json::from_str(&content).map_err(|source| DatasetError::Parse {
            path: self.path.clone(),
            source,
        })?;

        info!(path = %self.path.display(), tasks = tasks.len(), "Dataset loaded");
        Ok(tasks)
    }

    /// Persist the full task list
    /// Writes a sibling temp file, fsyncs, then renames over the target so a
    /// crash leaves either the previous file or the new one, never a torn write.
    pub fn save(&self, tasks: &[Task]) -> DatasetResult<()> {
        let bytes = to_pretty_json(tasks)?;
        let io_err = |source| DatasetError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let file_name = self
            .path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("dataset.json");
        let tmp = self
            .path
            .with_file_name(format!(".{}.tmp.{}", file_name, std::process::id()));

        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;

        debug!(path = %self.path.display(), tasks = tasks.len(), bytes = bytes.len(), "Dataset saved");
        Ok(())
    }
}

/// Four-space indented JSON, matching the layout of existing dataset files
fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    buf.push(b'\n');
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("dataset.json"));

        let mut task = Task::new("snake", "Build snake", "class Snake: pass");
        task.push_attempt("impl".into(), "tests".into());
        task.record_score(vec![1.0]);
        store.save(&[task.clone()]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, vec![task]);
        assert_eq!(loaded[0].status, TaskStatus::Done);
    }

    #[test]
    fn test_save_overwrites_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("dataset.json"));

        store.save(&[Task::new("a", "", "")]).unwrap();
        store.save(&[Task::new("b", "", ""), Task::new("c", "", "")]).unwrap();

        let names: Vec<_> = store.load().unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["b", "c"]);

        let entries = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_saved_file_uses_four_space_indent() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("dataset.json"));
        store.save(&[Task::new("a", "", "")]).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\n        \"name\": \"a\""));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("missing.json"));
        assert!(matches!(store.load(), Err(DatasetError::Io { .. })));
    }

    #[test]
    fn test_load_garbage_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        fs::write(&path, "{ not json").unwrap();

        let store = DatasetStore::new(path);
        assert!(matches!(store.load(), Err(DatasetError::Parse { .. })));
    }
}
