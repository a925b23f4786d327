//! Durable task records, one JSON document per task

use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;

use tracing::warn;

use crate::domain::scheduling::StoreError;
use crate::domain::scheduling::TaskStore;
use crate::domain::task::Task;

const RECORD_EXTENSION: &str = "json";

/// Stores each task at `<dir>/<encoded task id>.json`.
///
/// Writes go to a temporary sibling first and are renamed into place, so a crash
/// leaves either the previous or the new record.
#[derive(Debug, Clone)]
pub struct FileTaskStore {
    dir: PathBuf,
}

impl FileTaskStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, task_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXTENSION}", encode_file_name(task_id)))
    }
}

/// Keeps `[A-Za-z0-9_-]` and percent-encodes every other byte.
pub fn encode_file_name(task_id: &str) -> String {
    let mut out = String::with_capacity(task_id.len());
    for byte in task_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

impl TaskStore for FileTaskStore {
    fn put(&self, task: &Task) -> Result<(), StoreError> {
        let path = self.record_path(&task.task_id);
        let tmp = path.with_extension("tmp");
        let body = serde_json::to_vec_pretty(task)?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let content = match std::fs::read(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable task record");
                    continue;
                }
            };
            match serde_json::from_slice::<Task>(&content) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping corrupt task record");
                }
            }
        }
        tasks.sort_by(|a, b| {
            a.received_time
                .cmp(&b.received_time)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Ok(tasks)
    }

    fn delete(&self, task_id: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.record_path(task_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use api_types::CreateTaskRequest;
    use api_types::TaskStatus;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn task(id: &str, received: i64) -> Task {
        Task::from_request(
            CreateTaskRequest {
                task_id: id.to_string(),
                engine: "trainer:1".to_string(),
                ..Default::default()
            },
            received,
        )
    }

    #[test]
    fn put_overwrites_and_get_all_orders_by_arrival() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path().join("tasks")).unwrap();

        store.put(&task("b", 20)).unwrap();
        store.put(&task("a", 10)).unwrap();
        let mut running = task("b", 20);
        running.status = TaskStatus::Running;
        running.gpus = [1, 3].into();
        store.put(&running).unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].task_id, "a");
        assert_eq!(all[1], running);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).unwrap();
        store.put(&task("a", 1)).unwrap();

        store.delete("a").unwrap();
        store.delete("a").unwrap();
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn corrupt_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).unwrap();
        store.put(&task("good", 1)).unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].task_id, "good");
    }

    #[test]
    fn task_ids_are_made_file_name_safe() {
        assert_eq!(encode_file_name("job_1-a"), "job_1-a");
        assert_eq!(encode_file_name("../etc/x"), "%2E%2E%2Fetc%2Fx");

        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).unwrap();
        store.put(&task("a/b c", 1)).unwrap();
        assert_eq!(store.get_all().unwrap()[0].task_id, "a/b c");
        assert!(dir.path().join("a%2Fb%20c.json").exists());
    }
}
