//! A crash-safe durable queue: one JSON file per pending [`Task`] on disk,
//! written atomically (temp file + rename) so a process kill mid-write never
//! leaves a half-written task behind. On restart, `list_ids` lets the
//! dispatcher replay whatever was still pending when the process last
//! stopped.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::model::Task;

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

/// A directory of one `{id}.json` file per pending task.
#[derive(Debug, Clone)]
pub struct FileQueue {
    dir: PathBuf,
}

impl FileQueue {
    /// Opens (creating if necessary) the queue directory at `dir`. The
    /// directory is created with mode `0700` on Unix; files written into it
    /// are created with mode `0600`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            #[cfg(unix)]
            {
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(&dir)
                    .with_context(|| format!("creating queue directory {}", dir.display()))?;
            }
            #[cfg(not(unix))]
            {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("creating queue directory {}", dir.display()))?;
            }
        }
        Ok(FileQueue { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Writes `task` to disk, creating or overwriting its file. Writes go to
    /// a sibling temp file first and are renamed into place, so a reader
    /// never observes a partially-written task.
    pub fn put(&self, task: &Task) -> Result<()> {
        let final_path = self.path_for(&task.id);
        let tmp_path = self.dir.join(format!("{}.tmp-{}", task.id, crate::model::random_hex(8)));

        let json = serde_json::to_vec_pretty(task).context("serializing task")?;

        {
            let mut opts = std::fs::OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(unix)]
            opts.mode(0o600);
            let mut file = opts
                .open(&tmp_path)
                .with_context(|| format!("creating temp file {}", tmp_path.display()))?;
            file.write_all(&json).context("writing task bytes")?;
            file.sync_all().context("syncing task file")?;
        }

        std::fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("renaming into place {}", final_path.display()))?;

        Ok(())
    }

    /// Loads one task by id, if its file still exists.
    pub fn get(&self, id: &str) -> Result<Option<Task>> {
        let path = self.path_for(id);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).with_context(|| format!("parsing task {id}"))?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading task {}", path.display())),
        }
    }

    /// Removes a task's file. Idempotent: a missing file is not an error.
    pub fn remove(&self, id: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("removing task file"),
        }
    }

    /// Lists every task id currently persisted, sorted lexicographically.
    /// Since ids are `<millis>-<hex>`, this approximates FIFO on creation
    /// time without needing to open and parse every file first.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir).context("reading queue directory")? {
            let entry = entry.context("reading queue directory entry")?;
            let path = entry.path();
            if let Some(id) = task_id_from_path(&path) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Loads every still-pending task, for startup replay.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for id in self.list_ids()? {
            if let Some(task) = self.get(&id)? {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }
}

fn task_id_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(".json").map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{generate_id, now_millis, AddressList, HeaderMap, ParsedEmail};
    use chrono::Utc;

    fn sample_task() -> Task {
        Task {
            id: generate_id(12),
            created_at: Utc::now(),
            parsed: ParsedEmail {
                from: AddressList::single("a@example.com", None),
                to: AddressList::single("b@example.com", None),
                cc: AddressList::default(),
                subject: "hi".to_string(),
                text: "body".to_string(),
                html: String::new(),
                headers: HeaderMap::default(),
                attachment_info: Vec::new(),
                skipped_attachments: Vec::new(),
                storage_summary: None,
            },
            failed_webhooks: None,
            attempts: 0,
            last_error: None,
            updated_at: None,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();
        let task = sample_task();

        queue.put(&task).unwrap();
        let loaded = queue.get(&task.id).unwrap().expect("task should exist");

        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.parsed.subject, "hi");
    }

    #[test]
    fn get_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();
        assert!(queue.get("does-not-exist").unwrap().is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();
        let task = sample_task();
        queue.put(&task).unwrap();

        queue.remove(&task.id).unwrap();
        queue.remove(&task.id).unwrap();

        assert!(queue.get(&task.id).unwrap().is_none());
    }

    #[test]
    fn list_ids_only_reports_json_files_and_ignores_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();
        let task = sample_task();
        queue.put(&task).unwrap();

        // A stray temp file from an interrupted write shouldn't surface.
        std::fs::write(dir.path().join("stray.tmp-deadbeef"), b"{}").unwrap();

        let ids = queue.list_ids().unwrap();
        assert_eq!(ids, vec![task.id.clone()]);
    }

    #[test]
    fn list_ids_is_sorted_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();

        let mut first = sample_task();
        first.id = "100-aaaa".to_string();
        let mut second = sample_task();
        second.id = "200-bbbb".to_string();

        queue.put(&second).unwrap();
        queue.put(&first).unwrap();

        assert_eq!(queue.list_ids().unwrap(), vec![first.id, second.id]);
    }

    #[test]
    fn list_tasks_is_sorted_by_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();

        let mut first = sample_task();
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = sample_task();

        queue.put(&second).unwrap();
        queue.put(&first).unwrap();

        let tasks = queue.list_tasks().unwrap();
        assert_eq!(tasks[0].id, first.id);
        assert_eq!(tasks[1].id, second.id);
        let _ = now_millis();
    }

    #[cfg(unix)]
    #[test]
    fn files_are_created_with_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();
        let task = sample_task();
        queue.put(&task).unwrap();

        let meta = std::fs::metadata(queue.path_for(&task.id)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
