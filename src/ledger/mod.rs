//! The append-only task ledger (§4.1).
//!
//! Storage primitive: read-all-then-rewrite, as §4.1 explicitly permits.
//! Grounded in the teacher's `write_json_atomic` (`main.rs`): write the full
//! new contents to a sibling temp file, then rename over the original so a
//! reader never observes a partial file.

pub mod model;

use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

pub use model::{apply_changes, is_blocked, Complexity, Relation, Task, TaskOperation, TaskState,
    TaskStatus, TaskType};

use crate::error::LedgerError;

pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, terminated by a newline. Never writes a partial
    /// line: the whole file is re-materialized via temp-file + rename.
    pub fn append(&self, op: &TaskOperation) -> Result<(), LedgerError> {
        let mut existing = self.read_raw()?;
        let mut line = serde_json::to_string(op).expect("TaskOperation always serializes");
        line.push('\n');
        existing.push_str(&line);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp_path = self.path.with_extension("jsonl.tmp");
        let mut tmp = std::fs::File::create(&tmp_path).map_err(|source| LedgerError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        tmp.write_all(existing.as_bytes())
            .map_err(|source| LedgerError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        drop(tmp);
        std::fs::rename(&tmp_path, &self.path).map_err(|source| LedgerError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    fn read_raw(&self) -> Result<String, LedgerError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => Err(LedgerError::Corrupt {
                path: self.path.clone(),
                reason: "not valid UTF-8".to_string(),
            }),
            Err(source) => Err(LedgerError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Returns ops in file order. Malformed lines are skipped with a
    /// warning; missing file is an empty slice. A non-UTF8 file aborts.
    pub fn read(&self) -> Result<Vec<TaskOperation>, LedgerError> {
        let content = self.read_raw()?;
        let mut ops = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<TaskOperation>(trimmed) {
                Ok(op) => ops.push(op),
                Err(err) => warn!(
                    line = lineno + 1,
                    path = %self.path.display(),
                    error = %err,
                    "skipping malformed ledger line"
                ),
            }
        }
        Ok(ops)
    }

    pub fn create(&self, task: Task) -> Result<(), LedgerError> {
        self.append(&TaskOperation::Create {
            task: Box::new(task),
            timestamp: Utc::now(),
        })
    }

    pub fn update(
        &self,
        id: impl Into<String>,
        changes: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), LedgerError> {
        self.append(&TaskOperation::Update {
            id: id.into(),
            changes,
            timestamp: Utc::now(),
        })
    }

    pub fn link(
        &self,
        id: impl Into<String>,
        external_id: impl Into<String>,
        external_url: Option<String>,
    ) -> Result<(), LedgerError> {
        self.append(&TaskOperation::Link {
            id: id.into(),
            external_id: external_id.into(),
            external_url,
            timestamp: Utc::now(),
        })
    }

    pub fn relate(
        &self,
        id: impl Into<String>,
        relation: Relation,
        target_id: impl Into<String>,
    ) -> Result<(), LedgerError> {
        self.append(&TaskOperation::Relate {
            id: id.into(),
            relation,
            target_id: target_id.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn derive(&self) -> Result<TaskState, LedgerError> {
        Ok(derive(&self.read()?))
    }
}

/// The pure fold of §3/§4.1. `update`/`link`/`relate` against an unknown id
/// are silently ignored; a later `create` with the same id overwrites.
pub fn derive(ops: &[TaskOperation]) -> TaskState {
    let mut state = TaskState::new();
    for op in ops {
        match op {
            TaskOperation::Create { task, .. } => {
                state.insert(task.id.clone(), (**task).clone());
            }
            TaskOperation::Update {
                id,
                changes,
                timestamp,
            } => {
                if let Some(task) = state.get_mut(id) {
                    apply_changes(task, changes);
                    task.updated_at = *timestamp;
                }
            }
            TaskOperation::Link {
                id,
                external_id,
                external_url,
                timestamp,
            } => {
                if let Some(task) = state.get_mut(id) {
                    task.external_id = Some(external_id.clone());
                    task.external_url = external_url.clone();
                    task.updated_at = *timestamp;
                }
            }
            TaskOperation::Relate {
                id,
                relation,
                target_id,
                timestamp,
            } => {
                if let Some(task) = state.get_mut(id) {
                    match relation {
                        Relation::Blocks => task.blocks.push(target_id.clone()),
                        Relation::BlockedBy => task.blocked_by.push(target_id.clone()),
                        Relation::Parent => task.parent = Some(target_id.clone()),
                        Relation::Subtask => task.subtasks.push(target_id.clone()),
                    }
                    task.updated_at = *timestamp;
                }
            }
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: id.to_string(),
            task_type: TaskType::Task,
            status,
            title: format!("Task {id}"),
            description: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            estimate: None,
            actual: None,
            complexity: None,
            spec: None,
            aggregate: None,
            domain: None,
            tags: Vec::new(),
            blocked_by: Vec::new(),
            blocks: Vec::new(),
            parent: None,
            subtasks: Vec::new(),
            external_id: None,
            external_url: None,
            source: None,
        }
    }

    #[test]
    fn append_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("tasks.jsonl"));
        ledger.create(task("t1", TaskStatus::Pending)).unwrap();
        ledger
            .update(
                "t1",
                serde_json::json!({"status": "in_progress"})
                    .as_object()
                    .unwrap()
                    .clone(),
            )
            .unwrap();

        let ops = ledger.read().unwrap();
        assert_eq!(ops.len(), 2);
        let state = derive(&ops);
        assert_eq!(state["t1"].status, TaskStatus::InProgress);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("nope.jsonl"));
        assert!(ledger.read().unwrap().is_empty());
    }

    #[test]
    fn malformed_line_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");
        std::fs::write(&path, "not json\n{\"op\":\"bogus\"}\n").unwrap();
        let ledger = Ledger::new(path);
        assert_eq!(ledger.read().unwrap().len(), 0);
    }

    #[test]
    fn non_utf8_file_is_reported_as_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");
        std::fs::write(&path, [0xff, 0xfe, 0x00]).unwrap();
        let ledger = Ledger::new(path);
        assert!(matches!(ledger.read(), Err(LedgerError::Corrupt { .. })));
    }

    // Invariant 2: update/link/relate against an unknown id never grows the map.
    #[test]
    fn unknown_id_ops_are_noop() {
        let ops = vec![TaskOperation::Update {
            id: "ghost".to_string(),
            changes: serde_json::Map::new(),
            timestamp: Utc::now(),
        }];
        assert!(derive(&ops).is_empty());
    }

    // Invariant 3: a later create with the same id overwrites.
    #[test]
    fn later_create_overwrites() {
        let mut t1 = task("x", TaskStatus::Pending);
        t1.title = "first".to_string();
        let mut t2 = task("x", TaskStatus::Pending);
        t2.title = "second".to_string();
        let ops = vec![
            TaskOperation::Create {
                task: Box::new(t1),
                timestamp: Utc::now(),
            },
            TaskOperation::Create {
                task: Box::new(t2),
                timestamp: Utc::now(),
            },
        ];
        let state = derive(&ops);
        assert_eq!(state["x"].title, "second");
    }

    // Invariants 4-6: blocking.
    #[test]
    fn blocking_rules() {
        let mut state = TaskState::new();
        state.insert("a".to_string(), task("a", TaskStatus::Done));
        state.insert("b".to_string(), task("b", TaskStatus::InProgress));

        let mut t = task("t", TaskStatus::Pending);
        assert!(!is_blocked(&t, &state), "empty blockedBy never blocks");

        t.blocked_by = vec!["a".to_string()];
        assert!(!is_blocked(&t, &state), "only done blockers never block");

        t.blocked_by = vec!["b".to_string()];
        assert!(is_blocked(&t, &state), "non-terminal blocker blocks");

        t.blocked_by = vec!["missing".to_string()];
        assert!(!is_blocked(&t, &state), "dangling reference never blocks");
    }

    #[test]
    fn derive_is_deterministic() {
        let ops = vec![TaskOperation::Create {
            task: Box::new(task("a", TaskStatus::Pending)),
            timestamp: Utc::now(),
        }];
        let s1 = derive(&ops);
        let s2 = derive(&ops);
        assert_eq!(
            serde_json::to_string(&s1).unwrap(),
            serde_json::to_string(&s2).unwrap()
        );
    }
}
