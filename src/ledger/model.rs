//! Task and TaskOperation data model (§3).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Epic,
    Feature,
    Task,
    Subtask,
    Bug,
    Refactor,
    Docs,
    Test,
    Spike,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Discovered,
    Pending,
    InProgress,
    Review,
    Blocked,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Blocks,
    BlockedBy,
    Parent,
    Subtask,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    /// Set to `"tracker"` when the last write came from tracker sync
    /// overwriting local state (§4.5, §9), so reviewers can tell the two
    /// apart without diffing the ledger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A ledger entry. Tagged by `op`, carrying its own `timestamp` (§3).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TaskOperation {
    Create {
        task: Box<Task>,
        timestamp: DateTime<Utc>,
    },
    Update {
        id: String,
        changes: serde_json::Map<String, serde_json::Value>,
        timestamp: DateTime<Utc>,
    },
    Link {
        id: String,
        external_id: String,
        #[serde(default)]
        external_url: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Relate {
        id: String,
        relation: Relation,
        target_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl TaskOperation {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TaskOperation::Create { timestamp, .. }
            | TaskOperation::Update { timestamp, .. }
            | TaskOperation::Link { timestamp, .. }
            | TaskOperation::Relate { timestamp, .. } => *timestamp,
        }
    }
}

/// Derived state: `id -> Task`, produced by folding the ledger (§3, §4.1).
pub type TaskState = BTreeMap<String, Task>;

/// `isBlocked(task, state)` per §3: any `blockedBy` id resolving to a task
/// whose status is not `done`/`cancelled`. A dangling reference never blocks.
pub fn is_blocked(task: &Task, state: &TaskState) -> bool {
    task.blocked_by.iter().any(|blocker_id| {
        state
            .get(blocker_id)
            .is_some_and(|blocker| !blocker.status.is_terminal())
    })
}

/// Apply one `changes` map onto a task record (shallow merge, §4.1).
pub fn apply_changes(task: &mut Task, changes: &serde_json::Map<String, serde_json::Value>) {
    let mut value = serde_json::to_value(&*task).expect("Task always serializes");
    if let serde_json::Value::Object(ref mut obj) = value {
        for (k, v) in changes {
            obj.insert(k.clone(), v.clone());
        }
    }
    if let Ok(merged) = serde_json::from_value::<Task>(value) {
        *task = merged;
    }
}
