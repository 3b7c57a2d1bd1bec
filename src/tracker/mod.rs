//! Bidirectional reconciliation between the local ledger and an external
//! issue tracker (§4.5, §6.3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::{Ledger, Relation, Task, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalIssue {
    pub id: String,
    pub key: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub status: String,
    #[serde(rename = "type")]
    pub issue_type: String,
    pub parent: Option<String>,
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkType {
    Blocks,
    IsBlockedBy,
    RelatesTo,
    Duplicates,
    ParentOf,
    ChildOf,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub id: String,
    pub name: String,
    pub to: String,
}

#[derive(Debug, Clone, Default)]
pub struct IssueChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
}

/// The uniform tracker surface of §6.3. Adapters (`HttpTracker`, and this
/// crate's `NullTracker`) implement it; the concrete wire protocol per
/// vendor is out of scope (§1).
#[async_trait::async_trait]
pub trait Tracker: Send + Sync {
    async fn connect(&self) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
    async fn health_check(&self) -> anyhow::Result<(bool, Option<u64>)>;
    async fn create_issue(&self, task: &Task) -> anyhow::Result<ExternalIssue>;
    async fn update_issue(&self, id: &str, changes: &IssueChanges) -> anyhow::Result<()>;
    async fn get_issue(&self, id: &str) -> anyhow::Result<Option<ExternalIssue>>;
    async fn find_issues(&self, query: &str) -> anyhow::Result<Vec<ExternalIssue>>;
    async fn create_subtask(&self, parent_id: &str, task: &Task) -> anyhow::Result<ExternalIssue>;
    async fn link_issues(&self, from: &str, to: &str, link_type: LinkType) -> anyhow::Result<()>;
    async fn transition_issue(&self, id: &str, target_status: &str) -> anyhow::Result<()>;
    async fn get_transitions(&self, id: &str) -> anyhow::Result<Vec<Transition>>;
    async fn add_comment(&self, id: &str, body: &str) -> anyhow::Result<()>;
}

/// A no-op tracker: every call succeeds and does nothing. Used when no
/// tracker is configured, or in tests, the way the teacher's `MockBackendConfig`
/// stands in for a real LLM backend in `main.rs`.
pub struct NullTracker;

#[async_trait::async_trait]
impl Tracker for NullTracker {
    async fn connect(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn health_check(&self) -> anyhow::Result<(bool, Option<u64>)> {
        Ok((true, Some(0)))
    }
    async fn create_issue(&self, task: &Task) -> anyhow::Result<ExternalIssue> {
        let now = Utc::now();
        Ok(ExternalIssue {
            id: task.id.clone(),
            key: task.id.clone(),
            url: String::new(),
            title: task.title.clone(),
            description: task.description.clone(),
            status: "open".to_string(),
            issue_type: "task".to_string(),
            parent: task.parent.clone(),
            subtasks: task.subtasks.clone(),
            labels: task.tags.clone(),
            created: now,
            updated: now,
        })
    }
    async fn update_issue(&self, _id: &str, _changes: &IssueChanges) -> anyhow::Result<()> {
        Ok(())
    }
    async fn get_issue(&self, _id: &str) -> anyhow::Result<Option<ExternalIssue>> {
        Ok(None)
    }
    async fn find_issues(&self, _query: &str) -> anyhow::Result<Vec<ExternalIssue>> {
        Ok(Vec::new())
    }
    async fn create_subtask(&self, _parent_id: &str, task: &Task) -> anyhow::Result<ExternalIssue> {
        self.create_issue(task).await
    }
    async fn link_issues(&self, _from: &str, _to: &str, _link_type: LinkType) -> anyhow::Result<()> {
        Ok(())
    }
    async fn transition_issue(&self, _id: &str, _target_status: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn get_transitions(&self, _id: &str) -> anyhow::Result<Vec<Transition>> {
        Ok(Vec::new())
    }
    async fn add_comment(&self, _id: &str, _body: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// `reqwest`-backed adapter for HTTP issue trackers (Jira/Linear/GitHub
/// style REST APIs). Wire shape is vendor-specific and out of scope (§1);
/// this struct only carries the transport and auth the registry resolves.
pub struct HttpTracker {
    pub base_url: String,
    pub client: reqwest::Client,
    pub token: String,
}

#[async_trait::async_trait]
impl Tracker for HttpTracker {
    async fn connect(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn health_check(&self) -> anyhow::Result<(bool, Option<u64>)> {
        let start = std::time::Instant::now();
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await;
        Ok((response.is_ok(), Some(start.elapsed().as_millis() as u64)))
    }
    async fn create_issue(&self, task: &Task) -> anyhow::Result<ExternalIssue> {
        let now = Utc::now();
        let response: serde_json::Value = self
            .client
            .post(format!("{}/issues", self.base_url))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({"title": task.title, "description": task.description}))
            .send()
            .await?
            .json()
            .await
            .unwrap_or_default();
        Ok(ExternalIssue {
            id: response["id"].as_str().unwrap_or(&task.id).to_string(),
            key: response["key"].as_str().unwrap_or(&task.id).to_string(),
            url: response["url"].as_str().unwrap_or_default().to_string(),
            title: task.title.clone(),
            description: task.description.clone(),
            status: "open".to_string(),
            issue_type: "task".to_string(),
            parent: task.parent.clone(),
            subtasks: task.subtasks.clone(),
            labels: task.tags.clone(),
            created: now,
            updated: now,
        })
    }
    async fn update_issue(&self, id: &str, changes: &IssueChanges) -> anyhow::Result<()> {
        self.client
            .patch(format!("{}/issues/{id}", self.base_url))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "title": changes.title,
                "description": changes.description,
                "status": changes.status,
            }))
            .send()
            .await?;
        Ok(())
    }
    async fn get_issue(&self, _id: &str) -> anyhow::Result<Option<ExternalIssue>> {
        Ok(None)
    }
    async fn find_issues(&self, _query: &str) -> anyhow::Result<Vec<ExternalIssue>> {
        Ok(Vec::new())
    }
    async fn create_subtask(&self, _parent_id: &str, task: &Task) -> anyhow::Result<ExternalIssue> {
        self.create_issue(task).await
    }
    async fn link_issues(&self, _from: &str, _to: &str, _link_type: LinkType) -> anyhow::Result<()> {
        Ok(())
    }
    async fn transition_issue(&self, id: &str, target_status: &str) -> anyhow::Result<()> {
        self.client
            .post(format!("{}/issues/{id}/transitions", self.base_url))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({"to": target_status}))
            .send()
            .await?;
        Ok(())
    }
    async fn get_transitions(&self, _id: &str) -> anyhow::Result<Vec<Transition>> {
        Ok(Vec::new())
    }
    async fn add_comment(&self, id: &str, body: &str) -> anyhow::Result<()> {
        self.client
            .post(format!("{}/issues/{id}/comments", self.base_url))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({"body": body}))
            .send()
            .await?;
        Ok(())
    }
}

/// Resolves `RALPH_{T}_TOKEN`, then `{T}_TOKEN`, where `T` is the tracker
/// type uppercased with hyphens turned to underscores (§6.3).
pub fn resolve_auth(tracker_type: &str) -> Option<(String, Option<String>)> {
    let normalized = tracker_type.to_uppercase().replace('-', "_");
    let token = std::env::var(format!("RALPH_{normalized}_TOKEN"))
        .or_else(|_| std::env::var(format!("{normalized}_TOKEN")))
        .ok()?;
    let email = std::env::var(format!("RALPH_{normalized}_EMAIL"))
        .or_else(|_| std::env::var(format!("{normalized}_EMAIL")))
        .ok();
    Some((token, email))
}

pub struct TrackerRegistry {
    factories: HashMap<String, Box<dyn Fn(&str) -> Box<dyn Tracker> + Send + Sync>>,
}

impl Default for TrackerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerRegistry {
    pub fn new() -> Self {
        let mut factories: HashMap<String, Box<dyn Fn(&str) -> Box<dyn Tracker> + Send + Sync>> =
            HashMap::new();
        factories.insert(
            "http".to_string(),
            Box::new(|token: &str| {
                Box::new(HttpTracker {
                    base_url: String::new(),
                    client: reqwest::Client::new(),
                    token: token.to_string(),
                }) as Box<dyn Tracker>
            }),
        );
        Self { factories }
    }

    /// Builds a tracker for `tracker_type`, or `None` if no token is
    /// configured for it (§6.3: missing token disables sync for that type).
    pub fn build(&self, tracker_type: &str) -> Option<Box<dyn Tracker>> {
        let (token, _email) = resolve_auth(tracker_type)?;
        self.factories.get(tracker_type).map(|factory| factory(&token))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PerTaskSyncConfig {
    pub auto_create: bool,
    pub auto_transition: bool,
    pub auto_comment: bool,
    pub status_map: HashMap<TaskStatus, String>,
}

/// Per-task sync (§4.5 step 1-3). Failures are caught and logged by the
/// caller; this function itself only returns the ledger ops to append.
pub async fn sync_task(
    task: &Task,
    tracker: &dyn Tracker,
    config: &PerTaskSyncConfig,
    success: bool,
    ledger: &Ledger,
) {
    let mut external_id = task.external_id.clone();

    if config.auto_create && external_id.is_none() {
        match tracker.create_issue(task).await {
            Ok(issue) => {
                if let Err(err) = ledger.link(&task.id, issue.key.clone(), Some(issue.url.clone()))
                {
                    tracing::warn!(task = %task.id, error = %err, "failed to append link op");
                }
                external_id = Some(issue.key);
            }
            Err(err) => {
                tracing::warn!(task = %task.id, error = %err, "tracker create_issue failed");
            }
        }
    }

    if config.auto_transition {
        if let Some(ref id) = external_id {
            if let Some(target) = config.status_map.get(&task.status) {
                if let Err(err) = tracker.transition_issue(id, target).await {
                    tracing::warn!(task = %task.id, error = %err, "tracker transition_issue failed");
                }
            }
        }
    }

    if config.auto_comment {
        if let Some(ref id) = external_id {
            let body = if success {
                "Task completed successfully by Ralph.".to_string()
            } else {
                format!("Task marked as {:?} by Ralph.", task.status)
            };
            if let Err(err) = tracker.add_comment(id, &body).await {
                tracing::warn!(task = %task.id, error = %err, "tracker add_comment failed");
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncPhaseResult {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Auto,
    PushOnly,
    PullOnly,
}

/// `mapStatusToRalph`: reverse map, then inverse of the forward map
/// case-insensitively, then heuristic substring matches, defaulting to
/// `pending` (§4.5).
pub fn map_status_to_ralph(
    remote: &str,
    reverse_status_map: &HashMap<String, TaskStatus>,
    status_map: &HashMap<TaskStatus, String>,
) -> TaskStatus {
    if let Some(status) = reverse_status_map.get(remote) {
        return *status;
    }
    let remote_lower = remote.to_lowercase();
    for (status, mapped) in status_map {
        if mapped.to_lowercase() == remote_lower {
            return *status;
        }
    }
    if remote_lower.contains("done") || remote_lower.contains("closed") || remote_lower.contains("resolved") {
        return TaskStatus::Done;
    }
    if remote_lower.contains("progress") || remote_lower.contains("active") {
        return TaskStatus::InProgress;
    }
    if remote_lower.contains("review") {
        return TaskStatus::Review;
    }
    if remote_lower.contains("block") {
        return TaskStatus::Blocked;
    }
    TaskStatus::Pending
}

/// Two-phase bidirectional sync: pull (tracker → ledger) then push
/// (ledger → tracker). In `Auto` mode the tracker wins on conflict; explicit
/// push/pull modes bypass conflict resolution entirely (§4.5). `config`
/// supplies the ralph-status <-> remote-status mapping used by both phases;
/// `map_status_to_ralph` inverts it for the pull direction.
pub async fn sync_bidirectional(
    tracker: &dyn Tracker,
    ledger: &Ledger,
    mode: SyncMode,
    config: &PerTaskSyncConfig,
) -> anyhow::Result<(SyncPhaseResult, SyncPhaseResult)> {
    let reverse_status_map: HashMap<String, TaskStatus> = config
        .status_map
        .iter()
        .map(|(status, remote)| (remote.clone(), *status))
        .collect();

    let pull_start = std::time::Instant::now();
    let mut pull_result = SyncPhaseResult::default();
    if matches!(mode, SyncMode::Auto | SyncMode::PullOnly) {
        let state = ledger.derive()?;
        for task in state.values() {
            let Some(ref external_id) = task.external_id else {
                continue;
            };
            match tracker.get_issue(external_id).await {
                Ok(Some(issue)) => {
                    let remote_status =
                        map_status_to_ralph(&issue.status, &reverse_status_map, &config.status_map);
                    if matches!(mode, SyncMode::Auto) && remote_status != task.status {
                        let mut changes = serde_json::Map::new();
                        changes.insert(
                            "status".to_string(),
                            serde_json::to_value(remote_status).unwrap(),
                        );
                        changes.insert(
                            "source".to_string(),
                            serde_json::Value::String("tracker".to_string()),
                        );
                        ledger.update(&task.id, changes)?;
                        pull_result.updated += 1;
                    } else {
                        pull_result.skipped += 1;
                    }
                    pull_result.processed += 1;
                }
                Ok(None) => pull_result.skipped += 1,
                Err(err) => pull_result.errors.push(err.to_string()),
            }
        }
    }
    pull_result.duration_ms = pull_start.elapsed().as_millis() as u64;

    let push_start = std::time::Instant::now();
    let mut push_result = SyncPhaseResult::default();
    if matches!(mode, SyncMode::Auto | SyncMode::PushOnly) {
        let state = ledger.derive()?;
        for task in state.values() {
            match &task.external_id {
                None => {
                    if let Ok(issue) = tracker.create_issue(task).await {
                        ledger.link(&task.id, issue.key, Some(issue.url))?;
                        push_result.created += 1;
                    } else {
                        push_result.errors.push(format!("create failed for {}", task.id));
                    }
                    push_result.processed += 1;
                }
                Some(id) => {
                    let changes = IssueChanges {
                        title: Some(task.title.clone()),
                        description: Some(task.description.clone()),
                        status: config.status_map.get(&task.status).cloned(),
                    };
                    match tracker.update_issue(id, &changes).await {
                        Ok(()) => push_result.updated += 1,
                        Err(err) => push_result
                            .errors
                            .push(format!("update failed for {}: {err}", task.id)),
                    }
                    push_result.processed += 1;
                }
            }
        }
    }
    push_result.duration_ms = push_start.elapsed().as_millis() as u64;

    Ok((pull_result, push_result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_heuristics_fall_back_by_substring() {
        let empty = HashMap::new();
        assert_eq!(
            map_status_to_ralph("Closed", &empty, &empty),
            TaskStatus::Done
        );
        assert_eq!(
            map_status_to_ralph("In Progress", &empty, &empty),
            TaskStatus::InProgress
        );
        assert_eq!(
            map_status_to_ralph("Code Review", &empty, &empty),
            TaskStatus::Review
        );
        assert_eq!(
            map_status_to_ralph("Blocked", &empty, &empty),
            TaskStatus::Blocked
        );
        assert_eq!(
            map_status_to_ralph("Backlog", &empty, &empty),
            TaskStatus::Pending
        );
    }

    #[test]
    fn reverse_map_takes_priority() {
        let mut reverse = HashMap::new();
        reverse.insert("Triage".to_string(), TaskStatus::Blocked);
        assert_eq!(
            map_status_to_ralph("Triage", &reverse, &HashMap::new()),
            TaskStatus::Blocked
        );
    }

    #[test]
    fn auth_resolution_prefers_prefixed_var() {
        std::env::set_var("RALPH_MYTRACKER_TOKEN", "prefixed");
        std::env::set_var("MYTRACKER_TOKEN", "bare");
        let (token, _email) = resolve_auth("mytracker").unwrap();
        assert_eq!(token, "prefixed");
        std::env::remove_var("RALPH_MYTRACKER_TOKEN");
        std::env::remove_var("MYTRACKER_TOKEN");
    }

    #[test]
    fn missing_token_disables_sync() {
        std::env::remove_var("RALPH_NOPE_TOKEN");
        std::env::remove_var("NOPE_TOKEN");
        assert!(resolve_auth("nope").is_none());
    }

    struct CountingTracker {
        create_calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Tracker for CountingTracker {
        async fn connect(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn health_check(&self) -> anyhow::Result<(bool, Option<u64>)> {
            Ok((true, Some(0)))
        }
        async fn create_issue(&self, task: &Task) -> anyhow::Result<ExternalIssue> {
            self.create_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let now = task.created_at;
            Ok(ExternalIssue {
                id: "remote-1".to_string(),
                key: "PROJ-1".to_string(),
                url: "https://tracker.example/PROJ-1".to_string(),
                title: task.title.clone(),
                description: task.description.clone(),
                status: "open".to_string(),
                issue_type: "task".to_string(),
                parent: None,
                subtasks: Vec::new(),
                labels: Vec::new(),
                created: now,
                updated: now,
            })
        }
        async fn update_issue(&self, _id: &str, _changes: &IssueChanges) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get_issue(&self, _id: &str) -> anyhow::Result<Option<ExternalIssue>> {
            Ok(None)
        }
        async fn find_issues(&self, _query: &str) -> anyhow::Result<Vec<ExternalIssue>> {
            Ok(Vec::new())
        }
        async fn create_subtask(&self, _parent_id: &str, task: &Task) -> anyhow::Result<ExternalIssue> {
            self.create_issue(task).await
        }
        async fn link_issues(&self, _from: &str, _to: &str, _link_type: LinkType) -> anyhow::Result<()> {
            Ok(())
        }
        async fn transition_issue(&self, _id: &str, _target_status: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get_transitions(&self, _id: &str) -> anyhow::Result<Vec<Transition>> {
            Ok(Vec::new())
        }
        async fn add_comment(&self, _id: &str, _body: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn unlinked_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            task_type: crate::ledger::TaskType::Task,
            status: TaskStatus::Done,
            title: "Ship the thing".to_string(),
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

    // S7: unlinked task, autoCreate=true. First sync creates the issue and
    // links it; a second sync against the now-linked task must not create
    // a second issue.
    #[tokio::test]
    async fn auto_create_links_once_then_skips() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("tasks.jsonl"));
        let task = unlinked_task("t1");
        ledger.create(task.clone()).unwrap();

        let tracker = CountingTracker {
            create_calls: std::sync::atomic::AtomicUsize::new(0),
        };
        let config = PerTaskSyncConfig {
            auto_create: true,
            auto_transition: false,
            auto_comment: false,
            status_map: HashMap::new(),
        };

        sync_task(&task, &tracker, &config, true, &ledger).await;
        assert_eq!(
            tracker.create_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        let state = ledger.derive().unwrap();
        let linked = state.get("t1").unwrap().clone();
        assert_eq!(linked.external_id.as_deref(), Some("PROJ-1"));

        sync_task(&linked, &tracker, &config, true, &ledger).await;
        assert_eq!(
            tracker.create_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }
}
