//! Picks the next task, drives the inner iteration loop, and runs the
//! outer loop with its time/task caps (§4.2).

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::ledger::{is_blocked, Ledger, Task, TaskState, TaskStatus};

/// Total order of §4.2: exclude terminal/review/blocked statuses, exclude
/// blocked tasks, prefer resuming `in_progress` over starting fresh, then
/// earliest `createdAt`.
pub fn pick_next(state: &TaskState) -> Option<&Task> {
    let candidates: Vec<&Task> = state
        .values()
        .filter(|task| {
            !matches!(
                task.status,
                TaskStatus::Done | TaskStatus::Cancelled | TaskStatus::Review | TaskStatus::Blocked
            )
        })
        .filter(|task| !is_blocked(task, state))
        .collect();

    candidates
        .iter()
        .find(|task| task.status == TaskStatus::InProgress)
        .copied()
        .or_else(|| candidates.into_iter().min_by_key(|task| task.created_at))
}

#[derive(Debug, Clone)]
pub enum IterationOutcome {
    Complete { artifacts: Vec<String> },
    Continue { reason: String },
    Error { reason: String },
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub success: bool,
    pub iterations: u32,
    pub reason: Option<String>,
}

pub struct IterationLimits {
    pub max_iterations_per_task: u32,
    pub max_time_per_task: Duration,
}

/// Runs the inner loop for one task already marked `in_progress`. Takes a
/// future-returning closure rather than `async fn` in argument position so
/// callers can close over executor/LLM state across iterations.
pub async fn run_task_loop<Fut>(
    task: &Task,
    limits: &IterationLimits,
    mut execute_iteration: impl FnMut(&Task, u32) -> Fut,
    mut on_event: impl FnMut(u32, &IterationOutcome),
) -> TaskResult
where
    Fut: Future<Output = IterationOutcome>,
{
    let start = Instant::now();
    let mut i = 0u32;
    while i < limits.max_iterations_per_task && start.elapsed() < limits.max_time_per_task {
        i += 1;
        let outcome = execute_iteration(task, i).await;
        on_event(i, &outcome);
        match outcome {
            IterationOutcome::Complete { .. } => {
                return TaskResult {
                    success: true,
                    iterations: i,
                    reason: None,
                };
            }
            IterationOutcome::Error { reason } => {
                return TaskResult {
                    success: false,
                    iterations: i,
                    reason: Some(reason),
                };
            }
            IterationOutcome::Continue { .. } => {}
        }
    }

    let reason = if start.elapsed() >= limits.max_time_per_task {
        "Time limit exceeded"
    } else {
        "Max iterations reached"
    };
    TaskResult {
        success: false,
        iterations: i,
        reason: Some(reason.to_string()),
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopResult {
    pub tasks_completed: u32,
    pub tasks_failed: u32,
}

pub struct OuterLoopLimits {
    pub max_tasks_per_run: u32,
    pub max_time_per_run: Duration,
}

/// Appends the side-effecting ledger ops the outer loop needs. Kept as a
/// trait so `run_loop` stays agnostic of the ledger/executor/git stack.
/// `flush` is async because a successful flush may also commit (§6.4).
#[async_trait::async_trait]
pub trait LoopSink {
    fn mark_in_progress(&self, task: &Task);
    fn record_completion(&self, task_id: &str, result: &TaskResult);
    async fn flush(&mut self) -> anyhow::Result<()>;
    fn rollback(&mut self);
}

/// The outer loop of §4.2. `run_inner` is the caller-provided inner-loop
/// runner so this function has no dependency on the LLM/executor stack.
pub async fn run_loop<Fut>(
    ledger: &Ledger,
    limits: &OuterLoopLimits,
    mut run_inner: impl FnMut(&Task) -> Fut,
    mut sink: impl LoopSink,
) -> anyhow::Result<LoopResult>
where
    Fut: Future<Output = TaskResult>,
{
    let start = Instant::now();
    let mut result = LoopResult::default();

    loop {
        if result.tasks_completed + result.tasks_failed >= limits.max_tasks_per_run {
            break;
        }
        if start.elapsed() >= limits.max_time_per_run {
            break;
        }

        let state = ledger.derive()?;
        let Some(task) = pick_next(&state) else {
            break;
        };
        let task = task.clone();

        sink.mark_in_progress(&task);
        let task_result = run_inner(&task).await;

        if task_result.success {
            sink.flush().await?;
            result.tasks_completed += 1;
        } else {
            sink.rollback();
            result.tasks_failed += 1;
        }
        sink.record_completion(&task.id, &task_result);
    }

    Ok(result)
}

pub fn update_status(
    ledger: &Ledger,
    task_id: &str,
    status: TaskStatus,
    reason: Option<&str>,
) -> anyhow::Result<()> {
    let mut changes = serde_json::Map::new();
    changes.insert("status".to_string(), serde_json::to_value(status)?);
    if let Some(reason) = reason {
        changes.insert("lastReason".to_string(), serde_json::Value::String(reason.to_string()));
    }
    ledger.update(task_id, changes)?;
    Ok(())
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn task(id: &str, status: TaskStatus, created_offset_secs: i64) -> Task {
        Task {
            id: id.to_string(),
            task_type: crate::ledger::TaskType::Task,
            status,
            title: id.to_string(),
            description: String::new(),
            created_at: Utc::now() + ChronoDuration::seconds(created_offset_secs),
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

    // S1: sequential scheduling.
    #[test]
    fn sequential_scheduling() {
        let mut state = TaskState::new();
        state.insert("t1".to_string(), task("t1", TaskStatus::Pending, 0));
        state.insert("t2".to_string(), task("t2", TaskStatus::Pending, 10));

        assert_eq!(pick_next(&state).unwrap().id, "t1");

        state.get_mut("t1").unwrap().status = TaskStatus::InProgress;
        assert_eq!(pick_next(&state).unwrap().id, "t1");

        state.get_mut("t1").unwrap().status = TaskStatus::Done;
        assert_eq!(pick_next(&state).unwrap().id, "t2");
    }

    // S2: dependency gating.
    #[test]
    fn dependency_gating() {
        let mut state = TaskState::new();
        state.insert("t1".to_string(), task("t1", TaskStatus::Pending, 0));
        let mut t2 = task("t2", TaskStatus::Pending, 1);
        t2.blocked_by = vec!["t1".to_string()];
        state.insert("t2".to_string(), t2);

        assert_eq!(pick_next(&state).unwrap().id, "t1");

        state.get_mut("t1").unwrap().status = TaskStatus::Done;
        assert_eq!(pick_next(&state).unwrap().id, "t2");
    }

    // Invariant 7: never returns terminal/review/blocked.
    #[test]
    fn never_returns_excluded_statuses() {
        let mut state = TaskState::new();
        state.insert("done".to_string(), task("done", TaskStatus::Done, 0));
        state.insert("cancelled".to_string(), task("cancelled", TaskStatus::Cancelled, 1));
        state.insert("review".to_string(), task("review", TaskStatus::Review, 2));
        state.insert("blocked".to_string(), task("blocked", TaskStatus::Blocked, 3));
        assert!(pick_next(&state).is_none());
    }

    // Invariant 8: in_progress wins over pending/discovered regardless of age.
    #[test]
    fn in_progress_wins_over_older_pending() {
        let mut state = TaskState::new();
        state.insert("old".to_string(), task("old", TaskStatus::Pending, -100));
        state.insert("active".to_string(), task("active", TaskStatus::InProgress, 0));
        assert_eq!(pick_next(&state).unwrap().id, "active");
    }

    #[tokio::test]
    async fn inner_loop_stops_on_complete() {
        let t = task("t1", TaskStatus::InProgress, 0);
        let limits = IterationLimits {
            max_iterations_per_task: 10,
            max_time_per_task: Duration::from_secs(60),
        };
        let result = run_task_loop(
            &t,
            &limits,
            |_task, i| async move {
                if i == 3 {
                    IterationOutcome::Complete { artifacts: vec![] }
                } else {
                    IterationOutcome::Continue {
                        reason: "working".to_string(),
                    }
                }
            },
            |_, _| {},
        )
        .await;
        assert!(result.success);
        assert_eq!(result.iterations, 3);
    }

    #[tokio::test]
    async fn inner_loop_stops_on_error() {
        let t = task("t1", TaskStatus::InProgress, 0);
        let limits = IterationLimits {
            max_iterations_per_task: 10,
            max_time_per_task: Duration::from_secs(60),
        };
        let result = run_task_loop(
            &t,
            &limits,
            |_task, _i| async { IterationOutcome::Error {
                reason: "boom".to_string(),
            } },
            |_, _| {},
        )
        .await;
        assert!(!result.success);
        assert_eq!(result.reason.unwrap(), "boom");
    }

    #[tokio::test]
    async fn inner_loop_hits_max_iterations() {
        let t = task("t1", TaskStatus::InProgress, 0);
        let limits = IterationLimits {
            max_iterations_per_task: 2,
            max_time_per_task: Duration::from_secs(60),
        };
        let result = run_task_loop(
            &t,
            &limits,
            |_task, _i| async {
                IterationOutcome::Continue {
                    reason: "still going".to_string(),
                }
            },
            |_, _| {},
        )
        .await;
        assert!(!result.success);
        assert_eq!(result.iterations, 2);
        assert_eq!(result.reason.unwrap(), "Max iterations reached");
    }
}
