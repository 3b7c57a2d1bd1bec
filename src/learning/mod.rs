//! Replay ledger history into metrics, detect patterns, propose revisions
//! to the agent's operating instructions (§4.6).

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::{Complexity, Task, TaskType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub iterations: u64,
    pub commits: u64,
    pub files_changed: u64,
    pub lines_changed: u64,
    pub blockers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub task_id: String,
    pub task_type: TaskType,
    pub complexity: Option<Complexity>,
    pub aggregate: Option<String>,
    pub domain: Option<String>,
    pub tags: Vec<String>,
    pub duration_ms: i64,
    pub duration_days: f64,
    pub estimate: Option<f64>,
    pub actual: f64,
    pub estimate_ratio: Option<f64>,
    pub iterations: u64,
    pub commits: u64,
    pub files_changed: u64,
    pub lines_changed: u64,
    pub blockers: u64,
    pub is_bug: bool,
    pub is_test: bool,
    pub failed: bool,
}

pub fn record_task_metrics(task: &Task, ctx: &ExecutionContext) -> TaskMetrics {
    let completed_at = task.completed_at.unwrap_or_else(Utc::now);
    let duration_ms = (completed_at - task.created_at).num_milliseconds();
    let duration_days = duration_ms as f64 / 86_400_000.0;
    let actual = task.actual.unwrap_or(ctx.iterations as f64);
    let estimate_ratio = task.estimate.map(|estimate| actual / estimate);

    TaskMetrics {
        task_id: task.id.clone(),
        task_type: task.task_type,
        complexity: task.complexity,
        aggregate: task.aggregate.clone(),
        domain: task.domain.clone(),
        tags: task.tags.clone(),
        duration_ms,
        duration_days,
        estimate: task.estimate,
        actual,
        estimate_ratio,
        iterations: ctx.iterations,
        commits: ctx.commits,
        files_changed: ctx.files_changed,
        lines_changed: ctx.lines_changed,
        blockers: ctx.blockers.len() as u64,
        is_bug: task.task_type == TaskType::Bug,
        is_test: task.task_type == TaskType::Test,
        failed: false,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub volume: u64,
    pub mean_duration_ms: f64,
    pub median_duration_ms: f64,
    pub mean_iterations: f64,
    pub total_commits: u64,
    pub total_files_changed: u64,
    pub mean_estimate_ratio: f64,
    pub estimate_accuracy: f64,
    pub bug_count: u64,
    pub tasks_completed: u64,
    pub by_type: HashMap<String, u64>,
    pub by_aggregate: HashMap<String, u64>,
    pub by_complexity: HashMap<String, u64>,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn stddev(values: &[f64], avg: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

pub fn aggregate_period(metrics: &[TaskMetrics], start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> AggregateMetrics {
    let durations: Vec<f64> = metrics.iter().map(|m| m.duration_ms as f64).collect();
    let iterations: Vec<f64> = metrics.iter().map(|m| m.iterations as f64).collect();
    let ratios: Vec<f64> = metrics.iter().filter_map(|m| m.estimate_ratio).collect();
    let accurate = ratios.iter().filter(|r| (0.8..=1.2).contains(*r)).count();

    let mut by_type = HashMap::new();
    let mut by_aggregate = HashMap::new();
    let mut by_complexity = HashMap::new();
    for m in metrics {
        *by_type.entry(format!("{:?}", m.task_type)).or_insert(0) += 1;
        if let Some(ref agg) = m.aggregate {
            *by_aggregate.entry(agg.clone()).or_insert(0) += 1;
        }
        if let Some(complexity) = m.complexity {
            *by_complexity.entry(format!("{complexity:?}")).or_insert(0) += 1;
        }
    }

    AggregateMetrics {
        period_start: start,
        period_end: end,
        volume: metrics.len() as u64,
        mean_duration_ms: mean(&durations),
        median_duration_ms: median(&durations),
        mean_iterations: mean(&iterations),
        total_commits: metrics.iter().map(|m| m.commits).sum(),
        total_files_changed: metrics.iter().map(|m| m.files_changed).sum(),
        mean_estimate_ratio: mean(&ratios),
        estimate_accuracy: if ratios.is_empty() {
            0.0
        } else {
            accurate as f64 / ratios.len() as f64
        },
        bug_count: metrics.iter().filter(|m| m.is_bug).count() as u64,
        tasks_completed: metrics.len() as u64,
        by_type,
        by_aggregate,
        by_complexity,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    #[serde(rename = "type")]
    pub pattern_type: String,
    pub confidence: f64,
    pub description: String,
    pub data: serde_json::Value,
    pub evidence: Vec<String>,
    pub suggestion: Option<String>,
}

/// `min(sampleCount/k, 1) * strength`, the confidence shape shared by every
/// detector (§4.6).
fn confidence(sample_count: usize, k: f64, strength: f64) -> f64 {
    (sample_count as f64 / k).min(1.0) * strength
}

pub fn detect_estimation_drift(metrics: &[TaskMetrics], min_samples: usize) -> Option<Pattern> {
    let samples: Vec<&TaskMetrics> = metrics
        .iter()
        .filter(|m| m.estimate.is_some() && m.estimate_ratio.is_some())
        .collect();
    if samples.len() < min_samples {
        return None;
    }
    let ratios: Vec<f64> = samples.iter().filter_map(|m| m.estimate_ratio).collect();
    let avg_ratio = mean(&ratios);
    if !(avg_ratio > 1.5 || avg_ratio < 0.7) {
        return None;
    }
    let direction = if avg_ratio > 1.5 { "underestimated" } else { "overestimated" };
    Some(Pattern {
        pattern_type: "estimation_drift".to_string(),
        confidence: confidence(samples.len(), 10.0, 0.9),
        description: format!("Tasks are systematically {direction} (avg ratio {avg_ratio:.2})"),
        data: serde_json::json!({"direction": direction, "avgRatio": avg_ratio}),
        evidence: samples.iter().map(|m| m.task_id.clone()).collect(),
        suggestion: Some(format!(
            "Apply a {avg_ratio:.1}x multiplier to future estimates in this category"
        )),
    })
}

pub fn detect_task_clustering(metrics: &[TaskMetrics]) -> Option<Pattern> {
    let mut counts: HashMap<String, Vec<String>> = HashMap::new();
    for m in metrics {
        if let Some(ref agg) = m.aggregate {
            counts.entry(agg.clone()).or_default().push(m.task_id.clone());
        }
    }
    let (aggregate, ids) = counts.into_iter().find(|(_, ids)| ids.len() >= 3)?;
    Some(Pattern {
        pattern_type: "task_clustering".to_string(),
        confidence: confidence(ids.len(), 8.0, 0.7),
        description: format!("{} has a cluster of {} tasks", aggregate, ids.len()),
        data: serde_json::json!({"aggregate": aggregate, "count": ids.len()}),
        evidence: ids,
        suggestion: Some(format!("Consider promoting {aggregate} to its own epic")),
    })
}

pub fn detect_blocking_chain(state: &crate::ledger::TaskState) -> Option<Pattern> {
    let (id, blocked) = state
        .values()
        .map(|t| (t.id.clone(), t.blocks.clone()))
        .find(|(_, blocks)| blocks.len() >= 2)?;
    Some(Pattern {
        pattern_type: "blocking_chain".to_string(),
        confidence: confidence(blocked.len(), 5.0, 0.8),
        description: format!("{} blocks {} other tasks", id, blocked.len()),
        data: serde_json::json!({"taskId": id, "blocks": blocked}),
        evidence: vec![id],
        suggestion: Some("Prioritize this blocker to unblock downstream work".to_string()),
    })
}

pub fn detect_bug_hotspot(metrics: &[TaskMetrics]) -> Option<Pattern> {
    let mut counts: HashMap<String, (u64, u64)> = HashMap::new();
    for m in metrics {
        if let Some(ref agg) = m.aggregate {
            let entry = counts.entry(agg.clone()).or_insert((0, 0));
            entry.0 += 1;
            if m.is_bug {
                entry.1 += 1;
            }
        }
    }
    let (aggregate, (total, bugs)) = counts
        .into_iter()
        .find(|(_, (total, bugs))| *total >= 3 && *bugs >= 2)?;
    Some(Pattern {
        pattern_type: "bug_hotspot".to_string(),
        confidence: confidence(bugs as usize, 5.0, 0.85),
        description: format!("{aggregate} has {bugs} bugs out of {total} tasks"),
        data: serde_json::json!({"aggregate": aggregate, "bugCount": bugs, "total": total}),
        evidence: Vec::new(),
        suggestion: Some(format!("Audit {aggregate} for underlying design issues")),
    })
}

pub fn detect_iteration_anomaly(metrics: &[TaskMetrics]) -> Option<Pattern> {
    if metrics.len() < 5 {
        return None;
    }
    let iterations: Vec<f64> = metrics.iter().map(|m| m.iterations as f64).collect();
    let avg = mean(&iterations);
    let sigma = stddev(&iterations, avg);
    let outlier = metrics.iter().find(|m| m.iterations as f64 > avg + 2.0 * sigma)?;
    Some(Pattern {
        pattern_type: "iteration_anomaly".to_string(),
        confidence: confidence(metrics.len(), 10.0, 0.75),
        description: format!(
            "{} took {} iterations, far above the mean of {:.1}",
            outlier.task_id, outlier.iterations, avg
        ),
        data: serde_json::json!({"taskId": outlier.task_id, "iterations": outlier.iterations, "mean": avg}),
        evidence: vec![outlier.task_id.clone()],
        suggestion: None,
    })
}

pub fn detect_velocity_trend(periods: &[AggregateMetrics]) -> Option<Pattern> {
    if periods.len() < 2 {
        return None;
    }
    let mid = periods.len() / 2;
    let first_half = mean(
        &periods[..mid]
            .iter()
            .map(|p| p.tasks_completed as f64)
            .collect::<Vec<_>>(),
    );
    let second_half = mean(
        &periods[mid..]
            .iter()
            .map(|p| p.tasks_completed as f64)
            .collect::<Vec<_>>(),
    );
    if first_half == 0.0 {
        return None;
    }
    let relative_change = (second_half - first_half) / first_half;
    if relative_change.abs() <= 0.2 {
        return None;
    }
    let direction = if relative_change > 0.0 { "accelerating" } else { "slowing" };
    Some(Pattern {
        pattern_type: "velocity_trend".to_string(),
        confidence: confidence(periods.len(), 6.0, 0.7),
        description: format!("Velocity is {direction} ({:.0}% change)", relative_change * 100.0),
        data: serde_json::json!({"direction": direction, "relativeChange": relative_change}),
        evidence: Vec::new(),
        suggestion: None,
    })
}

pub fn detect_bottleneck(metrics: &[TaskMetrics]) -> Option<Pattern> {
    if metrics.len() < 5 {
        return None;
    }
    let overall_mean = mean(&metrics.iter().map(|m| m.duration_ms as f64).collect::<Vec<_>>());
    let mut by_type: HashMap<TaskType, Vec<f64>> = HashMap::new();
    for m in metrics {
        by_type.entry(m.task_type).or_default().push(m.duration_ms as f64);
    }
    let (task_type, durations) = by_type
        .into_iter()
        .find(|(_, durations)| durations.len() >= 2 && mean(durations) > 1.5 * overall_mean)?;
    Some(Pattern {
        pattern_type: "bottleneck".to_string(),
        confidence: confidence(durations.len(), 6.0, 0.7),
        description: format!("{task_type:?} tasks take {:.1}x the overall mean", mean(&durations) / overall_mean),
        data: serde_json::json!({"type": format!("{task_type:?}")}),
        evidence: Vec::new(),
        suggestion: None,
    })
}

pub fn detect_complexity_signal(metrics: &[TaskMetrics]) -> Option<Pattern> {
    if metrics.len() < 5 {
        return None;
    }
    let order = [
        Complexity::Trivial,
        Complexity::Simple,
        Complexity::Moderate,
        Complexity::Complex,
    ];
    let means: Vec<f64> = order
        .iter()
        .map(|c| {
            let durations: Vec<f64> = metrics
                .iter()
                .filter(|m| m.complexity == Some(*c))
                .map(|m| m.duration_ms as f64)
                .collect();
            mean(&durations)
        })
        .collect();
    let monotonic = means.windows(2).all(|w| w[0] <= w[1] || w[1] == 0.0);
    if monotonic {
        return None;
    }
    Some(Pattern {
        pattern_type: "complexity_signal".to_string(),
        confidence: confidence(metrics.len(), 10.0, 0.6),
        description: "Complexity rating doesn't track actual duration".to_string(),
        data: serde_json::json!({"meansByComplexity": means}),
        evidence: Vec::new(),
        suggestion: Some("Recalibrate complexity ratings against observed duration".to_string()),
    })
}

pub fn detect_test_gap(metrics: &[TaskMetrics]) -> Option<Pattern> {
    let mut by_aggregate: HashMap<String, (u64, u64)> = HashMap::new();
    for m in metrics {
        if let Some(ref agg) = m.aggregate {
            let entry = by_aggregate.entry(agg.clone()).or_insert((0, 0));
            if !m.is_test {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }
    }
    let (aggregate, (non_test, tests)) = by_aggregate.into_iter().find(|(_, (non_test, tests))| {
        *non_test >= 3 && (*tests as f64 / (*non_test + *tests).max(1) as f64) < 0.2
    })?;
    Some(Pattern {
        pattern_type: "test_gap".to_string(),
        confidence: confidence(non_test as usize, 6.0, 0.65),
        description: format!("{aggregate} has only {tests} test tasks against {non_test} others"),
        data: serde_json::json!({"aggregate": aggregate, "nonTest": non_test, "tests": tests}),
        evidence: Vec::new(),
        suggestion: Some(format!("Add test coverage tasks for {aggregate}")),
    })
}

pub fn detect_high_churn(metrics: &[TaskMetrics], min_samples: usize) -> Option<Pattern> {
    let overall_mean = mean(&metrics.iter().map(|m| m.files_changed as f64).collect::<Vec<_>>());
    let mut by_aggregate: HashMap<String, Vec<f64>> = HashMap::new();
    for m in metrics {
        if let Some(ref agg) = m.aggregate {
            by_aggregate.entry(agg.clone()).or_default().push(m.files_changed as f64);
        }
    }
    let (aggregate, values) = by_aggregate
        .into_iter()
        .find(|(_, values)| values.len() >= min_samples && mean(values) > 1.5 * overall_mean)?;
    Some(Pattern {
        pattern_type: "high_churn".to_string(),
        confidence: confidence(values.len(), 6.0, 0.7),
        description: format!("{aggregate} changes {:.1}x as many files as average", mean(&values) / overall_mean.max(1.0)),
        data: serde_json::json!({"aggregate": aggregate}),
        evidence: Vec::new(),
        suggestion: None,
    })
}

pub fn detect_coupling(metrics: &[TaskMetrics]) -> Option<Pattern> {
    let mut co_occurrence: HashMap<(String, String), u64> = HashMap::new();
    for m in metrics {
        let mut labels: Vec<String> = m.tags.clone();
        if let Some(ref agg) = m.aggregate {
            labels.push(agg.clone());
        }
        if let Some(ref domain) = m.domain {
            labels.push(domain.clone());
        }
        labels.sort();
        labels.dedup();
        for i in 0..labels.len() {
            for j in (i + 1)..labels.len() {
                *co_occurrence
                    .entry((labels[i].clone(), labels[j].clone()))
                    .or_insert(0) += 1;
            }
        }
    }
    let ((a, b), count) = co_occurrence.into_iter().find(|(_, count)| *count >= 3)?;
    Some(Pattern {
        pattern_type: "coupling".to_string(),
        confidence: confidence(count as usize, 6.0, 0.65),
        description: format!("{a} and {b} co-occur on {count} tasks"),
        data: serde_json::json!({"pair": [a, b], "count": count}),
        evidence: Vec::new(),
        suggestion: Some(format!("Consider whether {a} and {b} should be one module")),
    })
}

pub fn detect_failure_mode(metrics: &[TaskMetrics]) -> Option<Pattern> {
    let mut by_group: HashMap<String, u64> = HashMap::new();
    for m in metrics {
        if m.failed || m.blockers > 0 {
            let key = m.aggregate.clone().unwrap_or_else(|| format!("{:?}", m.task_type));
            *by_group.entry(key).or_insert(0) += 1;
        }
    }
    let (group, count) = by_group.into_iter().find(|(_, count)| *count >= 2)?;
    Some(Pattern {
        pattern_type: "failure_mode".to_string(),
        confidence: confidence(count as usize, 5.0, 0.7),
        description: format!("{group} has {count} failed or blocked tasks"),
        data: serde_json::json!({"group": group, "count": count}),
        evidence: Vec::new(),
        suggestion: None,
    })
}

pub fn detect_spec_drift(metrics: &[TaskMetrics]) -> Option<Pattern> {
    let mut by_area: HashMap<String, (u64, u64)> = HashMap::new();
    for m in metrics {
        if let Some(ref domain) = m.domain {
            let entry = by_area.entry(domain.clone()).or_insert((0, 0));
            entry.0 += 1;
            if m.failed {
                entry.1 += 1;
            }
        }
    }
    let (area, (total, failures)) = by_area.into_iter().find(|(_, (total, failures))| {
        *total >= 3 && (*failures as f64 / *total as f64) > 0.3
    })?;
    Some(Pattern {
        pattern_type: "spec_drift".to_string(),
        confidence: confidence(total as usize, 6.0, 0.6),
        description: format!("{area} has a {:.0}% failure fraction", failures as f64 / total as f64 * 100.0),
        data: serde_json::json!({"area": area, "total": total, "failures": failures}),
        evidence: Vec::new(),
        suggestion: Some(format!("Revisit the spec driving {area}")),
    })
}

pub fn detect_plan_drift(state: &crate::ledger::TaskState) -> Option<Pattern> {
    let mut by_area: HashMap<String, (u64, u64)> = HashMap::new();
    for task in state.values() {
        if task.subtasks.is_empty() {
            continue;
        }
        let key = task.aggregate.clone().unwrap_or_else(|| "unknown".to_string());
        let entry = by_area.entry(key).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += task.subtasks.len() as u64;
    }
    let (area, (parents, _spawned)) = by_area
        .into_iter()
        .find(|(_, (parents, spawned))| *parents >= 2 && *spawned > 0)?;
    Some(Pattern {
        pattern_type: "plan_drift".to_string(),
        confidence: confidence(parents as usize, 4.0, 0.6),
        description: format!("{area} spawned more subtasks than planned"),
        data: serde_json::json!({"area": area}),
        evidence: Vec::new(),
        suggestion: Some("Revisit initial task breakdown granularity".to_string()),
    })
}

pub fn detect_knowledge_staleness(metrics: &[TaskMetrics]) -> Option<Pattern> {
    let unclassified: Vec<&TaskMetrics> = metrics
        .iter()
        .filter(|m| m.aggregate.is_none() && m.domain.is_none())
        .collect();
    if unclassified.len() < 3 {
        return None;
    }
    let total_files: u64 = metrics.iter().map(|m| m.files_changed).sum();
    let unclassified_files: u64 = unclassified.iter().map(|m| m.files_changed).sum();
    if total_files == 0 {
        return None;
    }
    let share = unclassified_files as f64 / total_files as f64;
    if share <= 0.4 {
        return None;
    }
    Some(Pattern {
        pattern_type: "knowledge_staleness".to_string(),
        confidence: confidence(unclassified.len(), 5.0, 0.6),
        description: format!("{:.0}% of file changes come from unclassified tasks", share * 100.0),
        data: serde_json::json!({"share": share, "count": unclassified.len()}),
        evidence: unclassified.iter().map(|m| m.task_id.clone()).collect(),
        suggestion: Some("Backfill aggregate/domain tags for recent tasks".to_string()),
    })
}

pub struct DetectorContext<'a> {
    pub metrics: &'a [TaskMetrics],
    pub state: &'a crate::ledger::TaskState,
    pub periods: &'a [AggregateMetrics],
    pub min_samples: usize,
}

pub fn run_all_detectors(ctx: &DetectorContext) -> Vec<Pattern> {
    [
        detect_estimation_drift(ctx.metrics, ctx.min_samples),
        detect_task_clustering(ctx.metrics),
        detect_blocking_chain(ctx.state),
        detect_bug_hotspot(ctx.metrics),
        detect_iteration_anomaly(ctx.metrics),
        detect_velocity_trend(ctx.periods),
        detect_bottleneck(ctx.metrics),
        detect_complexity_signal(ctx.metrics),
        detect_test_gap(ctx.metrics),
        detect_high_churn(ctx.metrics, ctx.min_samples),
        detect_coupling(ctx.metrics),
        detect_failure_mode(ctx.metrics),
        detect_spec_drift(ctx.metrics),
        detect_plan_drift(ctx.state),
        detect_knowledge_staleness(ctx.metrics),
    ]
    .into_iter()
    .flatten()
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementProposal {
    pub id: String,
    pub target: String,
    pub section: Option<String>,
    pub priority: Priority,
    pub confidence: f64,
    pub description: String,
    pub status: String,
}

fn priority_for(pattern_type: &str) -> Priority {
    match pattern_type {
        "estimation_drift" | "bug_hotspot" | "spec_drift" => Priority::High,
        "blocking_chain" | "bottleneck" | "test_gap" | "failure_mode" => Priority::Medium,
        _ => Priority::Low,
    }
}

fn target_for(pattern_type: &str) -> &'static str {
    match pattern_type {
        "estimation_drift" | "complexity_signal" => "AGENTS.md",
        "bug_hotspot" | "test_gap" | "spec_drift" => "agents/quality.md",
        "blocking_chain" | "plan_drift" => "agents/planning.md",
        _ => "AGENTS.md",
    }
}

pub fn generate_improvements(patterns: &[Pattern], proposal_id_seed: &mut u64) -> (Vec<ImprovementProposal>, String) {
    let proposals: Vec<ImprovementProposal> = patterns
        .iter()
        .map(|pattern| {
            *proposal_id_seed += 1;
            ImprovementProposal {
                id: format!("prop-{proposal_id_seed}"),
                target: target_for(&pattern.pattern_type).to_string(),
                section: None,
                priority: priority_for(&pattern.pattern_type),
                confidence: pattern.confidence,
                description: pattern
                    .suggestion
                    .clone()
                    .unwrap_or_else(|| pattern.description.clone()),
                status: "pending".to_string(),
            }
        })
        .collect();

    let summary = format!(
        "{} pattern(s) detected, {} proposal(s) generated",
        patterns.len(),
        proposals.len()
    );
    (proposals, summary)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LearningEvent {
    TaskCompleted {
        task_id: String,
        success: bool,
        iterations: u64,
        estimate: Option<f64>,
        actual: f64,
        files_changed: u64,
        lines_changed: u64,
        task_type: TaskType,
        complexity: Option<Complexity>,
        blockers: u64,
    },
    PatternDetected {
        pattern: Pattern,
    },
    ImprovementProposed {
        proposal: ImprovementProposal,
    },
}

pub struct LearningLog {
    path: PathBuf,
}

impl LearningLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, event: &LearningEvent) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        use std::io::Write as _;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    pub fn save_proposals(&self, proposals: &[ImprovementProposal]) -> anyhow::Result<()> {
        for proposal in proposals {
            self.append(&LearningEvent::ImprovementProposed {
                proposal: proposal.clone(),
            })?;
        }
        Ok(())
    }

    pub fn load_pending_proposals(&self) -> anyhow::Result<Vec<ImprovementProposal>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut pending = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(LearningEvent::ImprovementProposed { proposal }) =
                serde_json::from_str::<LearningEvent>(line)
            {
                if proposal.status == "pending" {
                    pending.push(proposal);
                }
            }
        }
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{TaskState, TaskStatus};
    use tempfile::tempdir;

    fn metric(id: &str, estimate: f64, actual: f64) -> TaskMetrics {
        TaskMetrics {
            task_id: id.to_string(),
            task_type: TaskType::Task,
            complexity: None,
            aggregate: None,
            domain: None,
            tags: Vec::new(),
            duration_ms: 0,
            duration_days: 0.0,
            estimate: Some(estimate),
            actual,
            estimate_ratio: Some(actual / estimate),
            iterations: actual as u64,
            commits: 1,
            files_changed: 2,
            lines_changed: 10,
            blockers: 0,
            is_bug: false,
            is_test: false,
            failed: false,
        }
    }

    // S6: estimation drift.
    #[test]
    fn estimation_drift_detects_underestimation() {
        let metrics: Vec<TaskMetrics> = (0..10).map(|i| metric(&format!("t{i}"), 1.0, 5.0)).collect();
        let pattern = detect_estimation_drift(&metrics, 5).unwrap();
        assert_eq!(pattern.data["direction"], "underestimated");
        assert_eq!(pattern.data["avgRatio"], 5.0);
        assert!(pattern.suggestion.unwrap().contains("multiplier"));
    }

    #[test]
    fn estimation_drift_needs_min_samples() {
        let metrics: Vec<TaskMetrics> = (0..3).map(|i| metric(&format!("t{i}"), 1.0, 5.0)).collect();
        assert!(detect_estimation_drift(&metrics, 5).is_none());
    }

    #[test]
    fn task_clustering_needs_three() {
        let mut metrics: Vec<TaskMetrics> = (0..2).map(|i| metric(&format!("t{i}"), 1.0, 1.0)).collect();
        for m in &mut metrics {
            m.aggregate = Some("auth".to_string());
        }
        assert!(detect_task_clustering(&metrics).is_none());
        metrics.push({
            let mut m = metric("t2", 1.0, 1.0);
            m.aggregate = Some("auth".to_string());
            m
        });
        assert!(detect_task_clustering(&metrics).is_some());
    }

    #[test]
    fn proposals_get_sequential_ids_and_pending_status() {
        let patterns = vec![Pattern {
            pattern_type: "estimation_drift".to_string(),
            confidence: 0.9,
            description: "desc".to_string(),
            data: serde_json::json!({}),
            evidence: Vec::new(),
            suggestion: Some("multiply by 5x".to_string()),
        }];
        let mut seed = 0;
        let (proposals, summary) = generate_improvements(&patterns, &mut seed);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].status, "pending");
        assert_eq!(proposals[0].priority, Priority::High);
        assert!(summary.contains('1'));
    }

    #[test]
    fn load_pending_roundtrips_through_log() {
        let dir = tempdir().unwrap();
        let log = LearningLog::new(dir.path().join("learning.jsonl"));
        let proposal = ImprovementProposal {
            id: "prop-1".to_string(),
            target: "AGENTS.md".to_string(),
            section: None,
            priority: Priority::Medium,
            confidence: 0.7,
            description: "do something".to_string(),
            status: "pending".to_string(),
        };
        log.save_proposals(&[proposal]).unwrap();
        let pending = log.load_pending_proposals().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "prop-1");
    }

    #[test]
    fn blocking_chain_requires_two_blocked() {
        let state: TaskState = TaskState::new();
        assert!(detect_blocking_chain(&state).is_none());
    }

    #[test]
    fn aggregate_period_computes_accuracy() {
        let metrics = vec![metric("a", 1.0, 1.0), metric("b", 1.0, 5.0)];
        let agg = aggregate_period(&metrics, None, None);
        assert_eq!(agg.volume, 2);
        assert!((agg.estimate_accuracy - 0.5).abs() < 1e-9);
    }

    #[test]
    fn record_task_metrics_prefers_task_actual() {
        let mut task = super_task();
        task.actual = Some(3.0);
        let ctx = ExecutionContext {
            iterations: 9,
            commits: 1,
            files_changed: 1,
            lines_changed: 1,
            blockers: Vec::new(),
        };
        let m = record_task_metrics(&task, &ctx);
        assert_eq!(m.actual, 3.0);
    }

    fn super_task() -> Task {
        Task {
            id: "t".to_string(),
            task_type: TaskType::Task,
            status: TaskStatus::Done,
            title: "t".to_string(),
            description: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: Some(Utc::now()),
            estimate: Some(2.0),
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
}
