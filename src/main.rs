use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod config;
mod error;
mod executor;
mod git;
mod ledger;
mod learning;
mod llm;
mod logging;
mod notify;
mod paths;
mod policy;
mod sandbox;
mod scheduler;
mod tracker;

use config::RuntimeConfig;
use ledger::{Ledger, TaskStatus};
use paths::{LockGuard, StatePaths};

#[derive(Debug, Parser)]
#[command(name = "ralph")]
#[command(about = "Autonomous task-delivery loop driving an LLM agent over a plan document")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(long, global = true, default_value = "./ralph.config.json")]
    config: PathBuf,

    #[arg(long, global = true)]
    dry_run: bool,

    #[arg(long, global = true)]
    task: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler loop (default).
    Run,
    /// Parse the plan document into a candidate task list.
    Discover,
    /// Print the current task state and run status.
    Status,
    /// Run bidirectional tracker sync once.
    Sync,
    /// Replay the ledger and learning log to print pending proposals.
    Learn,
    /// Print CLI help.
    Help,
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            println!("Ralph failed: {err}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = RuntimeConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    config.apply_cli_overrides(cli.dry_run, cli.task.clone());

    let state_root = cli
        .config
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .join("state");
    let paths = StatePaths::new(state_root);
    paths.ensure_exists()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(&config, &paths).await,
        Commands::Discover => cmd_discover(&config),
        Commands::Status => cmd_status(&paths),
        Commands::Sync => cmd_sync(&config, &paths).await,
        Commands::Learn => cmd_learn(&config, &paths),
        Commands::Help => {
            print_help();
            Ok(())
        }
    }
}

fn print_help() {
    println!("ralph — autonomous task-delivery loop\n");
    println!("Subcommands: run (default), discover, status, sync, learn, help");
    println!("Flags: --config=<path> --dry-run --task=<id> --help|-h");
}

fn print_banner(work_dir: &std::path::Path) {
    println!("ralph starting");
    println!("working directory: {}", work_dir.display());
}

/// One completed task's worth of bookkeeping for the learning log, recorded
/// by `Sink::record_completion` for the tasks finished during this run only
/// (§4.6: the ledger's full `done` history is not re-derived every run).
struct CompletionRecord {
    task_id: String,
    iterations: u64,
    files_changed: u64,
    lines_changed: u64,
    commits: u64,
}

fn lines_delta(change: &sandbox::FileChange) -> u64 {
    let before = change.before.as_deref().map(|s| s.lines().count()).unwrap_or(0);
    let after = change.after.as_deref().map(|s| s.lines().count()).unwrap_or(0);
    before.abs_diff(after) as u64
}

/// Drives one LLM turn against the executor: sends the task as a chat
/// message, applies whatever tool calls come back, and decides the
/// iteration outcome from the response's finish reason (§4.8).
async fn run_iteration(
    llm_provider: &dyn llm::LlmProvider,
    executor: &Rc<RefCell<executor::Executor>>,
    task: &ledger::Task,
    iteration: u32,
) -> scheduler::IterationOutcome {
    let messages = vec![
        llm::Message {
            role: llm::Role::System,
            content: "You are ralph, an autonomous agent delivering one task at a time against a working tree.".to_string(),
        },
        llm::Message {
            role: llm::Role::User,
            content: format!("Task {} (iteration {iteration}): {}\n\n{}", task.id, task.title, task.description),
        },
    ];
    let tools = vec![
        llm::ToolSpec {
            name: "read_file".to_string(),
            description: "Read a file from the working tree".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"],
            }),
        },
        llm::ToolSpec {
            name: "write_file".to_string(),
            description: "Write a file in the working tree".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"path": {"type": "string"}, "content": {"type": "string"}},
                "required": ["path", "content"],
            }),
        },
        llm::ToolSpec {
            name: "bash".to_string(),
            description: "Run a shell command against the sandboxed working tree".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"command": {"type": "string"}},
                "required": ["command"],
            }),
        },
    ];

    let response = match llm_provider.chat(&messages, &tools).await {
        Ok(response) => response,
        Err(err) => {
            return scheduler::IterationOutcome::Error {
                reason: format!("llm request failed: {err}"),
            };
        }
    };

    for call in &response.tool_calls {
        match call.name.as_str() {
            "read_file" => {
                if let Some(path) = call.arguments.get("path").and_then(|v| v.as_str()) {
                    if let Err(err) = executor.borrow_mut().read_file(Path::new(path)) {
                        tracing::warn!(task = %task.id, path, error = %err, "read_file denied");
                    }
                }
            }
            "write_file" => {
                if let (Some(path), Some(content)) = (
                    call.arguments.get("path").and_then(|v| v.as_str()),
                    call.arguments.get("content").and_then(|v| v.as_str()),
                ) {
                    if let Err(err) = executor
                        .borrow_mut()
                        .write_file(Path::new(path), content.to_string())
                    {
                        tracing::warn!(task = %task.id, path, error = %err, "write_file denied");
                    }
                }
            }
            "bash" => {
                if let Some(command) = call.arguments.get("command").and_then(|v| v.as_str()) {
                    match executor.borrow_mut().bash(command).await {
                        Ok(result) => tracing::info!(
                            task = %task.id, command, exit_code = result.exit_code, "bash completed"
                        ),
                        Err(err) => tracing::warn!(task = %task.id, command, error = %err, "bash denied"),
                    }
                }
            }
            other => tracing::warn!(task = %task.id, tool = other, "unknown tool call"),
        }
    }

    tracing::debug!(
        task = %task.id,
        iteration,
        pending_changes = executor.borrow().get_pending_changes(),
        "iteration applied tool calls"
    );

    match response.finish_reason {
        llm::FinishReason::Stop => scheduler::IterationOutcome::Complete { artifacts: vec![] },
        llm::FinishReason::Error => scheduler::IterationOutcome::Error { reason: response.content },
        llm::FinishReason::ToolCalls | llm::FinishReason::Length => {
            scheduler::IterationOutcome::Continue { reason: response.content }
        }
    }
}

async fn cmd_run(config: &RuntimeConfig, paths: &StatePaths) -> Result<()> {
    let work_dir = std::env::current_dir()?;
    print_banner(&work_dir);

    let _lock = LockGuard::acquire(paths)?;
    let ledger = Ledger::new(paths.tasks_jsonl());

    let policy = crate::policy::Policy {
        mode: config.policy.mode.unwrap_or(crate::policy::PolicyMode::Core),
        files_read: config.policy.files_read.clone().unwrap_or_default(),
        files_write: config.policy.files_write.clone().unwrap_or_default(),
        commands: config.policy.commands.clone().unwrap_or_default(),
        approval: crate::policy::ApprovalConfig {
            required_for: config.policy.approval_required_for.clone(),
            require_reason: false,
        },
        checks: crate::policy::ChecksConfig {
            required: config.policy.checks_required.clone(),
            rollback_on_fail: config.policy.checks_rollback_on_fail,
        },
        ..crate::policy::Policy::default()
    };

    let limits = scheduler::OuterLoopLimits {
        max_tasks_per_run: config.r#loop.max_tasks_per_run,
        max_time_per_run: Duration::from_secs(config.r#loop.max_time_per_run_secs),
    };
    let iteration_limits = scheduler::IterationLimits {
        max_iterations_per_task: config.r#loop.max_iterations_per_task,
        max_time_per_task: Duration::from_secs(config.r#loop.max_time_per_task_secs),
    };

    let llm_provider = llm::MockProvider::stop_with("task complete");
    let git_ops = git::RealGitOps::new(work_dir.clone());
    let learning_log = learning::LearningLog::new(paths.learning_jsonl());

    let sandbox = sandbox::Sandbox::new(sandbox::SandboxConfig {
        root: work_dir.clone(),
        timeout: Duration::from_secs(config.sandbox.timeout_secs),
        max_commands: config.sandbox.max_commands,
        cache_reads: config.sandbox.cache_reads,
        allowed_commands: config.sandbox.allowed_commands.clone().unwrap_or_default(),
        denied_commands: config.sandbox.denied_commands.clone().unwrap_or_default(),
    });
    let executor = Rc::new(RefCell::new(executor::Executor::new(sandbox, policy, work_dir.clone())));

    struct Sink<'a> {
        ledger: &'a Ledger,
        executor: Rc<RefCell<executor::Executor>>,
        git_ops: &'a dyn git::GitOps,
        auto_commit: bool,
        commit_prefix: String,
        current_task: RefCell<Option<ledger::Task>>,
        committed_this_task: Cell<bool>,
        last_flush: RefCell<Vec<sandbox::FileChange>>,
        completions: Rc<RefCell<Vec<CompletionRecord>>>,
    }

    #[async_trait::async_trait]
    impl<'a> scheduler::LoopSink for Sink<'a> {
        fn mark_in_progress(&self, task: &ledger::Task) {
            *self.current_task.borrow_mut() = Some(task.clone());
            let mut changes = serde_json::Map::new();
            changes.insert(
                "status".to_string(),
                serde_json::to_value(TaskStatus::InProgress).unwrap(),
            );
            if let Err(err) = self.ledger.update(&task.id, changes) {
                tracing::warn!(task = %task.id, error = %err, "failed to mark task in_progress");
            }
        }

        async fn flush(&mut self) -> Result<()> {
            let changes = self.executor.borrow_mut().flush()?;
            if self.auto_commit && !changes.is_empty() {
                let task = self.current_task.borrow().clone();
                if let Some(task) = task {
                    let message = git::commit_message(&self.commit_prefix, &task.id, &task.title);
                    let committed = match self.git_ops.add(".").await {
                        Ok(()) => self.git_ops.commit(&message).await,
                        Err(err) => Err(err),
                    };
                    match committed {
                        Ok(_) => self.committed_this_task.set(true),
                        Err(err) => tracing::warn!(task = %task.id, error = %err, "auto-commit failed"),
                    }
                }
            }
            *self.last_flush.borrow_mut() = changes;
            Ok(())
        }

        fn rollback(&mut self) {
            self.executor.borrow_mut().rollback();
            self.last_flush.borrow_mut().clear();
        }

        fn record_completion(&self, task_id: &str, result: &scheduler::TaskResult) {
            let status = if result.success {
                TaskStatus::Done
            } else {
                TaskStatus::Blocked
            };
            if let Err(err) =
                scheduler::update_status(self.ledger, task_id, status, result.reason.as_deref())
            {
                tracing::warn!(task = %task_id, error = %err, "failed to record completion");
            }

            if result.success {
                let changes = self.last_flush.borrow();
                let files_changed = changes.len() as u64;
                let lines_changed = changes.iter().map(lines_delta).sum();
                self.completions.borrow_mut().push(CompletionRecord {
                    task_id: task_id.to_string(),
                    iterations: result.iterations as u64,
                    files_changed,
                    lines_changed,
                    commits: if self.committed_this_task.get() { 1 } else { 0 },
                });
            }
            self.committed_this_task.set(false);
            self.last_flush.borrow_mut().clear();
            *self.current_task.borrow_mut() = None;
        }
    }

    let completions = Rc::new(RefCell::new(Vec::new()));
    let sink = Sink {
        ledger: &ledger,
        executor: executor.clone(),
        git_ops: &git_ops,
        auto_commit: config.git.auto_commit,
        commit_prefix: config.git.commit_prefix.clone(),
        current_task: RefCell::new(None),
        committed_this_task: Cell::new(false),
        last_flush: RefCell::new(Vec::new()),
        completions: completions.clone(),
    };

    let result = scheduler::run_loop(
        &ledger,
        &limits,
        |task| {
            let executor = executor.clone();
            let llm_provider = &llm_provider;
            async move {
                scheduler::run_task_loop(
                    task,
                    &iteration_limits,
                    |task, iteration| {
                        let executor = executor.clone();
                        async move { run_iteration(llm_provider, &executor, task, iteration).await }
                    },
                    |iteration, outcome| {
                        tracing::info!(iteration, ?outcome, "iteration finished");
                    },
                )
                .await
            }
        },
        sink,
    )
    .await?;

    if config.learning.enabled {
        let state = ledger.derive()?;
        for record in completions.borrow().iter() {
            let Some(task) = state.get(&record.task_id) else {
                continue;
            };
            let ctx = learning::ExecutionContext {
                iterations: record.iterations,
                commits: record.commits,
                files_changed: record.files_changed,
                lines_changed: record.lines_changed,
                blockers: Vec::new(),
            };
            let metrics = learning::record_task_metrics(task, &ctx);
            learning_log.append(&learning::LearningEvent::TaskCompleted {
                task_id: metrics.task_id.clone(),
                success: true,
                iterations: metrics.iterations,
                estimate: metrics.estimate,
                actual: metrics.actual,
                files_changed: metrics.files_changed,
                lines_changed: metrics.lines_changed,
                task_type: metrics.task_type,
                complexity: metrics.complexity,
                blockers: metrics.blockers,
            })?;
        }
    }

    println!(
        "tasks completed: {}, tasks failed: {}",
        result.tasks_completed, result.tasks_failed
    );

    if result.tasks_completed == 0 && result.tasks_failed > 0 {
        anyhow::bail!("all tasks failed");
    }

    Ok(())
}

/// Plan parsing is out of scope (§1): this treats one markdown heading per
/// line as a candidate task title, the simplest parse that satisfies the
/// "producing a candidate task list" contract.
fn cmd_discover(config: &RuntimeConfig) -> Result<()> {
    let content = std::fs::read_to_string(&config.plan_file)
        .with_context(|| format!("reading plan file {}", config.plan_file.display()))?;
    let candidates: Vec<&str> = content
        .lines()
        .filter(|line| line.trim_start().starts_with("- ") || line.trim_start().starts_with("#"))
        .collect();
    println!("discovered {} candidate task(s):", candidates.len());
    for candidate in candidates {
        println!("  {candidate}");
    }
    Ok(())
}

fn cmd_status(paths: &StatePaths) -> Result<()> {
    let ledger = Ledger::new(paths.tasks_jsonl());
    let state = ledger.derive()?;
    let mut counts: HashMap<String, u32> = HashMap::new();
    for task in state.values() {
        *counts.entry(format!("{:?}", task.status)).or_insert(0) += 1;
    }
    println!("{} task(s) in ledger", state.len());
    for (status, count) in &counts {
        println!("  {status}: {count}");
    }
    Ok(())
}

async fn cmd_sync(config: &RuntimeConfig, paths: &StatePaths) -> Result<()> {
    let Some(ref tracker_type) = config.tracker.tracker_type else {
        println!("no tracker configured; nothing to sync");
        return Ok(());
    };
    let registry = tracker::TrackerRegistry::new();
    let Some(active_tracker) = registry.build(tracker_type) else {
        println!("tracker '{tracker_type}' has no credentials configured; sync disabled");
        return Ok(());
    };

    let ledger = Ledger::new(paths.tasks_jsonl());
    let sync_config = tracker::PerTaskSyncConfig {
        auto_create: config.tracker.auto_create,
        auto_transition: config.tracker.auto_transition,
        auto_comment: config.tracker.auto_comment,
        status_map: HashMap::new(),
    };
    let (pull, push) = tracker::sync_bidirectional(
        active_tracker.as_ref(),
        &ledger,
        tracker::SyncMode::Auto,
        &sync_config,
    )
    .await?;
    println!(
        "pull: processed={} created={} updated={} skipped={} errors={}",
        pull.processed, pull.created, pull.updated, pull.skipped, pull.errors.len()
    );
    println!(
        "push: processed={} created={} updated={} skipped={} errors={}",
        push.processed, push.created, push.updated, push.skipped, push.errors.len()
    );
    Ok(())
}

fn cmd_learn(config: &RuntimeConfig, paths: &StatePaths) -> Result<()> {
    let ledger = Ledger::new(paths.tasks_jsonl());
    let state = ledger.derive()?;
    let learning_log = learning::LearningLog::new(paths.learning_jsonl());
    let pending = learning_log.load_pending_proposals()?;

    if pending.is_empty() {
        println!("no pending improvement proposals");
    } else {
        println!("{} pending improvement proposal(s):", pending.len());
        for proposal in &pending {
            println!(
                "  [{:?}] {} -> {}",
                proposal.priority, proposal.target, proposal.description
            );
        }
    }

    let ctx = learning::DetectorContext {
        metrics: &[],
        state: &state,
        periods: &[],
        min_samples: 5,
    };
    let _ = learning::run_all_detectors(&ctx);
    let _ = config.learning.min_confidence;
    Ok(())
}
