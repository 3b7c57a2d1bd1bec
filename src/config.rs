//! Runtime configuration (§6.2), loaded from JSON or TOML by file
//! extension. Per-key defaults follow the teacher's `default_*()` idiom
//! in `main.rs`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::notify::NotificationConfig;
use crate::policy::{ApprovalClass, RequiredCheck};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Continue,
    Stop,
}

fn default_max_iterations_per_task() -> u32 {
    20
}
fn default_max_time_per_task_secs() -> u64 {
    1800
}
fn default_max_tasks_per_run() -> u32 {
    50
}
fn default_max_time_per_run_secs() -> u64 {
    14_400
}
fn default_on_failure() -> OnFailure {
    OnFailure::Continue
}
fn default_parallelism() -> u32 {
    1
}
fn default_sandbox_timeout_secs() -> u64 {
    120
}
fn default_max_commands() -> u64 {
    50
}
fn default_cache_reads() -> bool {
    true
}
fn default_commit_prefix() -> String {
    "ralph: ".to_string()
}
fn default_branch_prefix() -> String {
    "ralph/".to_string()
}
fn default_min_confidence() -> f64 {
    0.6
}
fn default_retention_days() -> u32 {
    90
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoopConfig {
    #[serde(default = "default_max_iterations_per_task")]
    pub max_iterations_per_task: u32,
    #[serde(rename = "maxTimePerTask", default = "default_max_time_per_task_secs")]
    pub max_time_per_task_secs: u64,
    pub max_cost_per_task: Option<f64>,
    #[serde(default = "default_max_tasks_per_run")]
    pub max_tasks_per_run: u32,
    #[serde(rename = "maxTimePerRun", default = "default_max_time_per_run_secs")]
    pub max_time_per_run_secs: u64,
    #[serde(default = "default_on_failure")]
    pub on_failure: OnFailure,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    pub dry_run: Option<bool>,
    pub task_filter: Option<String>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations_per_task: default_max_iterations_per_task(),
            max_time_per_task_secs: default_max_time_per_task_secs(),
            max_cost_per_task: None,
            max_tasks_per_run: default_max_tasks_per_run(),
            max_time_per_run_secs: default_max_time_per_run_secs(),
            on_failure: default_on_failure(),
            parallelism: default_parallelism(),
            dry_run: None,
            task_filter: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxConfigFile {
    #[serde(rename = "timeout", default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_commands")]
    pub max_commands: u64,
    #[serde(default = "default_cache_reads")]
    pub cache_reads: bool,
    pub allowed_paths: Option<Vec<String>>,
    pub denied_paths: Option<Vec<String>>,
    pub allowed_commands: Option<Vec<String>>,
    pub denied_commands: Option<Vec<String>>,
}

impl Default for SandboxConfigFile {
    fn default() -> Self {
        Self {
            timeout_secs: default_sandbox_timeout_secs(),
            max_commands: default_max_commands(),
            cache_reads: default_cache_reads(),
            allowed_paths: None,
            denied_paths: None,
            allowed_commands: None,
            denied_commands: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackerConfig {
    #[serde(rename = "type")]
    pub tracker_type: Option<String>,
    pub config_path: Option<PathBuf>,
    pub auto_create: bool,
    pub auto_transition: bool,
    pub auto_comment: bool,
    pub auto_pull: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GitConfig {
    pub auto_commit: bool,
    #[serde(default = "default_commit_prefix")]
    pub commit_prefix: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            auto_commit: false,
            commit_prefix: default_commit_prefix(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LearningConfig {
    pub enabled: bool,
    pub auto_apply_improvements: bool,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_apply_improvements: false,
            min_confidence: default_min_confidence(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicyConfigFile {
    pub mode: Option<crate::policy::PolicyMode>,
    pub files_read: Option<crate::policy::PathRules>,
    pub files_write: Option<crate::policy::PathRules>,
    pub commands: Option<crate::policy::CommandRules>,
    pub approval_required_for: Vec<ApprovalClass>,
    pub checks_required: Vec<RequiredCheck>,
    pub checks_rollback_on_fail: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub plan_file: PathBuf,
    pub agents_file: PathBuf,
    #[serde(default)]
    pub r#loop: LoopConfig,
    #[serde(default)]
    pub sandbox: SandboxConfigFile,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub policy: PolicyConfigFile,
}

impl RuntimeConfig {
    /// Loads by extension: `.toml` via the `toml` crate, anything else as
    /// JSON, matching the teacher's TOML-only load but generalized per §6.2
    /// (the config's default path is `ralph.config.json`).
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: RuntimeConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&raw)
                .with_context(|| format!("failed to parse TOML config: {}", path.display()))?,
            _ => serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse JSON config: {}", path.display()))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// `config.loop.parallelism` is reserved for future use and must
    /// default to, and remain, 1 (§5).
    pub fn validate(&self) -> Result<()> {
        if self.r#loop.parallelism != 1 {
            bail!("loop.parallelism must be 1 in this revision (got {})", self.r#loop.parallelism);
        }
        Ok(())
    }

    pub fn apply_cli_overrides(&mut self, dry_run: bool, task: Option<String>) {
        if dry_run {
            self.r#loop.dry_run = Some(true);
        }
        if let Some(task_id) = task {
            self.r#loop.task_filter = Some(task_id);
            self.r#loop.max_tasks_per_run = self.r#loop.max_tasks_per_run.min(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parallelism_other_than_one_is_rejected() {
        let mut config = minimal_config();
        config.r#loop.parallelism = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_json_by_default_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ralph.config.json");
        std::fs::write(
            &path,
            r#"{"planFile": "PLAN.md", "agentsFile": "AGENTS.md"}"#,
        )
        .unwrap();
        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.plan_file, PathBuf::from("PLAN.md"));
        assert_eq!(config.r#loop.parallelism, 1);
    }

    #[test]
    fn full_camel_case_document_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ralph.config.json");
        std::fs::write(
            &path,
            r#"{
                "planFile": "PLAN.md",
                "agentsFile": "AGENTS.md",
                "loop": {"maxIterationsPerTask": 5, "maxTimePerTask": 60, "maxTimePerRun": 600},
                "sandbox": {"timeout": 30, "maxCommands": 10},
                "tracker": {"type": "jira", "autoCreate": true},
                "git": {"autoCommit": true, "commitPrefix": "fix: "},
                "learning": {"enabled": true, "minConfidence": 0.8}
            }"#,
        )
        .unwrap();
        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.r#loop.max_iterations_per_task, 5);
        assert_eq!(config.r#loop.max_time_per_task_secs, 60);
        assert_eq!(config.r#loop.max_time_per_run_secs, 600);
        assert_eq!(config.sandbox.timeout_secs, 30);
        assert_eq!(config.sandbox.max_commands, 10);
        assert_eq!(config.tracker.tracker_type.as_deref(), Some("jira"));
        assert!(config.tracker.auto_create);
        assert!(config.git.auto_commit);
        assert_eq!(config.git.commit_prefix, "fix: ");
        assert!(config.learning.enabled);
        assert_eq!(config.learning.min_confidence, 0.8);
    }

    #[test]
    fn dry_run_flag_sets_loop_dry_run() {
        let mut config = minimal_config();
        config.apply_cli_overrides(true, None);
        assert_eq!(config.r#loop.dry_run, Some(true));
    }

    #[test]
    fn task_filter_caps_max_tasks_per_run() {
        let mut config = minimal_config();
        config.apply_cli_overrides(false, Some("t1".to_string()));
        assert_eq!(config.r#loop.task_filter, Some("t1".to_string()));
        assert_eq!(config.r#loop.max_tasks_per_run, 1);
    }

    fn minimal_config() -> RuntimeConfig {
        RuntimeConfig {
            plan_file: PathBuf::from("PLAN.md"),
            agents_file: PathBuf::from("AGENTS.md"),
            r#loop: LoopConfig::default(),
            sandbox: SandboxConfigFile::default(),
            tracker: TrackerConfig::default(),
            git: GitConfig::default(),
            learning: LearningConfig::default(),
            notifications: NotificationConfig::default(),
            policy: PolicyConfigFile::default(),
        }
    }
}
