//! Pure decision functions over file/command/action (§4.4).
//!
//! No I/O here beyond `RunRequiredChecks`, which shells out through an
//! injected runner the way the teacher's `run_turn_codex` spawns a process
//! and captures its output in `main.rs`.

use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    Core,
    Delivery,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PathRules {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandRules {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalClass {
    DestructiveOps,
    DependencyChanges,
    ProductionImpactingEdits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredCheck {
    Test,
    Build,
    Lint,
    Typecheck,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub required_for: Vec<ApprovalClass>,
    pub require_reason: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ChecksConfig {
    pub required: Vec<RequiredCheck>,
    pub rollback_on_fail: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Policy {
    pub version: u32,
    pub mode: PolicyMode,
    #[serde(rename = "filesRead", default)]
    pub files_read: PathRules,
    #[serde(rename = "filesWrite", default)]
    pub files_write: PathRules,
    #[serde(default)]
    pub commands: CommandRules,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub checks: ChecksConfig,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            version: 1,
            mode: PolicyMode::Core,
            files_read: PathRules::default(),
            files_write: PathRules::default(),
            commands: CommandRules::default(),
            approval: ApprovalConfig::default(),
            checks: ChecksConfig::default(),
        }
    }
}

/// A recorded denial, distinct from `PolicyError` so both file and command
/// checks can share the same `{rule}` rendering without allocating an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub rule: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub passed: bool,
    pub output: String,
    pub duration: Duration,
}

/// Prefix rule of §4.4: `.` matches everything; `X` matches `P` if `P == X`,
/// `P` starts with `X/`, or `P` starts with `X` (the last clause
/// intentionally lets `.env` deny `.env.local` too — see DESIGN.md).
fn path_matches(pattern: &str, rel_path: &str) -> bool {
    if pattern == "." {
        return true;
    }
    rel_path == pattern
        || rel_path.starts_with(&format!("{pattern}/"))
        || rel_path.starts_with(pattern)
}

fn relative_to(work_dir: &Path, path: &Path) -> String {
    path.strip_prefix(work_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn check_path(
    rules: &PathRules,
    path: &Path,
    work_dir: &Path,
    mode: PolicyMode,
    label: &str,
) -> Result<(), Violation> {
    let rel = relative_to(work_dir, path);
    for deny in &rules.deny {
        if path_matches(deny, &rel) {
            return Err(Violation {
                rule: format!("deny{label}: {deny}"),
            });
        }
    }
    for allow in &rules.allow {
        if path_matches(allow, &rel) {
            return Ok(());
        }
    }
    match mode {
        PolicyMode::Delivery => Err(Violation {
            rule: format!("not in allow{label} list (delivery mode)"),
        }),
        PolicyMode::Core => Ok(()),
    }
}

pub fn check_file_read(policy: &Policy, path: &Path, work_dir: &Path) -> Result<(), Violation> {
    check_path(&policy.files_read, path, work_dir, policy.mode, "Read")
}

pub fn check_file_write(
    policy: &Policy,
    path: &Path,
    work_dir: &Path,
    self_modification_approved: bool,
) -> Result<(), Violation> {
    if policy.mode == PolicyMode::Delivery {
        let rel = relative_to(work_dir, path);
        let under_guarded = path_matches("runtime", &rel) || path_matches("skills", &rel);
        if under_guarded && !self_modification_approved {
            return Err(Violation {
                rule: "self-modification denied: runtime/ and skills/ require explicit approval"
                    .to_string(),
            });
        }
    }
    check_path(&policy.files_write, path, work_dir, policy.mode, "Write")
}

fn command_matches(cmd: &str, pattern: &str) -> bool {
    cmd == pattern || cmd.starts_with(&format!("{pattern} ")) || cmd.contains(pattern)
}

pub fn check_command(policy: &Policy, cmd: &str) -> Result<(), Violation> {
    for deny in &policy.commands.deny {
        if command_matches(cmd, deny) {
            return Err(Violation {
                rule: format!("denyCommand: {deny}"),
            });
        }
    }
    for allow in &policy.commands.allow {
        if command_matches(cmd, allow) {
            return Ok(());
        }
    }
    match policy.mode {
        PolicyMode::Delivery => Err(Violation {
            rule: "not in allowCommands list (delivery mode)".to_string(),
        }),
        PolicyMode::Core => Ok(()),
    }
}

struct ClassPattern {
    class: ApprovalClass,
    needles: &'static [&'static str],
}

/// Independent regex families per §4.4. Real regexes are overkill for
/// prefix/contains style matching against a handful of literal fragments, so
/// this checks substrings case-insensitively, matching the spec's intent
/// without a `regex` dependency the teacher never carries.
const CLASS_PATTERNS: &[ClassPattern] = &[
    ClassPattern {
        class: ApprovalClass::DestructiveOps,
        needles: &[
            "rm -rf ",
            "rm -r ",
            "rm -f ",
            "rm ",
            "git reset",
            "git clean",
            "git checkout --",
            "git push --force",
            "drop table",
            "drop database",
            "truncate",
            "delete from",
        ],
    },
    ClassPattern {
        class: ApprovalClass::DependencyChanges,
        needles: &[
            "npm install",
            "npm uninstall",
            "npm update",
            "yarn add",
            "yarn remove",
            "pnpm add",
            "pnpm remove",
            "pip install",
            "pip uninstall",
            "cargo add",
            "cargo remove",
            "package.json",
            "yarn.lock",
            "pnpm-lock.yaml",
            "package-lock.json",
        ],
    },
    ClassPattern {
        class: ApprovalClass::ProductionImpactingEdits,
        needles: &[
            "deploy",
            "release",
            "publish",
            "dockerfile",
            "docker-compose",
            ".github/workflows",
            ".env.production",
            "infrastructure/",
            "terraform/",
            "k8s/",
            "kubernetes/",
        ],
    },
];

/// Splits on shell chaining operators so each piece can be checked for a
/// command-name prefix independently of what runs before/after it.
fn subcommands(text: &str) -> Vec<&str> {
    text.split(['&', ';', '|'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn classify_action(text: &str) -> HashSet<ApprovalClass> {
    let lower = text.to_lowercase();
    let subs = subcommands(&lower);
    CLASS_PATTERNS
        .iter()
        .filter(|p| {
            p.needles.iter().any(|needle| {
                // Trailing-space needles are command-name prefixes (`"rm "`);
                // matching them as a bare substring flags unrelated text like
                // "confirm the changes" or "warm restart". Require the needle
                // to anchor the start of a (sub)command instead.
                if needle.ends_with(' ') {
                    subs.iter().any(|sub| sub.starts_with(needle))
                } else {
                    lower.contains(needle)
                }
            })
        })
        .map(|p| p.class)
        .collect()
}

#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    pub requires_approval: bool,
    pub approval_class: Option<ApprovalClass>,
}

pub fn requires_approval(policy: &Policy, action_text: &str) -> ApprovalDecision {
    let classes = classify_action(action_text);
    for class in &classes {
        if policy.approval.required_for.contains(class) {
            return ApprovalDecision {
                requires_approval: true,
                approval_class: Some(*class),
            };
        }
    }
    ApprovalDecision {
        requires_approval: false,
        approval_class: None,
    }
}

/// Runs each configured check's command and measures wall duration. The
/// runner is injected so tests can stub exit codes without spawning a shell.
pub trait CheckRunner {
    fn run(&self, command: &str) -> (i32, String, String);
}

pub struct ShellRunner;

impl CheckRunner for ShellRunner {
    fn run(&self, command: &str) -> (i32, String, String) {
        match std::process::Command::new("sh").arg("-c").arg(command).output() {
            Ok(out) => (
                out.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&out.stdout).into_owned(),
                String::from_utf8_lossy(&out.stderr).into_owned(),
            ),
            Err(err) => (-1, String::new(), err.to_string()),
        }
    }
}

pub fn run_required_checks(
    policy: &Policy,
    command_map: &std::collections::HashMap<RequiredCheck, String>,
    runner: &dyn CheckRunner,
) -> Vec<CheckResult> {
    policy
        .checks
        .required
        .iter()
        .map(|check| match command_map.get(check) {
            None => CheckResult {
                passed: false,
                output: format!("No command configured for check: {check:?}"),
                duration: Duration::ZERO,
            },
            Some(command) => {
                let start = Instant::now();
                let (code, stdout, stderr) = runner.run(command);
                let duration = start.elapsed();
                let output = if stdout.is_empty() { stderr } else { stdout };
                CheckResult {
                    passed: code == 0,
                    output,
                    duration,
                }
            }
        })
        .collect()
}

pub fn all_checks_passed(results: &[CheckResult]) -> bool {
    !results.is_empty() && results.iter().all(|r| r.passed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery_policy() -> Policy {
        Policy {
            mode: PolicyMode::Delivery,
            files_write: PathRules {
                allow: vec![".".to_string()],
                deny: vec!["src/protected".to_string()],
            },
            ..Policy::default()
        }
    }

    // S4: deny beats allow.
    #[test]
    fn deny_beats_allow() {
        let policy = delivery_policy();
        let result = check_file_write(
            &policy,
            Path::new("src/protected/a.ts"),
            Path::new("."),
            false,
        );
        let violation = result.unwrap_err();
        assert!(violation.rule.contains("denyWrite: src/protected"));
    }

    #[test]
    fn env_prefix_denies_env_local() {
        let mut policy = delivery_policy();
        policy.files_read.deny = vec![".env".to_string()];
        policy.files_read.allow = vec![".".to_string()];
        let result = check_file_read(&policy, Path::new(".env.local"), Path::new("."));
        assert!(result.is_err());
    }

    #[test]
    fn core_mode_allows_by_default() {
        let policy = Policy::default();
        assert!(check_file_read(&policy, Path::new("anything.rs"), Path::new(".")).is_ok());
    }

    #[test]
    fn delivery_mode_denies_outside_allowlist() {
        let mut policy = delivery_policy();
        policy.files_write.allow.clear();
        let result = check_file_write(&policy, Path::new("x.rs"), Path::new("."), false);
        assert!(result.unwrap_err().rule.contains("delivery mode"));
    }

    #[test]
    fn self_modification_guard_blocks_runtime_writes() {
        let policy = delivery_policy();
        let result = check_file_write(
            &policy,
            Path::new("runtime/prompts.md"),
            Path::new("."),
            false,
        );
        assert!(result.is_err());
        let approved = check_file_write(
            &policy,
            Path::new("runtime/prompts.md"),
            Path::new("."),
            true,
        );
        assert!(approved.is_ok());
    }

    // S5-equivalent: command classification.
    #[test]
    fn classify_destructive_rm() {
        let classes = classify_action("rm -rf /tmp/foo");
        assert!(classes.contains(&ApprovalClass::DestructiveOps));
    }

    #[test]
    fn classify_dependency_change() {
        let classes = classify_action("npm install left-pad");
        assert!(classes.contains(&ApprovalClass::DependencyChanges));
    }

    #[test]
    fn classify_does_not_flag_rm_inside_unrelated_words() {
        let classes = classify_action("confirm the changes before a warm restart");
        assert!(!classes.contains(&ApprovalClass::DestructiveOps));
    }

    #[test]
    fn classify_at_most_independent_per_class() {
        let classes = classify_action("rm -rf node_modules && npm install");
        assert!(classes.contains(&ApprovalClass::DestructiveOps));
        assert!(classes.contains(&ApprovalClass::DependencyChanges));
        assert_eq!(classes.len(), 2);
    }

    // S8: required checks.
    struct StubRunner;
    impl CheckRunner for StubRunner {
        fn run(&self, command: &str) -> (i32, String, String) {
            if command == "npm test" {
                (0, "ok".to_string(), String::new())
            } else {
                (1, String::new(), "build failed".to_string())
            }
        }
    }

    #[test]
    fn required_checks_mixed_result() {
        let mut policy = Policy::default();
        policy.checks.required = vec![RequiredCheck::Test, RequiredCheck::Build];
        let mut map = std::collections::HashMap::new();
        map.insert(RequiredCheck::Test, "npm test".to_string());
        map.insert(RequiredCheck::Build, "npm run build".to_string());

        let results = run_required_checks(&policy, &map, &StubRunner);
        assert!(!all_checks_passed(&results));
        let build_result = &results[1];
        assert!(!build_result.passed);
        assert_eq!(build_result.output, "build failed");
    }

    #[test]
    fn missing_command_for_check_fails_without_running() {
        let mut policy = Policy::default();
        policy.checks.required = vec![RequiredCheck::Lint];
        let map = std::collections::HashMap::new();
        let results = run_required_checks(&policy, &map, &StubRunner);
        assert!(!results[0].passed);
        assert!(results[0].output.contains("No command configured"));
    }
}
