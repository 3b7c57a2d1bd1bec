//! Composes Sandbox + Policy into the single surface the scheduler and LLM
//! adapter use (§4.7). Mirrors the teacher's pattern of a thin façade type
//! owning a child component and translating its results at the boundary.

use std::path::{Path, PathBuf};

use crate::error::{PolicyDenied, PolicyError};
use crate::policy::{self, Policy};
use crate::sandbox::{BashResult, FileChange, Sandbox};

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    PolicyViolation { target: String, rule: String },
    ApprovalRequired { target: String, class: String },
}

pub struct Executor {
    sandbox: Sandbox,
    policy: Policy,
    work_dir: PathBuf,
    self_modification_approved: bool,
    interactive: bool,
    events: Vec<ProgressEvent>,
}

impl Executor {
    pub fn new(sandbox: Sandbox, policy: Policy, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            sandbox,
            policy,
            work_dir: work_dir.into(),
            self_modification_approved: false,
            interactive: false,
            events: Vec::new(),
        }
    }

    pub fn events(&self) -> &[ProgressEvent] {
        &self.events
    }

    pub fn read_file(&mut self, path: &Path) -> Result<String, PolicyDenied> {
        match policy::check_file_read(&self.policy, path, &self.work_dir) {
            Ok(()) => self
                .sandbox
                .read(path)
                .map_err(|_| {
                    PolicyDenied(PolicyError::FileReadDenied {
                        target: path.to_path_buf(),
                        rule: "unreadable".to_string(),
                    })
                }),
            Err(violation) => {
                self.events.push(ProgressEvent::PolicyViolation {
                    target: path.display().to_string(),
                    rule: violation.rule.clone(),
                });
                Err(PolicyDenied(PolicyError::FileReadDenied {
                    target: path.to_path_buf(),
                    rule: violation.rule,
                }))
            }
        }
    }

    pub fn write_file(&mut self, path: &Path, content: impl Into<String>) -> Result<(), PolicyDenied> {
        match policy::check_file_write(
            &self.policy,
            path,
            &self.work_dir,
            self.self_modification_approved,
        ) {
            Ok(()) => {
                self.sandbox.write(path, content);
                Ok(())
            }
            Err(violation) => {
                self.events.push(ProgressEvent::PolicyViolation {
                    target: path.display().to_string(),
                    rule: violation.rule.clone(),
                });
                Err(PolicyDenied(PolicyError::FileWriteDenied {
                    target: path.to_path_buf(),
                    rule: violation.rule,
                }))
            }
        }
    }

    /// Checks command policy, then approval requirement. A required-approval
    /// command is skipped (not executed) in non-interactive runs, matching
    /// the scheduler's default batch mode.
    pub async fn bash(&mut self, command: &str) -> Result<BashResult, PolicyDenied> {
        if let Err(violation) = policy::check_command(&self.policy, command) {
            self.events.push(ProgressEvent::PolicyViolation {
                target: command.to_string(),
                rule: violation.rule.clone(),
            });
            return Err(PolicyDenied(PolicyError::CommandDenied {
                target: command.to_string(),
                rule: violation.rule,
            }));
        }

        let decision = policy::requires_approval(&self.policy, command);
        if decision.requires_approval && !self.interactive {
            let class = format!("{:?}", decision.approval_class);
            self.events.push(ProgressEvent::ApprovalRequired {
                target: command.to_string(),
                class: class.clone(),
            });
            return Ok(BashResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("approval required: {class}"),
            });
        }

        Ok(self.sandbox.bash(command).await)
    }

    pub fn flush(&mut self) -> anyhow::Result<Vec<FileChange>> {
        Ok(self.sandbox.flush()?)
    }

    pub fn rollback(&mut self) {
        self.sandbox.rollback();
    }

    pub fn get_pending_changes(&self) -> usize {
        self.sandbox.pending_change_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PathRules, PolicyMode};
    use crate::sandbox::SandboxConfig;
    use tempfile::tempdir;

    #[test]
    fn denied_write_emits_policy_violation_and_error() {
        let dir = tempdir().unwrap();
        let mut policy = Policy::default();
        policy.mode = PolicyMode::Delivery;
        policy.files_write = PathRules {
            allow: vec![".".to_string()],
            deny: vec!["src/protected".to_string()],
        };
        let sandbox = Sandbox::new(SandboxConfig::new(dir.path()));
        let mut executor = Executor::new(sandbox, policy, dir.path());

        let result = executor.write_file(Path::new("src/protected/a.rs"), "x");
        assert!(result.is_err());
        assert_eq!(executor.events().len(), 1);
    }

    #[tokio::test]
    async fn approval_required_command_is_skipped_non_interactively() {
        let dir = tempdir().unwrap();
        let mut policy = Policy::default();
        policy.approval.required_for = vec![crate::policy::ApprovalClass::DestructiveOps];
        let sandbox = Sandbox::new(SandboxConfig::new(dir.path()));
        let mut executor = Executor::new(sandbox, policy, dir.path());

        let result = executor.bash("rm -rf build").await.unwrap();
        assert_ne!(result.exit_code, 0);
        assert!(matches!(
            executor.events()[0],
            ProgressEvent::ApprovalRequired { .. }
        ));
    }
}
