//! Copy-on-write overlay filesystem plus command runner (§4.3).
//!
//! Buffers every write/delete in memory until `flush`; subprocesses always
//! see the real disk, never the overlay (§9). Materialization follows the
//! teacher's atomic-write idiom: write full content to a temp path, then
//! rename. Change hashes are `sha256` truncated to 12 hex characters,
//! following `stevedores-org-aivcs`'s use of `sha2`/`hex` for content
//! fingerprints in its sandbox layer.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::SandboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: PathBuf,
    pub change_type: ChangeType,
    pub before: Option<String>,
    pub after: Option<String>,
    pub hash: String,
}

#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Read { path: PathBuf },
    Bash { command: String, exit_code: i32 },
}

#[derive(Debug, Clone, Default)]
pub struct SandboxCounters {
    pub file_reads: u64,
    pub bytes_read: u64,
    pub file_writes: u64,
    pub bytes_written: u64,
    pub bash_commands: u64,
    pub total_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct BashResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub struct SandboxConfig {
    pub root: PathBuf,
    pub timeout: Duration,
    pub max_commands: u64,
    pub cache_reads: bool,
    pub allowed_commands: Vec<String>,
    pub denied_commands: Vec<String>,
}

impl SandboxConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            timeout: Duration::from_secs(120),
            max_commands: 50,
            cache_reads: true,
            allowed_commands: Vec::new(),
            denied_commands: Vec::new(),
        }
    }
}

struct CacheEntry {
    content: String,
    mtime: std::time::SystemTime,
}

/// One task attempt's worth of overlay state. Not shared across attempts;
/// owned by the single scheduler thread (§5).
pub struct Sandbox {
    config: SandboxConfig,
    pending_writes: HashMap<PathBuf, String>,
    pending_deletes: HashSet<PathBuf>,
    read_cache: HashMap<PathBuf, CacheEntry>,
    log: Vec<ExecutionEvent>,
    counters: SandboxCounters,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            pending_writes: HashMap::new(),
            pending_deletes: HashSet::new(),
            read_cache: HashMap::new(),
            log: Vec::new(),
            counters: SandboxCounters::default(),
        }
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.root.join(path)
        }
    }

    pub fn write(&mut self, path: &Path, content: impl Into<String>) {
        let abs = self.absolute(path);
        self.pending_deletes.remove(&abs);
        self.pending_writes.insert(abs, content.into());
    }

    pub fn delete(&mut self, path: &Path) {
        let abs = self.absolute(path);
        self.pending_writes.remove(&abs);
        self.pending_deletes.insert(abs);
    }

    pub fn exists(&self, path: &Path) -> bool {
        let abs = self.absolute(path);
        if self.pending_writes.contains_key(&abs) {
            return true;
        }
        abs.exists() && !self.pending_deletes.contains(&abs)
    }

    pub fn read(&mut self, path: &Path) -> Result<String, SandboxError> {
        let abs = self.absolute(path);
        if self.pending_deletes.contains(&abs) {
            return Err(SandboxError::FileDeletedInSandbox(abs));
        }
        if let Some(content) = self.pending_writes.get(&abs) {
            return Ok(content.clone());
        }

        let metadata = std::fs::metadata(&abs).map_err(|source| SandboxError::Io {
            path: abs.clone(),
            source,
        })?;
        let mtime = metadata.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);

        if self.config.cache_reads {
            if let Some(cached) = self.read_cache.get(&abs) {
                if cached.mtime == mtime {
                    return Ok(cached.content.clone());
                }
            }
        }

        let content = std::fs::read_to_string(&abs).map_err(|source| SandboxError::Io {
            path: abs.clone(),
            source,
        })?;
        self.counters.bytes_read += content.len() as u64;
        self.counters.file_reads += 1;
        self.log.push(ExecutionEvent::Read { path: abs.clone() });
        if self.config.cache_reads {
            self.read_cache.insert(
                abs,
                CacheEntry {
                    content: content.clone(),
                    mtime,
                },
            );
        }
        Ok(content)
    }

    /// Materializes pending writes/deletes atomically per file and clears
    /// pending state. Hash is computed over the new content.
    pub fn flush(&mut self) -> Result<Vec<FileChange>, SandboxError> {
        let mut changes = Vec::new();

        for (path, content) in self.pending_writes.drain() {
            let before = std::fs::read_to_string(&path).ok();
            let change_type = if before.is_some() {
                ChangeType::Modified
            } else {
                ChangeType::Created
            };
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| SandboxError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            let tmp_path = path.with_extension("sandbox.tmp");
            std::fs::write(&tmp_path, &content).map_err(|source| SandboxError::Io {
                path: tmp_path.clone(),
                source,
            })?;
            std::fs::rename(&tmp_path, &path).map_err(|source| SandboxError::Io {
                path: path.clone(),
                source,
            })?;

            let hash = content_hash(&content);
            self.counters.file_writes += 1;
            self.counters.bytes_written += content.len() as u64;
            changes.push(FileChange {
                path,
                change_type,
                before,
                after: Some(content),
                hash,
            });
        }

        for path in self.pending_deletes.drain() {
            let before = std::fs::read_to_string(&path).ok();
            if path.exists() {
                std::fs::remove_file(&path).map_err(|source| SandboxError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
            changes.push(FileChange {
                path,
                change_type: ChangeType::Deleted,
                before,
                after: None,
                hash: String::new(),
            });
        }

        Ok(changes)
    }

    pub fn rollback(&mut self) {
        self.pending_writes.clear();
        self.pending_deletes.clear();
    }

    pub fn reset(&mut self) {
        self.rollback();
        self.log.clear();
        self.counters = SandboxCounters::default();
    }

    pub fn counters(&self) -> SandboxCounters {
        self.counters.clone()
    }

    pub fn pending_change_count(&self) -> usize {
        self.pending_writes.len() + self.pending_deletes.len()
    }

    pub fn log(&self) -> Vec<ExecutionEvent> {
        self.log.clone()
    }

    fn command_matches(cmd: &str, pattern: &str) -> bool {
        let first_token = cmd.split_whitespace().next().unwrap_or(cmd);
        first_token == pattern || first_token.starts_with(pattern)
    }

    pub async fn bash(&mut self, command: &str) -> BashResult {
        for denied in &self.config.denied_commands {
            if Self::command_matches(command, denied) {
                return BashResult {
                    exit_code: 126,
                    stdout: String::new(),
                    stderr: "Command not allowed".to_string(),
                };
            }
        }
        if !self.config.allowed_commands.is_empty()
            && !self
                .config
                .allowed_commands
                .iter()
                .any(|allowed| Self::command_matches(command, allowed))
        {
            return BashResult {
                exit_code: 126,
                stdout: String::new(),
                stderr: "Command not allowed".to_string(),
            };
        }
        if self.counters.bash_commands >= self.config.max_commands {
            return BashResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: "Command limit exceeded".to_string(),
            };
        }

        let started = std::time::Instant::now();
        let result = timeout(
            self.config.timeout,
            Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.config.root)
                .env("RALPH_SANDBOX", "true")
                .output(),
        )
        .await;
        self.counters.total_duration += started.elapsed();

        let bash_result = match result {
            Ok(Ok(output)) => BashResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Ok(Err(err)) => BashResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: err.to_string(),
            },
            Err(_) => BashResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: "Time limit exceeded".to_string(),
            },
        };

        self.counters.bash_commands += 1;
        self.log.push(ExecutionEvent::Bash {
            command: command.to_string(),
            exit_code: bash_result.exit_code,
        });
        bash_result
    }
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..12].to_string()
}
