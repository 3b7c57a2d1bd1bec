//! Resolves the per-repository state directory layout (component 1, §6.1).

use anyhow::Context;
use std::path::{Path, PathBuf};

/// Resolved locations of the three append-only logs plus the lock file.
///
/// Mirrors the teacher's `crank_io::repo_crank_dir` resolution, generalized
/// from a single `.crank/` directory to the three-file layout of §6.1.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn tasks_jsonl(&self) -> PathBuf {
        self.root.join("tasks.jsonl")
    }

    pub fn progress_jsonl(&self) -> PathBuf {
        self.root.join("progress.jsonl")
    }

    pub fn learning_jsonl(&self) -> PathBuf {
        self.root.join("learning.jsonl")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("run.lock")
    }

    pub fn ensure_exists(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }
}

pub fn ensure_dir(path: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

/// Enforces the single-writer assumption of §5: concurrent schedulers
/// against the same state directory are unsupported. `create_new` fails if
/// the lock file already exists; the guard removes it on drop.
pub struct LockGuard {
    lock_path: PathBuf,
}

impl LockGuard {
    pub fn acquire(paths: &StatePaths) -> anyhow::Result<Self> {
        paths.ensure_exists()?;
        let lock_path = paths.lock_file();
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .with_context(|| {
                format!(
                    "could not acquire lock {} (another run may be active)",
                    lock_path.display()
                )
            })?;
        use std::io::Write as _;
        writeln!(file, "pid={}", std::process::id())?;
        Ok(Self { lock_path })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn state_paths_are_under_root() {
        let dir = tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        assert_eq!(paths.tasks_jsonl(), dir.path().join("tasks.jsonl"));
        assert_eq!(paths.progress_jsonl(), dir.path().join("progress.jsonl"));
        assert_eq!(paths.learning_jsonl(), dir.path().join("learning.jsonl"));
        assert_eq!(paths.lock_file(), dir.path().join("run.lock"));
    }

    #[test]
    fn ensure_exists_creates_nested_dirs() {
        let dir = tempdir().unwrap();
        let paths = StatePaths::new(dir.path().join("a").join("b"));
        paths.ensure_exists().unwrap();
        assert!(paths.root.exists());
    }

    #[test]
    fn second_lock_acquisition_fails_while_first_held() {
        let dir = tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        let guard = LockGuard::acquire(&paths).unwrap();
        assert!(LockGuard::acquire(&paths).is_err());
        drop(guard);
        assert!(LockGuard::acquire(&paths).is_ok());
    }
}
