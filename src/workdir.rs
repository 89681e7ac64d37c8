use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::errors::JobError;

/// Directories currently owned by running jobs. The cleaner never touches
/// anything registered here.
#[derive(Debug, Clone, Default)]
pub struct ActiveWorkDirs {
    inner: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ActiveWorkDirs {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, path: &Path) {
        if let Ok(mut set) = self.inner.lock() {
            set.insert(path.to_path_buf());
        }
    }

    fn remove(&self, path: &Path) {
        if let Ok(mut set) = self.inner.lock() {
            set.remove(path);
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .map(|set| set.contains(path))
            .unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|set| set.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn remove_tree(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove work dir");
        }
    }
}

/// Exclusive per-job directory. Registered as active for as long as the
/// guard lives. With `cleanup` set it is removed by [`WorkDir::close`], or
/// on drop if the guard is never closed.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    cleanup: bool,
    active: ActiveWorkDirs,
}

impl WorkDir {
    /// Create `<temp_dir>/job-<job_id>-<suffix>`. Fails if it already exists.
    pub fn create(
        temp_dir: &Path,
        job_id: &str,
        cleanup: bool,
        active: &ActiveWorkDirs,
    ) -> Result<Self, JobError> {
        // Job ids come off the queue; keep them from escaping temp_dir.
        let safe_id: String = job_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .take(64)
            .collect();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let path = temp_dir.join(format!("job-{}-{}", safe_id, &suffix[..8]));

        std::fs::create_dir_all(temp_dir).map_err(|source| JobError::WorkDir {
            path: temp_dir.to_path_buf(),
            source,
        })?;
        std::fs::create_dir(&path).map_err(|source| JobError::WorkDir {
            path: path.clone(),
            source,
        })?;

        active.insert(&path);
        Ok(Self {
            path,
            cleanup,
            active: active.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the repository is cloned inside the work dir.
    pub fn repo_path(&self) -> PathBuf {
        self.path.join("repo")
    }

    /// Remove the directory on the blocking pool and deregister it once it
    /// is gone.
    pub async fn close(mut self) {
        if !self.cleanup {
            return;
        }
        self.cleanup = false;
        let path = self.path.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || remove_tree(&path)).await {
            tracing::warn!(path = %self.path.display(), error = %e, "work dir removal task failed");
        }
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.cleanup {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let path = self.path.clone();
                    handle.spawn_blocking(move || remove_tree(&path));
                }
                Err(_) => remove_tree(&self.path),
            }
        }
        self.active.remove(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_registers_and_drop_removes() {
        let tmp = TempDir::new().unwrap();
        let active = ActiveWorkDirs::new();
        let path = {
            let dir = WorkDir::create(tmp.path(), "abc", true, &active).unwrap();
            assert!(dir.path().is_dir());
            assert!(active.contains(dir.path()));
            let name = dir.path().file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with("job-abc-"));
            dir.path().to_path_buf()
        };
        assert!(!path.exists());
        assert!(active.is_empty());
    }

    #[test]
    fn test_drop_keeps_dir_without_cleanup() {
        let tmp = TempDir::new().unwrap();
        let active = ActiveWorkDirs::new();
        let dir = WorkDir::create(tmp.path(), "abc", false, &active).unwrap();
        let path = dir.path().to_path_buf();
        drop(dir);
        assert!(path.exists());
        assert!(!active.contains(&path));
    }

    #[tokio::test]
    async fn test_close_removes_then_deregisters() {
        let tmp = TempDir::new().unwrap();
        let active = ActiveWorkDirs::new();
        let dir = WorkDir::create(tmp.path(), "abc", true, &active).unwrap();
        let path = dir.path().to_path_buf();
        std::fs::create_dir_all(dir.repo_path().join("src")).unwrap();
        std::fs::write(dir.repo_path().join("src/lib.rs"), "fn main() {}").unwrap();

        dir.close().await;
        assert!(!path.exists());
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn test_close_keeps_dir_without_cleanup() {
        let tmp = TempDir::new().unwrap();
        let active = ActiveWorkDirs::new();
        let dir = WorkDir::create(tmp.path(), "abc", false, &active).unwrap();
        let path = dir.path().to_path_buf();
        dir.close().await;
        assert!(path.exists());
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn test_drop_inside_runtime_removes_off_thread() {
        let tmp = TempDir::new().unwrap();
        let active = ActiveWorkDirs::new();
        let dir = WorkDir::create(tmp.path(), "abc", true, &active).unwrap();
        let path = dir.path().to_path_buf();
        drop(dir);
        assert!(active.is_empty());
        for _ in 0..100 {
            if !path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_same_job_gets_distinct_dirs() {
        let tmp = TempDir::new().unwrap();
        let active = ActiveWorkDirs::new();
        let a = WorkDir::create(tmp.path(), "abc", true, &active).unwrap();
        let b = WorkDir::create(tmp.path(), "abc", true, &active).unwrap();
        assert_ne!(a.path(), b.path());
        assert_eq!(active.len(), 2);
    }
}
