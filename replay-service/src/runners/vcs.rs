// Version Control
// Answers whether a file is committed, which decides deployment installs

use std::collections::HashSet;
use std::path::PathBuf;
use tokio::process::Command;
use tokio::sync::OnceCell;

/// Trait for looking up tracked files
#[async_trait::async_trait]
pub trait VcsTrackedFiles: Send + Sync {
    /// Whether `path` (relative to the working directory) is tracked
    async fn is_tracked(&self, path: &str) -> bool;
}

/// Tracked files as reported by `git ls-files`, listed once per run
pub struct GitTrackedFiles {
    working_dir: PathBuf,
    files: OnceCell<HashSet<String>>,
}

impl GitTrackedFiles {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            files: OnceCell::new(),
        }
    }

    async fn list(&self) -> HashSet<String> {
        if !self.working_dir.join(".git").exists() {
            return HashSet::new();
        }

        let output = Command::new("git")
            .arg("ls-files")
            .current_dir(&self.working_dir)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::to_string)
                .collect(),
            Ok(output) => {
                tracing::warn!(status = %output.status, "git ls-files failed");
                HashSet::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not run git ls-files");
                HashSet::new()
            }
        }
    }
}

#[async_trait::async_trait]
impl VcsTrackedFiles for GitTrackedFiles {
    async fn is_tracked(&self, path: &str) -> bool {
        let path = path.strip_prefix("./").unwrap_or(path);
        self.files
            .get_or_init(|| self.list())
            .await
            .contains(path)
    }
}
