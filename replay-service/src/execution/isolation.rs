// Run Isolation
// Scratch space and relocation of ambient dependency-manager state for one run

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;

/// Local dependency-manager configuration directory in the working directory
pub const CONFIG_DIR: &str = ".bundle";

/// Inherited variables hidden from every command, in addition to `BUNDLE_*`
pub const SCRUBBED_VARS: [&str; 2] = ["RUBYOPT", "RUBYLIB"];

const SCRUBBED_PREFIX: &str = "BUNDLE_";

/// Errors that can occur while isolating a run
#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("Failed to create scratch directory: {0}")]
    Scratch(#[source] io::Error),

    #[error("Failed to move {from} to {to}: {source}")]
    Relocate {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Names among `vars` that must not leak into cell commands
pub fn scrubbed_variables<I, K>(vars: I) -> Vec<String>
where
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
{
    let mut names: Vec<String> = vars
        .into_iter()
        .map(|name| name.as_ref().to_string())
        .filter(|name| name.starts_with(SCRUBBED_PREFIX) || SCRUBBED_VARS.contains(&name.as_str()))
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Scrubbed names present in this process's environment
pub fn inherited_scrubbed_variables() -> Vec<String> {
    scrubbed_variables(
        std::env::vars_os()
            .filter_map(|(name, _)| name.into_string().ok()),
    )
}

/// Move a directory tree, copying when a rename cannot cross filesystems
fn move_dir(from: &Path, to: &Path) -> Result<(), IsolationError> {
    let relocate = |source| IsolationError::Relocate {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    copy_dir(from, to).map_err(relocate)?;
    fs::remove_dir_all(from).map_err(relocate)
}

fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Process-wide state of one matrix run
///
/// Preparing moves an existing `.bundle` out of the working directory so
/// every cell starts from the same baseline. Restoring removes whatever the
/// run left behind and moves the original back. Dropping an unrestored
/// sandbox restores it as well. If the original cannot be moved back, the
/// scratch directory holding it is kept on disk.
#[derive(Debug)]
pub struct RunSandbox {
    scratch: Option<TempDir>,
    scratch_path: PathBuf,
    working_dir: PathBuf,
    relocated: Option<PathBuf>,
    restored: bool,
}

impl RunSandbox {
    pub fn prepare(working_dir: impl Into<PathBuf>) -> Result<Self, IsolationError> {
        let working_dir = working_dir.into();
        let scratch = tempfile::Builder::new()
            .prefix("replay-")
            .tempdir()
            .map_err(IsolationError::Scratch)?;
        fs::create_dir(scratch.path().join("locks")).map_err(IsolationError::Scratch)?;

        let config_dir = working_dir.join(CONFIG_DIR);
        let relocated = if config_dir.is_dir() {
            let target = scratch.path().join("bundle-config");
            move_dir(&config_dir, &target)?;
            tracing::info!(from = %config_dir.display(), to = %target.display(), "relocated local config");
            Some(target)
        } else {
            None
        };

        Ok(Self {
            scratch_path: scratch.path().to_path_buf(),
            scratch: Some(scratch),
            working_dir,
            relocated,
            restored: false,
        })
    }

    /// Directory shared by all workers for lock files
    pub fn lock_dir(&self) -> PathBuf {
        self.scratch_path.join("locks")
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_path
    }

    /// Put the working directory back the way the run found it
    pub fn restore(mut self) -> Result<(), IsolationError> {
        self.restore_in_place()
    }

    fn restore_in_place(&mut self) -> Result<(), IsolationError> {
        if self.restored {
            return Ok(());
        }

        let result = self.put_back();
        match &result {
            Ok(()) => self.restored = true,
            Err(_) => self.keep_scratch(),
        }
        result
    }

    fn put_back(&mut self) -> Result<(), IsolationError> {
        let config_dir = self.working_dir.join(CONFIG_DIR);
        if let Ok(meta) = fs::symlink_metadata(&config_dir) {
            let removed = if meta.is_dir() {
                fs::remove_dir_all(&config_dir)
            } else {
                fs::remove_file(&config_dir)
            };
            removed.map_err(|source| IsolationError::Remove {
                path: config_dir.clone(),
                source,
            })?;
            tracing::debug!(path = %config_dir.display(), "removed config created during run");
        }

        if let Some(relocated) = &self.relocated {
            move_dir(relocated, &config_dir)?;
            tracing::info!(path = %config_dir.display(), "restored local config");
        }
        self.relocated = None;
        Ok(())
    }

    /// Stop the scratch directory from being deleted while it holds the original config
    fn keep_scratch(&mut self) {
        let Some(relocated) = &self.relocated else {
            return;
        };
        if let Some(scratch) = self.scratch.take() {
            #[allow(deprecated)]
            let kept = scratch.into_path();
            tracing::warn!(
                path = %relocated.display(),
                scratch = %kept.display(),
                "original local config left in scratch directory"
            );
        }
    }
}

impl Drop for RunSandbox {
    fn drop(&mut self) {
        if let Err(e) = self.restore_in_place() {
            tracing::warn!(error = %e, "failed to restore working directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrubbed_variables() {
        let names = scrubbed_variables([
            "PATH",
            "BUNDLE_GEMFILE",
            "RUBYOPT",
            "BUNDLE_BIN_PATH",
            "HOME",
            "RUBYLIB",
            "MY_BUNDLE_X",
        ]);
        assert_eq!(
            names,
            vec!["BUNDLE_BIN_PATH", "BUNDLE_GEMFILE", "RUBYLIB", "RUBYOPT"]
        );
    }

    #[test]
    fn test_relocates_and_restores_existing_config() {
        let work = tempfile::tempdir().unwrap();
        let config = work.path().join(CONFIG_DIR);
        fs::create_dir_all(config.join("nested")).unwrap();
        fs::write(config.join("config"), "BUNDLE_PATH: vendor").unwrap();
        fs::write(config.join("nested/file"), "x").unwrap();

        let sandbox = RunSandbox::prepare(work.path()).unwrap();
        assert!(!config.exists());
        assert!(sandbox.lock_dir().is_dir());

        // a cell writes its own config during the run
        fs::create_dir_all(&config).unwrap();
        fs::write(config.join("config"), "BUNDLE_FROZEN: true").unwrap();

        sandbox.restore().unwrap();
        assert_eq!(
            fs::read_to_string(config.join("config")).unwrap(),
            "BUNDLE_PATH: vendor"
        );
        assert_eq!(fs::read_to_string(config.join("nested/file")).unwrap(), "x");
    }

    #[test]
    fn test_removes_config_created_during_run() {
        let work = tempfile::tempdir().unwrap();
        let config = work.path().join(CONFIG_DIR);

        let sandbox = RunSandbox::prepare(work.path()).unwrap();
        fs::create_dir_all(&config).unwrap();
        sandbox.restore().unwrap();

        assert!(!config.exists());
    }

    #[test]
    fn test_replaces_file_left_by_run() {
        let work = tempfile::tempdir().unwrap();
        let config = work.path().join(CONFIG_DIR);
        fs::create_dir_all(&config).unwrap();
        fs::write(config.join("config"), "BUNDLE_PATH: vendor").unwrap();

        let sandbox = RunSandbox::prepare(work.path()).unwrap();
        fs::write(&config, "not a directory").unwrap();
        sandbox.restore().unwrap();

        assert_eq!(
            fs::read_to_string(config.join("config")).unwrap(),
            "BUNDLE_PATH: vendor"
        );
    }

    #[test]
    fn test_failed_restore_keeps_original() {
        let work = tempfile::tempdir().unwrap();
        let project = work.path().join("project");
        fs::create_dir_all(project.join(CONFIG_DIR)).unwrap();
        fs::write(project.join(CONFIG_DIR).join("config"), "BUNDLE_PATH: vendor").unwrap();

        let sandbox = RunSandbox::prepare(&project).unwrap();
        let scratch = sandbox.scratch_dir().to_path_buf();

        // the working directory turns into a file, so nothing can be moved back into it
        fs::remove_dir_all(&project).unwrap();
        fs::write(&project, "").unwrap();

        assert!(sandbox.restore().is_err());
        assert_eq!(
            fs::read_to_string(scratch.join("bundle-config/config")).unwrap(),
            "BUNDLE_PATH: vendor"
        );
        fs::remove_dir_all(&scratch).unwrap();
    }

    #[test]
    fn test_drop_restores() {
        let work = tempfile::tempdir().unwrap();
        let config = work.path().join(CONFIG_DIR);
        fs::create_dir_all(&config).unwrap();

        let scratch;
        {
            let sandbox = RunSandbox::prepare(work.path()).unwrap();
            scratch = sandbox.scratch_dir().to_path_buf();
            assert!(!config.exists());
        }

        assert!(config.is_dir());
        assert!(!scratch.exists());
    }

    #[test]
    fn test_copy_dir() {
        let from = tempfile::tempdir().unwrap();
        let to = tempfile::tempdir().unwrap();
        fs::create_dir_all(from.path().join("a/b")).unwrap();
        fs::write(from.path().join("a/b/c"), "deep").unwrap();

        copy_dir(from.path(), &to.path().join("copy")).unwrap();
        assert_eq!(
            fs::read_to_string(to.path().join("copy/a/b/c")).unwrap(),
            "deep"
        );
    }
}
