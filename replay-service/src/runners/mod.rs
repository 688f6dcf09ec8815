// Runners Module
// Collaborators that touch the outside world: shell commands, runtime managers, git

pub mod runtime;
pub mod shell;
pub mod vcs;

// Re-export key types
pub use runtime::{detect_resolver, RuntimeResolver, RuntimeSwitch};
pub use shell::ShellRunner;
pub use vcs::{GitTrackedFiles, VcsTrackedFiles};

use crate::execution::environment::EnvironmentOverlay;

use std::path::Path;
use std::sync::Arc;

/// Callback for handling output lines in real-time; the flag marks stderr
pub type OutputCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Outcome of one command invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (if the process exited normally)
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Trait for command runners
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a shell command with the given overlay on top of the inherited environment
    ///
    /// Output must be forwarded to `on_output` line by line as it is produced.
    async fn run(
        &self,
        env: &EnvironmentOverlay,
        command: &str,
        working_dir: &Path,
        on_output: OutputCallback,
    ) -> CommandOutput;
}
