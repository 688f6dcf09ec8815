// Matrix Orchestrator
// Drives every cell through install and build commands on a bounded worker pool

use crate::config::models::{value_to_list, Cell, SECTIONS};
use crate::error::ServiceResult;
use crate::execution::environment::{Composition, EnvironmentComposer, EnvironmentOverlay};
use crate::execution::events::{
    CellState, EventSender, ExecutionEvent, ExecutionResult, FailureKind, ProgressSender,
};
use crate::execution::isolation::{inherited_scrubbed_variables, RunSandbox};
use crate::execution::lock::{run_lock, with_lock, ResourceLock, DEFAULT_LOCK_KEY};
use crate::runners::{CommandRunner, OutputCallback, RuntimeResolver, VcsTrackedFiles};

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Manifest used when a cell does not name one
pub const DEFAULT_MANIFEST: &str = "Gemfile";

/// Variable telling test suites which parallel cell they run in
pub const SLOT_VAR: &str = "TEST_ENV_NUMBER";

/// Options for one matrix run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Directory every command runs in
    pub working_dir: PathBuf,
    /// Maximum number of cells running at once
    pub concurrency: usize,
    /// Install arguments overriding both the config and the deployment default
    pub bundler_args: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            concurrency: 1,
            bundler_args: None,
        }
    }
}

impl RunOptions {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_bundler_args(mut self, args: impl Into<String>) -> Self {
        self.bundler_args = Some(args.into());
        self
    }
}

/// `TEST_ENV_NUMBER` value for the n-th dispatched cell: "" for the first, then "2", "3", ...
pub fn slot_value(dispatched: usize) -> String {
    if dispatched == 0 {
        String::new()
    } else {
        (dispatched + 1).to_string()
    }
}

/// Shell command for one script section of a cell, if it runs at all
///
/// List entries are chained with `&&`, each behind the runtime prefix. A cell
/// without `script` runs the default rake task.
pub fn section_command(
    cell: &Cell,
    section: &str,
    prefix: &str,
    wants_install: bool,
) -> Option<String> {
    match cell.get(section) {
        Some(value) => {
            let commands = value_to_list(value);
            if commands.is_empty() {
                return None;
            }
            Some(
                commands
                    .iter()
                    .map(|command| format!("{}{}", prefix, command))
                    .collect::<Vec<_>>()
                    .join(" && "),
            )
        }
        None if section == "script" => Some(if wants_install {
            format!("{}bundle exec rake", prefix)
        } else {
            format!("{}rake", prefix)
        }),
        None => None,
    }
}

/// `<prefix>bundle install <args> --quiet`
pub fn install_command(prefix: &str, args: Option<&str>) -> String {
    let command = format!("{}bundle install {}", prefix, args.unwrap_or(""));
    format!("{} --quiet", command.trim())
}

/// Matrix run orchestrator
pub struct ExecutionOrchestrator {
    options: RunOptions,
    runner: Arc<dyn CommandRunner>,
    composer: EnvironmentComposer,
    vcs: Arc<dyn VcsTrackedFiles>,
    lock: Option<Arc<dyn ResourceLock>>,
    event_tx: Option<ProgressSender>,
}

impl ExecutionOrchestrator {
    pub fn new(
        options: RunOptions,
        runner: Arc<dyn CommandRunner>,
        resolver: Arc<dyn RuntimeResolver>,
        vcs: Arc<dyn VcsTrackedFiles>,
    ) -> Self {
        let composer = EnvironmentComposer::new(resolver, options.working_dir.clone());
        Self {
            options,
            runner,
            composer,
            vcs,
            lock: None,
            event_tx: None,
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Use `lock` instead of file locks in the run's scratch directory
    pub fn with_lock(mut self, lock: Arc<dyn ResourceLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run every cell and return the results in matrix order
    ///
    /// Cell failures are outcomes, not errors. `Err` means the working
    /// directory could not be isolated or restored.
    pub async fn run(&self, matrix: &[Cell]) -> ServiceResult<Vec<ExecutionResult>> {
        let sandbox = RunSandbox::prepare(&self.options.working_dir)?;
        let lock = match &self.lock {
            Some(lock) => lock.clone(),
            None => run_lock(&sandbox.lock_dir()),
        };

        let worker = Arc::new(CellWorker {
            runner: self.runner.clone(),
            composer: self.composer.clone(),
            vcs: self.vcs.clone(),
            lock,
            events: self.event_tx.clone(),
            working_dir: self.options.working_dir.clone(),
            bundler_args: self.options.bundler_args.clone(),
            scrubbed: inherited_scrubbed_variables(),
            parallel: self.options.concurrency > 1,
        });

        let queue: VecDeque<(usize, Cell)> = matrix.iter().cloned().enumerate().collect();
        let queue = Arc::new(Mutex::new(queue));
        let workers = self.options.concurrency.max(1).min(matrix.len()).max(1);
        tracing::info!(cells = matrix.len(), workers, "starting matrix run");

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let worker = worker.clone();
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut results = Vec::new();
                loop {
                    let next = queue.lock().await.pop_front();
                    let Some((index, cell)) = next else {
                        break;
                    };
                    results.push(CellWorker::run_guarded(worker.clone(), index, cell).await);
                }
                results
            }));
        }

        let mut results = Vec::with_capacity(matrix.len());
        for handle in handles {
            match handle.await {
                Ok(done) => results.extend(done),
                Err(e) => tracing::error!(error = %e, "worker task failed"),
            }
        }
        results.sort_by_key(|result| result.index);

        sandbox.restore()?;
        Ok(results)
    }

    /// Copy-pasteable command reproducing a cell's `script` section
    ///
    /// `None` when the cell's runtime is unavailable.
    pub async fn rerun_command(&self, cell: &Cell) -> Option<String> {
        let composer = self.composer.clone().with_rerun(true);
        let Composition::Ready(env) = composer.compose(cell).await else {
            return None;
        };

        let wants_install = wants_install(cell, &self.options.working_dir);
        let command = section_command(cell, "script", env.prefix(), wants_install)?;
        let assignments = env.overlay.to_assignments();
        if assignments.is_empty() {
            Some(command)
        } else {
            Some(format!("{} {}", assignments, command))
        }
    }
}

/// A cell installs dependencies when it names a manifest or the default one exists
fn wants_install(cell: &Cell, working_dir: &std::path::Path) -> bool {
    cell.gemfile().is_some() || working_dir.join(DEFAULT_MANIFEST).exists()
}

/// State shared by the worker tasks of one run
struct CellWorker {
    runner: Arc<dyn CommandRunner>,
    composer: EnvironmentComposer,
    vcs: Arc<dyn VcsTrackedFiles>,
    lock: Arc<dyn ResourceLock>,
    events: Option<ProgressSender>,
    working_dir: PathBuf,
    bundler_args: Option<String>,
    scrubbed: Vec<String>,
    parallel: bool,
}

impl CellWorker {
    /// Run a cell in its own task so a panic fails only that cell
    async fn run_guarded(worker: Arc<Self>, index: usize, cell: Cell) -> ExecutionResult {
        let start = Instant::now();
        let task = tokio::spawn({
            let worker = worker.clone();
            let cell = cell.clone();
            async move { worker.run_cell(index, cell).await }
        });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(index, error = %e, "cell task failed");
                let result = ExecutionResult::started(index, cell)
                    .finish(CellState::Failure(FailureKind::Command), start.elapsed());
                worker.events.send_event(ExecutionEvent::CellFinished {
                    result: result.clone(),
                });
                result
            }
        }
    }

    async fn run_cell(&self, index: usize, cell: Cell) -> ExecutionResult {
        let start = Instant::now();
        let result = ExecutionResult::started(index, cell);
        self.events.send_event(ExecutionEvent::CellStarted {
            result: result.clone(),
        });

        let state = self.drive(index, &result.cell).await;
        tracing::debug!(index, state = state.label(), "cell finished");

        let result = result.finish(state, start.elapsed());
        self.events.send_event(ExecutionEvent::CellFinished {
            result: result.clone(),
        });
        result
    }

    async fn drive(&self, index: usize, cell: &Cell) -> CellState {
        let composed = match self.composer.compose(cell).await {
            Composition::Ready(composed) => composed,
            Composition::MissingRuntime { version } => {
                tracing::info!(index, version = %version, "runtime not available");
                return CellState::MissingRuntime;
            }
        };
        let prefix = composed.prefix().to_string();
        let overlay = self.finish_overlay(index, composed.overlay);

        let wants_install = wants_install(cell, &self.working_dir);
        if wants_install {
            let key = cell.rvm().unwrap_or_else(|| DEFAULT_LOCK_KEY.to_string());
            let installed = with_lock(
                self.lock.as_ref(),
                &key,
                self.install(index, cell, &overlay, &prefix),
            )
            .await;
            match installed {
                Ok(true) => {}
                Ok(false) => return CellState::Failure(FailureKind::Install),
                Err(e) => {
                    tracing::warn!(index, key = %key, error = %e, "could not lock install");
                    return CellState::Failure(FailureKind::Install);
                }
            }
        }

        for section in SECTIONS {
            if let Some(command) = section_command(cell, section, &prefix, wants_install) {
                if !self.execute(index, &overlay, &command).await {
                    return CellState::Failure(FailureKind::Command);
                }
            }
        }
        CellState::Success
    }

    /// Hide inherited dependency-manager state and number the cell when running in parallel
    ///
    /// Cells leave the queue in matrix order, so `index` is also the dispatch ordinal.
    fn finish_overlay(&self, index: usize, mut overlay: EnvironmentOverlay) -> EnvironmentOverlay {
        for name in &self.scrubbed {
            if overlay.get(name).is_none() {
                overlay.unset(name.as_str());
            }
        }
        if self.parallel {
            overlay.set(SLOT_VAR, slot_value(index));
        }
        overlay
    }

    async fn install(
        &self,
        index: usize,
        cell: &Cell,
        overlay: &EnvironmentOverlay,
        prefix: &str,
    ) -> bool {
        let args = self.install_args(cell).await;
        let command = install_command(prefix, args.as_deref());
        self.execute(index, overlay, &command).await
    }

    async fn install_args(&self, cell: &Cell) -> Option<String> {
        if let Some(args) = self.bundler_args.clone().or_else(|| cell.bundler_args()) {
            return Some(args);
        }

        let manifest = cell
            .gemfile()
            .unwrap_or_else(|| DEFAULT_MANIFEST.to_string());
        if self.vcs.is_tracked(&format!("{}.lock", manifest)).await {
            Some(format!(
                "--deployment --path {}",
                self.working_dir.join("vendor/bundle").display()
            ))
        } else {
            None
        }
    }

    async fn execute(&self, index: usize, overlay: &EnvironmentOverlay, command: &str) -> bool {
        self.events.send_event(ExecutionEvent::CommandStarted {
            index,
            command: command.to_string(),
        });

        let events = self.events.clone();
        let on_output: OutputCallback = Arc::new(move |line: &str, is_error: bool| {
            events.send_event(ExecutionEvent::CellOutput {
                index,
                line: line.to_string(),
                is_error,
            });
        });

        let output = self
            .runner
            .run(overlay, command, &self.working_dir, on_output)
            .await;
        if !output.succeeded() {
            tracing::debug!(index, command, exit_code = ?output.exit_code, "command failed");
        }
        output.succeeded()
    }
}
