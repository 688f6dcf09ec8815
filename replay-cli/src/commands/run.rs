use crate::output;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;

use replay_service::config::DEFAULT_CONFIG_FILE;
use replay_service::{
    detect_resolver, progress_channel, CellState, CommandRunner, ConfigLoader, ExecutionEvent,
    ExecutionOrchestrator, GitTrackedFiles, MatrixBuilder, RunOptions, ShellRunner,
    VcsTrackedFiles,
};

/// Run every cell of a build matrix locally
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Run cells in parallel; without a count, one per available CPU
    #[arg(
        long,
        short = 'p',
        value_name = "PROCESSES",
        num_args = 0..=1,
        default_missing_value = "0"
    )]
    pub parallel: Option<usize>,

    /// Build configuration file, relative to the working directory
    #[arg(long, short = 'c', value_name = "PATH", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Working directory for execution
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Dependency install arguments, overriding the configuration
    #[arg(long, value_name = "ARGS", allow_hyphen_values = true)]
    pub bundler_args: Option<String>,
}

impl RunArgs {
    /// Number of cells allowed to run at once
    pub fn concurrency(&self) -> usize {
        match self.parallel {
            None => 1,
            Some(0) => std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            Some(n) => n,
        }
    }
}

/// Run the matrix and return the process exit code
pub async fn execute(args: RunArgs) -> Result<i32> {
    let working_dir = match &args.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let working_dir = working_dir
        .canonicalize()
        .wrap_err_with(|| format!("Working directory not found: {}", working_dir.display()))?;
    let config_path = working_dir.join(&args.config);

    let (config, ignored) = ConfigLoader::load(&config_path)?.split_ignored();
    if let Some(line) = output::ignoring(&ignored) {
        println!("{}", line);
    }
    let matrix = MatrixBuilder::expand(config);
    tracing::debug!(cells = matrix.len(), config = %config_path.display(), "matrix expanded");

    let mut options = RunOptions::new(&working_dir).with_concurrency(args.concurrency());
    if let Some(bundler_args) = args.bundler_args {
        options = options.with_bundler_args(bundler_args);
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new());
    let resolver = detect_resolver(&working_dir).await;
    let vcs: Arc<dyn VcsTrackedFiles> = Arc::new(GitTrackedFiles::new(&working_dir));

    // Create progress channel and orchestrator
    let (tx, mut rx) = progress_channel();
    let orchestrator = ExecutionOrchestrator::new(
        options.clone(),
        runner.clone(),
        resolver.clone(),
        vcs.clone(),
    )
    .with_progress(tx);

    // Spawn execution in background
    let cells = matrix.clone();
    let run_handle = tokio::spawn(async move { orchestrator.run(&cells).await });

    // Process events in the foreground
    let color = output::stdout_is_tty();
    while let Some(event) = rx.recv().await {
        match event {
            ExecutionEvent::CellStarted { result } | ExecutionEvent::CellFinished { result } => {
                println!(
                    "{}",
                    output::info_line(result.state, &result.cell, &matrix, color)
                );
            }
            ExecutionEvent::CommandStarted { command, .. } => {
                println!("{}", command);
            }
            ExecutionEvent::CellOutput { line, is_error, .. } => {
                if is_error {
                    eprintln!("{}", line);
                } else {
                    println!("{}", line);
                }
            }
        }
    }

    let results = run_handle.await??;

    if results.len() > 1 {
        println!("\nResults:");
        for result in &results {
            println!(
                "{}",
                output::info_line(result.state, &result.cell, &matrix, color)
            );
        }
    }

    let rerun = ExecutionOrchestrator::new(options, runner, resolver, vcs);
    for result in results
        .iter()
        .filter(|result| matches!(result.state, CellState::Failure(_)))
    {
        if let Some(command) = rerun.rerun_command(&result.cell).await {
            println!("rerun: {}", command);
        }
    }

    let all_passed = results.len() == matrix.len()
        && results.iter().all(|result| result.state.is_success());
    Ok(if all_passed { 0 } else { 1 })
}
