// Replay Service Library
// Expands a CI build matrix and runs every cell locally

pub mod config;
pub mod error;
pub mod execution;
pub mod runners;

// Re-export commonly used types
pub use error::{ServiceError, ServiceResult};

// Re-export configuration types
pub use config::{Cell, ConfigError, ConfigLoader, ConfigNormalizer, RawConfig};

// Re-export execution types
pub use execution::{
    progress_channel, CellState, ExecutionEvent, ExecutionOrchestrator, ExecutionResult,
    FailureKind, Matrix, MatrixBuilder, ProgressReceiver, ProgressSender, RunOptions,
};

// Re-export runner types
pub use runners::{
    detect_resolver, CommandRunner, GitTrackedFiles, RuntimeResolver, ShellRunner,
    VcsTrackedFiles,
};
