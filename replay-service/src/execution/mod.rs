// Execution Engine Module
// Matrix expansion, per-cell environments, locking, isolation and orchestration

pub mod environment;
pub mod events;
pub mod isolation;
pub mod lock;
pub mod matrix;
pub mod orchestrator;

// Re-export key types
pub use environment::{
    parse_assignments, ComposedEnvironment, Composition, EnvironmentComposer, EnvironmentOverlay,
    MANIFEST_VAR,
};
pub use events::{
    progress_channel, CellState, EventSender, ExecutionEvent, ExecutionResult, FailureKind,
    ProgressReceiver, ProgressSender,
};
pub use isolation::{IsolationError, RunSandbox};
pub use lock::{with_lock, KeyedMutexLock, LockError, LockGuard, ResourceLock, DEFAULT_LOCK_KEY};
pub use matrix::{Matrix, MatrixBuilder};
pub use orchestrator::{section_command, ExecutionOrchestrator, RunOptions};
