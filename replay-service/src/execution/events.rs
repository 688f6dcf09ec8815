// Execution Events
// Progress reporting and result types for matrix runs

use crate::config::models::Cell;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Why a cell failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Dependency installation failed; nothing else ran
    Install,
    /// A build command failed
    Command,
}

/// Lifecycle state of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Start,
    Success,
    Failure(FailureKind),
    /// The requested runtime version is not installed
    MissingRuntime,
}

impl CellState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CellState::Start)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CellState::Success)
    }

    pub fn label(&self) -> &'static str {
        match self {
            CellState::Start => "START",
            CellState::Success => "SUCCESS",
            CellState::Failure(_) => "FAILURE",
            CellState::MissingRuntime => "MISSING-RUNTIME",
        }
    }
}

/// Outcome of one cell, paired with its position in the matrix
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub index: usize,
    pub cell: Cell,
    pub state: CellState,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn started(index: usize, cell: Cell) -> Self {
        Self {
            index,
            cell,
            state: CellState::Start,
            duration: Duration::ZERO,
        }
    }

    pub fn finish(mut self, state: CellState, duration: Duration) -> Self {
        self.state = state;
        self.duration = duration;
        self
    }
}

/// Events emitted during a matrix run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// A worker picked up the cell
    CellStarted { result: ExecutionResult },

    /// A command is about to run for the cell
    CommandStarted { index: usize, command: String },

    /// Output line (stdout/stderr) of a running command
    CellOutput {
        index: usize,
        line: String,
        is_error: bool,
    },

    /// The cell reached a terminal state
    CellFinished { result: ExecutionResult },
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::CellStarted {
            result: ExecutionResult::started(0, Cell::new()),
        });
        tx.send_event(ExecutionEvent::CommandStarted {
            index: 0,
            command: "rake".into(),
        });

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(event1, ExecutionEvent::CellStarted { .. }));

        let event2 = rx.recv().await.unwrap();
        assert!(matches!(event2, ExecutionEvent::CommandStarted { .. }));
    }

    #[test]
    fn test_result_lifecycle() {
        let result = ExecutionResult::started(3, Cell::new());
        assert!(!result.state.is_terminal());

        let result = result.finish(
            CellState::Failure(FailureKind::Install),
            Duration::from_secs(2),
        );
        assert_eq!(result.index, 3);
        assert!(result.state.is_terminal());
        assert!(!result.state.is_success());
        assert_eq!(result.state.label(), "FAILURE");
        assert_eq!(result.duration, Duration::from_secs(2));
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        // Should not panic
        sender.send_event(ExecutionEvent::CommandStarted {
            index: 0,
            command: "rake".into(),
        });
    }
}
