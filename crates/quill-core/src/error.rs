//! Error types for quill-core.

use thiserror::Error;

/// Result type for quill-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in quill-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Cyclic dependency detected in the cell graph.
    #[error("cyclic dependency detected: {0}")]
    CyclicDependency(String),

    /// Cell not found.
    #[error("cell not found: {0}")]
    CellNotFound(String),

    /// Notebook not found in storage.
    #[error("notebook not found: {0}")]
    NotebookNotFound(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// IPC communication error with the kernel process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// The kernel process died or became unresponsive.
    ///
    /// This is a fatal condition for the notebook session; the current run
    /// is aborted and the coordinator must be restarted or torn down.
    #[error("kernel terminated: {0}")]
    KernelFatal(String),

    /// Execution error reported outside the normal per-cell result path.
    #[error("execution error: {0}")]
    Execution(String),

    /// Invalid operation (e.g., moving a cell out of bounds).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(String),
}
