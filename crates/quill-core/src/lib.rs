//! Core engine for the Quill reactive notebook.
//!
//! Given a user-edited graph of interdependent Python and SQL cells, this
//! crate keeps outputs consistent by re-executing exactly the affected
//! cells in a valid order:
//!
//! - [`analyze`] derives each cell's read/write symbol sets from its source
//! - [`graph`] projects those sets into a dependency graph with cycle
//!   detection and position-tie-broken topological ordering
//! - [`schedule`] plans runs (cascade order, cycle handling)
//! - [`ipc`] speaks the length-prefixed message protocol to the isolated
//!   `quill-kernel` process that owns the Python namespace and the SQL
//!   connection
//! - [`coordinator`] serializes mutations and runs per notebook, persists
//!   through [`storage`], and streams [`events`] to observers
//!
//! The kernel runs user code in its own process; crashing it never crashes
//! the orchestration layer.

pub mod analyze;
pub mod autorun;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod graph;
pub mod ipc;
pub mod notebook;
pub mod schedule;
pub mod storage;

pub use coordinator::Coordinator;
pub use error::{Error, Result};
pub use events::{CellSnapshot, NotebookEvent, NotebookSnapshot};
pub use graph::DependencyGraph;
pub use notebook::{Cell, CellId, CellKind, CellStatus, ExecStatus, MimeType, Notebook, Output};
