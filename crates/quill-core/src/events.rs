//! Observer event stream.
//!
//! The coordinator translates mutations and kernel messages into a causally
//! ordered stream of events. Every event carries the notebook revision so
//! observers can reconcile against a snapshot. For a single execution of a
//! cell, `cell_status(running)` precedes any `cell_stdout`/`cell_output`,
//! and the final event is a terminal `cell_status` (success or error).

use serde::{Deserialize, Serialize};

use crate::notebook::{Cell, CellId, CellKind, CellStatus, ExecStatus, Notebook, Output};

/// A point-in-time view of one cell, as sent to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub id: CellId,
    pub kind: CellKind,
    pub source: String,
    pub reads: Vec<String>,
    pub writes: Vec<String>,
    pub status: CellStatus,
    pub outputs: Vec<Output>,
    pub stdout: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Cell> for CellSnapshot {
    fn from(cell: &Cell) -> Self {
        Self {
            id: cell.id.clone(),
            kind: cell.kind,
            source: cell.source.clone(),
            reads: cell.reads.iter().cloned().collect(),
            writes: cell.writes.iter().cloned().collect(),
            status: cell.status,
            outputs: cell.outputs.clone(),
            stdout: cell.stdout.clone(),
            error: cell.error.clone(),
        }
    }
}

/// A full notebook state for observers that join late.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotebookSnapshot {
    pub id: String,
    pub owner: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_connection: Option<String>,
    pub revision: u64,
    pub cells: Vec<CellSnapshot>,
}

impl From<&Notebook> for NotebookSnapshot {
    fn from(notebook: &Notebook) -> Self {
        Self {
            id: notebook.id.clone(),
            owner: notebook.owner.clone(),
            name: notebook.name.clone(),
            db_connection: notebook.db_connection.clone(),
            revision: notebook.revision(),
            cells: notebook.cells().iter().map(CellSnapshot::from).collect(),
        }
    }
}

/// Events fanned out to notebook observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotebookEvent {
    /// A cell was created at `index`.
    CellCreated {
        revision: u64,
        index: usize,
        cell: CellSnapshot,
    },

    /// A cell was deleted.
    CellDeleted { revision: u64, cell_id: CellId },

    /// A cell's source changed; carries the re-derived read/write sets.
    CellUpdated {
        revision: u64,
        cell_id: CellId,
        source: String,
        reads: Vec<String>,
        writes: Vec<String>,
        status: CellStatus,
    },

    /// A cell moved to a new index.
    CellMoved {
        revision: u64,
        cell_id: CellId,
        index: usize,
    },

    /// A cell's execution status changed.
    CellStatus {
        revision: u64,
        cell_id: CellId,
        status: CellStatus,
    },

    /// Incremental standard output from a running cell.
    CellStdout {
        revision: u64,
        cell_id: CellId,
        text: String,
    },

    /// One MIME-tagged output from a running cell.
    CellOutput {
        revision: u64,
        cell_id: CellId,
        output: Output,
    },

    /// Human-readable error text for a failed cell.
    CellError {
        revision: u64,
        cell_id: CellId,
        error: String,
    },

    /// The database connection string changed (or failed to).
    DbConnectionUpdated {
        revision: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_string: Option<String>,
        status: ExecStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The kernel process was replaced; all runtime state was reset.
    KernelRestarted { revision: u64 },
}

impl NotebookEvent {
    /// The notebook revision the event was emitted at.
    pub fn revision(&self) -> u64 {
        match self {
            Self::CellCreated { revision, .. }
            | Self::CellDeleted { revision, .. }
            | Self::CellUpdated { revision, .. }
            | Self::CellMoved { revision, .. }
            | Self::CellStatus { revision, .. }
            | Self::CellStdout { revision, .. }
            | Self::CellOutput { revision, .. }
            | Self::CellError { revision, .. }
            | Self::DbConnectionUpdated { revision, .. }
            | Self::KernelRestarted { revision } => *revision,
        }
    }
}
