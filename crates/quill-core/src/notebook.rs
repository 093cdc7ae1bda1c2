//! Notebook and cell domain model.
//!
//! A notebook is an ordered sequence of Python and SQL cells. Each cell
//! carries its derived read/write symbol sets, a runtime-only status, and
//! the outputs captured by its last execution. The dependency graph is a
//! pure projection of the cells' read/write sets and is rebuilt from them
//! after every mutation.

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::analyze;
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;

/// Unique identifier for a cell. Stable across edits, opaque to clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(String);

impl CellId {
    /// Create an identifier from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The language of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Python,
    Sql,
}

/// Runtime execution status of a cell. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    /// Cell has not been executed since load.
    #[default]
    Idle,
    /// Cell is currently executing in the kernel.
    Running,
    /// Last execution completed successfully.
    Success,
    /// Last execution failed.
    Error,
    /// Cell was skipped in a run because an in-run dependency failed.
    /// Only the scheduler sets this; the kernel never does.
    Blocked,
}

/// Terminal outcome of a single execution or configuration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Success,
    Error,
}

/// The closed set of output payload types the kernel can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeType {
    TextPlain,
    TextHtml,
    ImagePng,
    Json,
    PlotlyJson,
    VegaLite,
}

impl MimeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TextPlain => "text/plain",
            Self::TextHtml => "text/html",
            Self::ImagePng => "image/png",
            Self::Json => "application/json",
            Self::PlotlyJson => "application/vnd.plotly.v1+json",
            Self::VegaLite => "application/vnd.vegalite.v5+json",
        }
    }

    /// Parse a MIME string. Vega-Lite versions are collapsed onto one tag.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text/plain" => Some(Self::TextPlain),
            "text/html" => Some(Self::TextHtml),
            "image/png" => Some(Self::ImagePng),
            "application/json" => Some(Self::Json),
            "application/vnd.plotly.v1+json" => Some(Self::PlotlyJson),
            _ if s.starts_with("application/vnd.vegalite.v") => Some(Self::VegaLite),
            _ => None,
        }
    }
}

impl std::fmt::Display for MimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MimeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MimeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown MIME type: {s}")))
    }
}

/// A MIME-tagged output payload produced by one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub mime: MimeType,
    /// String, structured table, or base64 data, depending on `mime`.
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Output {
    pub fn new(mime: MimeType, data: serde_json::Value) -> Self {
        Self { mime, data, metadata: None }
    }

    /// A plain-text output.
    pub fn text(data: impl Into<String>) -> Self {
        Self::new(MimeType::TextPlain, serde_json::Value::String(data.into()))
    }
}

/// A single notebook cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    pub kind: CellKind,
    pub source: String,
    /// Symbols this cell reads from the shared namespace. Derived.
    pub reads: BTreeSet<String>,
    /// Symbols this cell writes into the shared namespace. Derived.
    pub writes: BTreeSet<String>,
    /// Runtime-only; reset to idle on load.
    #[serde(skip, default)]
    pub status: CellStatus,
    /// Outputs captured by the last execution, in emission order.
    #[serde(default)]
    pub outputs: Vec<Output>,
    /// Standard output captured by the last execution.
    #[serde(default)]
    pub stdout: String,
    /// Error text from the last execution, if it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Cell {
    /// Create an empty cell of the given kind.
    pub fn new(kind: CellKind) -> Self {
        Self {
            id: CellId::fresh(),
            kind,
            source: String::new(),
            reads: BTreeSet::new(),
            writes: BTreeSet::new(),
            status: CellStatus::Idle,
            outputs: Vec::new(),
            stdout: String::new(),
            error: None,
        }
    }

    /// Re-derive the read/write sets from the current source.
    ///
    /// Read/write derivation is a pure function of the source text; invalid
    /// source yields empty sets and the failure surfaces at execution time.
    pub fn reanalyze(&mut self) {
        let (reads, writes) = analyze::analyze(self.kind, &self.source);
        self.reads = reads;
        self.writes = writes;
    }

    /// Clear the captured results of the previous execution.
    pub fn clear_results(&mut self) {
        self.outputs.clear();
        self.stdout.clear();
        self.error = None;
    }
}

/// An in-memory notebook document.
#[derive(Debug, Serialize, Deserialize)]
pub struct Notebook {
    pub id: String,
    pub owner: String,
    pub name: String,
    /// SQL connection string forwarded to the kernel, if configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_connection: Option<String>,
    cells: Vec<Cell>,
    /// Bumped on every successful mutation.
    revision: u64,
    /// Derived from the cells' read/write sets; rebuilt, never stored.
    #[serde(skip, default)]
    graph: DependencyGraph,
}

impl Notebook {
    /// Create an empty notebook owned by `owner`.
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.into(),
            name: name.into(),
            db_connection: None,
            cells: Vec::new(),
            revision: 0,
            graph: DependencyGraph::default(),
        }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, id: &CellId) -> Option<&Cell> {
        self.cells.iter().find(|c| &c.id == id)
    }

    pub fn cell_mut(&mut self, id: &CellId) -> Option<&mut Cell> {
        self.cells.iter_mut().find(|c| &c.id == id)
    }

    /// The cell's index in the ordered sequence.
    pub fn position(&self, id: &CellId) -> Option<usize> {
        self.cells.iter().position(|c| &c.id == id)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Bump and return the revision counter. Called once per mutation.
    pub fn bump_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Rebuild the dependency graph from the current cells.
    ///
    /// Called after every mutation and after deserialization. Full rebuild
    /// is O(n²) in the cell count, which is negligible at notebook scale.
    pub fn rebuild_graph(&mut self) {
        self.graph.rebuild(&self.cells);
    }

    /// Insert a new empty cell, after `after` or at the end.
    ///
    /// Returns the new cell's id and insertion index. The read/write sets of
    /// an empty cell are empty, so the graph stays valid until the first
    /// source update.
    pub fn insert_cell(&mut self, kind: CellKind, after: Option<&CellId>) -> Result<(CellId, usize)> {
        let index = match after {
            Some(anchor) => self
                .position(anchor)
                .map(|p| p + 1)
                .ok_or_else(|| Error::CellNotFound(anchor.to_string()))?,
            None => self.cells.len(),
        };
        let cell = Cell::new(kind);
        let id = cell.id.clone();
        self.cells.insert(index, cell);
        Ok((id, index))
    }

    /// Remove a cell, returning it for symbol cleanup.
    pub fn remove_cell(&mut self, id: &CellId) -> Result<Cell> {
        let index = self
            .position(id)
            .ok_or_else(|| Error::CellNotFound(id.to_string()))?;
        Ok(self.cells.remove(index))
    }

    /// Move a cell to `index` (clamped to the sequence length).
    ///
    /// Returns the effective index. Position participates in scheduling
    /// tie-breaks, so callers must rebuild the graph afterwards.
    pub fn move_cell(&mut self, id: &CellId, index: usize) -> Result<usize> {
        let from = self
            .position(id)
            .ok_or_else(|| Error::CellNotFound(id.to_string()))?;
        let cell = self.cells.remove(from);
        let to = index.min(self.cells.len());
        self.cells.insert(to, cell);
        Ok(to)
    }

    /// Replace a cell's source and re-derive its read/write sets.
    pub fn update_source(&mut self, id: &CellId, source: String) -> Result<()> {
        let cell = self
            .cell_mut(id)
            .ok_or_else(|| Error::CellNotFound(id.to_string()))?;
        cell.source = source;
        cell.reanalyze();
        Ok(())
    }

    /// Symbols written only by `removed` and by no remaining cell.
    ///
    /// These are safe to purge from the kernel namespace after deletion.
    pub fn unique_symbols(&self, removed: &Cell) -> Vec<String> {
        removed
            .writes
            .iter()
            .filter(|sym| !self.cells.iter().any(|c| c.writes.contains(*sym)))
            .cloned()
            .collect()
    }
}
