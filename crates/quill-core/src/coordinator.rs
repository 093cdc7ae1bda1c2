//! Notebook coordinator.
//!
//! The coordinator is the notebook-scoped bridge between inbound commands
//! and the kernel process. It owns the in-memory document and its derived
//! graph, serializes every mutation and run under one async lock, persists
//! after each mutation, translates kernel messages into observer events,
//! and fans those events out over a broadcast channel.
//!
//! Concurrency model: a single `tokio::sync::Mutex` guards the notebook and
//! the kernel handle together, so mutations and runs on one notebook are
//! strictly serialized in arrival order. The broadcast fan-out is
//! best-effort; slow observers may drop intermediate events but always see
//! the terminal status of a run (the channel keeps the newest messages).

use tokio::sync::{broadcast, Mutex};

use crate::error::{Error, Result};
use crate::events::{CellSnapshot, NotebookEvent, NotebookSnapshot};
use crate::ipc::{KernelLink, KernelMessage, KernelRequest};
use crate::notebook::{CellId, CellKind, CellStatus, ExecStatus, Notebook};
use crate::schedule::{self, RunPlan};
use crate::storage::Storage;

/// Capacity of the observer broadcast channel. Observers that fall more
/// than this many events behind start losing the oldest ones.
const EVENT_CHANNEL_CAPACITY: usize = 256;

struct Inner<K> {
    notebook: Notebook,
    kernel: K,
}

/// Coordinates one notebook against one kernel process.
pub struct Coordinator<S, K> {
    inner: Mutex<Inner<K>>,
    events: broadcast::Sender<NotebookEvent>,
    storage: S,
}

impl<S: Storage, K: KernelLink> Coordinator<S, K> {
    /// Bind a notebook to a kernel.
    ///
    /// Registers every existing cell with the kernel and, if the notebook
    /// carries a connection string, replays it as `SetDatabaseConfig`. A
    /// config failure at bind time is logged, not fatal: the document must
    /// stay usable even when its database is unreachable.
    pub async fn bind(mut notebook: Notebook, storage: S, mut kernel: K) -> Result<Self> {
        notebook.rebuild_graph();

        for (position, cell) in notebook.cells().iter().enumerate() {
            kernel
                .send(KernelRequest::RegisterCell {
                    id: cell.id.clone(),
                    source: cell.source.clone(),
                    kind: cell.kind,
                    position,
                })
                .await?;
        }

        if let Some(connection_string) = notebook.db_connection.clone() {
            kernel
                .send(KernelRequest::SetDatabaseConfig { connection_string })
                .await?;
            if let Err(message) = Self::await_config_result(&mut kernel).await? {
                tracing::warn!(notebook = %notebook.id, error = %message, "database config rejected on load");
            }
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Mutex::new(Inner { notebook, kernel }),
            events,
            storage,
        })
    }

    /// Subscribe to the observer event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<NotebookEvent> {
        self.events.subscribe()
    }

    /// A full state snapshot for late-joining observers.
    pub async fn snapshot(&self) -> NotebookSnapshot {
        let inner = self.inner.lock().await;
        NotebookSnapshot::from(&inner.notebook)
    }

    /// Broadcast an event, ignoring send failures (no subscribers yet).
    fn emit(&self, event: NotebookEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&self, notebook: &mut Notebook, id: &CellId, status: CellStatus) {
        if let Some(cell) = notebook.cell_mut(id) {
            cell.status = status;
        }
        self.emit(NotebookEvent::CellStatus {
            revision: notebook.revision(),
            cell_id: id.clone(),
            status,
        });
    }

    /// Create a new empty cell, after `after` or at the end.
    pub async fn create_cell(&self, kind: CellKind, after: Option<&CellId>) -> Result<CellId> {
        let mut inner = self.inner.lock().await;
        let (id, index) = inner.notebook.insert_cell(kind, after)?;
        inner.notebook.rebuild_graph();
        let revision = inner.notebook.bump_revision();
        self.storage.save(&inner.notebook).await?;

        let cell = inner
            .notebook
            .cell(&id)
            .ok_or_else(|| Error::CellNotFound(id.to_string()))?;
        self.emit(NotebookEvent::CellCreated {
            revision,
            index,
            cell: CellSnapshot::from(cell),
        });

        Self::register_all(&mut inner).await?;
        Ok(id)
    }

    /// Replace a cell's source, re-deriving its read/write sets.
    pub async fn update_cell(&self, id: &CellId, source: String) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.notebook.update_source(id, source)?;
        inner.notebook.rebuild_graph();
        let revision = inner.notebook.bump_revision();
        self.storage.save(&inner.notebook).await?;

        let (source, reads, writes, status, position) = {
            let cell = inner
                .notebook
                .cell(id)
                .ok_or_else(|| Error::CellNotFound(id.to_string()))?;
            (
                cell.source.clone(),
                cell.reads.iter().cloned().collect(),
                cell.writes.iter().cloned().collect(),
                cell.status,
                inner.notebook.position(id).unwrap_or(0),
            )
        };
        self.emit(NotebookEvent::CellUpdated {
            revision,
            cell_id: id.clone(),
            source: source.clone(),
            reads,
            writes,
            status,
        });

        let kind = inner
            .notebook
            .cell(id)
            .map(|c| c.kind)
            .ok_or_else(|| Error::CellNotFound(id.to_string()))?;
        inner
            .kernel
            .send(KernelRequest::RegisterCell { id: id.clone(), source, kind, position })
            .await?;
        Ok(())
    }

    /// Delete a cell and purge its uniquely-owned symbols from the kernel.
    pub async fn delete_cell(&self, id: &CellId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let removed = inner.notebook.remove_cell(id)?;
        let purge = inner.notebook.unique_symbols(&removed);
        inner.notebook.rebuild_graph();
        let revision = inner.notebook.bump_revision();
        self.storage.save(&inner.notebook).await?;

        self.emit(NotebookEvent::CellDeleted { revision, cell_id: id.clone() });

        inner
            .kernel
            .send(KernelRequest::RemoveCell { id: id.clone(), purge })
            .await?;
        // Positions after the deleted cell shifted; refresh the kernel's view.
        Self::register_all(&mut inner).await?;
        Ok(())
    }

    /// Move a cell to `index`. Position is the scheduling tie-break, so the
    /// graph is rebuilt even though no read/write set changed.
    pub async fn move_cell(&self, id: &CellId, index: usize) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let effective = inner.notebook.move_cell(id, index)?;
        inner.notebook.rebuild_graph();
        let revision = inner.notebook.bump_revision();
        self.storage.save(&inner.notebook).await?;

        self.emit(NotebookEvent::CellMoved {
            revision,
            cell_id: id.clone(),
            index: effective,
        });

        Self::register_all(&mut inner).await?;
        Ok(effective)
    }

    /// Update the database connection string.
    ///
    /// The kernel validates the string by probing a connection; on failure
    /// the in-memory value rolls back and the error is reported to
    /// observers.
    pub async fn set_db_connection(&self, connection_string: String) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let previous = inner.notebook.db_connection.take();
        inner.notebook.db_connection = Some(connection_string.clone());

        inner
            .kernel
            .send(KernelRequest::SetDatabaseConfig {
                connection_string: connection_string.clone(),
            })
            .await?;

        match Self::await_config_result(&mut inner.kernel).await? {
            Ok(()) => {
                let revision = inner.notebook.bump_revision();
                self.storage.save(&inner.notebook).await?;
                self.emit(NotebookEvent::DbConnectionUpdated {
                    revision,
                    connection_string: Some(connection_string),
                    status: ExecStatus::Success,
                    error: None,
                });
                Ok(())
            }
            Err(message) => {
                inner.notebook.db_connection = previous;
                self.emit(NotebookEvent::DbConnectionUpdated {
                    revision: inner.notebook.revision(),
                    connection_string: Some(connection_string),
                    status: ExecStatus::Error,
                    error: Some(message),
                });
                Ok(())
            }
        }
    }

    /// Run a cell and its transitive dependents in topological order.
    pub async fn run_cell(&self, id: &CellId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let plan = schedule::plan(inner.notebook.graph(), id)?;
        self.drive(&mut inner, plan).await
    }

    /// Run every cell in the notebook.
    pub async fn run_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let plan = schedule::plan_all(inner.notebook.graph())?;
        self.drive(&mut inner, plan).await
    }

    /// Replace the kernel with a freshly spawned one.
    ///
    /// The document survives; all runtime state (statuses, outputs, the
    /// namespace) starts over. Cells are re-registered and the database
    /// config is replayed.
    pub async fn restart_kernel(&self, fresh: K) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.kernel = fresh;

        Self::register_all(&mut inner).await?;
        if let Some(connection_string) = inner.notebook.db_connection.clone() {
            inner
                .kernel
                .send(KernelRequest::SetDatabaseConfig { connection_string })
                .await?;
            if let Err(message) = Self::await_config_result(&mut inner.kernel).await? {
                tracing::warn!(error = %message, "database config rejected after kernel restart");
            }
        }

        let cell_ids: Vec<CellId> = inner.notebook.cells().iter().map(|c| c.id.clone()).collect();
        for id in &cell_ids {
            if let Some(cell) = inner.notebook.cell_mut(id) {
                cell.status = CellStatus::Idle;
                cell.clear_results();
            }
        }
        let revision = inner.notebook.bump_revision();
        self.storage.save(&inner.notebook).await?;

        self.emit(NotebookEvent::KernelRestarted { revision });
        for id in cell_ids {
            self.emit(NotebookEvent::CellStatus {
                revision,
                cell_id: id,
                status: CellStatus::Idle,
            });
        }
        Ok(())
    }

    async fn register_all(inner: &mut Inner<K>) -> Result<()> {
        let cells: Vec<KernelRequest> = inner
            .notebook
            .cells()
            .iter()
            .enumerate()
            .map(|(position, cell)| KernelRequest::RegisterCell {
                id: cell.id.clone(),
                source: cell.source.clone(),
                kind: cell.kind,
                position,
            })
            .collect();
        for request in cells {
            inner.kernel.send(request).await?;
        }
        Ok(())
    }

    /// Drain kernel messages until the `ConfigResult` for an in-flight
    /// `SetDatabaseConfig` arrives.
    async fn await_config_result(kernel: &mut K) -> Result<std::result::Result<(), String>> {
        loop {
            match kernel.recv().await {
                None => {
                    return Err(Error::KernelFatal(
                        "kernel exited while applying database config".to_string(),
                    ))
                }
                Some(KernelMessage::ConfigResult { status: ExecStatus::Success, .. }) => {
                    return Ok(Ok(()))
                }
                Some(KernelMessage::ConfigResult { status: ExecStatus::Error, error }) => {
                    return Ok(Err(error
                        .unwrap_or_else(|| "database configuration failed".to_string())))
                }
                Some(other) => {
                    tracing::trace!(?other, "ignoring kernel message while awaiting config result");
                }
            }
        }
    }

    /// Execute a planned run.
    ///
    /// Cycle plans never reach the kernel: cycle members error out, the
    /// rest of the affected set blocks. Cascades walk the topological order
    /// strictly sequentially; a non-success dependency *within this run*
    /// blocks its dependents, while historical failures outside the
    /// affected set are ignored.
    async fn drive(&self, inner: &mut Inner<K>, plan: RunPlan) -> Result<()> {
        match plan {
            RunPlan::Cycle { members, blocked } => {
                let message = schedule::cycle_message(&members);
                for id in &members {
                    let revision = inner.notebook.revision();
                    if let Some(cell) = inner.notebook.cell_mut(id) {
                        cell.clear_results();
                        cell.error = Some(message.clone());
                    }
                    self.emit(NotebookEvent::CellError {
                        revision,
                        cell_id: id.clone(),
                        error: message.clone(),
                    });
                    self.set_status(&mut inner.notebook, id, CellStatus::Error);
                }
                for id in &blocked {
                    self.set_status(&mut inner.notebook, id, CellStatus::Blocked);
                }
                self.storage.save(&inner.notebook).await?;
                Ok(())
            }
            RunPlan::Cascade { order } => {
                let affected: rustc_hash::FxHashSet<CellId> = order.iter().cloned().collect();
                let mut failed: rustc_hash::FxHashSet<CellId> = rustc_hash::FxHashSet::default();

                for id in order {
                    let deps_in_run_failed = inner
                        .notebook
                        .graph()
                        .dependencies(&id)
                        .into_iter()
                        .any(|dep| affected.contains(&dep) && failed.contains(&dep));
                    if deps_in_run_failed {
                        self.set_status(&mut inner.notebook, &id, CellStatus::Blocked);
                        failed.insert(id);
                        continue;
                    }

                    if let Some(cell) = inner.notebook.cell_mut(&id) {
                        cell.clear_results();
                    }
                    self.set_status(&mut inner.notebook, &id, CellStatus::Running);

                    inner.kernel.send(KernelRequest::Execute { id: id.clone() }).await?;
                    let (status, error) = self.pump_execution(inner, &id).await?;

                    match status {
                        ExecStatus::Success => {
                            self.set_status(&mut inner.notebook, &id, CellStatus::Success);
                        }
                        ExecStatus::Error => {
                            let text = error.unwrap_or_else(|| "execution failed".to_string());
                            let revision = inner.notebook.revision();
                            if let Some(cell) = inner.notebook.cell_mut(&id) {
                                cell.error = Some(text.clone());
                            }
                            self.emit(NotebookEvent::CellError {
                                revision,
                                cell_id: id.clone(),
                                error: text,
                            });
                            self.set_status(&mut inner.notebook, &id, CellStatus::Error);
                            failed.insert(id);
                        }
                    }
                }

                self.storage.save(&inner.notebook).await?;
                Ok(())
            }
        }
    }

    /// Forward streaming messages for one execution until its terminal
    /// `Result` arrives.
    async fn pump_execution(
        &self,
        inner: &mut Inner<K>,
        id: &CellId,
    ) -> Result<(ExecStatus, Option<String>)> {
        loop {
            let Some(message) = inner.kernel.recv().await else {
                // A dead kernel is fatal for the session; no cell-level
                // event is emitted for it.
                return Err(Error::KernelFatal(
                    "kernel exited during cell execution".to_string(),
                ));
            };
            let revision = inner.notebook.revision();
            match message {
                KernelMessage::Status { .. } => {
                    // The scheduler already announced `running`.
                }
                KernelMessage::Stdout { id: cell_id, text } if cell_id == *id => {
                    if let Some(cell) = inner.notebook.cell_mut(id) {
                        cell.stdout.push_str(&text);
                    }
                    self.emit(NotebookEvent::CellStdout {
                        revision,
                        cell_id,
                        text,
                    });
                }
                KernelMessage::Output { id: cell_id, output } if cell_id == *id => {
                    if let Some(cell) = inner.notebook.cell_mut(id) {
                        cell.outputs.push(output.clone());
                    }
                    self.emit(NotebookEvent::CellOutput {
                        revision,
                        cell_id,
                        output,
                    });
                }
                KernelMessage::Result { id: cell_id, status, error } if cell_id == *id => {
                    return Ok((status, error));
                }
                other => {
                    tracing::trace!(?other, "ignoring kernel message for another cell");
                }
            }
        }
    }
}
