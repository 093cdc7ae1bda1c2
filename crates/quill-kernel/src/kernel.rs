//! Kernel state and request dispatch.

use std::ffi::CString;
use std::sync::mpsc::Sender;

use pyo3::prelude::*;
use pyo3::types::PyDict;
use rustc_hash::FxHashMap;

use quill_core::ipc::protocol::{KernelMessage, KernelRequest};
use quill_core::{CellId, CellKind, ExecStatus};

use crate::{exec, sql};

/// Imports run once at startup to pre-populate the shared namespace with
/// the well-known math/data/plotting stack. Missing libraries are skipped;
/// matplotlib is forced onto the Agg backend so nothing ever opens a
/// window.
const BOOTSTRAP: &str = r#"
import collections
import datetime
import itertools
import json
import math
import random
import re
import statistics

try:
    import numpy as np
except ImportError:
    pass
try:
    import pandas as pd
except ImportError:
    pass
try:
    import matplotlib
    matplotlib.use("Agg")
    import matplotlib.pyplot as plt
except ImportError:
    pass
try:
    import plotly
    import plotly.express as px
    import plotly.graph_objects as go
except ImportError:
    pass
try:
    import altair as alt
except ImportError:
    pass
"#;

#[derive(Clone)]
struct RegisteredCell {
    source: String,
    kind: CellKind,
    position: usize,
}

/// The kernel: one namespace, one optional database config, a registry of
/// cell sources, and the outbound message channel.
pub struct Kernel {
    tx: Sender<KernelMessage>,
    cells: FxHashMap<CellId, RegisteredCell>,
    namespace: Py<PyDict>,
    db_connection: Option<String>,
}

impl Kernel {
    /// Initialize the interpreter and bootstrap the namespace.
    pub fn new(tx: Sender<KernelMessage>) -> anyhow::Result<Self> {
        let bootstrap = CString::new(BOOTSTRAP)?;
        let namespace = Python::with_gil(|py| -> PyResult<Py<PyDict>> {
            let ns = PyDict::new(py);
            py.run(bootstrap.as_c_str(), Some(&ns), Some(&ns))?;
            Ok(ns.unbind())
        })?;
        Ok(Self {
            tx,
            cells: FxHashMap::default(),
            namespace,
            db_connection: None,
        })
    }

    fn send(&self, message: KernelMessage) {
        let _ = self.tx.send(message);
    }

    pub fn handle(&mut self, request: KernelRequest) {
        match request {
            KernelRequest::RegisterCell { id, source, kind, position } => {
                tracing::debug!(cell = %id, position, "registering cell");
                self.cells.insert(id, RegisteredCell { source, kind, position });
            }
            KernelRequest::RemoveCell { id, purge } => {
                self.cells.remove(&id);
                if !purge.is_empty() {
                    Python::with_gil(|py| {
                        let ns = self.namespace.bind(py);
                        for symbol in &purge {
                            // Missing symbols (never executed) are fine.
                            let _ = ns.del_item(symbol);
                        }
                    });
                }
            }
            KernelRequest::Execute { id } => self.execute(&id),
            KernelRequest::SetDatabaseConfig { connection_string } => {
                self.set_db_config(connection_string);
            }
            KernelRequest::Shutdown => {
                // Handled by the main loop before dispatch.
            }
        }
    }

    fn execute(&mut self, id: &CellId) {
        self.send(KernelMessage::Status { id: id.clone(), running: true });

        let Some(cell) = self.cells.get(id).cloned() else {
            self.send(KernelMessage::Result {
                id: id.clone(),
                status: ExecStatus::Error,
                error: Some(format!("cell {id} is not registered with the kernel")),
            });
            return;
        };

        let outcome = match cell.kind {
            CellKind::Python => Python::with_gil(|py| {
                exec::execute_python(
                    py,
                    self.namespace.bind(py),
                    &cell.source,
                    cell.position,
                    id,
                    &self.tx,
                )
            }),
            CellKind::Sql => Python::with_gil(|py| {
                sql::execute_sql(
                    py,
                    self.namespace.bind(py),
                    &cell.source,
                    self.db_connection.as_deref(),
                    id,
                    &self.tx,
                )
            }),
        };

        let (status, error) = match outcome {
            Ok(()) => (ExecStatus::Success, None),
            Err(text) => (ExecStatus::Error, Some(text)),
        };
        self.send(KernelMessage::Result { id: id.clone(), status, error });
    }

    /// Validate the connection string with a probe connection before
    /// accepting it. A rejected config leaves the previous one in place.
    fn set_db_config(&mut self, connection_string: String) {
        match postgres::Client::connect(&connection_string, postgres::NoTls) {
            Ok(client) => {
                drop(client);
                self.db_connection = Some(connection_string);
                self.send(KernelMessage::ConfigResult { status: ExecStatus::Success, error: None });
            }
            Err(e) => {
                tracing::warn!(error = %e, "database config rejected");
                self.send(KernelMessage::ConfigResult {
                    status: ExecStatus::Error,
                    error: Some(e.to_string()),
                });
            }
        }
    }
}
