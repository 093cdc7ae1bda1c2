//! Debounced auto-run for the reactive driving mode.
//!
//! In reactive mode the outer layer reports every cell edit here; once a
//! cell has been quiet for the debounce window (~1.5s), a run is triggered
//! through the same `run_cell` entry point explicit mode uses. Each cell
//! keeps its own deadline, so editing one cell does not postpone another's
//! pending run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::coordinator::Coordinator;
use crate::ipc::KernelLink;
use crate::notebook::CellId;
use crate::storage::Storage;

/// Default quiet window after the last edit before an auto-run fires.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1500);

/// Handle to a running auto-run debouncer task.
pub struct AutoRun {
    edits: mpsc::UnboundedSender<CellId>,
}

impl AutoRun {
    /// Spawn the debouncer task for a coordinator.
    pub fn spawn<S, K>(coordinator: Arc<Coordinator<S, K>>, delay: Duration) -> Self
    where
        S: Storage + 'static,
        K: KernelLink + 'static,
    {
        let (edits, mut rx) = mpsc::unbounded_channel::<CellId>();
        tokio::spawn(async move {
            let mut deadlines: HashMap<CellId, Instant> = HashMap::new();
            loop {
                let due = deadlines
                    .iter()
                    .min_by_key(|(_, at)| **at)
                    .map(|(id, at)| (id.clone(), *at));

                tokio::select! {
                    edit = rx.recv() => match edit {
                        Some(id) => {
                            deadlines.insert(id, Instant::now() + delay);
                        }
                        // Sender dropped: the notebook session is over.
                        None => break,
                    },
                    () = sleep_until_due(due.as_ref().map(|(_, at)| *at)) => {
                        if let Some((id, _)) = due {
                            deadlines.remove(&id);
                            if let Err(e) = coordinator.run_cell(&id).await {
                                tracing::warn!(cell = %id, error = %e, "auto-run failed");
                            }
                        }
                    }
                }
            }
        });
        Self { edits }
    }

    /// Report that a cell was edited, resetting its debounce deadline.
    pub fn notify(&self, cell: CellId) {
        let _ = self.edits.send(cell);
    }
}

async fn sleep_until_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
