//! Notebook persistence.
//!
//! The coordinator saves after every mutation through this interface and is
//! agnostic to the backend. The serialization format is owned here: one
//! JSON document per notebook. Runtime-only state (cell status, the derived
//! graph) never hits storage; `load` rebuilds the graph from the persisted
//! read/write sets.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::notebook::Notebook;

/// Persistence interface consumed by the coordinator.
pub trait Storage: Send + Sync {
    fn save(&self, notebook: &Notebook) -> impl Future<Output = Result<()>> + Send;
    fn load(&self, id: &str) -> impl Future<Output = Result<Notebook>> + Send;
    fn list(&self, owner: &str) -> impl Future<Output = Result<Vec<String>>> + Send;
    fn delete(&self, id: &str) -> impl Future<Output = Result<()>> + Send;
}

fn to_document(notebook: &Notebook) -> Result<String> {
    serde_json::to_string_pretty(notebook)
        .map_err(|e| Error::Serialization(format!("failed to serialize notebook: {e}")))
}

fn from_document(id: &str, document: &str) -> Result<Notebook> {
    let mut notebook: Notebook = serde_json::from_str(document)
        .map_err(|e| Error::Serialization(format!("failed to parse notebook {id}: {e}")))?;
    notebook.rebuild_graph();
    Ok(notebook)
}

/// In-memory storage for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStorage {
    documents: Mutex<HashMap<String, (String, String)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    async fn save(&self, notebook: &Notebook) -> Result<()> {
        let document = to_document(notebook)?;
        let mut documents = self
            .documents
            .lock()
            .map_err(|_| Error::Storage("memory store poisoned".to_string()))?;
        documents.insert(notebook.id.clone(), (notebook.owner.clone(), document));
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Notebook> {
        let documents = self
            .documents
            .lock()
            .map_err(|_| Error::Storage("memory store poisoned".to_string()))?;
        let (_, document) = documents
            .get(id)
            .ok_or_else(|| Error::NotebookNotFound(id.to_string()))?;
        from_document(id, document)
    }

    async fn list(&self, owner: &str) -> Result<Vec<String>> {
        let documents = self
            .documents
            .lock()
            .map_err(|_| Error::Storage("memory store poisoned".to_string()))?;
        let mut ids: Vec<String> = documents
            .iter()
            .filter(|(_, (doc_owner, _))| doc_owner == owner)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut documents = self
            .documents
            .lock()
            .map_err(|_| Error::Storage("memory store poisoned".to_string()))?;
        documents
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotebookNotFound(id.to_string()))
    }
}

/// Directory-backed storage: one pretty-printed JSON file per notebook.
pub struct JsonDirStorage {
    root: PathBuf,
}

impl JsonDirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }
}

impl Storage for JsonDirStorage {
    async fn save(&self, notebook: &Notebook) -> Result<()> {
        let document = to_document(notebook)?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.path_for(&notebook.id), document).await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Notebook> {
        let path = self.path_for(id);
        let document = match tokio::fs::read_to_string(&path).await {
            Ok(document) => document,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotebookNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        from_document(id, &document)
    }

    async fn list(&self, owner: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match owner_of(&path).await {
                Ok(Some(doc_owner)) if doc_owner == owner => {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        ids.push(stem.to_string());
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable notebook file"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotebookNotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn owner_of(path: &Path) -> Result<Option<String>> {
    let document = tokio::fs::read_to_string(path).await?;
    let value: serde_json::Value = serde_json::from_str(&document)
        .map_err(|e| Error::Serialization(format!("invalid notebook file: {e}")))?;
    Ok(value
        .get("owner")
        .and_then(|owner| owner.as_str())
        .map(|owner| owner.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notebook::CellKind;

    fn sample_notebook(owner: &str) -> Notebook {
        let mut nb = Notebook::new(owner, "analysis");
        let (id, _) = nb.insert_cell(CellKind::Python, None).unwrap();
        nb.update_source(&id, "x = 5".to_string()).unwrap();
        nb.rebuild_graph();
        nb
    }

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let storage = MemoryStorage::new();
        let nb = sample_notebook("u1");
        let id = nb.id.clone();

        storage.save(&nb).await.unwrap();
        let restored = storage.load(&id).await.unwrap();
        assert_eq!(restored.id, id);
        assert_eq!(restored.cells().len(), 1);
        assert!(restored.cells()[0].writes.contains("x"));
    }

    #[tokio::test]
    async fn test_memory_list_filters_by_owner() {
        let storage = MemoryStorage::new();
        let mine = sample_notebook("me");
        let theirs = sample_notebook("them");
        storage.save(&mine).await.unwrap();
        storage.save(&theirs).await.unwrap();

        let ids = storage.list("me").await.unwrap();
        assert_eq!(ids, vec![mine.id.clone()]);
    }

    #[tokio::test]
    async fn test_memory_load_missing() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            storage.load("nope").await,
            Err(Error::NotebookNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_json_dir_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonDirStorage::new(dir.path());
        let nb = sample_notebook("u1");
        let id = nb.id.clone();

        storage.save(&nb).await.unwrap();
        let restored = storage.load(&id).await.unwrap();
        assert_eq!(restored.cells().len(), 1);

        // The graph is rebuilt on load even though it is never persisted.
        assert!(restored.graph().position(&restored.cells()[0].id).is_some());

        let ids = storage.list("u1").await.unwrap();
        assert_eq!(ids, vec![id.clone()]);

        storage.delete(&id).await.unwrap();
        assert!(matches!(
            storage.load(&id).await,
            Err(Error::NotebookNotFound(_))
        ));
    }
}
