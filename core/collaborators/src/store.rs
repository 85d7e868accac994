use async_trait::async_trait;
use chrono::{DateTime, Utc};
use para_schemas::{NoteId, NoteMetadata};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info};

use crate::error::{CollaboratorError, Result};

/// Source of note text and path metadata.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get(&self, note_id: &NoteId) -> Result<(String, NoteMetadata)>;
    async fn list_notes(&self) -> Result<Vec<NoteId>>;
}

/// Content store backed by a map, used by tests and embedders of the engine.
#[derive(Default)]
pub struct MemoryContentStore {
    notes: RwLock<HashMap<NoteId, (String, NoteMetadata)>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, note_id: NoteId, text: impl Into<String>, metadata: NoteMetadata) {
        // A panicked writer leaves the map itself intact
        let mut notes = self.notes.write().unwrap_or_else(|e| e.into_inner());
        notes.insert(note_id, (text.into(), metadata));
    }

    /// Insert a note keyed by the identity of `path`.
    pub fn insert_path(&self, path: impl AsRef<Path>, text: impl Into<String>) -> NoteId {
        let path = path.as_ref();
        let note_id = NoteId::from_path(path);
        let text = text.into();
        let metadata = NoteMetadata {
            path: Some(path.to_path_buf()),
            modified: None,
            size_bytes: Some(text.len() as u64),
        };
        self.insert(note_id.clone(), text, metadata);
        note_id
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn get(&self, note_id: &NoteId) -> Result<(String, NoteMetadata)> {
        let notes = self.notes.read().unwrap_or_else(|e| e.into_inner());
        notes
            .get(note_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(note_id.clone()))
    }

    async fn list_notes(&self) -> Result<Vec<NoteId>> {
        let notes = self.notes.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<NoteId> = notes.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Markdown files under a root directory, identified by their path.
pub struct DirectoryContentStore {
    root: PathBuf,
    paths: RwLock<HashMap<NoteId, PathBuf>>,
}

impl DirectoryContentStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            paths: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn scan(&self) -> Result<Vec<NoteId>> {
        let mut found = HashMap::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                let hidden = path
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with('.'))
                    .unwrap_or(false);

                if hidden {
                    continue;
                }
                if file_type.is_dir() {
                    pending.push(path);
                } else if path.extension().map(|e| e == "md").unwrap_or(false) {
                    found.insert(NoteId::from_path(&path), path);
                }
            }
        }

        let mut ids: Vec<NoteId> = found.keys().cloned().collect();
        ids.sort();

        let mut paths = self
            .paths
            .write()
            .map_err(|_| CollaboratorError::Unavailable("content store lock poisoned".into()))?;
        *paths = found;

        info!("Scanned {} notes under {}", ids.len(), self.root.display());
        Ok(ids)
    }

    fn lookup(&self, note_id: &NoteId) -> Result<Option<PathBuf>> {
        let paths = self
            .paths
            .read()
            .map_err(|_| CollaboratorError::Unavailable("content store lock poisoned".into()))?;
        Ok(paths.get(note_id).cloned())
    }
}

#[async_trait]
impl ContentStore for DirectoryContentStore {
    async fn get(&self, note_id: &NoteId) -> Result<(String, NoteMetadata)> {
        let path = match self.lookup(note_id)? {
            Some(path) => path,
            None => {
                debug!("Note {} not cached, rescanning {}", note_id, self.root.display());
                self.scan().await?;
                self.lookup(note_id)?
                    .ok_or_else(|| CollaboratorError::NotFound(note_id.clone()))?
            }
        };

        let bytes = tokio::fs::read(&path).await?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let fs_meta = tokio::fs::metadata(&path).await.ok();

        let metadata = NoteMetadata {
            path: Some(path),
            modified: fs_meta
                .as_ref()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from),
            size_bytes: fs_meta.map(|m| m.len()),
        };

        Ok((text, metadata))
    }

    async fn list_notes(&self) -> Result<Vec<NoteId>> {
        self.scan().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryContentStore::new();
        let id = store.insert_path("vault/plan.md", "- [ ] ship it");

        let (text, metadata) = store.get(&id).await.unwrap();
        assert_eq!(text, "- [ ] ship it");
        assert_eq!(metadata.size_bytes, Some(13));
        assert_eq!(store.list_notes().await.unwrap(), vec![id]);

        let missing = store.get(&NoteId::new("nope")).await;
        assert!(matches!(missing, Err(CollaboratorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_memory_store_survives_poisoned_lock() {
        let store = std::sync::Arc::new(MemoryContentStore::new());
        let poisoner = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.notes.write().unwrap();
            panic!("writer died");
        })
        .join();
        assert!(store.notes.is_poisoned());

        let id = store.insert_path("vault/after.md", "still here");
        let (text, _) = store.get(&id).await.unwrap();
        assert_eq!(text, "still here");
        assert_eq!(store.list_notes().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_directory_store_walks_markdown() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("Projects");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("launch.md"), "# Launch\ndeadline friday").unwrap();
        std::fs::write(temp_dir.path().join("image.png"), [0u8, 1, 2]).unwrap();
        std::fs::create_dir_all(temp_dir.path().join(".obsidian")).unwrap();
        std::fs::write(temp_dir.path().join(".obsidian").join("x.md"), "hidden").unwrap();

        let store = DirectoryContentStore::new(temp_dir.path());
        let ids = store.list_notes().await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0], NoteId::from_path(nested.join("launch.md")));

        let (text, metadata) = store.get(&ids[0]).await.unwrap();
        assert!(text.contains("deadline"));
        assert!(metadata.modified.is_some());
    }
}
