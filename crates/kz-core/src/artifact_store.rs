//! Persistence for serialized model artifacts.
//!
//! The engine only needs two operations from the host: read a named blob and
//! replace a named blob atomically. [`FileArtifactStore`] implements that
//! with a write-to-temp, fsync, rename sequence so a crash mid-write never
//! leaves a truncated artifact behind. [`MemoryArtifactStore`] backs tests.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid artifact name: {0:?}")]
    InvalidName(String),
    #[error("artifact store rejected write of {0:?}")]
    WriteRejected(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Read an artifact. `Ok(None)` when it has never been written.
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>, ArtifactError>;

    /// Replace an artifact. Readers observe either the old or the new bytes.
    async fn save(&self, name: &str, bytes: &[u8]) -> Result<(), ArtifactError>;

    /// Delete an artifact. Returns `true` if something was removed.
    async fn remove(&self, name: &str) -> Result<bool, ArtifactError>;
}

/// Names end up in file paths, so only a conservative alphabet is allowed.
fn validate_name(name: &str) -> Result<(), ArtifactError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ArtifactError::InvalidName(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// FileArtifactStore
// ---------------------------------------------------------------------------

/// Stores each artifact as `<base_dir>/<name>.json`.
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    base_dir: PathBuf,
}

impl FileArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    fn artifact_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.json"))
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.base_dir
            .join(format!(".{name}.json.{}.tmp", std::process::id()))
    }
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>, ArtifactError> {
        validate_name(name)?;
        match tokio::fs::read(self.artifact_path(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, name: &str, bytes: &[u8]) -> Result<(), ArtifactError> {
        validate_name(name)?;
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let tmp = self.temp_path(name);
        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, self.artifact_path(name)).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        tracing::debug!(artifact = name, bytes = bytes.len(), "artifact written");
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool, ArtifactError> {
        validate_name(name)?;
        match tokio::fs::remove_file(self.artifact_path(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

/// In-memory store for tests. Saves to names registered with
/// [`MemoryArtifactStore::fail_saves_for`] are rejected.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    saves: Mutex<Vec<String>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later save of `name` fail with [`ArtifactError::WriteRejected`].
    pub fn fail_saves_for(&self, name: &str) {
        self.lock_failing().insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock_failing().clear();
    }

    /// Names of successful saves, in order.
    pub fn saved_names(&self) -> Vec<String> {
        self.saves
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.lock_blobs().get(name).cloned()
    }

    pub fn insert(&self, name: &str, bytes: Vec<u8>) {
        self.lock_blobs().insert(name.to_string(), bytes);
    }

    fn lock_blobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_failing(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.failing.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>, ArtifactError> {
        validate_name(name)?;
        Ok(self.get(name))
    }

    async fn save(&self, name: &str, bytes: &[u8]) -> Result<(), ArtifactError> {
        validate_name(name)?;
        if self.lock_failing().contains(name) {
            return Err(ArtifactError::WriteRejected(name.to_string()));
        }
        self.insert(name, bytes.to_vec());
        self.saves
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(name.to_string());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool, ArtifactError> {
        validate_name(name)?;
        Ok(self.lock_blobs().remove(name).is_some())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (FileArtifactStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = FileArtifactStore::new(dir.path().join("models"));
        (store, dir)
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let (store, _dir) = temp_store();
        assert!(store.load("duration-model").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_returns_bytes() {
        let (store, _dir) = temp_store();
        store.save("duration-model", b"{\"v\":1}").await.unwrap();
        let bytes = store.load("duration-model").await.unwrap().unwrap();
        assert_eq!(bytes, b"{\"v\":1}");
    }

    #[tokio::test]
    async fn save_replaces_and_leaves_no_temp_files() {
        let (store, _dir) = temp_store();
        store.save("category-model", b"old").await.unwrap();
        store.save("category-model", b"new").await.unwrap();
        assert_eq!(store.load("category-model").await.unwrap().unwrap(), b"new");

        let names: Vec<String> = std::fs::read_dir(store.base_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["category-model.json".to_string()]);
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let (store, _dir) = temp_store();
        store.save("duration-model", b"x").await.unwrap();
        assert!(store.remove("duration-model").await.unwrap());
        assert!(!store.remove("duration-model").await.unwrap());
    }

    #[tokio::test]
    async fn path_like_names_are_rejected() {
        let (store, _dir) = temp_store();
        let err = store.save("../escape", b"x").await.unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidName(_)));
        assert!(store.load("").await.is_err());
    }

    #[tokio::test]
    async fn memory_store_injected_failure_keeps_previous_bytes() {
        let store = MemoryArtifactStore::new();
        store.save("duration-model", b"v1").await.unwrap();
        store.fail_saves_for("duration-model");

        let err = store.save("duration-model", b"v2").await.unwrap_err();
        assert!(matches!(err, ArtifactError::WriteRejected(_)));
        assert_eq!(store.get("duration-model").unwrap(), b"v1");
        assert_eq!(store.saved_names(), vec!["duration-model".to_string()]);

        store.clear_failures();
        store.save("duration-model", b"v2").await.unwrap();
        assert_eq!(store.get("duration-model").unwrap(), b"v2");
    }
}
