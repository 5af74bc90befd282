//! Last-applied state and where it is kept.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use stackclaw_core::{Error, NodeId, Outputs, ResourceKind, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const STATE_VERSION: u32 = 1;

/// What was last applied for one resource.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ResourceState {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub kind: ResourceKind,
    /// Provider-assigned id; `None` for data sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Resolved properties sent to the provider.
    pub properties: JsonValue,
    #[serde(default)]
    pub outputs: Outputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<NodeId>,
    /// Dependencies at apply time; drives delete ordering once the resource
    /// is no longer declared.
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
    pub updated: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StackState {
    pub version: u32,
    pub stack: String,
    #[serde(default)]
    pub resources: BTreeMap<NodeId, ResourceState>,
}

impl Default for StackState {
    fn default() -> Self {
        Self::new("")
    }
}

impl StackState {
    pub fn new(stack: &str) -> Self {
        Self {
            version: STATE_VERSION,
            stack: stack.into(),
            resources: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ResourceState> {
        self.resources.get(id)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Recorded resources that list `id` as a dependency.
    pub fn dependents(&self, id: &str) -> Vec<NodeId> {
        self.resources
            .iter()
            .filter(|(_, r)| r.dependencies.iter().any(|d| d.as_str() == id))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Where stack state lives between runs.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last saved state. A store that has never been written
    /// returns an empty state.
    async fn load(&self) -> Result<StackState>;

    async fn save(&self, state: &StackState) -> Result<()>;

    /// Physical location for humans (path, URL).
    fn location(&self) -> String;
}

/// JSON file store. Writes go to a sibling temp file first and are renamed
/// into place so a crash never leaves a torn state file.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<StackState> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let state: StackState = serde_json::from_slice(&bytes)?;
                if state.version > STATE_VERSION {
                    return Err(Error::State(format!(
                        "{} has state version {}, newest supported is {}",
                        self.path.display(),
                        state.version,
                        STATE_VERSION
                    )));
                }
                tracing::debug!(
                    path = %self.path.display(),
                    resources = state.len(),
                    "state loaded"
                );
                Ok(state)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StackState::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, state: &StackState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), resources = state.len(), "state saved");
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-process store, mostly for tests.
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<StackState>,
    saves: Mutex<usize>,
}

impl MemoryStateStore {
    pub fn new(state: StackState) -> Self {
        Self {
            state: Mutex::new(state),
            saves: Mutex::new(0),
        }
    }

    pub fn snapshot(&self) -> StackState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|n| *n).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<StackState> {
        self.state
            .lock()
            .map(|s| s.clone())
            .map_err(|_| Error::State("state lock poisoned".into()))
    }

    async fn save(&self, state: &StackState) -> Result<()> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| Error::State("state lock poisoned".into()))?;
        *guard = state.clone();
        if let Ok(mut n) = self.saves.lock() {
            *n += 1;
        }
        Ok(())
    }

    fn location(&self) -> String {
        "memory".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(deps: &[&str]) -> ResourceState {
        ResourceState {
            resource_type: "local:file:File".into(),
            kind: ResourceKind::Managed,
            provider_id: Some("f-1".into()),
            properties: json!({"content": "x"}),
            outputs: Outputs::new(),
            parent: None,
            dependencies: deps.iter().map(|d| NodeId::new(*d)).collect(),
            updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn file_store_missing_file_is_empty_state() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(tmp.path().join("nested/state.json"));
        let state = store.load().await.unwrap();
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn file_store_save_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(tmp.path().join("nested/state.json"));
        let mut state = StackState::new("keyvault");
        state.resources.insert("a".into(), record(&[]));
        state.resources.insert("b".into(), record(&["a"]));
        store.save(&state).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.dependents("a"), vec![NodeId::new("b")]);
        assert!(!tmp.path().join("nested/state.json.tmp").exists());
    }

    #[tokio::test]
    async fn file_store_rejects_newer_version() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, r#"{"version": 99, "stack": "x", "resources": {}}"#).unwrap();
        let err = FileStateStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }

    #[tokio::test]
    async fn memory_store_counts_saves() {
        let store = MemoryStateStore::default();
        store.save(&StackState::new("s")).await.unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load().await.unwrap().stack, "s");
    }
}
