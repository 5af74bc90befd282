//! Local provider: materializes resources as JSON documents on disk.
//!
//! Layout: `<root>/<type-path>/<id>.json`, where `azure-native:keyvault:Vault`
//! becomes `azure-native/keyvault/Vault`. Handy for trying stacks out and
//! for tests; real clouds plug in through the same `Provider` trait.

use crate::provider::{Created, Provider};
use anyhow::{Context, Result};
use serde_json::{json, Value as JsonValue};
use stackclaw_core::Outputs;
use std::path::{Path, PathBuf};

pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn type_dir(&self, resource_type: &str) -> PathBuf {
        resource_type
            .split(':')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |dir, segment| dir.join(path_segment(segment)))
    }

    /// Document for `id`. Ids come from state, so anything that is not a
    /// single plain path segment is refused.
    fn document_path(&self, resource_type: &str, id: &str) -> Result<PathBuf> {
        if id.is_empty() || path_segment(id) != id {
            anyhow::bail!("invalid local resource id '{}'", id);
        }
        Ok(self.type_dir(resource_type).join(format!("{}.json", id)))
    }

    async fn write_document(
        &self,
        resource_type: &str,
        id: &str,
        properties: &JsonValue,
    ) -> Result<Outputs> {
        let path = self.document_path(resource_type, id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let outputs = outputs_for(resource_type, id, properties);
        let document = json!({
            "id": id,
            "type": resource_type,
            "properties": properties,
        });
        tokio::fs::write(&path, serde_json::to_vec_pretty(&document)?)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        tracing::debug!("wrote {}", path.display());
        Ok(outputs)
    }
}

/// Name for a new resource: the `name` property if there is one, otherwise
/// the last segment of the type token.
fn resource_name(resource_type: &str, properties: &JsonValue) -> String {
    properties
        .get("name")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            resource_type
                .rsplit(':')
                .next()
                .unwrap_or(resource_type)
                .to_lowercase()
        })
}

/// One file name component: separators and anything outside
/// `[A-Za-z0-9._-]` become `_`, and `.`/`..` are never returned as is.
fn path_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}

fn outputs_for(resource_type: &str, id: &str, properties: &JsonValue) -> Outputs {
    let mut outputs: Outputs = properties
        .as_object()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    outputs
        .entry("name".into())
        .or_insert_with(|| JsonValue::String(resource_name(resource_type, properties)));
    outputs.insert("id".into(), JsonValue::String(id.to_string()));
    outputs.insert("type".into(), JsonValue::String(resource_type.to_string()));
    outputs
}

#[async_trait::async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn create(&self, resource_type: &str, properties: &JsonValue) -> Result<Created> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!(
            "{}-{}",
            path_segment(&resource_name(resource_type, properties)),
            &suffix[..8]
        );
        let outputs = self.write_document(resource_type, &id, properties).await?;
        Ok(Created { id, outputs })
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        properties: &JsonValue,
    ) -> Result<Outputs> {
        let path = self.document_path(resource_type, id)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            anyhow::bail!("{} {} does not exist", resource_type, id);
        }
        self.write_document(resource_type, id, properties).await
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<()> {
        let path = self.document_path(resource_type, id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // Already gone counts as deleted
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting {}", path.display())),
        }
    }

    /// Lookups echo their arguments back, plus `name` (the `name` argument or
    /// the first string argument) and a path-style `id`.
    async fn read(&self, resource_type: &str, args: &JsonValue) -> Result<Outputs> {
        let name = args
            .get("name")
            .and_then(JsonValue::as_str)
            .or_else(|| {
                args.as_object()
                    .and_then(|m| m.values().find_map(JsonValue::as_str))
            })
            .with_context(|| format!("{} lookup needs a string argument", resource_type))?
            .to_string();
        let mut outputs: Outputs = args
            .as_object()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        outputs.insert("name".into(), JsonValue::String(name.clone()));
        outputs.insert(
            "id".into(),
            JsonValue::String(format!("/{}/{}", resource_type.replace(':', "/"), name)),
        );
        Ok(outputs)
    }
}
