//! Stack files: one YAML (or JSON) document with a name, config values and
//! an ordered list of resources.

use serde::Deserialize;
use serde_json::Value as JsonValue;
use stackclaw_core::{Declaration, Error, Result, StackConfig, Value};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StackFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    config: BTreeMap<String, JsonValue>,
    #[serde(default)]
    resources: Vec<ResourceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ResourceEntry {
    id: String,
    #[serde(rename = "type")]
    resource_type: String,
    #[serde(default)]
    data: bool,
    #[serde(default)]
    properties: BTreeMap<String, JsonValue>,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
}

/// A parsed stack file.
#[derive(Debug, Clone)]
pub struct StackDocument {
    pub name: String,
    pub config: StackConfig,
    /// In file order; the order breaks ties between independent resources.
    pub declarations: Vec<Declaration>,
}

/// Parse stack file text. `fallback_name` names the stack when the file
/// does not.
pub fn parse_stack(text: &str, fallback_name: &str) -> Result<StackDocument> {
    let file: StackFile = serde_yaml::from_str(text)
        .map_err(|e| Error::Declaration(format!("invalid stack file: {}", e)))?;

    let name = file
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| fallback_name.to_string());
    if name.is_empty() {
        return Err(Error::Declaration("stack has no name".into()));
    }

    let mut config = StackConfig::new();
    for (key, value) in file.config {
        match secret_entry(&value) {
            Some(inner) => config.set_secret(key, inner.clone()),
            None => config.set(key, value),
        }
    }

    let declarations = file.resources.into_iter().map(declaration).collect();
    Ok(StackDocument {
        name,
        config,
        declarations,
    })
}

/// Read and parse a stack file. Unreadable files are declaration errors.
pub fn load_stack(path: &Path) -> Result<StackDocument> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Declaration(format!("cannot read {}: {}", path.display(), e)))?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let doc = parse_stack(&text, stem)?;
    tracing::debug!(
        path = %path.display(),
        stack = %doc.name,
        resources = doc.declarations.len(),
        "stack file loaded"
    );
    Ok(doc)
}

/// Parse `key=value` command line overrides. Values stay strings.
pub fn parse_overrides(pairs: &[String]) -> Result<StackConfig> {
    let mut config = StackConfig::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .filter(|(k, _)| !k.trim().is_empty())
            .ok_or_else(|| {
                Error::Declaration(format!("config override '{}' is not key=value", pair))
            })?;
        config.set(key.trim(), value);
    }
    Ok(config)
}

/// `{secret: v}` marks a secret config value.
fn secret_entry(value: &JsonValue) -> Option<&JsonValue> {
    match value.as_object() {
        Some(map) if map.len() == 1 => map.get("secret"),
        _ => None,
    }
}

fn declaration(entry: ResourceEntry) -> Declaration {
    let mut decl = if entry.data {
        Declaration::data(entry.id, entry.resource_type)
    } else {
        Declaration::managed(entry.id, entry.resource_type)
    };
    for (key, raw) in entry.properties {
        decl = decl.property(key, Value::from_json(raw));
    }
    if let Some(parent) = entry.parent {
        decl = decl.parent(parent);
    }
    for dependency in entry.depends_on {
        decl = decl.depends_on(dependency);
    }
    decl
}
