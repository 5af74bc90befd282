//! Core types for stackclaw

use crate::context::StackConfig;
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

/// Reserved namespace for `${config.key}` substitutions.
pub const CONFIG_NAMESPACE: &str = "config";

/// Placeholder printed wherever a secret value would be shown.
pub const REDACTED: &str = "[secret]";

/// Resource identifier - cheaply cloneable
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0.to_string()
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Outputs published by a resource once its operation completes.
pub type Outputs = BTreeMap<String, JsonValue>;

/// Desired properties of a resource.
pub type Properties = BTreeMap<String, Value>;

/// A pointer at another resource's output, e.g. `${kv.properties.vaultUri}`.
/// `output` is a dotted path; its first segment names the output, the rest
/// walk into nested objects.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct OutputRef {
    pub node: NodeId,
    pub output: String,
}

impl OutputRef {
    pub fn new(node: impl Into<NodeId>, output: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            output: output.into(),
        }
    }

    /// Look the referenced value up in the producer's outputs.
    pub fn lookup<'a>(&self, outputs: &'a Outputs) -> Option<&'a JsonValue> {
        let mut segments = self.output.split('.');
        let mut current = outputs.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                JsonValue::Object(map) => map.get(segment)?,
                JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl std::fmt::Display for OutputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${{{}.{}}}", self.node, self.output)
    }
}

/// A property value. References stay typed from load to execution so the
/// builder can find every implicit dependency by walking the tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// A plain json value with no references inside.
    Literal(JsonValue),
    /// Another resource's output, not known until that resource is applied.
    Reference(OutputRef),
    /// A stack config key, substituted by the graph builder.
    Config(String),
    /// Sensitive value; redacted from plans and logs.
    Secret(Box<Value>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// Why a value could not be turned into plain json.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Unresolved {
    Output(OutputRef),
    Config(String),
}

impl std::fmt::Display for Unresolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Output(r) => write!(f, "{} is not known", r),
            Self::Config(key) => write!(f, "config key '{}' was never substituted", key),
        }
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\$\{([A-Za-z0-9_\-]+)\.([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\}$")
            .expect("placeholder pattern is valid")
    })
}

impl Value {
    pub fn literal(v: impl Into<JsonValue>) -> Self {
        Self::Literal(v.into())
    }

    pub fn reference(node: impl Into<NodeId>, output: impl Into<String>) -> Self {
        Self::Reference(OutputRef::new(node, output))
    }

    pub fn secret(v: Value) -> Self {
        Self::Secret(Box::new(v))
    }

    /// Parse a raw json tree from a stack file.
    ///
    /// A string that is exactly `${node.output}` becomes a reference and
    /// `${config.key}` a config lookup. An object of the single key
    /// `$secret` wraps its value as a secret. Containers holding no
    /// placeholders collapse back into one literal.
    pub fn from_json(raw: JsonValue) -> Self {
        match raw {
            JsonValue::String(s) => match placeholder_pattern().captures(&s) {
                Some(caps) if &caps[1] == CONFIG_NAMESPACE => Self::Config(caps[2].to_string()),
                Some(caps) => Self::reference(&caps[1], &caps[2]),
                None => Self::Literal(JsonValue::String(s)),
            },
            JsonValue::Array(items) => {
                let values: Vec<Value> = items.into_iter().map(Self::from_json).collect();
                if values.iter().all(|v| matches!(v, Self::Literal(_))) {
                    Self::Literal(JsonValue::Array(
                        values.into_iter().map(Self::into_literal).collect(),
                    ))
                } else {
                    Self::List(values)
                }
            }
            JsonValue::Object(mut map) => {
                if map.len() == 1 {
                    if let Some(inner) = map.remove("$secret") {
                        return Self::secret(Self::from_json(inner));
                    }
                }
                let values: BTreeMap<String, Value> = map
                    .into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect();
                if values.values().all(|v| matches!(v, Self::Literal(_))) {
                    Self::Literal(JsonValue::Object(
                        values
                            .into_iter()
                            .map(|(k, v)| (k, v.into_literal()))
                            .collect(),
                    ))
                } else {
                    Self::Map(values)
                }
            }
            other => Self::Literal(other),
        }
    }

    fn into_literal(self) -> JsonValue {
        match self {
            Self::Literal(v) => v,
            _ => JsonValue::Null,
        }
    }

    /// Every output reference in this value, depth first.
    pub fn references(&self) -> Vec<&OutputRef> {
        let mut found = Vec::new();
        self.collect_references(&mut found);
        found
    }

    fn collect_references<'a>(&'a self, found: &mut Vec<&'a OutputRef>) {
        match self {
            Self::Reference(r) => found.push(r),
            Self::Secret(inner) => inner.collect_references(found),
            Self::List(items) => items.iter().for_each(|v| v.collect_references(found)),
            Self::Map(map) => map.values().for_each(|v| v.collect_references(found)),
            Self::Literal(_) | Self::Config(_) => {}
        }
    }

    pub fn contains_secret(&self) -> bool {
        self.contains_secret_with(&|_| false)
    }

    /// Like `contains_secret`, but a reference also counts when
    /// `secret_ref` says the output it points at is sensitive.
    pub fn contains_secret_with<F>(&self, secret_ref: &F) -> bool
    where
        F: Fn(&OutputRef) -> bool,
    {
        match self {
            Self::Secret(_) => true,
            Self::Reference(r) => secret_ref(r),
            Self::List(items) => items.iter().any(|v| v.contains_secret_with(secret_ref)),
            Self::Map(map) => map.values().any(|v| v.contains_secret_with(secret_ref)),
            Self::Literal(_) | Self::Config(_) => false,
        }
    }

    /// Replace every config lookup with its value from the stack config.
    pub fn substitute_config(self, config: &StackConfig) -> Result<Value> {
        Ok(match self {
            Self::Config(key) => {
                let entry = config.require(&key)?;
                let literal = Self::Literal(entry.value.clone());
                if entry.secret {
                    Self::secret(literal)
                } else {
                    literal
                }
            }
            Self::Secret(inner) => Self::secret(inner.substitute_config(config)?),
            Self::List(items) => Self::List(
                items
                    .into_iter()
                    .map(|v| v.substitute_config(config))
                    .collect::<Result<_>>()?,
            ),
            Self::Map(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| Ok((k, v.substitute_config(config)?)))
                    .collect::<Result<_>>()?,
            ),
            other => other,
        })
    }

    /// Produce plain json, looking references up through `lookup`. Fails on
    /// the first reference `lookup` cannot answer.
    pub fn resolve_with<F>(&self, lookup: &F) -> std::result::Result<JsonValue, Unresolved>
    where
        F: Fn(&OutputRef) -> Option<JsonValue>,
    {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Reference(r) => lookup(r).ok_or_else(|| Unresolved::Output(r.clone())),
            Self::Config(key) => Err(Unresolved::Config(key.clone())),
            Self::Secret(inner) => inner.resolve_with(lookup),
            Self::List(items) => items
                .iter()
                .map(|v| v.resolve_with(lookup))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(JsonValue::Array),
            Self::Map(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.resolve_with(lookup)?)))
                .collect::<std::result::Result<serde_json::Map<_, _>, _>>()
                .map(JsonValue::Object),
        }
    }

    /// Display form: secrets masked, references and config keys shown as
    /// their `${...}` placeholders.
    pub fn redacted(&self) -> JsonValue {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Reference(r) => JsonValue::String(r.to_string()),
            Self::Config(key) => JsonValue::String(format!("${{{}.{}}}", CONFIG_NAMESPACE, key)),
            Self::Secret(_) => JsonValue::String(REDACTED.into()),
            Self::List(items) => JsonValue::Array(items.iter().map(Value::redacted).collect()),
            Self::Map(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.redacted()))
                    .collect(),
            ),
        }
    }
}

/// Resolve a whole property map into one json object.
pub fn resolve_properties<F>(
    properties: &Properties,
    lookup: &F,
) -> std::result::Result<JsonValue, Unresolved>
where
    F: Fn(&OutputRef) -> Option<JsonValue>,
{
    properties
        .iter()
        .map(|(k, v)| Ok((k.clone(), v.resolve_with(lookup)?)))
        .collect::<std::result::Result<serde_json::Map<_, _>, _>>()
        .map(JsonValue::Object)
}

/// Managed resources go through create/update/delete; data sources are only
/// ever read.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    #[default]
    Managed,
    Data,
}

/// One resource declaration, as read from a stack file.
#[derive(Clone, Debug, PartialEq)]
pub struct Declaration {
    pub id: NodeId,
    pub resource_type: String,
    pub kind: ResourceKind,
    pub properties: Properties,
    pub parent: Option<NodeId>,
    pub depends_on: Vec<NodeId>,
}

impl Declaration {
    pub fn managed(id: impl Into<NodeId>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            kind: ResourceKind::Managed,
            properties: Properties::new(),
            parent: None,
            depends_on: Vec::new(),
        }
    }

    pub fn data(id: impl Into<NodeId>, resource_type: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Data,
            ..Self::managed(id, resource_type)
        }
    }

    pub fn property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn parent(mut self, parent: impl Into<NodeId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<NodeId>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    /// The provider package of the resource type: `azure-native` for
    /// `azure-native:keyvault:Vault`.
    pub fn package(&self) -> &str {
        type_package(&self.resource_type)
    }
}

/// Package segment of a `package:module:Type` token.
pub fn type_package(resource_type: &str) -> &str {
    resource_type
        .split_once(':')
        .map(|(package, _)| package)
        .unwrap_or(resource_type)
}

/// Check that a declaration id is usable as a node id.
pub fn validate_id(id: &NodeId) -> Result<()> {
    if id.as_str().is_empty() {
        return Err(Error::Declaration("resource id must not be empty".into()));
    }
    if id.as_str() == CONFIG_NAMESPACE {
        return Err(Error::Declaration(format!(
            "'{}' is reserved for config lookups",
            CONFIG_NAMESPACE
        )));
    }
    if !id
        .as_str()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Declaration(format!(
            "resource id '{}' may only contain letters, digits, '-' and '_'",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn placeholder_parsing() {
        assert_eq!(
            Value::from_json(json!("${kv.id}")),
            Value::reference("kv", "id")
        );
        assert_eq!(
            Value::from_json(json!("${config.tenantId}")),
            Value::Config("tenantId".into())
        );
        assert_eq!(
            Value::from_json(json!("prefix-${kv.id}")),
            Value::literal("prefix-${kv.id}")
        );
    }

    #[test]
    fn nested_literals_collapse() {
        let v = Value::from_json(json!({"sku": {"family": "A", "name": "standard"}}));
        assert!(matches!(v, Value::Literal(_)));
    }

    #[test]
    fn output_path_lookup() {
        let mut outputs = Outputs::new();
        outputs.insert("properties".into(), json!({"vaultUri": "https://kv", "tags": ["a", "b"]}));
        let uri = OutputRef::new("kv", "properties.vaultUri");
        assert_eq!(uri.lookup(&outputs), Some(&json!("https://kv")));
        let tag = OutputRef::new("kv", "properties.tags.1");
        assert_eq!(tag.lookup(&outputs), Some(&json!("b")));
        assert!(OutputRef::new("kv", "missing").lookup(&outputs).is_none());
    }

    #[test]
    fn type_package_split() {
        assert_eq!(type_package("azure-native:keyvault:Vault"), "azure-native");
        assert_eq!(type_package("local"), "local");
    }
}
