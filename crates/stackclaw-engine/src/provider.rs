//! Provider plugin interface and registry.
//!
//! A provider owns the real API calls for one type package
//! (`azure-native`, `local`, ...). The executor only ever talks to this trait.

use anyhow::Result;
use serde_json::Value as JsonValue;
use stackclaw_core::{type_package, Error, Outputs};
use std::collections::HashMap;
use std::sync::Arc;

/// What a provider hands back after creating a resource.
#[derive(Clone, Debug, PartialEq)]
pub struct Created {
    /// Provider-assigned identifier, used for later update/delete calls.
    pub id: String,
    pub outputs: Outputs,
}

/// Implement this to bind a cloud API.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Short name for logs (e.g. "local", "azure-native").
    fn name(&self) -> &str;

    /// Create a resource from fully resolved properties.
    async fn create(&self, resource_type: &str, properties: &JsonValue) -> Result<Created>;

    /// Converge an existing resource to new properties.
    async fn update(&self, resource_type: &str, id: &str, properties: &JsonValue)
        -> Result<Outputs>;

    /// Delete a resource by provider id.
    async fn delete(&self, resource_type: &str, id: &str) -> Result<()>;

    /// Look up an existing object (data source). Default: unsupported.
    async fn read(&self, resource_type: &str, _args: &JsonValue) -> Result<Outputs> {
        anyhow::bail!("provider {} cannot read {}", self.name(), resource_type)
    }
}

/// Maps type packages to providers. A fallback provider, when set, serves
/// every package without a dedicated registration.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    fallback: Option<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider for a package. Replaces any existing one.
    pub fn register(&mut self, package: impl Into<String>, provider: impl Provider + 'static) {
        self.providers.insert(package.into(), Arc::new(provider));
    }

    pub fn set_fallback(&mut self, provider: Arc<dyn Provider>) {
        self.fallback = Some(provider);
    }

    /// Provider responsible for `resource_type`.
    pub fn get(&self, resource_type: &str) -> stackclaw_core::Result<Arc<dyn Provider>> {
        self.providers
            .get(type_package(resource_type))
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| Error::UnknownProvider(resource_type.to_string()))
    }
}
