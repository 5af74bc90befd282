//! Deployment context threaded through build, resolve, plan and apply.

use crate::error::{Error, Result};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// A single stack config entry.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigValue {
    pub value: JsonValue,
    pub secret: bool,
}

/// Key/value config for one stack (`config:` section of a stack file plus
/// command line overrides).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StackConfig {
    values: BTreeMap<String, ConfigValue>,
}

impl StackConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        self.values.insert(
            key.into(),
            ConfigValue {
                value: value.into(),
                secret: false,
            },
        );
    }

    pub fn set_secret(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        self.values.insert(
            key.into(),
            ConfigValue {
                value: value.into(),
                secret: true,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    /// Like `get`, but a missing key is an error.
    pub fn require(&self, key: &str) -> Result<&ConfigValue> {
        self.values
            .get(key)
            .ok_or_else(|| Error::MissingConfig(key.to_string()))
    }

    /// Apply overrides on top of this config. An override keeps the secret
    /// flag of the entry it replaces.
    pub fn merge(&mut self, overrides: StackConfig) {
        for (key, mut entry) in overrides.values {
            if let Some(existing) = self.values.get(&key) {
                entry.secret |= existing.secret;
            }
            self.values.insert(key, entry);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The current deployment: which stack, which run, its config, and the
/// cancellation signal shared by every task of the run.
#[derive(Clone, Debug)]
pub struct DeploymentContext {
    pub stack: String,
    pub run_id: String,
    pub config: StackConfig,
    cancel: CancellationToken,
}

impl DeploymentContext {
    pub fn new(stack: impl Into<String>, config: StackConfig) -> Self {
        let stack = stack.into();
        let run_id = format!(
            "{}-{}",
            stack,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            stack,
            run_id,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop admitting new work. Operations already in flight finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
