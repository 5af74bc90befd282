//! stackclaw core - declaration types, deployment context, error handling

pub mod context;
pub mod error;
pub mod types;

pub use context::{ConfigValue, DeploymentContext, StackConfig};
pub use error::{Error, Result};
pub use types::*;
