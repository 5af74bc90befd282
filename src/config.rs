//! stackclaw configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup and
//! falls back to defaults if no config file exists. Command line flags
//! override individual values.

use serde::{Deserialize, Serialize};
use stackclaw_engine::ApplyOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const CONFIG_FILE: &str = "stackclaw.toml";
pub const DEFAULT_LOG_FILTER: &str = "stackclaw=info";
/// Working directory kept next to a stack file.
pub const WORK_DIR: &str = ".stackclaw";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StackclawConfig {
    pub engine: EngineConfig,
    pub state: StateConfig,
    pub provider: ProviderConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Max provider operations in flight.
    pub parallelism: usize,
    /// Per-operation timeout.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// State file. Default: `.stackclaw/<stack>.state.json` next to the
    /// stack file.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Root directory for the local provider. Default:
    /// `.stackclaw/resources` next to the stack file.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, used when `RUST_LOG` is not set.
    pub filter: String,
    /// Emit JSON lines instead of human-readable logs.
    pub json: bool,
    /// Also write logs to this file.
    pub file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: stackclaw_engine::executor::DEFAULT_PARALLELISM,
            timeout_secs: stackclaw_engine::executor::DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.into(),
            json: false,
            file: None,
        }
    }
}

impl StackclawConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::debug!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Load a config file the user asked for by name. Unlike `load`, a
    /// missing or invalid file is an error.
    pub fn load_required(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
        toml::from_str(&content).map_err(|e| anyhow::anyhow!("invalid {}: {}", path.display(), e))
    }

    /// `./stackclaw.toml`, else the per-user config directory.
    pub fn default_path() -> PathBuf {
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return local;
        }
        dirs::config_dir()
            .map(|d| d.join("stackclaw").join(CONFIG_FILE))
            .unwrap_or(local)
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            parallelism: self.engine.parallelism.max(1),
            timeout: Duration::from_secs(self.engine.timeout_secs.max(1)),
        }
    }

    pub fn state_path(&self, stack_dir: &Path, stack: &str) -> PathBuf {
        self.state
            .path
            .clone()
            .unwrap_or_else(|| stack_dir.join(WORK_DIR).join(format!("{}.state.json", stack)))
    }

    pub fn provider_root(&self, stack_dir: &Path) -> PathBuf {
        self.provider
            .root
            .clone()
            .unwrap_or_else(|| stack_dir.join(WORK_DIR).join("resources"))
    }
}

/// Install the global subscriber. The returned guard flushes the file
/// writer and must live until exit.
pub fn init_tracing(log: &LogConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| log.filter.as_str().into());

    let (file_layer, guard) = match &log.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "stackclaw.log".into());
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if log.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    guard
}
