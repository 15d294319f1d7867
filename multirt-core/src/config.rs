//! Pool configuration.
//!
//! Defaults work out of the box for the reference engine; hosts usually load
//! a JSON file with [`PoolConfig::from_file`] and let `MULTIRT_INSTANCES`
//! override the instance count.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable overriding [`PoolConfig::instance_count`].
pub const INSTANCES_ENV: &str = "MULTIRT_INSTANCES";

/// Names used to reach the model loader inside an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Module imported inside the instance.
    pub module: String,
    /// Attribute of `module` called with the model path.
    pub entry: String,
    /// Attribute of the loaded model invoked by `forward`.
    pub forward: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            module: "loader".to_string(),
            entry: "load".to_string(),
            forward: "forward".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of engine replicas to create.
    pub instance_count: usize,
    /// Script every engine runs right after creation.
    pub bootstrap: String,
    /// Appended to the bootstrap as `path <dir>` lines.
    pub search_paths: Vec<PathBuf>,
    pub loader: LoaderConfig,
    /// Modules every instance imports after bootstrap.
    pub preload_modules: Vec<String>,
    /// Import the registry's singleton module into every instance at startup.
    pub attach_singleton: bool,
    /// Create instances concurrently on scoped threads.
    pub parallel_startup: bool,
    /// Shared libraries mapped with global symbol visibility before startup.
    pub preload_libraries: Vec<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            instance_count: 2,
            bootstrap: String::new(),
            search_paths: vec![PathBuf::from(".")],
            loader: LoaderConfig::default(),
            preload_modules: Vec::new(),
            attach_singleton: true,
            parallel_startup: true,
            preload_libraries: Vec::new(),
        }
    }
}

impl PoolConfig {
    pub fn with_instances(instance_count: usize) -> Self {
        Self {
            instance_count,
            ..Self::default()
        }
    }

    /// Read a JSON configuration file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        debug!(?path, instances = config.instance_count, "Loaded pool configuration");
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var(INSTANCES_ENV) {
            self.instance_count = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a positive integer, got '{}'", INSTANCES_ENV, value))?;
        }
        Ok(())
    }

    /// The full bootstrap text handed to each engine.
    pub fn bootstrap_script(&self) -> String {
        let mut script = self.bootstrap.clone();
        if !script.is_empty() && !script.ends_with('\n') {
            script.push('\n');
        }
        for dir in &self.search_paths {
            script.push_str(&format!("path {}\n", dir.display()));
        }
        script
    }
}
