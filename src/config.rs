//! Shell configuration.
//!
//! The dependency map and the load priorities are static configuration read once
//! at shell startup. Modules are kept as an ordered list so that the declared
//! order survives deserialization; [`DependencyGraph`](crate::graph::DependencyGraph)
//! relies on it for its top-level traversal order.
//!
//! ```json
//! {
//!   "wait_timeout": 30000,
//!   "dependency_timeout": 30000,
//!   "modules": [
//!     { "name": "dashboard", "priority": "high" },
//!     { "name": "contacts", "dependencies": ["dashboard"] }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShellConfig {
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,

    /// Upper bound for callback-style readiness waits.
    #[serde(default = "default_wait_timeout", with = "duration_ms")]
    pub wait_timeout: Duration,

    /// Upper bound for a module waiting on its dependencies before loading.
    #[serde(default = "default_dependency_timeout", with = "duration_ms")]
    pub dependency_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleConfig {
    pub name: String,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub priority: LoadPriority,
}

impl ModuleConfig {
    pub fn new(name: &str, dependencies: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            priority: LoadPriority::default(),
        }
    }

    pub fn with_priority(mut self, priority: LoadPriority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LoadPriority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl LoadPriority {
    /// Modules at this priority are preloaded at shell startup.
    pub fn is_preloaded(&self) -> bool {
        matches!(self, LoadPriority::Critical | LoadPriority::High)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to open config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn default_wait_timeout() -> Duration {
    Duration::from_millis(30_000)
}

fn default_dependency_timeout() -> Duration {
    Duration::from_millis(30_000)
}

// Duration型のシリアライズ/デシリアライズヘルパー
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> ConfigResult<T> {
    let config = serde_json::from_str(s)?;
    Ok(config)
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            modules: Vec::new(),
            wait_timeout: default_wait_timeout(),
            dependency_timeout: default_dependency_timeout(),
        }
    }
}

impl ShellConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        from_file(path)
    }

    pub fn with_module(mut self, module: ModuleConfig) -> Self {
        self.modules.push(module);
        self
    }

    pub fn module(&self, name: &str) -> Option<&ModuleConfig> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// The module set the host shell ships with.
    pub fn builtin() -> Self {
        use LoadPriority::*;
        let modules = [
            ("dashboard", &[][..], High),
            ("contacts", &["dashboard"][..], Medium),
            ("companies", &["contacts"][..], Medium),
            ("messages", &["contacts"][..], Medium),
            ("workflows", &["messages"][..], Medium),
            ("monitoring", &["dashboard"][..], High),
            ("reports", &["dashboard", "monitoring"][..], Low),
            ("configuration", &[][..], Low),
            ("admin", &["configuration"][..], Low),
            ("profile", &[][..], Medium),
        ];
        modules
            .into_iter()
            .fold(Self::default(), |config, (name, deps, priority)| {
                config.with_module(ModuleConfig::new(name, deps).with_priority(priority))
            })
    }
}
