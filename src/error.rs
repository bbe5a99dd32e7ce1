//! Error types for the daemon core.

use thiserror::Error;

/// A module failed to load. The load is atomic: nothing from the module is
/// registered when this is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Module {name} could not be loaded: {desc}")]
pub struct ModuleLoadError {
    pub name: String,
    pub desc: String,
}

impl ModuleLoadError {
    pub fn new(name: impl Into<String>, desc: impl Into<String>) -> Self {
        ModuleLoadError {
            name: name.into(),
            desc: desc.into(),
        }
    }
}

/// A configuration key failed validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid config key {key}: {reason}")]
pub struct ConfigValidationError {
    pub key: String,
    pub reason: String,
}

impl ConfigValidationError {
    pub fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigValidationError {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced while loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Validation(#[from] ConfigValidationError),
}
