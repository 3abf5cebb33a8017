// This module handles the optional config.toml.
// It only carries backend URLs and the submit path. Environment variables with the
// same names win over the file, so a deployment can override one backend without
// touching the rest.

use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    dispatcher::DEFAULT_SUBMIT_PATH,
    router::{ConfigSource, EnvSource},
};

fn default_submit_path() -> String {
    DEFAULT_SUBMIT_PATH.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchConfig {
    #[serde(default = "default_submit_path")]
    pub submit_path: String,
    /// Base URL per key, e.g. SDXL_BASE_URL.
    #[serde(default)]
    pub backends: HashMap<String, String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            submit_path: default_submit_path(),
            backends: HashMap::new(),
        }
    }
}

impl DispatchConfig {
    pub fn source(&self) -> LayeredSource {
        LayeredSource {
            file: self.backends.clone(),
        }
    }
}

/// Environment first, then the config file.
#[derive(Debug, Clone, Default)]
pub struct LayeredSource {
    file: HashMap<String, String>,
}

impl ConfigSource for LayeredSource {
    fn get(&self, key: &str) -> Option<String> {
        EnvSource
            .get(key)
            .or_else(|| self.file.get(key).cloned())
    }
}

pub fn read_config(path: &Path) -> Result<DispatchConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Error reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Error parsing {}", path.display()))
}

#[cfg(test)]
fn testconfig() -> DispatchConfig {
    toml::from_str(include_str!("../testdata/config.toml")).unwrap()
}
