// Backend routing.
//
// Every model has its own backend. Its base URL is looked up by key in whatever
// configuration source the caller hands us, usually the environment.

use std::collections::HashMap;

use crate::{error::DispatchError, profiles::ModelProfile};

/// Key/value configuration lookup.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// The model's base URL, with trailing slashes removed.
pub fn resolve_base_url(source: &dyn ConfigSource, profile: &ModelProfile) -> Result<String, DispatchError> {
    let key = profile.base_url_env_var.as_str();
    let value = source.get(key).ok_or_else(|| {
        DispatchError::Configuration(format!("{} is not set (backend for {})", key, profile.model_id))
    })?;
    let url = value.trim().trim_end_matches('/');
    if url.is_empty() {
        return Err(DispatchError::Configuration(format!(
            "{} is empty (backend for {})",
            key, profile.model_id
        )));
    }
    Ok(url.to_owned())
}

pub fn submit_url(base_url: &str, submit_path: &str) -> String {
    format!("{}/{}", base_url, submit_path.trim_start_matches('/'))
}
