use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Host-level configuration. Everything has a sensible default so embedders
/// that never touch a config file get a working host.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Name given to the deferred-call worker thread.
    #[serde(default = "HostConfig::default_worker_thread_name")]
    pub worker_thread_name: String,
    /// Directories searched when a script is created with a bare file name.
    #[serde(default)]
    pub script_dirs: Vec<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { worker_thread_name: Self::default_worker_thread_name(), script_dirs: Vec::new() }
    }
}

impl HostConfig {
    fn default_worker_thread_name() -> String {
        "script-defer".to_string()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading host config '{}'", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing host config '{}'", path.display()))
    }

    /// Resolves a script reference against the configured search directories.
    /// An existing or absolute path wins; otherwise the first search directory
    /// containing the file. Falls back to the path as given (the load step
    /// reports the failure).
    pub fn resolve_script_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() || path.exists() {
            return path.to_path_buf();
        }
        for dir in &self.script_dirs {
            let candidate = dir.join(path);
            if candidate.exists() {
                return candidate;
            }
        }
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = HostConfig::default();
        assert_eq!(config.worker_thread_name, "script-defer");
        assert!(config.script_dirs.is_empty());
    }
}
