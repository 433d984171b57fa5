//! Repository and per-path configuration.
//!
//! Configuration lives in JSON at `${repo_root}/.thetaconfig` with a `repo`
//! section of numeric knobs and a `patterns` list pairing glob patterns with
//! checkpoint format names. Every `GIT_THETA_*` environment variable
//! overrides its key for the current process.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ThetaError};
use crate::utils::env;

/// File name of the configuration file at the repository root.
pub const CONFIG_FILE_NAME: &str = ".thetaconfig";

/// Repository-level knobs. Changing the LSH parameters after signatures have
/// been committed is a repository-wide breaking change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub parameter_atol: f64,
    pub parameter_rtol: f64,
    pub lsh_signature_size: usize,
    pub lsh_threshold: f64,
    pub lsh_pool_size: usize,
    pub max_concurrency: i64,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            parameter_atol: 1e-8,
            parameter_rtol: 1e-5,
            lsh_signature_size: 16,
            lsh_threshold: 1e-6,
            lsh_pool_size: 10_000,
            max_concurrency: -1,
        }
    }
}

impl RepoConfig {
    /// Apply `GIT_THETA_*` environment overrides on top of the file values.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = env::parsed(env::PARAMETER_ATOL)? {
            self.parameter_atol = v;
        }
        if let Some(v) = env::parsed(env::PARAMETER_RTOL)? {
            self.parameter_rtol = v;
        }
        if let Some(v) = env::parsed(env::LSH_SIGNATURE_SIZE)? {
            self.lsh_signature_size = v;
        }
        if let Some(v) = env::parsed(env::LSH_THRESHOLD)? {
            self.lsh_threshold = v;
        }
        if let Some(v) = env::parsed(env::LSH_POOL_SIZE)? {
            self.lsh_pool_size = v;
        }
        if let Some(v) = env::parsed(env::MAX_CONCURRENCY)? {
            self.max_concurrency = v;
        }
        Ok(self)
    }
}

/// Per-path configuration: which checkpoint format a glob pattern uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternConfig {
    pub pattern: String,
    pub checkpoint_format: String,
}

/// The parsed `.thetaconfig` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThetaConfig {
    #[serde(default)]
    pub repo: RepoConfig,
    #[serde(default)]
    pub patterns: Vec<PatternConfig>,
}

impl ThetaConfig {
    /// Read the configuration from a repository root. A missing file yields
    /// the defaults; a malformed file is a configuration error.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = Self::path(repo_root);
        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents).map_err(|e| {
                ThetaError::config(format!("malformed {}: {e}", path.display()))
            })?
        } else {
            Self::default()
        };
        config.repo = config.repo.with_env_overrides()?;
        Ok(config)
    }

    pub fn path(repo_root: &Path) -> PathBuf {
        repo_root.join(CONFIG_FILE_NAME)
    }

    /// Write the configuration back, pretty-printed with sorted keys.
    pub fn write(&self, repo_root: &Path) -> Result<()> {
        let rendered = serde_json::to_string_pretty(&serde_json::to_value(self)?)?;
        fs::write(Self::path(repo_root), rendered + "\n")?;
        Ok(())
    }

    /// Record the checkpoint format for a pattern, replacing any previous
    /// entry for the same pattern.
    pub fn set_pattern(&mut self, pattern: &str, checkpoint_format: &str) {
        self.patterns.retain(|p| p.pattern != pattern);
        self.patterns.push(PatternConfig {
            pattern: pattern.to_string(),
            checkpoint_format: checkpoint_format.to_string(),
        });
    }

    /// The checkpoint format configured for a path, if any pattern matches.
    /// Later entries win, mirroring how attribute files are read.
    pub fn checkpoint_format_for(&self, path: &str) -> Option<&str> {
        let mut found = None;
        for pc in &self.patterns {
            if let Ok(pattern) = glob::Pattern::new(&pc.pattern) {
                if pattern.matches(path) {
                    found = Some(pc.checkpoint_format.as_str());
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = RepoConfig::default();
        assert_eq!(c.parameter_atol, 1e-8);
        assert_eq!(c.parameter_rtol, 1e-5);
        assert_eq!(c.lsh_signature_size, 16);
        assert_eq!(c.lsh_threshold, 1e-6);
        assert_eq!(c.lsh_pool_size, 10_000);
        assert_eq!(c.max_concurrency, -1);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let parsed: ThetaConfig =
            serde_json::from_str(r#"{"repo": {"parameter_atol": 0.5}, "patterns": []}"#).unwrap();
        assert_eq!(parsed.repo.parameter_atol, 0.5);
        assert_eq!(parsed.repo.lsh_signature_size, 16);
    }

    #[test]
    fn pattern_lookup_last_match_wins() {
        let mut config = ThetaConfig::default();
        config.set_pattern("*.ckpt", "flat");
        config.set_pattern("models/*.ckpt", "json");
        assert_eq!(config.checkpoint_format_for("models/a.ckpt"), Some("json"));
        assert_eq!(config.checkpoint_format_for("a.ckpt"), Some("flat"));
        assert_eq!(config.checkpoint_format_for("a.bin"), None);
    }

    #[test]
    fn load_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ThetaConfig::default();
        config.repo.max_concurrency = 4;
        config.set_pattern("*.ckpt", "flat");
        config.write(dir.path()).unwrap();
        let loaded = ThetaConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.repo.max_concurrency, 4);
        assert_eq!(loaded.patterns, config.patterns);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), "{not json").unwrap();
        assert!(matches!(
            ThetaConfig::load(dir.path()),
            Err(ThetaError::Config(_))
        ));
    }
}
