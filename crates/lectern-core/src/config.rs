//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/lectern/config.toml)
//! 3. Environment variables (LECTERN_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

use crate::store::Backend;

/// Environment variable prefix
const ENV_PREFIX: &str = "LECTERN";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (SQLite db, sled tree)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Which storage engine to open
    #[serde(default)]
    pub backend: Backend,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backend: Backend::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (LECTERN_DATA_DIR, LECTERN_BACKEND)
    /// 2. Config file (~/.config/lectern/config.toml or LECTERN_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // LECTERN_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // LECTERN_BACKEND
        if let Ok(val) = std::env::var(format!("{}_BACKEND", ENV_PREFIX)) {
            match val.parse::<Backend>() {
                Ok(backend) => self.backend = backend,
                Err(err) => warn!("ignoring {}_BACKEND: {}", ENV_PREFIX, err),
            }
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with LECTERN_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lectern")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("lectern.db")
    }

    /// Get the path to the sled tree
    pub fn kv_path(&self) -> PathBuf {
        self.data_dir.join("kv")
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lectern")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap();
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            // Clear all the vars
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &["LECTERN_DATA_DIR", "LECTERN_BACKEND", "LECTERN_CONFIG"];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend, Backend::Sqlite);
        assert!(config.data_dir.ends_with("lectern"));
    }

    #[test]
    fn test_file_paths() {
        let config = Config::default();
        assert!(config.sqlite_path().ends_with("lectern.db"));
        assert!(config.kv_path().ends_with("kv"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("LECTERN_DATA_DIR", "/tmp/lectern-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/lectern-test"));
    }

    #[test]
    fn test_env_override_backend() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        assert_eq!(config.backend, Backend::Sqlite);

        env::set_var("LECTERN_BACKEND", "memory");
        config.apply_env_overrides();
        assert_eq!(config.backend, Backend::Memory);

        // Parsing is case-insensitive
        env::set_var("LECTERN_BACKEND", "KV");
        config.apply_env_overrides();
        assert_eq!(config.backend, Backend::Kv);

        // An unknown value is ignored, keeping the previous selection
        env::set_var("LECTERN_BACKEND", "postgres");
        config.apply_env_overrides();
        assert_eq!(config.backend, Backend::Kv);
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/lectern"),
            backend: Backend::Kv,
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("backend"));
        assert!(toml_str.contains("kv"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.backend, config.backend);
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp = TempDir::new().unwrap();

        // Redirect the config file into the sandbox
        let config_path = temp.path().join("conf").join("config.toml");
        env::set_var("LECTERN_CONFIG", &config_path);

        let config = Config {
            data_dir: temp.path().join("data"),
            backend: Backend::Kv,
        };
        config.save().unwrap();
        // Parent directories are created as needed
        assert!(config_path.exists());

        let loaded = Config::load().unwrap();
        assert_eq!(loaded.data_dir, config.data_dir);
        assert_eq!(loaded.backend, Backend::Kv);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            backend = "memory"
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.backend, Backend::Memory);
    }

    #[test]
    fn test_load_from_path() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp = TempDir::new().unwrap();

        let data_dir = temp.path().join("data");
        let config_path = temp.path().join("config.toml");
        std::fs::write(
            &config_path,
            format!("data_dir = {:?}\nbackend = \"kv\"\n", data_dir),
        )
        .unwrap();

        let config = Config::load_from_path(&config_path).unwrap();
        assert_eq!(config.backend, Backend::Kv);
        assert_eq!(config.data_dir, data_dir);
        // Loading created the data directory
        assert!(data_dir.exists());
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp = TempDir::new().unwrap();

        // Point the data dir somewhere disposable before defaults kick in
        env::set_var("LECTERN_DATA_DIR", temp.path().join("data"));

        let path = temp.path().join("nonexistent.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.backend, Backend::Sqlite);
        assert!(config.data_dir.exists());
    }

    #[test]
    fn test_load_rejects_malformed_toml() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp = TempDir::new().unwrap();

        let config_path = temp.path().join("config.toml");
        std::fs::write(&config_path, "backend = [not toml").unwrap();

        assert!(Config::load_from_path(&config_path).is_err());
    }
}
