//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. System config: `/etc/egress-warden/config.toml`
//! 2. User config: `~/.config/egress-warden/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. CLI flags (highest priority)
//!
//! Lists are **merged** (appended). Scalars are **overridden**.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::Config;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/egress-warden/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "egress-warden";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Load and merge configuration from all sources.
    ///
    /// Missing system and user files are skipped. A missing `extra` file is
    /// an error, since the user named it. Invalid TOML anywhere fails fast.
    pub fn load(&self, extra: Option<&Path>, overrides: Config) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        for path in [&self.system_path, &self.user_path] {
            match self.load_file(path)? {
                Some(file_config) => {
                    config.merge(file_config);
                    debug!("Loaded config from {:?}", path);
                }
                None => debug!("No config found at {:?}", path),
            }
        }

        if let Some(extra_path) = extra {
            match self.load_file(extra_path)? {
                Some(extra_config) => {
                    config.merge(extra_config);
                    debug!("Loaded additional config from {:?}", extra_path);
                }
                None => {
                    return Err(ConfigError::ReadError {
                        path: extra_path.to_path_buf(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        config.merge(overrides);
        Ok(config)
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use tempfile::tempdir;

    #[test]
    fn test_missing_files_use_defaults() {
        let dir = tempdir().unwrap();
        let loader = ConfigLoader::with_paths(
            dir.path().join("nonexistent_system.toml"),
            dir.path().join("nonexistent_user.toml"),
        );

        let config = loader.load(None, Config::default()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_user_config_overrides_system() {
        let dir = tempdir().unwrap();

        fs::write(
            dir.path().join("system.toml"),
            "[session]\nhealth_retries = 60\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("user.toml"),
            "[session]\nhealth_retries = 90\n",
        )
        .unwrap();

        let loader = ConfigLoader::with_paths(
            dir.path().join("system.toml"),
            dir.path().join("user.toml"),
        );
        let config = loader.load(None, Config::default()).unwrap();

        assert_eq!(config.session.health_retries, Some(90));
    }

    #[test]
    fn test_lists_are_merged() {
        let dir = tempdir().unwrap();

        fs::write(
            dir.path().join("system.toml"),
            "[network]\nallow = [\"pypi.org\"]\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("user.toml"),
            "[network]\nallow = [\"custom.example.com\"]\n",
        )
        .unwrap();

        let loader = ConfigLoader::with_paths(
            dir.path().join("system.toml"),
            dir.path().join("user.toml"),
        );
        let config = loader.load(None, Config::default()).unwrap();

        assert_eq!(config.network.allow, vec!["pypi.org", "custom.example.com"]);
    }

    #[test]
    fn test_cli_overrides_are_applied_last() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("user.toml"),
            "[network]\nblock = [\"evil.example.com\"]\n",
        )
        .unwrap();

        let loader = ConfigLoader::with_paths(
            dir.path().join("system.toml"),
            dir.path().join("user.toml"),
        );
        let overrides = Config {
            network: NetworkConfig {
                allow: vec!["cli-domain.example.com".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let config = loader.load(None, overrides).unwrap();

        assert_eq!(config.network.allow, vec!["cli-domain.example.com"]);
        assert_eq!(config.network.block, vec!["evil.example.com"]);
    }

    #[test]
    fn test_extra_config_is_merged() {
        let dir = tempdir().unwrap();
        let extra = dir.path().join("project.toml");
        fs::write(&extra, "[session]\nexec_image = \"node:22\"\n").unwrap();

        let loader = ConfigLoader::with_paths(
            dir.path().join("system.toml"),
            dir.path().join("user.toml"),
        );
        let config = loader.load(Some(&extra), Config::default()).unwrap();

        assert_eq!(config.session.exec_image.as_deref(), Some("node:22"));
    }

    #[test]
    fn test_missing_extra_config_is_error() {
        let dir = tempdir().unwrap();
        let loader = ConfigLoader::with_paths(
            dir.path().join("system.toml"),
            dir.path().join("user.toml"),
        );

        let err = loader
            .load(Some(&dir.path().join("missing.toml")), Config::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("invalid.toml"), "this is not valid TOML [[[").unwrap();

        let loader = ConfigLoader::with_paths(
            dir.path().join("invalid.toml"),
            dir.path().join("user.toml"),
        );
        let err = loader.load(None, Config::default()).unwrap_err();

        assert!(matches!(err, ConfigError::ParseError { .. }));
    }
}
