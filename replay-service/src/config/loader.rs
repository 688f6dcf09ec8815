// Configuration Loader
// Reads a .travis.yml style file into a RawConfig

use crate::config::models::RawConfig;

use serde_yaml::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = ".travis.yml";

/// Errors that can occur while loading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Expected a mapping at the top of {0}")]
    NotAMapping(PathBuf),
}

/// Loader for build configuration files
pub struct ConfigLoader;

impl ConfigLoader {
    /// Parse configuration from a YAML string
    ///
    /// An empty document is an empty configuration.
    pub fn parse(content: &str, origin: &Path) -> Result<RawConfig, ConfigError> {
        let value: Value = serde_yaml::from_str(content).map_err(|source| ConfigError::Yaml {
            path: origin.to_path_buf(),
            source,
        })?;

        match value {
            Value::Null => Ok(RawConfig::new()),
            Value::Mapping(map) => Ok(RawConfig::from_mapping(map)),
            _ => Err(ConfigError::NotAMapping(origin.to_path_buf())),
        }
    }

    /// Load configuration from a file; a missing file is an empty configuration
    pub fn load(path: impl AsRef<Path>) -> Result<RawConfig, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(RawConfig::new());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::load(dir.path().join(DEFAULT_CONFIG_FILE)).unwrap();
        assert!(config.is_empty());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, "rvm:\n  - 2.0.0\n  - 1.9.3\nscript: rake foo\n").unwrap();

        let config = ConfigLoader::load(&path).unwrap();
        assert_eq!(
            config.get("rvm"),
            Some(&Value::from(vec!["2.0.0", "1.9.3"]))
        );
        assert_eq!(config.get("script"), Some(&Value::from("rake foo")));
    }

    #[test]
    fn test_empty_document() {
        let config = ConfigLoader::parse("", Path::new("x.yml")).unwrap();
        assert!(config.is_empty());
    }

    #[test]
    fn test_not_a_mapping() {
        let err = ConfigLoader::parse("- a\n- b\n", Path::new("x.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotAMapping(_)));
    }

    #[test]
    fn test_invalid_yaml() {
        let err = ConfigLoader::parse("rvm: [a, b", Path::new("x.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::Yaml { .. }));
        assert!(err.to_string().contains("x.yml"));
    }
}
