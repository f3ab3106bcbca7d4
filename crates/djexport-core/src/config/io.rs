//! YAML configuration loading and saving
//!
//! Works with any serde configuration type. Missing or broken files fall
//! back to defaults in [`load_config`]; [`read_config`] reports them.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Errors from [`read_config`]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Read a configuration file, `Ok(None)` if it does not exist
pub fn read_config<T>(path: &Path) -> Result<Option<T>, ConfigError>
where
    T: DeserializeOwned,
{
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Load configuration from a YAML file
///
/// A missing file yields the defaults. So does an unreadable or invalid
/// one, after a warning.
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    log::info!("[config] Loading from {:?}", path);

    match read_config(path) {
        Ok(Some(config)) => config,
        Ok(None) => {
            log::info!("[config] No config file, using defaults");
            T::default()
        }
        Err(e) => {
            log::warn!("[config] {}, using defaults", e);
            T::default()
        }
    }
}

/// Save configuration to a YAML file, creating parent directories
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;
    std::fs::write(path, yaml).with_context(|| format!("Failed to write config file: {:?}", path))?;

    log::info!("[config] Saved {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        retries: u32,
        label: String,
    }

    #[test]
    fn test_missing_file_is_none_and_default() {
        let path = Path::new("/nonexistent/djexport/config.yaml");
        assert!(read_config::<Sample>(path).unwrap().is_none());
        assert_eq!(load_config::<Sample>(path), Sample::default());
    }

    #[test]
    fn test_invalid_file_is_reported_by_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "retries: [not a number").unwrap();

        assert!(matches!(read_config::<Sample>(&path), Err(ConfigError::Parse { .. })));
        assert_eq!(load_config::<Sample>(&path), Sample::default());
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let config = Sample {
            retries: 5,
            label: "usb".into(),
        };

        save_config(&config, &path).unwrap();
        assert_eq!(load_config::<Sample>(&path), config);
    }
}
