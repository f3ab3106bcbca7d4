//! Export configuration
//!
//! ```ignore
//! use djexport_core::config::{default_config_path, load_config, ExportConfig};
//!
//! let config: ExportConfig = load_config(&default_config_path());
//! let settings = config.settings();
//! ```

mod io;
mod paths;

pub use io::{load_config, read_config, save_config, ConfigError};
pub use paths::{default_config_dir, default_config_path, CONFIG_FILE};

use crate::export::{ExportDestination, ExportSettings, TrackFailurePolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// User settings for exports, stored as YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Directory created under the destination for the database
    pub database_dir_name: String,
    /// Directory created under the destination for media files
    pub music_dir_name: String,
    /// Crate holding every exported track; `null` disables it
    pub root_crate_name: Option<String>,
    /// Write the database in a temp directory and copy it over on success
    pub stage_database: bool,
    pub copy_retries: usize,
    /// Seconds without analysis progress before the export moves on;
    /// `null` waits forever
    pub analysis_idle_timeout_secs: Option<u64>,
    pub cancel_poll_interval_ms: u64,
    pub track_failure_policy: TrackFailurePolicy,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            database_dir_name: "Engine Library".to_string(),
            music_dir_name: "djexport-music".to_string(),
            root_crate_name: Some("Exported".to_string()),
            stage_database: true,
            copy_retries: 3,
            analysis_idle_timeout_secs: Some(600),
            cancel_poll_interval_ms: 100,
            track_failure_policy: TrackFailurePolicy::Skip,
        }
    }
}

impl ExportConfig {
    /// Pipeline settings derived from this config
    pub fn settings(&self) -> ExportSettings {
        ExportSettings {
            root_crate_name: self.root_crate_name.clone().filter(|name| !name.trim().is_empty()),
            analysis_idle_timeout: self.analysis_idle_timeout_secs.map(Duration::from_secs),
            cancel_poll_interval: Duration::from_millis(self.cancel_poll_interval_ms.max(1)),
            track_failure_policy: self.track_failure_policy,
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Destination directories under `base`
    pub fn destination(&self, base: &Path) -> ExportDestination {
        ExportDestination::under(base, &self.database_dir_name, &self.music_dir_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: ExportConfig = serde_yaml::from_str("copy_retries: 7\ntrack_failure_policy: abort\n").unwrap();
        assert_eq!(config.copy_retries, 7);
        assert_eq!(config.track_failure_policy, TrackFailurePolicy::Abort);
        assert_eq!(config.database_dir_name, "Engine Library");
        assert_eq!(config.root_crate_name.as_deref(), Some("Exported"));
    }

    #[test]
    fn test_null_disables_optional_settings() {
        let config: ExportConfig =
            serde_yaml::from_str("root_crate_name: null\nanalysis_idle_timeout_secs: null\n").unwrap();
        let settings = config.settings();
        assert_eq!(settings.root_crate_name, None);
        assert_eq!(settings.analysis_idle_timeout, None);
    }

    #[test]
    fn test_settings_conversion() {
        let config = ExportConfig {
            root_crate_name: Some("  ".to_string()),
            cancel_poll_interval_ms: 0,
            ..Default::default()
        };
        let settings = config.settings();
        assert_eq!(settings.root_crate_name, None);
        assert_eq!(settings.cancel_poll_interval, Duration::from_millis(1));
        assert_eq!(settings.analysis_idle_timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_destination_uses_configured_names() {
        let config = ExportConfig::default();
        let dest = config.destination(Path::new("/media/usb"));
        assert_eq!(dest.database_dir, Path::new("/media/usb/Engine Library"));
        assert_eq!(dest.music_dir, Path::new("/media/usb/djexport-music"));
    }

    #[test]
    fn test_saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let config = ExportConfig {
            stage_database: false,
            ..Default::default()
        };
        save_config(&config, &path).unwrap();
        assert_eq!(load_config::<ExportConfig>(&path), config);
    }
}
