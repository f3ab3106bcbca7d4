//! Standard locations of djexport files

use std::path::PathBuf;

/// Name of the configuration file inside [`default_config_dir`]
pub const CONFIG_FILE: &str = "config.yaml";

/// Per-user configuration directory
///
/// Returns: `<config dir>/djexport`, e.g. `~/.config/djexport` on Linux
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("djexport")
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join(CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_is_inside_config_dir() {
        let path = default_config_path();
        assert!(path.ends_with("djexport/config.yaml"));
        assert!(path.starts_with(default_config_dir()));
    }
}
