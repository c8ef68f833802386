//! Default path resolution for the station configuration file

use std::path::PathBuf;

/// Environment variable overriding the default configuration path
pub const CONFIG_ENV_VAR: &str = "EOL_STATION_CONFIG";

/// Returns the default path for the station configuration file.
///
/// Uses XDG config directory if available:
/// - Linux/macOS: `~/.config/eol/station.toml`
/// - Fallback: `/etc/eol/station.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("eol")
        .join("station.toml")
}
