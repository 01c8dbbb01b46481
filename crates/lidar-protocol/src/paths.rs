use std::path::PathBuf;

/// Returns the config directory for the lidar bridge.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("lidar")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("lidar")
    } else {
        PathBuf::from("/tmp/lidar")
    }
}

/// Returns the default config file path for the web server.
pub fn config_file_path() -> PathBuf {
    dirs_path().join("config.toml")
}
