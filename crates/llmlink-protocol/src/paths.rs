use std::path::PathBuf;

const APP_DIR: &str = "llmlink";

/// Returns the per-platform configuration directory for llmlink.
///
/// `$LLMLINK_CONFIG_DIR` wins everywhere. Otherwise:
/// Windows `%LOCALAPPDATA%\llmlink`, macOS `~/Library/Application Support/llmlink`,
/// other Unix `$XDG_CONFIG_HOME/llmlink` or `~/.config/llmlink`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LLMLINK_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    platform_config_dir()
}

#[cfg(windows)]
fn platform_config_dir() -> PathBuf {
    if let Ok(local) = std::env::var("LOCALAPPDATA") {
        return PathBuf::from(local).join(APP_DIR);
    }
    std::env::temp_dir().join(APP_DIR)
}

#[cfg(target_os = "macos")]
fn platform_config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join("Library")
            .join("Application Support")
            .join(APP_DIR);
    }
    std::env::temp_dir().join(APP_DIR)
}

#[cfg(all(not(windows), not(target_os = "macos")))]
fn platform_config_dir() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join(APP_DIR)
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join(APP_DIR)
    } else {
        std::env::temp_dir().join(APP_DIR)
    }
}

/// Returns the broker configuration document path.
pub fn config_path() -> PathBuf {
    config_dir().join("broker.json")
}

/// Returns the discovery file path for a listener role (`<role>_port`).
pub fn port_file_path(role: &str) -> PathBuf {
    config_dir().join(format!("{role}_port"))
}
