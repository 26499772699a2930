use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use relay_types::config::RelayConfig;

/// Returns the Relay home directory (~/.relay/)
pub fn relay_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".relay")
}

/// Returns the path to the config file (~/.relay/config.toml)
pub fn config_path() -> PathBuf {
    relay_home().join("config.toml")
}

/// Where the agent CLI writes its own log files unless configured otherwise.
pub fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local")
        .join("share")
        .join("opencode")
        .join("log")
}

/// The log directory to watch for this config.
pub fn log_dir(config: &RelayConfig) -> PathBuf {
    config
        .log_watch
        .log_dir
        .clone()
        .unwrap_or_else(default_log_dir)
}

/// Load config from disk, creating default if it doesn't exist.
pub fn load_config() -> Result<RelayConfig> {
    load_config_from(&config_path())
}

/// Load config from `path`, writing the default config there first if the
/// file is missing.
pub fn load_config_from(path: &Path) -> Result<RelayConfig> {
    if !path.exists() {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let default = RelayConfig::default();
        save_config_to(&default, path)?;
        return Ok(default);
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: RelayConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config at {}", path.display()))?;
    Ok(config)
}

/// Save config to disk, overwriting the existing file.
pub fn save_config(config: &RelayConfig) -> Result<()> {
    save_config_to(config, &config_path())
}

fn save_config_to(config: &RelayConfig, path: &Path) -> Result<()> {
    let toml_str = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, toml_str)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_home_is_dot_relay() {
        let home = relay_home();
        assert!(home.to_string_lossy().contains(".relay"));
    }

    #[test]
    fn default_config_roundtrips() {
        let config = RelayConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: RelayConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.stream.max_buffer_bytes, 10 * 1024 * 1024);
        assert_eq!(parsed.log_watch.poll_interval_ms, 500);
        assert_eq!(parsed.interactions.permission_timeout_ms, 300_000);
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = load_config_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[log_watch]\nlog_dir = \"/var/log/agent\"\npoll_interval_ms = 250\n",
        )
        .unwrap();
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.log_watch.poll_interval_ms, 250);
        assert_eq!(log_dir(&config), PathBuf::from("/var/log/agent"));
        assert_eq!(config.stream.max_buffer_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn unset_log_dir_falls_back_to_agent_default() {
        let config = RelayConfig::default();
        assert_eq!(log_dir(&config), default_log_dir());
        assert!(default_log_dir().ends_with("opencode/log"));
    }
}
