use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub interactions: InteractionConfig,
    #[serde(default)]
    pub log_watch: LogWatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Hard cap on buffered, not-yet-framed stdout text.
    pub max_buffer_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionConfig {
    pub permission_timeout_ms: u64,
    pub question_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogWatchConfig {
    /// Directory holding the agent's `*.log` files. Unset means the
    /// agent's default location.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            permission_timeout_ms: 5 * 60 * 1000,
            question_timeout_ms: 5 * 60 * 1000,
        }
    }
}

impl Default for LogWatchConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            poll_interval_ms: 500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
