//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "task-bridge.toml",
    "./config/config.toml",
    "/etc/task-bridge/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("TASKBRIDGE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(val) = env::var("TASKBRIDGE_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("TASKBRIDGE_HTTP_HOST") {
            config.http.host = val;
        }

        if let Ok(val) = env::var("TASKBRIDGE_QUEUE_TYPE") {
            config.queue.backend = val;
        }
        if let Ok(val) = env::var("TASKBRIDGE_QUEUE_NAME") {
            config.queue.name = val;
        }
        if let Ok(val) = env::var("TASKBRIDGE_SQS_QUEUE_URL") {
            config.queue.sqs.queue_url = val;
        }
        if let Ok(val) = env::var("TASKBRIDGE_SQS_REGION") {
            config.queue.sqs.region = val;
        }
        if let Ok(val) = env::var("TASKBRIDGE_SQS_ENDPOINT_URL") {
            config.queue.sqs.endpoint_url = val;
        }

        if let Ok(val) = env::var("TASKBRIDGE_STORE_TYPE") {
            config.store.backend = val;
        }
        if let Ok(val) = env::var("TASKBRIDGE_DYNAMODB_TABLE_NAME") {
            config.store.dynamodb.table_name = val;
        }
        if let Ok(val) = env::var("TASKBRIDGE_DYNAMODB_REGION") {
            config.store.dynamodb.region = val;
        }
        if let Ok(val) = env::var("TASKBRIDGE_DYNAMODB_ENDPOINT_URL") {
            config.store.dynamodb.endpoint_url = val;
        }

        if let Ok(val) = env::var("TASKBRIDGE_CONSUMER_QUEUE_WAIT_TIME_SECONDS") {
            if let Ok(v) = val.parse() {
                config.consumer.queue_wait_time_seconds = v;
            }
        }
        if let Ok(val) = env::var("TASKBRIDGE_CONSUMER_IN_PROGRESS_TTL_SECONDS") {
            if let Ok(v) = val.parse() {
                config.consumer.in_progress_ttl_seconds = v;
            }
        }
        if let Ok(val) = env::var("TASKBRIDGE_CONSUMER_HEARTBEAT_VISIBILITY_TIMEOUT_SECONDS") {
            if let Ok(v) = val.parse() {
                config.consumer.heartbeat_visibility_timeout_seconds = v;
            }
        }
        if let Ok(val) = env::var("TASKBRIDGE_CONSUMER_HEARTBEAT_INTERVAL_SECONDS") {
            if let Ok(v) = val.parse() {
                config.consumer.heartbeat_interval_seconds = v;
            }
        }
        if let Ok(val) = env::var("TASKBRIDGE_CONSUMER_NON_RETRYABLE_ERROR_KINDS") {
            config.consumer.non_retryable_error_kinds =
                val.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }

        if let Ok(val) = env::var("TASKBRIDGE_PRODUCER_MESSAGE_GROUP_ID_MODE") {
            config.producer.message_group_id_mode = val;
        }
        if let Ok(val) = env::var("TASKBRIDGE_PRODUCER_TIMEOUT_SECONDS") {
            if let Ok(v) = val.parse() {
                config.producer.timeout_seconds = v;
            }
        }
        if let Ok(val) = env::var("TASKBRIDGE_PRODUCER_POLL_TIME_SECONDS") {
            if let Ok(v) = val.parse() {
                config.producer.poll_time_seconds = v;
            }
        }

        if let Ok(val) = env::var("TASKBRIDGE_GUARD_ENABLED") {
            config.guard.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("TASKBRIDGE_GUARD_AGENT_URI") {
            config.guard.agent_uri = val;
        }
        if let Ok(val) = env::var("TASKBRIDGE_GUARD_EXPIRES_IN_MINUTES") {
            if let Ok(v) = val.parse() {
                config.guard.expires_in_minutes = v;
            }
        }

        if let Ok(val) = env::var("TASKBRIDGE_DATA_DIR") {
            config.data_dir = val;
        }
        if let Ok(val) = env::var("TASKBRIDGE_DEV_MODE") {
            config.dev_mode = val.parse().unwrap_or(false);
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
    use std::io::Write;

    #[test]
    fn loads_defaults_when_no_file_and_no_env_present() {
        let loader = ConfigLoader::with_path("/nonexistent/task-bridge.toml");
        let config = loader.load().unwrap();
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.queue.backend, "sqlite");
    }

    #[test]
    fn loads_and_parses_an_explicit_file_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[http]\nport = 9999\n").unwrap();

        let loader = ConfigLoader::with_path(file.path());
        let config = loader.load().unwrap();
        assert_eq!(config.http.port, 9999);
    }
}
