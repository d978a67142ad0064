//! Task Bridge Configuration System
//!
//! TOML-based configuration with environment variable override support,
//! grounded in the teacher's `fc-config` crate: one `AppConfig` root,
//! `#[serde(default)]` sections so a partial TOML file is valid, and a
//! `ConfigLoader` that layers file -> env var on top of `Default::default()`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration (spec.md §6, SPEC_FULL.md §9.2): the
/// queue backend, the store backend, the Consumer's tunables, the
/// Producer's tunables, the Guard endpoint, and the HTTP probe server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub consumer: ConsumerSettings,
    pub producer: ProducerSettings,
    pub guard: GuardSettings,

    /// Data directory for the sqlite-backed dev queue/store files.
    pub data_dir: String,

    /// Enables the embedded sqlite queue/store and LocalStack-style
    /// defaults instead of the AWS-backed ones.
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            queue: QueueConfig::default(),
            store: StoreConfig::default(),
            consumer: ConsumerSettings::default(),
            producer: ProducerSettings::default(),
            guard: GuardSettings::default(),
            data_dir: "./data".to_string(),
            dev_mode: false,
        }
    }
}

/// HTTP probe server configuration (spec.md §6: `/ready`, `/health`, `/busy`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Message Queue backend selection and per-backend settings (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// `"sqlite"` (embedded dev queue) or `"sqs"`.
    #[serde(rename = "type")]
    pub backend: String,
    pub name: String,
    pub sqs: SqsConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            name: "task-bridge".to_string(),
            sqs: SqsConfig::default(),
        }
    }
}

/// AWS SQS queue configuration (spec.md §6: FIFO queue, per-receipt
/// visibility timeout).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqsConfig {
    pub queue_url: String,
    pub region: String,
    /// LocalStack/dev endpoint override; empty means use the default AWS
    /// endpoint resolver.
    pub endpoint_url: String,
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            queue_url: String::new(),
            region: "us-east-1".to_string(),
            endpoint_url: String::new(),
        }
    }
}

/// Status Store backend selection and per-backend settings (spec.md §4.1,
/// §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `"sqlite"` (embedded dev store) or `"dynamodb"`.
    #[serde(rename = "type")]
    pub backend: String,
    pub dynamodb: DynamoDbConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            dynamodb: DynamoDbConfig::default(),
        }
    }
}

/// DynamoDB table configuration (spec.md §6: primary key `message_id`, TTL
/// attribute `expiration`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamoDbConfig {
    pub table_name: String,
    pub region: String,
    pub endpoint_url: String,
}

impl Default for DynamoDbConfig {
    fn default() -> Self {
        Self {
            table_name: "task-bridge-results".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: String::new(),
        }
    }
}

/// Consumer tunables (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    pub queue_wait_time_seconds: u32,
    pub in_progress_ttl_seconds: i64,
    pub heartbeat_visibility_timeout_seconds: u32,
    pub heartbeat_interval_seconds: f64,
    /// `ComputeFailure::kind` values that classify as ERROR-terminal
    /// instead of left-for-redelivery.
    pub non_retryable_error_kinds: Vec<String>,
    pub stop_timeout_seconds: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            queue_wait_time_seconds: 1,
            in_progress_ttl_seconds: 600,
            heartbeat_visibility_timeout_seconds: 30,
            heartbeat_interval_seconds: 10.0,
            non_retryable_error_kinds: Vec::new(),
            stop_timeout_seconds: 10,
        }
    }
}

/// Producer tunables (spec.md §4.5, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    /// `global`, `request`, or `producer`.
    pub message_group_id_mode: String,
    pub timeout_seconds: f64,
    pub poll_time_seconds: f64,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            message_group_id_mode: "global".to_string(),
            timeout_seconds: 300.0,
            poll_time_seconds: 1.0,
        }
    }
}

/// Scale-In Guard configuration (spec.md §4.3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSettings {
    pub enabled: bool,
    pub agent_uri: String,
    pub expires_in_minutes: u32,
    pub raise_for_req_error: bool,
    pub raise_for_agent_error: bool,
    pub request_timeout_seconds: u64,
    pub retries: u32,
    pub backoff_factor: f64,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            agent_uri: String::new(),
            expires_in_minutes: 60,
            raise_for_req_error: true,
            raise_for_agent_error: true,
            request_timeout_seconds: 15,
            retries: 3,
            backoff_factor: 0.5,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override, searching the
    /// standard paths / `TASKBRIDGE_CONFIG` for a TOML file first.
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Generate an example TOML configuration.
    pub fn example_toml() -> String {
        r#"# Task Bridge Configuration
# Environment variables (TASKBRIDGE_*) override these settings.

[http]
port = 8080
host = "0.0.0.0"

[queue]
type = "sqlite"  # sqlite (embedded dev queue) or sqs
name = "task-bridge"

[queue.sqs]
queue_url = ""
region = "us-east-1"
endpoint_url = ""

[store]
type = "sqlite"  # sqlite (embedded dev store) or dynamodb

[store.dynamodb]
table_name = "task-bridge-results"
region = "us-east-1"
endpoint_url = ""

[consumer]
queue_wait_time_seconds = 1
in_progress_ttl_seconds = 600
heartbeat_visibility_timeout_seconds = 30
heartbeat_interval_seconds = 10.0
non_retryable_error_kinds = []
stop_timeout_seconds = 10

[producer]
message_group_id_mode = "global"  # global, request, or producer
timeout_seconds = 300.0
poll_time_seconds = 1.0

[guard]
enabled = true
agent_uri = ""
expires_in_minutes = 60
raise_for_req_error = true
raise_for_agent_error = true
request_timeout_seconds = 15
retries = 3
backoff_factor = 0.5

data_dir = "./data"
dev_mode = false
"#
        .to_string()
    }
}
