//! The Producer: submits a unit of work to the queue, writes the initial
//! SUBMITTED row, and either blocks polling the Store or returns the
//! message_id (spec.md §4.5).
//!
//! Grounded in the Python original's `producer/producer.py`: the same
//! `message_group_id` derivation per mode, the same `post`/
//! `post_non_blocking` split, and the same mapping of Store failures onto
//! a `Response` value rather than propagating. The send side reuses the
//! teacher's `QueuePublisher` trait (`fc-queue`), generalized.

pub mod error;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

pub use error::{ProducerError, Result};

use tb_common::{Message, ResultStatus, SerialisedMessage};
use tb_queue::QueuePublisher;
use tb_store::{StatusStore, StoreError};

/// `"global" | "request" | "producer"` (spec.md §4.5, §6, I8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupIdMode {
    /// All requests from every Producer share one message group: useful
    /// for a single-consumer-per-queue deployment that must process in
    /// strict submission order.
    Global,
    /// One group per request_id: parallelizes across consumers.
    Request,
    /// One group per Producer instance, stable for this process's
    /// lifetime but not across restarts (see spec.md §9 Open Questions).
    Producer,
}

impl GroupIdMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "global" => Ok(GroupIdMode::Global),
            "request" => Ok(GroupIdMode::Request),
            "producer" => Ok(GroupIdMode::Producer),
            other => Err(ProducerError::InvalidGroupIdMode(other.to_string())),
        }
    }
}

const GLOBAL_MESSAGE_GROUP_ID: &str = "default_message_group_id";

/// Tuning for one Producer instance (spec.md §4.5, §6).
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub message_group_id_mode: GroupIdMode,
    /// TTL for the SUBMITTED row and the deadline for `post`'s blocking poll.
    pub timeout_seconds: f64,
    pub poll_time_seconds: f64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            message_group_id_mode: GroupIdMode::Global,
            timeout_seconds: 300.0,
            poll_time_seconds: 1.0,
        }
    }
}

/// The outcome of `post`/`retrieve_result` (spec.md §4.5). A successful
/// response has `status=SUCCESS`, `status_code=200`, `error=None`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, ToSchema)]
pub struct Response {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub status: ResultStatus,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn success(message_id: String, request_id: Option<String>, result: Value) -> Self {
        Self {
            message_id,
            request_id,
            status: ResultStatus::Success,
            status_code: 200,
            result: Some(result),
            error: None,
        }
    }

    fn error(message_id: String, err: impl std::fmt::Display) -> Self {
        Self {
            message_id,
            request_id: None,
            status: ResultStatus::Error,
            status_code: 500,
            result: None,
            error: Some(err.to_string()),
        }
    }
}

/// Submits work through the queue and reads outcomes back from the Store
/// (spec.md §4.5). One instance per logical caller; `GroupIdMode::Producer`
/// derives its stable group id from this instance's identity.
pub struct Producer {
    queue: Arc<dyn QueuePublisher>,
    store: Arc<dyn StatusStore>,
    config: ProducerConfig,
    instance_group_id: String,
}

impl Producer {
    pub fn new(queue: Arc<dyn QueuePublisher>, store: Arc<dyn StatusStore>, config: ProducerConfig) -> Self {
        Self {
            queue,
            store,
            config,
            instance_group_id: Uuid::new_v4().to_string(),
        }
    }

    fn message_group_id(&self, request_id: &str) -> String {
        match self.config.message_group_id_mode {
            GroupIdMode::Global => GLOBAL_MESSAGE_GROUP_ID.to_string(),
            GroupIdMode::Request => request_id.to_string(),
            GroupIdMode::Producer => self.instance_group_id.clone(),
        }
    }

    /// Submit a message but do not block (spec.md §4.5 step 1-5).
    pub async fn post_non_blocking(&self, mut body: Value, request_id: Option<String>) -> Result<String> {
        let request_id = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        match body.as_object_mut() {
            Some(map) => {
                map.insert("request_id".to_string(), Value::String(request_id.clone()));
            }
            None => {
                let kind = match &body {
                    Value::Null => "null",
                    Value::Bool(_) => "a bool",
                    Value::Number(_) => "a number",
                    Value::String(_) => "a string",
                    Value::Array(_) => "an array",
                    Value::Object(_) => unreachable!(),
                };
                return Err(ProducerError::NotAJsonObject(kind.to_string()));
            }
        }

        let message_group_id = self.message_group_id(&request_id);
        let message = Message {
            body: body.clone(),
            message_group_id: message_group_id.clone(),
        };

        let message_id = self.queue.publish(message).await?;

        let ttl_seconds = self.config.timeout_seconds.ceil() as i64;
        let serialised_message = SerialisedMessage {
            message_id: message_id.clone(),
            message_group_id,
            receipt_handle: None,
            body,
        };
        self.store
            .put_status(
                ResultStatus::Submitted,
                &message_id,
                Some(ttl_seconds),
                Some(request_id.clone()),
                None,
                Some(serialised_message),
            )
            .await?;

        info!(message_id = %message_id, request_id = %request_id, "submitted message");
        Ok(message_id)
    }

    /// Submit and block until the result is ready or the Producer's
    /// `timeout_seconds` elapses (spec.md §4.5).
    pub async fn post(&self, body: Value, request_id: Option<String>) -> Response {
        let message_id = match self.post_non_blocking(body, request_id).await {
            Ok(id) => id,
            Err(e) => return Response::error(String::new(), e),
        };

        match self
            .store
            .poll_result(
                &message_id,
                self.config.timeout_seconds,
                self.config.poll_time_seconds,
                true,
            )
            .await
        {
            Ok((result, request_id)) => Response::success(message_id, request_id, result),
            Err(e) => Response::error(message_id, e),
        }
    }

    /// Check the status of the result for this message_id.
    pub async fn retrieve_result_status(&self, message_id: &str) -> std::result::Result<ResultStatus, StoreError> {
        self.store.get_status(message_id).await
    }

    /// One-shot fetch of the result for this message_id (spec.md §4.5:
    /// `ResultMissing`/`ResultErrorStatus` map to a 500 `Response`).
    pub async fn retrieve_result(&self, message_id: &str) -> Response {
        match self.store.get_result(message_id, true).await {
            Ok((result, request_id)) => Response::success(message_id.to_string(), request_id, result),
            Err(e) => Response::error(message_id.to_string(), e),
        }
    }
}
