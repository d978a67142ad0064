//! The Status Store: a keyed record store that doubles as the
//! result-delivery channel between Producer and Consumer (spec.md §4.1).
//!
//! `StatusStore` is the trait; `dynamodb` and `sqlite` are the two
//! concrete backends, mirroring the split the teacher's `tb-queue` crate
//! already makes between an AWS-backed and a local/dev backend.

pub mod error;

#[cfg(feature = "dynamodb")]
pub mod dynamodb;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::StoreError;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use tb_common::{ResultStatus, SerialisedMessage, StoreItem};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors on which `poll_result` should keep polling rather than propagate:
/// the row hasn't been written yet, or it is still SUBMITTED/IN_PROGRESS.
fn is_poll_continue_error(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::KeyNotFound(_) | StoreError::ResultInProgressStatus(_, _)
    )
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Unconditional or conditional put of a pre-built row (spec.md §4.1).
    async fn put_item(&self, item: StoreItem, allow_overwrite: bool) -> Result<()>;

    /// Strongly-consistent read; classifies absence/corruption/expiry.
    async fn get_item(&self, message_id: &str, raise_for_expiry: bool) -> Result<StoreItem>;

    /// Construct and put a non-SUCCESS status row (spec.md §4.1). Rejects
    /// `status=SUCCESS` (use `put_result`) and `error` set with a non-ERROR
    /// status, matching `dynamo_db_client.py::status_put`.
    async fn put_status(
        &self,
        status: ResultStatus,
        message_id: &str,
        ttl_seconds: Option<i64>,
        request_id: Option<String>,
        error: Option<String>,
        serialised_message: Option<SerialisedMessage>,
    ) -> Result<()> {
        if status == ResultStatus::Success {
            return Err(StoreError::Backend(
                "put_status cannot be used to set status=SUCCESS, use put_result".into(),
            ));
        }
        if error.is_some() && status != ResultStatus::Error {
            return Err(StoreError::Backend(format!(
                "can only set error if status=ERROR, got status={status}"
            )));
        }

        let expiration = ttl_seconds.map(tb_common::expiration_from_ttl);
        let item = StoreItem::new(
            message_id,
            status,
            None,
            error,
            request_id,
            serialised_message,
            expiration,
        )?;
        self.put_item(item, true).await
    }

    /// Write the terminal SUCCESS row. No expiration (I2).
    async fn put_result(
        &self,
        message_id: &str,
        result: Value,
        request_id: Option<String>,
        serialised_message: Option<SerialisedMessage>,
    ) -> Result<()> {
        let item = StoreItem::new(
            message_id,
            ResultStatus::Success,
            Some(result),
            None,
            request_id,
            serialised_message,
            None,
        )?;
        self.put_item(item, true).await
    }

    /// Write the terminal ERROR row. Callers stringify the source error the
    /// way `dynamo_db_client.py::error_put` does (`"{type}: {message}"`)
    /// before calling this; kept as a plain `String` param (rather than a
    /// generic `Display` bound) so the trait stays object-safe for
    /// `Arc<dyn StatusStore>`.
    async fn put_error(
        &self,
        message_id: &str,
        error: String,
        ttl_seconds: Option<i64>,
        request_id: Option<String>,
        serialised_message: Option<SerialisedMessage>,
    ) -> Result<()> {
        self.put_status(
            ResultStatus::Error,
            message_id,
            ttl_seconds,
            request_id,
            Some(error),
            serialised_message,
        )
        .await
    }

    /// Get the result, classifying every non-SUCCESS outcome.
    async fn get_result(
        &self,
        message_id: &str,
        return_request_id: bool,
    ) -> Result<(Value, Option<String>)> {
        let item = self.get_item(message_id, true).await?;

        if item.status == ResultStatus::Error {
            return Err(StoreError::ResultErrorStatus(
                message_id.to_string(),
                item.error.unwrap_or_default(),
            ));
        }
        if item.status == ResultStatus::Submitted || item.status == ResultStatus::InProgress {
            return Err(StoreError::ResultInProgressStatus(
                message_id.to_string(),
                item.status,
            ));
        }

        let result = item
            .result
            .ok_or_else(|| StoreError::ResultMissing(message_id.to_string()))?;
        let request_id = if return_request_id { item.request_id } else { None };
        Ok((result, request_id))
    }

    /// Returns `ERROR` for an expired or unparseable row instead of
    /// propagating, treating both as terminal bad states (spec.md §4.1).
    async fn get_status(&self, message_id: &str) -> Result<ResultStatus> {
        match self.get_item(message_id, true).await {
            Ok(item) => Ok(item.status),
            Err(StoreError::ExpiredItem(_)) | Err(StoreError::Unparseable(_, _)) => {
                Ok(ResultStatus::Error)
            }
            Err(other) => Err(other),
        }
    }

    /// True iff `get_result` succeeds.
    async fn result_exists(&self, message_id: &str) -> bool {
        self.get_result(message_id, false).await.is_ok()
    }

    /// Poll `get_result` until it succeeds, a non-continuable error occurs,
    /// or `timeout_seconds` elapses (spec.md §4.1: `KeyNotFound` and
    /// `ResultInProgressStatus` are the only errors that keep polling).
    async fn poll_result(
        &self,
        message_id: &str,
        timeout_seconds: f64,
        poll_interval_seconds: f64,
        return_request_id: bool,
    ) -> Result<(Value, Option<String>)> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(timeout_seconds);
        let poll_interval = Duration::from_secs_f64(poll_interval_seconds);

        loop {
            match self.get_result(message_id, return_request_id).await {
                Ok(result) => return Ok(result),
                Err(err) if is_poll_continue_error(&err) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StoreError::AwaitingResultTimeout(
                            timeout_seconds,
                            message_id.to_string(),
                        ));
                    }
                    debug!(message_id, error = %err, "result not ready, continuing poll");
                    tokio::time::sleep(poll_interval).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}
