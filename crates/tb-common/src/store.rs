//! The Store's data model: `ResultStatus`, `StoreItem` and the invariants
//! enforced at construction (I6).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

/// Tagged status of one `StoreItem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Submitted,
    InProgress,
    Success,
    Error,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Submitted => "submitted",
            ResultStatus::InProgress => "in_progress",
            ResultStatus::Success => "success",
            ResultStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the queue-delivered envelope, stored alongside a `StoreItem`
/// for diagnostics (`serialised_message` in spec terms). `receipt_handle`
/// is absent for the Producer's pre-delivery SUBMITTED snapshot, which is
/// written before the queue has handed back a receipt.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SerialisedMessage {
    pub message_id: String,
    pub message_group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_handle: Option<String>,
    pub body: Value,
}

/// Errors raised when constructing a `StoreItem` that would violate I6.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreItemError {
    #[error("status=SUCCESS requires a non-null result and forbids error/expiration")]
    InvalidSuccessRow,
    #[error("status=ERROR requires a non-null error and forbids a result")]
    InvalidErrorRow,
    #[error("an item carrying both a result and an expiration is invalid regardless of status")]
    ResultWithExpiration,
}

/// The single authoritative record kept per message_id.
///
/// Constructed only through `StoreItem::new`, which enforces I6: the
/// invariants hold for every row the core ever writes.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StoreItem {
    pub message_id: String,
    pub status: ResultStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialised_message: Option<SerialisedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

impl StoreItem {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message_id: impl Into<String>,
        status: ResultStatus,
        result: Option<Value>,
        error: Option<String>,
        request_id: Option<String>,
        serialised_message: Option<SerialisedMessage>,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<Self, StoreItemError> {
        if status == ResultStatus::Success && (error.is_some() || result.is_none()) {
            return Err(StoreItemError::InvalidSuccessRow);
        }
        if status == ResultStatus::Error && (error.is_none() || result.is_some()) {
            return Err(StoreItemError::InvalidErrorRow);
        }
        // Checked against the raw fields, not the status tag: any row
        // carrying both is invalid, matching the original store client.
        if result.is_some() && expiration.is_some() {
            return Err(StoreItemError::ResultWithExpiration);
        }

        Ok(Self {
            message_id: message_id.into(),
            status,
            updated_at: now_truncated_to_seconds(),
            result,
            error,
            request_id,
            serialised_message,
            expiration,
        })
    }

    /// True only when the row is non-terminal and past its expiration.
    pub fn is_expired(&self) -> bool {
        if self.status == ResultStatus::Success {
            return false;
        }
        match self.expiration {
            None => false,
            Some(exp) => Utc::now() > exp,
        }
    }
}

/// `updated_at` and TTL expirations are always stamped by the store client,
/// rounded down to whole seconds UTC, never accepted from a caller.
pub fn now_truncated_to_seconds() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}

pub fn expiration_from_ttl(ttl_seconds: i64) -> DateTime<Utc> {
    now_truncated_to_seconds() + Duration::seconds(ttl_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_row_requires_result_and_forbids_error() {
        let err = StoreItem::new(
            "m-1",
            ResultStatus::Success,
            None,
            None,
            None,
            None,
            None,
        )
        .unwrap_err();
        assert_eq!(err, StoreItemError::InvalidSuccessRow);

        let err = StoreItem::new(
            "m-1",
            ResultStatus::Success,
            Some(Value::Bool(true)),
            Some("boom".into()),
            None,
            None,
            None,
        )
        .unwrap_err();
        assert_eq!(err, StoreItemError::InvalidSuccessRow);
    }

    #[test]
    fn error_row_requires_error_and_forbids_result() {
        let err = StoreItem::new("m-1", ResultStatus::Error, None, None, None, None, None)
            .unwrap_err();
        assert_eq!(err, StoreItemError::InvalidErrorRow);
    }

    #[test]
    fn result_and_expiration_are_mutually_exclusive_regardless_of_status() {
        let err = StoreItem::new(
            "m-1",
            ResultStatus::InProgress,
            Some(Value::Null),
            None,
            None,
            None,
            Some(now_truncated_to_seconds()),
        )
        .unwrap_err();
        assert_eq!(err, StoreItemError::ResultWithExpiration);
    }

    #[test]
    fn success_row_never_reports_expired() {
        let item = StoreItem::new(
            "m-1",
            ResultStatus::Success,
            Some(Value::Bool(true)),
            None,
            None,
            None,
            None,
        )
        .unwrap();
        assert!(!item.is_expired());
    }

    #[test]
    fn non_terminal_row_expires_after_its_expiration_timestamp() {
        let item = StoreItem::new(
            "m-1",
            ResultStatus::InProgress,
            None,
            None,
            None,
            None,
            Some(now_truncated_to_seconds() - Duration::seconds(1)),
        )
        .unwrap();
        assert!(item.is_expired());
    }
}
