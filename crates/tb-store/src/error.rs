use thiserror::Error;

/// The Store's error taxonomy (spec.md §4.1, §7). `get_status` collapses
/// `ExpiredItem` and `Unparseable` into `ResultStatus::Error` rather than
/// propagating them; everywhere else these are distinct, typed failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no item found for message_id={0}")]
    KeyNotFound(String),

    #[error("item already exists for message_id={0}")]
    KeyAlreadyExists(String),

    #[error("item for message_id={0} has SUCCESS status but no result (data corruption)")]
    ResultMissing(String),

    #[error("item for message_id={0} has ERROR status: {1}")]
    ResultErrorStatus(String, String),

    #[error("result for message_id={0} is still in progress, status={1}")]
    ResultInProgressStatus(String, tb_common::ResultStatus),

    #[error("item for message_id={0} could not be parsed: {1}")]
    Unparseable(String, String),

    #[error("item for message_id={0} has expired")]
    ExpiredItem(String),

    #[error("timed out after {0}s awaiting result for message_id={1}")]
    AwaitingResultTimeout(f64, String),

    #[error("store construction rejected: {0}")]
    InvalidItem(#[from] tb_common::StoreItemError),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialisation error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
