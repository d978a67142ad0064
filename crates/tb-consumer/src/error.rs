use std::time::Duration;
use thiserror::Error;

/// Consumer lifecycle errors (spec.md §4.4).
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("consumer is already consuming")]
    AlreadyConsuming,

    #[error("consumer worker did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error("consumer reports is_running=true but the processing lock is absent (internal invariant violation)")]
    ProcessingLockInvariant,
}

pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Classification of a `process_message` failure, used to decide whether
/// `process_message_wrapped` writes an ERROR row and acks, or leaves the
/// message for redelivery (spec.md §4.4).
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// ack the message, write ERROR: decode failure, in-progress write
    /// failure never reaches this variant (that one is retryable), or a
    /// compute failure whose `kind` is in the configured non-retryable set.
    #[error("{0}")]
    Unretryable(String),

    /// leave the message on the queue for redelivery: store writes that
    /// failed transiently, or a compute failure whose `kind` is not
    /// configured as non-retryable.
    #[error("{0}")]
    Retryable(String),
}
