use thiserror::Error;

/// Producer-side errors. Only `post_non_blocking`/construction can raise
/// these; `post`/`retrieve_result` never throw to their caller, mapping
/// everything onto a typed `Response` instead (spec.md §4.5, §7).
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("invalid message_group_id_mode {0:?}, expected one of \"global\", \"request\", \"producer\"")]
    InvalidGroupIdMode(String),

    #[error("message body must be a JSON object so request_id can be injected, got {0}")]
    NotAJsonObject(String),

    #[error("failed to publish message to queue: {0}")]
    Queue(#[from] tb_queue::QueueError),

    #[error("failed to write SUBMITTED row: {0}")]
    Store(#[from] tb_store::StoreError),
}

pub type Result<T> = std::result::Result<T, ProducerError>;
