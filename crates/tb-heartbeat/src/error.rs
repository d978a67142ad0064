use thiserror::Error;

#[derive(Error, Debug)]
pub enum HeartbeatError {
    #[error("interval must be at least 1 second less than visibility_timeout, got interval={interval}, visibility_timeout={visibility_timeout}")]
    InvalidInterval { interval: f64, visibility_timeout: u32 },

    #[error("heartbeat worker did not stop within {0:?}")]
    StopTimeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, HeartbeatError>;
