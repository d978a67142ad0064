use thiserror::Error;

/// Scale-In Guard error taxonomy (spec.md §4.3).
#[derive(Error, Debug)]
pub enum GuardError {
    /// HTTP transport/status failure against the host agent, after retries.
    #[error("scale-in guard request failed: {0}")]
    Request(String),

    /// A 2xx response whose body reports `failure` or `error` — the agent
    /// accepted the request but could not apply the state.
    #[error("scale-in guard agent reported an error: {0}")]
    Agent(String),
}

pub type Result<T> = std::result::Result<T, GuardError>;
