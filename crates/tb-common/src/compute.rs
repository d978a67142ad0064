//! The compute-function contract.
//!
//! The Python original validates a compute callable's signature at
//! `Consumer.__init__` time with `inspect.signature`. Here the admission
//! check is the trait bound itself: a type implementing `ComputeFn` already
//! has the right shape, so there is nothing left to check at runtime.

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

/// A classified compute failure. `kind` is matched against a Consumer's
/// configured set of non-retryable kinds to decide whether the failure is
/// terminal (ERROR row, message deleted) or left for redelivery.
#[derive(Debug, Clone)]
pub struct ComputeFailure {
    pub kind: String,
    pub message: String,
}

impl ComputeFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ComputeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ComputeFailure {}

/// User-supplied work: takes the parsed body and the queue-assigned
/// message_id, returns the JSON result or a classified failure.
#[async_trait]
pub trait ComputeFn: Send + Sync {
    async fn compute(&self, body: Value, message_id: String) -> Result<Value, ComputeFailure>;
}

/// Adapts a plain async closure to `ComputeFn`.
pub struct FnCompute<F>(F);

impl<F, Fut> FnCompute<F>
where
    F: Fn(Value, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ComputeFailure>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> ComputeFn for FnCompute<F>
where
    F: Fn(Value, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ComputeFailure>> + Send + 'static,
{
    async fn compute(&self, body: Value, message_id: String) -> Result<Value, ComputeFailure> {
        (self.0)(body, message_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fn_compute_adapts_a_closure() {
        let compute = FnCompute::new(|body: Value, message_id: String| async move {
            Ok(json!({"received_body": body, "message_id": message_id}))
        });

        let result = compute
            .compute(json!({"parameters": [1, 2, 3]}), "mid-1".into())
            .await
            .unwrap();

        assert_eq!(result["message_id"], "mid-1");
        assert_eq!(result["received_body"]["parameters"], json!([1, 2, 3]));
    }
}
