//! The message envelope shared by the queue, the Store and the compute function.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::store::SerialisedMessage;

/// A unit of work handed to the queue. `body` is the caller-supplied JSON
/// document; the Producer injects `request_id` into it before publishing.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Message {
    pub body: Value,
    pub message_group_id: String,
}

/// A message as received off the queue, carrying everything needed to
/// acknowledge it or extend its visibility.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    /// Queue-assigned id; the Store's primary key.
    pub message_id: String,
    pub receipt_handle: String,
    pub queue_identifier: String,
}

impl QueuedMessage {
    /// Snapshot this message the way it should be persisted alongside a
    /// StoreItem, for diagnostics on the error path.
    pub fn to_serialised_message(&self) -> SerialisedMessage {
        SerialisedMessage {
            message_id: self.message_id.clone(),
            message_group_id: self.message.message_group_id.clone(),
            receipt_handle: Some(self.receipt_handle.clone()),
            body: self.message.body.clone(),
        }
    }
}
