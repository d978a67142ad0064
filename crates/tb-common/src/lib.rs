//! Shared types for the request/response bridge: the message envelope, the
//! Store's data model, the compute-function contract, and logging setup.

pub mod compute;
pub mod logging;
pub mod message;
pub mod store;

pub use compute::{ComputeFailure, ComputeFn, FnCompute};
pub use message::{Message, QueuedMessage};
pub use store::{
    expiration_from_ttl, now_truncated_to_seconds, ResultStatus, SerialisedMessage, StoreItem,
    StoreItemError,
};
