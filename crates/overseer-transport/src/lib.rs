// Subject-routed message bus between the control plane and workers.
//
// Delivery contract: per-subject FIFO, consumer groups (one live consumer per
// group), at-least-once with consumer-side dedup, publish deadline of 5s when
// a group's in-flight window is full.

pub mod bus;
pub mod dedup;
pub mod reply;

pub use bus::{BusOptions, MessageBus, Subscription};
pub use dedup::DedupWindow;
pub use reply::ReplyWaiters;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Publish timed out on subject {0}")]
    PublishTimeout(String),

    #[error("Consumer group '{group}' already has a live consumer on {subject}")]
    GroupTaken { subject: String, group: String },

    #[error("Subject {0} is closed")]
    Closed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
