//! Durable work queue dispatch.
//!
//! A [`QueueProcessor`] owns one named channel: producers [`publish`]
//! jobs onto a durable list and emit a wake-up, a single long-running
//! [`process`] loop drains the list into a handler. The list and the
//! notifier are backend-agnostic traits so deployments can run in-process
//! ([`MemoryQueue`]) or against Redis (`redis-backend` feature).
//!
//! Delivery is at-least-once; handlers must be idempotent. Channels are
//! independent - no fairness or cross-channel ordering is promised.
//!
//! [`publish`]: QueueProcessor::publish
//! [`process`]: QueueProcessor::process

mod memory;
mod processor;

#[cfg(feature = "redis-backend")]
mod redis;

pub use memory::MemoryQueue;
pub use processor::{DeliveryMode, ProcessorStats, QueueProcessor};

#[cfg(feature = "redis-backend")]
pub use redis::RedisJobQueue;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Wake-up signals for a channel. The payload carries no information.
pub type NotificationStream = BoxStream<'static, ()>;

/// Errors from queue backends and the processor.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The durable list or notifier backend failed.
    #[error("queue backend error: {0}")]
    Backend(String),

    /// A job payload could not be encoded or decoded.
    #[error("job payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// The notification subscription ended while processing was active.
    #[error("notification subscription closed")]
    SubscriptionClosed,

    /// `process` was called while another drain loop owns the channel.
    #[error("channel is already being processed")]
    AlreadyRunning,
}

/// A durable FIFO list holding one channel's pending jobs.
///
/// The list is shared, external state: any number of producers may append
/// while one processor pops. It survives process restarts - the list, not
/// the processor, is the source of truth for unprocessed work.
#[async_trait]
pub trait JobList<J: Send + 'static>: Send + Sync {
    /// Append a job to the tail.
    async fn append(&self, job: J) -> Result<(), QueueError>;

    /// Pop the head, or `None` when the list is empty.
    async fn pop_front(&self) -> Result<Option<J>, QueueError>;

    /// Snapshot every pending job, head first. Used by schedulers to skip
    /// publishing duplicates; the drain loop itself never calls this.
    async fn list_all(&self) -> Result<Vec<J>, QueueError>;
}

/// Publish/subscribe wake-up signals for channels.
///
/// Notifications are fire-and-forget hints that the list may have grown;
/// the drain loop re-checks emptiness itself, so a coalesced or spurious
/// wake-up is harmless.
#[async_trait]
pub trait JobNotifier: Send + Sync {
    /// Emit one wake-up on the named channel.
    async fn notify(&self, channel: &str) -> Result<(), QueueError>;

    /// Subscribe to wake-ups on the named channel. Dropping the stream
    /// unsubscribes.
    async fn subscribe(&self, channel: &str) -> Result<NotificationStream, QueueError>;
}
