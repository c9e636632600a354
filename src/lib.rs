//! mangacquire - manga metadata acquisition and caching system.
//!
//! Core background-processing engine: a per-channel work queue dispatcher
//! and an adaptive rate limiter for outbound source requests. The web
//! server, ORM layer, and per-source scrapers live in sibling crates and
//! consume this one through its traits.

pub mod config;
pub mod rate_limit;
pub mod shutdown;
pub mod sources;
pub mod throttle;
pub mod work_queue;

pub use config::AcquireConfig;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use shutdown::{SharedShutdown, Shutdown};
pub use sources::SourceError;
pub use throttle::ThrottleWindow;
pub use work_queue::{
    DeliveryMode, JobList, JobNotifier, MemoryQueue, QueueError, QueueProcessor,
};

#[cfg(feature = "redis-backend")]
pub use work_queue::RedisJobQueue;
