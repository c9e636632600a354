//! Rate limiting for outbound source requests.
//!
//! Wraps a caller-supplied fetch operation with windowed pacing and bounded
//! retry on rate-limit responses, exposed as lazy streams. Window bounds are
//! redrawn after every pause so the request cadence never repeats.

mod config;
mod limiter;

pub use config::RateLimitConfig;
pub use limiter::RateLimiter;
