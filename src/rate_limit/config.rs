//! Rate limiter configuration.

use serde::{Deserialize, Serialize};

use crate::throttle::ThrottleWindow;

/// Default retry budget for rate-limited requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff window after a rate-limit response, in seconds.
pub const DEFAULT_RETRY_PAUSE: (i64, i64) = (30, 90);

/// Pacing and retry settings for one source.
///
/// Immutable for the process lifetime; loaded from configuration once.
/// Pacing only engages when both `requests` and `pause` are enabled -
/// otherwise the limiter passes requests straight through and only the
/// rate-limit retry path remains active.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// How many requests may be issued before a pause is due.
    pub requests: ThrottleWindow,
    /// Pause length between request windows, in seconds.
    pub pause: ThrottleWindow,
    /// How many times a rate-limited request is retried before giving up.
    pub max_retries: u32,
    /// Backoff window after a rate-limit response, in seconds.
    pub retry_pause: ThrottleWindow,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: ThrottleWindow::disabled(),
            pause: ThrottleWindow::disabled(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_pause: ThrottleWindow::new(DEFAULT_RETRY_PAUSE.0, DEFAULT_RETRY_PAUSE.1),
        }
    }
}

impl RateLimitConfig {
    /// Whether windowed pacing is in effect.
    pub fn enabled(&self) -> bool {
        self.requests.enabled() && self.pause.enabled()
    }
}
