//! Jittered throttle windows.
//!
//! A [`ThrottleWindow`] is a normalized `[min, max]` integer range used both
//! as a request-count ceiling and as a pause duration in seconds. Every draw
//! produces a fresh random value so outbound traffic never settles into a
//! fixed cadence a remote service could fingerprint.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A normalized `[min, max]` range for jittered throttling decisions.
///
/// Construction order never matters: `ThrottleWindow::new(a, b)` and
/// `ThrottleWindow::new(b, a)` are identical. In configuration files a
/// window is written as a two-element array, e.g. `requests = [2, 5]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(i64, i64)", into = "(i64, i64)")]
pub struct ThrottleWindow {
    min: i64,
    max: i64,
}

impl ThrottleWindow {
    /// Create a window from two bounds, in either order.
    pub fn new(a: i64, b: i64) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    /// A window that never throttles.
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    /// Whether this window takes part in throttling at all.
    pub fn enabled(&self) -> bool {
        self.min > 0 || self.max > 0
    }

    /// Draw a uniform value from `[min, max]`, both ends inclusive.
    pub fn value(&self, rng: &mut impl Rng) -> i64 {
        rng.gen_range(self.min..=self.max)
    }

    /// Draw a pause duration.
    ///
    /// Zero when the window is disabled. When the range is degenerate
    /// (`min == max`) the duration is exactly `min` seconds with no jitter.
    /// Otherwise a fresh value is drawn and a fractional second of jitter is
    /// added, truncated to whole milliseconds.
    pub fn timeout(&self, rng: &mut impl Rng) -> Duration {
        if !self.enabled() {
            return Duration::ZERO;
        }
        if self.max <= self.min {
            return Duration::from_millis(self.min.max(0) as u64 * 1000);
        }
        let value = self.value(rng);
        let jitter: f64 = rng.gen();
        let millis = ((value as f64 + jitter) * 1000.0).max(0.0) as u64;
        Duration::from_millis(millis)
    }
}

impl From<(i64, i64)> for ThrottleWindow {
    fn from((a, b): (i64, i64)) -> Self {
        Self::new(a, b)
    }
}

impl From<ThrottleWindow> for (i64, i64) {
    fn from(window: ThrottleWindow) -> Self {
        (window.min, window.max)
    }
}

impl Default for ThrottleWindow {
    fn default() -> Self {
        Self::disabled()
    }
}
