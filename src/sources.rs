//! Failure contract for source fetch implementations.
//!
//! Per-source fetchers (MangaDex, AniList, scanlation sites, ...) live
//! outside this crate; they only need to surface failures as [`SourceError`]
//! so the rate limiter can tell the one retryable class - being rate
//! limited - apart from everything else, which is fatal for the sequence.

use thiserror::Error;

/// Errors raised by a source fetch operation.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source asked us to slow down. Retried with jittered backoff.
    #[error("rate limited by source (HTTP {status})")]
    RateLimited { status: u16 },

    /// Any non-success status that is not a rate limit.
    #[error("source returned HTTP {status}")]
    Status { status: u16 },

    /// Transport-level failure from the HTTP client.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The source responded but the payload was not understood.
    #[error("failed to decode source response: {0}")]
    Decode(String),
}

impl SourceError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            SourceError::RateLimited {
                status: status.as_u16(),
            }
        } else {
            SourceError::Status {
                status: status.as_u16(),
            }
        }
    }

    /// Whether this failure should be retried after a backoff pause.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            SourceError::RateLimited { .. } => true,
            SourceError::Http(e) => {
                e.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS)
            }
            _ => false,
        }
    }
}
