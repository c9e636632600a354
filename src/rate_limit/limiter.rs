//! Windowed pacing and bounded retry around source fetches.

use std::future::Future;
use std::time::Duration;

use futures::stream::{self, Stream};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, warn};

use crate::shutdown::{sleep_unless_cancelled, SharedShutdown, Shutdown};
use crate::sources::SourceError;

use super::config::RateLimitConfig;

/// Paces an async fetch operation against one source.
///
/// Two modes are exposed, both lazy forward-only streams:
///
/// - [`fetch`](RateLimiter::fetch) repeats a no-input fetch forever, pausing
///   after each full request window;
/// - [`fetch_each`](RateLimiter::fetch_each) maps a finite input sequence
///   through the fetch, pausing before the next request once a window is
///   spent, and preserving input order.
///
/// Rate-limit responses are retried with a jittered backoff up to
/// `max_retries` times; any other failure ends the stream after yielding
/// the error. A limiter holds mutable pacing state and is meant for one
/// caller at a time - clone the config into a second limiter instead of
/// sharing one.
pub struct RateLimiter {
    config: RateLimitConfig,
    rng: StdRng,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic limiter for tests.
    pub fn with_seed(config: RateLimitConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Fresh RNG for one fetch sequence, derived from the limiter RNG.
    fn sequence_rng(&mut self) -> StdRng {
        StdRng::seed_from_u64(self.rng.gen())
    }

    /// Repeat `fetch_fn` forever, pacing after each spent request window.
    ///
    /// The stream only ends through cancellation (silently) or a fatal
    /// fetch error (yielded, then the stream terminates).
    pub fn fetch<F, Fut, T>(
        &mut self,
        fetch_fn: F,
        shutdown: SharedShutdown,
    ) -> impl Stream<Item = Result<T, SourceError>> + Send
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SourceError>> + Send + 'static,
        T: Send + 'static,
    {
        let state = UnaryState {
            fetch: fetch_fn,
            pacing: Pacing::start(self.config, self.sequence_rng()),
            shutdown,
            pause_pending: false,
            done: false,
        };

        stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            // The pause owed from the previous yield happens before the
            // next request is even considered.
            if st.pause_pending {
                st.pause_pending = false;
                if !st.pacing.pause(&st.shutdown).await {
                    return None;
                }
            }
            if st.shutdown.is_requested() {
                return None;
            }

            st.pacing.bump();
            let outcome = {
                let fetch = &mut st.fetch;
                request_with_retry(|| fetch(), &mut st.pacing, &st.shutdown).await
            };

            match outcome {
                Attempt::Ok(value) => {
                    if st.pacing.window_exhausted() {
                        st.pause_pending = true;
                    }
                    Some((Ok(value), st))
                }
                Attempt::Cancelled => None,
                Attempt::Fatal(err) => {
                    st.done = true;
                    Some((Err(err), st))
                }
            }
        })
    }

    /// Map `inputs` through `fetch_fn`, strictly one at a time.
    ///
    /// Output order matches input order. Unlike the unary mode the pause
    /// check runs before each request, so the stream never sleeps after its
    /// final item. A fatal error on any input ends the whole sequence.
    pub fn fetch_each<I, U, F, Fut, T>(
        &mut self,
        inputs: I,
        fetch_fn: F,
        shutdown: SharedShutdown,
    ) -> impl Stream<Item = Result<T, SourceError>> + Send
    where
        I: IntoIterator<Item = U>,
        I::IntoIter: Send + 'static,
        U: Clone + Send + Sync + 'static,
        F: FnMut(U) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SourceError>> + Send + 'static,
        T: Send + 'static,
    {
        let state = MappedState {
            inputs: inputs.into_iter(),
            fetch: fetch_fn,
            pacing: Pacing::start(self.config, self.sequence_rng()),
            shutdown,
            done: false,
        };

        stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            if st.shutdown.is_requested() {
                return None;
            }
            let input = st.inputs.next()?;

            if st.pacing.window_exhausted() && !st.pacing.pause(&st.shutdown).await {
                return None;
            }

            st.pacing.bump();
            let outcome = {
                let fetch = &mut st.fetch;
                let input = &input;
                request_with_retry(|| fetch(input.clone()), &mut st.pacing, &st.shutdown).await
            };

            match outcome {
                Attempt::Ok(value) => Some((Ok(value), st)),
                Attempt::Cancelled => None,
                Attempt::Fatal(err) => {
                    st.done = true;
                    Some((Err(err), st))
                }
            }
        })
    }
}

struct UnaryState<F> {
    fetch: F,
    pacing: Pacing,
    shutdown: SharedShutdown,
    pause_pending: bool,
    done: bool,
}

struct MappedState<I, F> {
    inputs: I,
    fetch: F,
    pacing: Pacing,
    shutdown: SharedShutdown,
    done: bool,
}

/// Per-sequence pacing state. Reset by construction at the start of every
/// top-level fetch call; never resumed across sequences.
struct Pacing {
    config: RateLimitConfig,
    rng: StdRng,
    count: u64,
    rate: i64,
    limit: i64,
    timeout: Duration,
}

impl Pacing {
    fn start(config: RateLimitConfig, mut rng: StdRng) -> Self {
        let limit = config.requests.value(&mut rng);
        let timeout = config.pause.timeout(&mut rng);
        Self {
            config,
            rng,
            count: 0,
            rate: 0,
            limit,
            timeout,
        }
    }

    fn bump(&mut self) {
        self.count += 1;
        self.rate += 1;
    }

    fn window_exhausted(&self) -> bool {
        self.config.enabled() && self.rate >= self.limit
    }

    /// Sleep out the current pause, then reset the rate and redraw both the
    /// request ceiling and the next pause length. Returns false when the
    /// sleep was cancelled.
    async fn pause(&mut self, shutdown: &Shutdown) -> bool {
        debug!(
            window_requests = self.rate,
            total_requests = self.count,
            pause_ms = self.timeout.as_millis() as u64,
            "request window spent, pausing"
        );
        if !sleep_unless_cancelled(self.timeout, shutdown).await {
            return false;
        }
        self.rate = 0;
        self.limit = self.config.requests.value(&mut self.rng);
        self.timeout = self.config.pause.timeout(&mut self.rng);
        true
    }
}

enum Attempt<T> {
    Ok(T),
    Cancelled,
    Fatal(SourceError),
}

/// Issue one logical request, absorbing rate-limit responses with a jittered
/// backoff until the retry budget runs out. Any other failure is fatal.
async fn request_with_retry<C, Fut, T>(
    mut call: C,
    pacing: &mut Pacing,
    shutdown: &Shutdown,
) -> Attempt<T>
where
    C: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match call().await {
            Ok(value) => return Attempt::Ok(value),
            Err(err) if err.is_rate_limited() => {
                if attempt >= pacing.config.max_retries {
                    error!(
                        attempts = attempt + 1,
                        error = %err,
                        "rate-limit retries exhausted"
                    );
                    return Attempt::Fatal(err);
                }
                attempt += 1;
                let wait = pacing.config.retry_pause.timeout(&mut pacing.rng);
                warn!(
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    "source rate limited, backing off"
                );
                if !sleep_unless_cancelled(wait, shutdown).await {
                    return Attempt::Cancelled;
                }
            }
            Err(err) => {
                error!(error = %err, "source fetch failed");
                return Attempt::Fatal(err);
            }
        }
    }
}
