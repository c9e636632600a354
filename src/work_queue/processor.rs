//! Per-channel publish and drain loop.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::shutdown::Shutdown;

use super::{JobList, JobNotifier, QueueError};

/// How drained jobs reach the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum DeliveryMode {
    /// Await the handler before popping the next job. FIFO order, fully
    /// backpressured: a slow handler slows the whole channel.
    Inline,
    /// A fixed pool of workers consumes jobs from an internal channel.
    /// No completion ordering; the pop loop blocks once the pool is busy.
    Pooled {
        #[serde(default = "default_pool_workers")]
        workers: usize,
    },
}

fn default_pool_workers() -> usize {
    4
}

impl Default for DeliveryMode {
    fn default() -> Self {
        DeliveryMode::Inline
    }
}

/// Counters for one processor. Handler failures are isolated from the
/// drain loop, so these are how they surface to monitoring.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    delivered: AtomicU64,
    handler_errors: AtomicU64,
}

impl ProcessorStats {
    /// Jobs whose handler returned `Ok`.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Jobs whose handler returned an error (logged and skipped).
    pub fn handler_errors(&self) -> u64 {
        self.handler_errors.load(Ordering::Relaxed)
    }

    fn record(&self, result: &anyhow::Result<()>) {
        match result {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                warn!(%error, "job handler failed");
                self.handler_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Dispatches one channel's durable job list to a handler.
///
/// `publish` appends and emits a wake-up; `process` is the single
/// long-running drain loop. At most one drain runs per processor: the loop
/// is owned by the one task inside `process`, and a second concurrent
/// `process` call is rejected outright. Wake-ups that arrive mid-drain
/// buffer in the subscription, and any pass that popped at least one job is
/// followed by another pass, so a publish racing the empty check is never
/// stranded.
pub struct QueueProcessor<J> {
    store: Arc<dyn JobList<J>>,
    notifier: Arc<dyn JobNotifier>,
    channel: String,
    mode: DeliveryMode,
    stats: Arc<ProcessorStats>,
    running: AtomicBool,
}

impl<J: Send + 'static> QueueProcessor<J> {
    pub fn new(
        channel: impl Into<String>,
        store: Arc<dyn JobList<J>>,
        notifier: Arc<dyn JobNotifier>,
        mode: DeliveryMode,
    ) -> Self {
        Self {
            store,
            notifier,
            channel: channel.into(),
            mode,
            stats: Arc::new(ProcessorStats::default()),
            running: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        self.stats.clone()
    }

    /// Append a job and wake the drain loop. Never blocks on the consumer.
    pub async fn publish(&self, job: J) -> Result<(), QueueError> {
        self.store.append(job).await?;
        self.notifier.notify(&self.channel).await?;
        Ok(())
    }

    /// Drain the channel until `shutdown` fires.
    ///
    /// Subscribes to wake-ups, drains once immediately, then drains again
    /// on every notification. Returns `Ok(())` on cancellation; backend
    /// errors are logged and returned so a supervising scheduler can decide
    /// whether to re-enter.
    pub async fn process<H, Fut>(&self, handler: H, shutdown: &Shutdown) -> Result<(), QueueError>
    where
        H: Fn(J) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(QueueError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let mut notifications = self.notifier.subscribe(&self.channel).await?;
        let mut deliverer = self.build_deliverer(handler);

        debug!(channel = %self.channel, "processing started");
        self.drain(&mut deliverer, shutdown).await?;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                wake = notifications.next() => match wake {
                    Some(()) => self.drain(&mut deliverer, shutdown).await?,
                    None => {
                        error!(channel = %self.channel, "notification subscription closed");
                        return Err(QueueError::SubscriptionClosed);
                    }
                },
            }
        }

        deliverer.close().await;
        debug!(channel = %self.channel, "processing stopped");
        Ok(())
    }

    /// One drain: pop until empty, then repeat while passes keep finding
    /// work. The repeat covers jobs appended between the final pop and the
    /// empty observation; an empty pass ends the drain so a burst of
    /// wake-ups for an already-empty list cannot spin.
    async fn drain(
        &self,
        deliverer: &mut Deliverer<J>,
        shutdown: &Shutdown,
    ) -> Result<(), QueueError> {
        loop {
            let mut popped = 0usize;
            loop {
                if shutdown.is_requested() {
                    return Ok(());
                }
                match self.store.pop_front().await {
                    Ok(Some(job)) => {
                        deliverer.deliver(job, &self.stats).await?;
                        popped += 1;
                    }
                    Ok(None) => break,
                    Err(error) => {
                        error!(channel = %self.channel, %error, "failed to pop job");
                        return Err(error);
                    }
                }
            }
            if popped == 0 {
                return Ok(());
            }
            debug!(channel = %self.channel, popped, "drain pass complete, re-checking");
        }
    }

    fn build_deliverer<H, Fut>(&self, handler: H) -> Deliverer<J>
    where
        H: Fn(J) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        match self.mode {
            DeliveryMode::Inline => Deliverer::Inline {
                handler: Box::new(move |job| handler(job).boxed()),
            },
            DeliveryMode::Pooled { workers } => {
                let workers = workers.max(1);
                let (tx, rx) = mpsc::channel::<J>(workers);
                let rx = Arc::new(Mutex::new(rx));

                let mut handles = Vec::with_capacity(workers);
                for worker_id in 0..workers {
                    let rx = rx.clone();
                    let handler = handler.clone();
                    let stats = self.stats.clone();
                    handles.push(tokio::spawn(async move {
                        debug!(worker_id, "delivery worker started");
                        loop {
                            let job = { rx.lock().await.recv().await };
                            match job {
                                Some(job) => stats.record(&handler(job).await),
                                None => break,
                            }
                        }
                        debug!(worker_id, "delivery worker stopped");
                    }));
                }

                Deliverer::Pooled { tx, handles }
            }
        }
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

type InlineHandler<J> =
    Box<dyn Fn(J) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

enum Deliverer<J> {
    Inline { handler: InlineHandler<J> },
    Pooled {
        tx: mpsc::Sender<J>,
        handles: Vec<JoinHandle<()>>,
    },
}

impl<J> Deliverer<J> {
    async fn deliver(&mut self, job: J, stats: &ProcessorStats) -> Result<(), QueueError> {
        match self {
            Deliverer::Inline { handler } => {
                stats.record(&handler(job).await);
                Ok(())
            }
            Deliverer::Pooled { tx, .. } => tx
                .send(job)
                .await
                .map_err(|_| QueueError::Backend("delivery pool stopped".into())),
        }
    }

    /// Let pooled workers finish whatever is still queued, then join them.
    async fn close(self) {
        if let Deliverer::Pooled { tx, handles } = self {
            drop(tx);
            for handle in handles {
                let _ = handle.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_queue::MemoryQueue;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use tokio::sync::Mutex as AsyncMutex;

    fn processor(mode: DeliveryMode) -> (Arc<MemoryQueue<u64>>, Arc<QueueProcessor<u64>>) {
        let queue = Arc::new(MemoryQueue::new());
        let processor = Arc::new(QueueProcessor::new(
            "chapter-index",
            queue.clone(),
            queue.clone(),
            mode,
        ));
        (queue, processor)
    }

    /// Run `process` in the background, returning the task handle.
    fn spawn_process(
        processor: Arc<QueueProcessor<u64>>,
        seen: Arc<AsyncMutex<Vec<u64>>>,
        shutdown: crate::shutdown::SharedShutdown,
    ) -> JoinHandle<Result<(), QueueError>> {
        tokio::spawn(async move {
            processor
                .process(
                    move |job| {
                        let seen = seen.clone();
                        async move {
                            seen.lock().await.push(job);
                            Ok(())
                        }
                    },
                    &shutdown,
                )
                .await
        })
    }

    #[tokio::test]
    async fn delivers_jobs_published_before_processing() {
        let (_, processor) = processor(DeliveryMode::Inline);
        for job in [1, 2, 3] {
            processor.publish(job).await.unwrap();
        }

        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let shutdown = Shutdown::shared();
        let handle = spawn_process(processor.clone(), seen.clone(), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.request();
        handle.await.unwrap().unwrap();

        assert_eq!(*seen.lock().await, vec![1, 2, 3]);
        assert_eq!(processor.stats().delivered(), 3);
    }

    #[tokio::test]
    async fn delivers_jobs_published_while_processing() {
        let (_, processor) = processor(DeliveryMode::Inline);
        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let shutdown = Shutdown::shared();
        let handle = spawn_process(processor.clone(), seen.clone(), shutdown.clone());

        for job in 1..=5 {
            processor.publish(job).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.request();
        handle.await.unwrap().unwrap();

        assert_eq!(*seen.lock().await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn inline_delivery_is_ordered_and_backpressured() {
        let (_, processor) = processor(DeliveryMode::Inline);
        for job in 1..=5 {
            processor.publish(job).await.unwrap();
        }

        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let shutdown = Shutdown::shared();
        let handler_seen = seen.clone();

        let start = Instant::now();
        let task = {
            let processor = processor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                processor
                    .process(
                        move |job| {
                            let seen = handler_seen.clone();
                            async move {
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                seen.lock().await.push(job);
                                Ok(())
                            }
                        },
                        &shutdown,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(700)).await;
        shutdown.request();
        task.await.unwrap().unwrap();

        assert_eq!(*seen.lock().await, vec![1, 2, 3, 4, 5]);
        // Five sequential 100ms handlers cannot finish under 500ms.
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn only_one_drain_runs_at_a_time() {
        let (_, processor) = processor(DeliveryMode::Inline);
        for job in 1..=10 {
            processor.publish(job).await.unwrap();
        }
        // Pile on extra wake-ups for the same backlog.
        for _ in 0..5 {
            processor.notifier.notify("chapter-index").await.unwrap();
        }

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let shutdown = Shutdown::shared();

        let task = {
            let processor = processor.clone();
            let shutdown = shutdown.clone();
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            tokio::spawn(async move {
                processor
                    .process(
                        move |_job| {
                            let in_flight = in_flight.clone();
                            let max_in_flight = max_in_flight.clone();
                            async move {
                                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                                max_in_flight.fetch_max(now, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(5)).await;
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                Ok(())
                            }
                        },
                        &shutdown,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.request();
        task.await.unwrap().unwrap();

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(processor.stats().delivered(), 10);
    }

    #[tokio::test]
    async fn concurrent_process_calls_are_rejected() {
        let (_, processor) = processor(DeliveryMode::Inline);
        let shutdown = Shutdown::shared();

        let first = {
            let processor = processor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                processor
                    .process(|_job| async { Ok(()) }, &shutdown)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = processor.process(|_job| async { Ok(()) }, &shutdown).await;
        assert!(matches!(second, Err(QueueError::AlreadyRunning)));

        shutdown.request();
        first.await.unwrap().unwrap();

        // The channel is free again once the first loop exits.
        let rerun_shutdown = Shutdown::new();
        rerun_shutdown.request();
        processor
            .process(|_job| async { Ok(()) }, &rerun_shutdown)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pooled_delivery_caps_concurrency() {
        let (_, processor) = processor(DeliveryMode::Pooled { workers: 2 });
        for job in 1..=6 {
            processor.publish(job).await.unwrap();
        }

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let shutdown = Shutdown::shared();

        let task = {
            let processor = processor.clone();
            let shutdown = shutdown.clone();
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            let done = done.clone();
            tokio::spawn(async move {
                processor
                    .process(
                        move |_job| {
                            let in_flight = in_flight.clone();
                            let max_in_flight = max_in_flight.clone();
                            let done = done.clone();
                            async move {
                                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                                max_in_flight.fetch_max(now, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                done.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            }
                        },
                        &shutdown,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(400)).await;
        shutdown.request();
        task.await.unwrap().unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert!(max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn handler_errors_do_not_halt_the_channel() {
        let (_, processor) = processor(DeliveryMode::Inline);
        for job in 1..=3 {
            processor.publish(job).await.unwrap();
        }

        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let shutdown = Shutdown::shared();

        let task = {
            let processor = processor.clone();
            let shutdown = shutdown.clone();
            let handler_seen = seen.clone();
            tokio::spawn(async move {
                processor
                    .process(
                        move |job| {
                            let seen = handler_seen.clone();
                            async move {
                                if job == 2 {
                                    anyhow::bail!("unreachable source");
                                }
                                seen.lock().await.push(job);
                                Ok(())
                            }
                        },
                        &shutdown,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.request();
        task.await.unwrap().unwrap();

        assert_eq!(*seen.lock().await, vec![1, 3]);
        assert_eq!(processor.stats().delivered(), 2);
        assert_eq!(processor.stats().handler_errors(), 1);
    }

    #[tokio::test]
    async fn spurious_wakeups_on_empty_queue_are_harmless() {
        let (_, processor) = processor(DeliveryMode::Inline);
        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let shutdown = Shutdown::shared();
        let handle = spawn_process(processor.clone(), seen.clone(), shutdown.clone());

        for _ in 0..10 {
            processor.notifier.notify("chapter-index").await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.request();
        handle.await.unwrap().unwrap();

        assert!(seen.lock().await.is_empty());
    }
}
