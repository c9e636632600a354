//! In-memory queue backend for single-process operation and tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, Mutex};

use super::{JobList, JobNotifier, NotificationStream, QueueError};

/// Wake-ups that may queue up before a subscriber catches up. Lagging only
/// coalesces wake-ups, it never loses work - the drain loop re-checks the
/// list itself.
const WAKE_BUFFER: usize = 64;

/// One channel's job list held in process memory.
///
/// Implements both [`JobList`] and [`JobNotifier`], so a single instance
/// backs a whole `QueueProcessor`. Not durable: pending jobs are lost on
/// restart, which is fine for tests and acceptable for single-process
/// deployments that rebuild their backlog on startup.
///
/// `Clone` is manual so handles share the same underlying list without
/// requiring `J: Clone`.
pub struct MemoryQueue<J> {
    jobs: Arc<Mutex<VecDeque<J>>>,
    wake: broadcast::Sender<()>,
}

impl<J> MemoryQueue<J> {
    pub fn new() -> Self {
        let (wake, _) = broadcast::channel(WAKE_BUFFER);
        Self {
            jobs: Arc::new(Mutex::new(VecDeque::new())),
            wake,
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

impl<J> Clone for MemoryQueue<J> {
    fn clone(&self) -> Self {
        Self {
            jobs: Arc::clone(&self.jobs),
            wake: self.wake.clone(),
        }
    }
}

impl<J> Default for MemoryQueue<J> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<J: Clone + Send + Sync + 'static> JobList<J> for MemoryQueue<J> {
    async fn append(&self, job: J) -> Result<(), QueueError> {
        self.jobs.lock().await.push_back(job);
        Ok(())
    }

    async fn pop_front(&self) -> Result<Option<J>, QueueError> {
        Ok(self.jobs.lock().await.pop_front())
    }

    async fn list_all(&self) -> Result<Vec<J>, QueueError> {
        Ok(self.jobs.lock().await.iter().cloned().collect())
    }
}

#[async_trait]
impl<J: Send + Sync + 'static> JobNotifier for MemoryQueue<J> {
    async fn notify(&self, _channel: &str) -> Result<(), QueueError> {
        // No subscribers yet is not an error - the wake-up is just a hint.
        let _ = self.wake.send(());
        Ok(())
    }

    async fn subscribe(&self, _channel: &str) -> Result<NotificationStream, QueueError> {
        let rx = self.wake.subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(()) => Some(((), rx)),
                // Missed wake-ups collapse into the one we deliver now.
                Err(broadcast::error::RecvError::Lagged(_)) => Some(((), rx)),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(stream.boxed())
    }
}
