//! Redis-backed durable queue: a list per channel plus pub/sub wake-ups.
//!
//! Jobs are JSON documents in a Redis list (append = RPUSH, pop = LPOP),
//! notifications go over pub/sub on a channel-derived key. Multiple
//! producer processes can publish; the single processor per channel drains.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{JobList, JobNotifier, NotificationStream, QueueError};

/// Key prefix for queue data in Redis.
const KEY_PREFIX: &str = "mangacquire:";

/// Durable Redis queue for one channel.
pub struct RedisJobQueue {
    client: redis::Client,
    conn: ConnectionManager,
    channel: String,
}

impl RedisJobQueue {
    /// Connect to Redis and bind this handle to a channel.
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `channel` - Channel name; keys are derived from it
    pub async fn connect(redis_url: &str, channel: impl Into<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Backend(format!("Redis connection error: {}", e)))?;

        let conn = ConnectionManager::new(client.clone()).await.map_err(|e| {
            QueueError::Backend(format!("Redis connection manager error: {}", e))
        })?;

        Ok(Self {
            client,
            conn,
            channel: channel.into(),
        })
    }

    /// The Redis key holding this channel's pending jobs.
    fn list_key(&self) -> String {
        format!("{}queue:{}", KEY_PREFIX, self.channel)
    }

    /// The pub/sub key carrying a channel's wake-ups.
    fn event_key(channel: &str) -> String {
        format!("{}events:{}", KEY_PREFIX, channel)
    }
}

impl Clone for RedisJobQueue {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            conn: self.conn.clone(),
            channel: self.channel.clone(),
        }
    }
}

#[async_trait]
impl<J> JobList<J> for RedisJobQueue
where
    J: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn append(&self, job: J) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(self.list_key(), payload)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn pop_front(&self) -> Result<Option<J>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .lpop(self.list_key(), None)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        raw.map(|payload| serde_json::from_str(&payload))
            .transpose()
            .map_err(QueueError::from)
    }

    async fn list_all(&self) -> Result<Vec<J>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(self.list_key(), 0, -1)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        raw.iter()
            .map(|payload| serde_json::from_str(payload).map_err(QueueError::from))
            .collect()
    }
}

#[async_trait]
impl JobNotifier for RedisJobQueue {
    async fn notify(&self, channel: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(Self::event_key(channel), 1)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<NotificationStream, QueueError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        pubsub
            .subscribe(Self::event_key(channel))
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        debug!(channel, "subscribed to queue wake-ups");
        Ok(pubsub.into_on_message().map(|_msg| ()).boxed())
    }
}
