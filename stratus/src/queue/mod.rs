//! Dual-lane FIFO queues with interchangeable backends.
//!
//! Each schedule type gets one named lane. Elements are removed only by a
//! successful `get`, so a crashed worker never loses queued work. Both
//! backends expose a non-blocking `get`; workers poll with a short sleep so
//! a backend swap is transparent to the scheduling loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::request::{QueueElement, ScheduleType};

pub mod memory;
pub mod redis;

/// A FIFO lane of `(request_id, ignore_return_value)` pairs.
#[async_trait]
pub trait RequestQueue: Send + Sync {
    /// Non-blocking enqueue at the tail.
    async fn put(&self, element: QueueElement) -> Result<()>;

    /// Non-blocking dequeue at the head; `None` when the lane is empty.
    async fn get(&self) -> Result<Option<QueueElement>>;

    /// Current queue depth.
    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Which backend hosts the lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    /// Process-shared queues inside the server.
    Memory,
    /// Lists on an external key-value server.
    Redis,
}

/// Probe for a reachable key-value server.
///
/// Selected only when the server answers a ping within `ping_timeout`;
/// anything else falls back to the in-process backend.
pub async fn detect_backend(redis_url: Option<&str>, ping_timeout: Duration) -> QueueBackend {
    let Some(url) = redis_url else {
        return QueueBackend::Memory;
    };
    match tokio::time::timeout(ping_timeout, redis::ping(url)).await {
        Ok(Ok(())) => {
            tracing::info!(url, "Queue backend: redis");
            QueueBackend::Redis
        }
        Ok(Err(err)) => {
            tracing::info!(url, error = %err, "Key-value server unreachable, using in-process queues");
            QueueBackend::Memory
        }
        Err(_) => {
            tracing::info!(url, "Key-value server ping timed out, using in-process queues");
            QueueBackend::Memory
        }
    }
}

/// Open one queue per lane on the selected backend.
pub async fn open_lanes(
    backend: QueueBackend,
    redis_url: Option<&str>,
) -> Result<HashMap<ScheduleType, Arc<dyn RequestQueue>>> {
    let mut lanes: HashMap<ScheduleType, Arc<dyn RequestQueue>> = HashMap::new();
    for lane in ScheduleType::lanes() {
        let queue: Arc<dyn RequestQueue> = match backend {
            QueueBackend::Memory => Arc::new(memory::MemoryQueue::new()),
            QueueBackend::Redis => {
                let url = redis_url.ok_or_else(|| {
                    crate::error::StratusError::Queue(
                        "redis backend selected without a url".to_string(),
                    )
                })?;
                Arc::new(redis::RedisQueue::connect(url, lane).await?)
            }
        };
        lanes.insert(lane, queue);
    }
    Ok(lanes)
}
