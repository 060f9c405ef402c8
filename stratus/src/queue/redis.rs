//! Redis queue backend: one list per lane.
//!
//! Elements are pushed to the head and popped from the tail, so FIFO order
//! is preserved and a pop is the only operation that removes an element.
//! JSON is the wire encoding; the element type is tiny and self-describing.

use async_trait::async_trait;
use fred::prelude::*;

use crate::error::Result;
use crate::queue::RequestQueue;
use crate::request::{QueueElement, ScheduleType};

/// Answer a single ping against `url`, connecting from scratch.
pub(crate) async fn ping(url: &str) -> std::result::Result<(), Error> {
    let config = Config::from_url(url)?;
    let client = Client::new(config, None, None, None);
    client.connect();
    client.wait_for_connect().await?;
    let _: String = client.ping(None).await?;
    client.quit().await?;
    Ok(())
}

pub struct RedisQueue {
    client: Client,
    key: String,
}

impl RedisQueue {
    /// Connect a lane-scoped client. The list key is namespaced so several
    /// servers can share one key-value store.
    pub async fn connect(url: &str, lane: ScheduleType) -> Result<Self> {
        let config = Config::from_url(url).map_err(crate::error::StratusError::from)?;
        let client = Client::new(config, None, None, None);
        client.connect();
        client
            .wait_for_connect()
            .await
            .map_err(crate::error::StratusError::from)?;
        Ok(RedisQueue {
            client,
            key: format!("stratus:queue:{lane}"),
        })
    }
}

#[async_trait]
impl RequestQueue for RedisQueue {
    async fn put(&self, element: QueueElement) -> Result<()> {
        let encoded = serde_json::to_string(&element)?;
        let _: i64 = self
            .client
            .lpush(&self.key, encoded)
            .await
            .map_err(crate::error::StratusError::from)?;
        Ok(())
    }

    async fn get(&self) -> Result<Option<QueueElement>> {
        let raw: Option<String> = self
            .client
            .rpop(&self.key, None)
            .await
            .map_err(crate::error::StratusError::from)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn len(&self) -> Result<usize> {
        let depth: u64 = self
            .client
            .llen(&self.key)
            .await
            .map_err(crate::error::StratusError::from)?;
        Ok(depth as usize)
    }
}
