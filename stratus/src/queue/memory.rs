//! In-process queue backend: a shared deque behind a mutex.
//!
//! Used when no external key-value server is reachable. The lock is held
//! only for push/pop, so contention between the HTTP handlers and the
//! worker loops is negligible.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::queue::RequestQueue;
use crate::request::QueueElement;

#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<VecDeque<QueueElement>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        MemoryQueue::default()
    }
}

#[async_trait]
impl RequestQueue for MemoryQueue {
    async fn put(&self, element: QueueElement) -> Result<()> {
        self.inner.lock().push_back(element);
        Ok(())
    }

    async fn get(&self) -> Result<Option<QueueElement>> {
        Ok(self.inner.lock().pop_front())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.inner.lock().len())
    }
}
