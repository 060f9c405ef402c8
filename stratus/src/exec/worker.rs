//! Per-lane worker loop.
//!
//! A worker owns a bounded pool of child execution slots and pulls from its
//! lane with a sleep-poll (non-blocking `get`, so the queue backend is
//! interchangeable). The blocking lane awaits each child before the next
//! dequeue; the non-blocking lane multiplexes children through its slot
//! pool, which supplies back-pressure by blocking submission once full.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StratusError};
use crate::exec::child::ChildRunner;
use crate::queue::RequestQueue;
use crate::request::{RequestRecord, RequestStatus, ScheduleType};
use crate::store::RequestStore;

/// Configuration for a worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls of an empty lane.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// A long-lived worker bound to one lane.
pub struct Worker<S, R> {
    lane: ScheduleType,
    worker_id: usize,
    slots: usize,
    store: Arc<S>,
    queue: Arc<dyn RequestQueue>,
    runner: Arc<R>,
    config: WorkerConfig,
    in_flight: Arc<AtomicUsize>,
}

impl<S, R> Worker<S, R>
where
    S: RequestStore + 'static,
    R: ChildRunner + 'static,
{
    pub fn new(
        lane: ScheduleType,
        worker_id: usize,
        slots: usize,
        store: Arc<S>,
        queue: Arc<dyn RequestQueue>,
        runner: Arc<R>,
        config: WorkerConfig,
    ) -> Self {
        Worker {
            lane,
            worker_id,
            slots: slots.max(1),
            store,
            queue,
            runner,
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of children currently executing under this worker.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Run the worker loop until `shutdown` is cancelled.
    #[tracing::instrument(skip_all, fields(lane = %self.lane, worker_id = self.worker_id))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        tracing::info!(host, slots = self.slots, "Worker started");
        let semaphore = Arc::new(Semaphore::new(self.slots));
        let mut children: JoinSet<()> = JoinSet::new();

        loop {
            // Drain finished non-blocking children (non-blocking poll).
            while let Some(joined) = children.try_join_next() {
                if let Err(join_err) = joined {
                    tracing::error!(error = %join_err, "Child task panicked");
                }
            }

            if shutdown.is_cancelled() {
                break;
            }

            let element = self.queue.get().await?;
            let Some(element) = element else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            };

            let Some(record) = self.store.get(element.request_id).await? else {
                tracing::warn!(request_id = %element.request_id, "Dequeued unknown request, discarding");
                continue;
            };
            if record.status != RequestStatus::Pending {
                // Aborted (or otherwise resolved) while queued.
                tracing::debug!(
                    request_id = %record.request_id,
                    status = %record.status,
                    "Discarding request no longer pending"
                );
                continue;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| StratusError::Internal("worker slot pool closed".to_string()))?;

            tracing::info!(request_id = %record.request_id, name = %record.name, "Dispatching request");
            match self.lane {
                ScheduleType::Blocking => {
                    let _permit = permit;
                    self.execute(record, element.ignore_return_value).await;
                }
                ScheduleType::NonBlocking => {
                    let worker = self.clone();
                    let ignore = element.ignore_return_value;
                    children.spawn(async move {
                        let _permit = permit;
                        worker.execute(record, ignore).await;
                    });
                }
            }
        }

        tracing::info!("Worker shutting down, waiting for in-flight children");
        while children.join_next().await.is_some() {}
        Ok(())
    }

    async fn execute(&self, record: RequestRecord, ignore_return_value: bool) {
        let request_id = record.request_id;
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::Relaxed);
        });

        match self.runner.run(&record, ignore_return_value).await {
            Ok(outcome) if outcome.is_normal() => {
                tracing::info!(request_id = %request_id, "Request finished");
            }
            Ok(outcome) => {
                // The record keeps whatever state the child last wrote;
                // RUNNING here means the child died mid-flight and the
                // reaper will reconcile it.
                tracing::warn!(
                    request_id = %request_id,
                    outcome = ?outcome,
                    "Child ended abnormally"
                );
            }
            Err(err) => {
                tracing::error!(
                    request_id = %request_id,
                    error = %err,
                    "Failed to run child"
                );
            }
        }
    }
}
