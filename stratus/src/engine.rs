//! The engine facade: one value owning the store, lanes, plan, runner, and
//! registry, constructed at startup and passed explicitly to whoever needs
//! it. There are no process-wide singletons.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::{Result, StratusError};
use crate::exec::child::ChildRunner;
use crate::exec::worker::{Worker, WorkerConfig};
use crate::plan::WorkerPlan;
use crate::queue::RequestQueue;
use crate::registry::{EntrypointRegistry, KILL_PROCESS_TREE};
use crate::request::{
    QueueElement, RequestId, RequestPayload, RequestRecord, RequestStatus, ScheduleType,
};
use crate::store::{RequestFilter, RequestStore};

/// Engine-level settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding one `<request_id>.log` per request.
    pub log_dir: PathBuf,
    /// Worker loop settings.
    pub worker: WorkerConfig,
}

/// A request submission, as produced by an HTTP handler.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub request_id: RequestId,
    pub name: String,
    pub entrypoint: String,
    pub body: RequestPayload,
    pub schedule_type: ScheduleType,
    pub ignore_return_value: bool,
}

/// Result of an abort attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AbortOutcome {
    /// The record was moved to ABORTED (kill job submitted if it had a pid).
    Aborted,
    /// The record had already finished; aborting was a no-op.
    AlreadyFinished { status: RequestStatus },
}

/// The request execution engine.
pub struct Engine<S, R> {
    store: Arc<S>,
    lanes: HashMap<ScheduleType, Arc<dyn RequestQueue>>,
    plan: WorkerPlan,
    runner: Arc<R>,
    registry: Arc<EntrypointRegistry>,
    config: EngineConfig,
}

impl<S, R> Engine<S, R>
where
    S: RequestStore + 'static,
    R: ChildRunner + 'static,
{
    pub fn new(
        store: Arc<S>,
        lanes: HashMap<ScheduleType, Arc<dyn RequestQueue>>,
        plan: WorkerPlan,
        runner: Arc<R>,
        registry: Arc<EntrypointRegistry>,
        config: EngineConfig,
    ) -> Self {
        Engine {
            store,
            lanes,
            plan,
            runner,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn plan(&self) -> WorkerPlan {
        self.plan
    }

    pub fn registry(&self) -> &Arc<EntrypointRegistry> {
        &self.registry
    }

    pub fn lane(&self, schedule_type: ScheduleType) -> &Arc<dyn RequestQueue> {
        &self.lanes[&schedule_type]
    }

    /// Where a request's combined stdout/stderr lives.
    pub fn log_path_for(&self, request_id: RequestId) -> PathBuf {
        self.config.log_dir.join(format!("{request_id}.log"))
    }

    /// Create the durable record and enqueue the request.
    ///
    /// The log file exists (empty) before the record does, so any reader
    /// that sees the record can open its log. Duplicate ids are accepted
    /// silently: the first submission wins and nothing is re-enqueued.
    #[tracing::instrument(
        skip_all,
        fields(request_id = %submit.request_id, name = %submit.name, lane = %submit.schedule_type)
    )]
    pub async fn submit(&self, submit: SubmitRequest) -> Result<()> {
        let log_path = self.log_path_for(submit.request_id);
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;

        let record = RequestRecord::new(
            submit.request_id,
            submit.name,
            submit.entrypoint,
            submit.body,
            submit.schedule_type,
            log_path,
        );
        if !self.store.create_if_not_exists(&record).await? {
            tracing::debug!("Request already exists, not re-enqueuing");
            return Ok(());
        }

        let lane = self.lanes.get(&submit.schedule_type).ok_or_else(|| {
            StratusError::Internal(format!("no lane for schedule type {}", submit.schedule_type))
        })?;
        lane.put(QueueElement {
            request_id: submit.request_id,
            ignore_return_value: submit.ignore_return_value,
        })
        .await?;
        tracing::info!("Request enqueued");
        Ok(())
    }

    /// Abort one request.
    ///
    /// Flips the record to ABORTED (valid from PENDING or RUNNING); if the
    /// record held a pid, submits a BLOCKING kill-tree job for it. Aborting
    /// a finished record is a no-op.
    #[tracing::instrument(skip(self), fields(request_id = %request_id))]
    pub async fn abort(&self, request_id: RequestId) -> Result<AbortOutcome> {
        let record = self
            .store
            .get(request_id)
            .await?
            .ok_or(StratusError::RequestNotFound(request_id))?;
        if record.status.is_terminal() {
            tracing::info!(status = %record.status, "Request already finished, abort is a no-op");
            return Ok(AbortOutcome::AlreadyFinished {
                status: record.status,
            });
        }

        let updated = match self
            .store
            .update(request_id, |r| {
                r.status = RequestStatus::Aborted;
                Ok(())
            })
            .await
        {
            Ok(updated) => updated,
            // Lost the race against the child writing its terminal state.
            Err(StratusError::InvalidTransition { from, .. }) => {
                return Ok(AbortOutcome::AlreadyFinished { status: from });
            }
            Err(err) => return Err(err),
        };
        tracing::info!("Request marked aborted");

        if let Some(pid) = updated.pid {
            self.submit(SubmitRequest {
                request_id: RequestId::from(Uuid::new_v4()),
                name: KILL_PROCESS_TREE.to_string(),
                entrypoint: KILL_PROCESS_TREE.to_string(),
                body: RequestPayload {
                    kwargs: json!({"parent_pids": [pid], "force": true}),
                    ..RequestPayload::default()
                },
                schedule_type: ScheduleType::Blocking,
                ignore_return_value: true,
            })
            .await?;
            tracing::info!(pid, "Submitted kill job for aborted request");
        }

        Ok(AbortOutcome::Aborted)
    }

    /// Abort every PENDING or RUNNING request.
    pub async fn abort_all(&self) -> Result<Vec<(RequestId, AbortOutcome)>> {
        let active = self.store.list(&RequestFilter::active()).await?;
        let mut outcomes = Vec::with_capacity(active.len());
        for record in active {
            // Skip our own kill jobs or they would abort each other.
            if record.entrypoint == KILL_PROCESS_TREE {
                continue;
            }
            let outcome = self.abort(record.request_id).await?;
            outcomes.push((record.request_id, outcome));
        }
        Ok(outcomes)
    }

    /// Build the workers the plan calls for: `blocking_workers` workers on
    /// the BLOCKING lane with one slot each, and a single NON_BLOCKING
    /// worker owning the whole slot pool.
    pub fn build_workers(&self) -> Vec<(String, Arc<Worker<S, R>>)> {
        let mut workers = Vec::with_capacity(self.plan.blocking_workers + 1);
        for worker_id in 0..self.plan.blocking_workers {
            workers.push((
                format!("worker-blocking-{worker_id}"),
                Arc::new(Worker::new(
                    ScheduleType::Blocking,
                    worker_id,
                    1,
                    self.store.clone(),
                    self.lanes[&ScheduleType::Blocking].clone(),
                    self.runner.clone(),
                    self.config.worker.clone(),
                )),
            ));
        }
        workers.push((
            "worker-non-blocking-0".to_string(),
            Arc::new(Worker::new(
                ScheduleType::NonBlocking,
                0,
                self.plan.nonblocking_slots,
                self.store.clone(),
                self.lanes[&ScheduleType::NonBlocking].clone(),
                self.runner.clone(),
                self.config.worker.clone(),
            )),
        ));
        workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::child::InlineChildRunner;
    use crate::exec::executor::ExecSettings;
    use crate::plan::WorkerPlan;
    use crate::queue::memory::MemoryQueue;
    use crate::registry::{Entrypoint, ExecutionContext};
    use crate::store::sqlite::SqliteRequestStore;
    use async_trait::async_trait;
    use serde_json::Value;
    use sqlx::SqlitePool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl Entrypoint for Counter {
        async fn run(&self, _ctx: ExecutionContext) -> anyhow::Result<Value> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(json!("counted"))
        }
    }

    fn engine(
        pool: SqlitePool,
        registry: EntrypointRegistry,
        log_dir: PathBuf,
    ) -> Engine<SqliteRequestStore, InlineChildRunner<SqliteRequestStore>> {
        let store = Arc::new(SqliteRequestStore::new(pool));
        let registry = Arc::new(registry);
        let mut lanes: HashMap<ScheduleType, Arc<dyn RequestQueue>> = HashMap::new();
        for lane in ScheduleType::lanes() {
            lanes.insert(lane, Arc::new(MemoryQueue::new()));
        }
        let runner = Arc::new(InlineChildRunner::new(
            store.clone(),
            registry.clone(),
            ExecSettings::default(),
        ));
        Engine::new(
            store,
            lanes,
            WorkerPlan {
                blocking_workers: 2,
                nonblocking_slots: 4,
            },
            runner,
            registry,
            EngineConfig {
                log_dir,
                worker: WorkerConfig {
                    poll_interval: Duration::from_millis(10),
                },
            },
        )
    }

    fn submission(id: RequestId, entrypoint: &str, lane: ScheduleType) -> SubmitRequest {
        SubmitRequest {
            request_id: id,
            name: entrypoint.to_string(),
            entrypoint: entrypoint.to_string(),
            body: RequestPayload::default(),
            schedule_type: lane,
            ignore_return_value: false,
        }
    }

    #[sqlx::test]
    async fn submit_creates_the_log_file_before_the_record(pool: SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            pool,
            EntrypointRegistry::with_builtins(),
            dir.path().to_path_buf(),
        );

        let id = RequestId::from(Uuid::new_v4());
        engine
            .submit(submission(id, "counter", ScheduleType::Blocking))
            .await
            .unwrap();

        let record = engine.store().get(id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Pending);
        assert!(record.log_path.exists());
        assert_eq!(engine.lane(ScheduleType::Blocking).len().await.unwrap(), 1);
    }

    #[sqlx::test]
    async fn duplicate_submission_runs_exactly_once(pool: SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            pool,
            EntrypointRegistry::with_builtins(),
            dir.path().to_path_buf(),
        );

        let id = RequestId::from(Uuid::new_v4());
        engine
            .submit(submission(id, "counter", ScheduleType::Blocking))
            .await
            .unwrap();
        engine
            .submit(submission(id, "counter", ScheduleType::Blocking))
            .await
            .unwrap();

        // Second submit was silently dropped: nothing re-enqueued.
        assert_eq!(engine.lane(ScheduleType::Blocking).len().await.unwrap(), 1);
    }

    #[sqlx::test]
    async fn abort_of_unknown_request_is_not_found(pool: SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            pool,
            EntrypointRegistry::with_builtins(),
            dir.path().to_path_buf(),
        );
        let err = engine
            .abort(RequestId::from(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, StratusError::RequestNotFound(_)));
    }

    #[sqlx::test]
    async fn abort_of_pending_request_needs_no_kill_job(pool: SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            pool,
            EntrypointRegistry::with_builtins(),
            dir.path().to_path_buf(),
        );

        let id = RequestId::from(Uuid::new_v4());
        engine
            .submit(submission(id, "counter", ScheduleType::NonBlocking))
            .await
            .unwrap();

        assert_eq!(engine.abort(id).await.unwrap(), AbortOutcome::Aborted);
        let record = engine.store().get(id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Aborted);
        // No pid, so no kill job landed on the blocking lane.
        assert_eq!(engine.lane(ScheduleType::Blocking).len().await.unwrap(), 0);
    }

    #[sqlx::test]
    async fn abort_of_running_request_submits_a_kill_job(pool: SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            pool,
            EntrypointRegistry::with_builtins(),
            dir.path().to_path_buf(),
        );

        let id = RequestId::from(Uuid::new_v4());
        engine
            .submit(submission(id, "counter", ScheduleType::NonBlocking))
            .await
            .unwrap();
        engine
            .store()
            .update(id, |r| {
                r.pid = Some(424242);
                r.status = RequestStatus::Running;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(engine.abort(id).await.unwrap(), AbortOutcome::Aborted);
        // The kill job is a BLOCKING request of the builtin kind.
        let element = engine
            .lane(ScheduleType::Blocking)
            .get()
            .await
            .unwrap()
            .expect("kill job enqueued");
        let kill_record = engine
            .store()
            .get(element.request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kill_record.entrypoint, KILL_PROCESS_TREE);
        assert_eq!(
            kill_record.request_body.kwargs["parent_pids"],
            json!([424242])
        );
    }

    #[sqlx::test]
    async fn abort_of_finished_request_is_a_no_op(pool: SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            pool,
            EntrypointRegistry::with_builtins(),
            dir.path().to_path_buf(),
        );

        let id = RequestId::from(Uuid::new_v4());
        engine
            .submit(submission(id, "counter", ScheduleType::NonBlocking))
            .await
            .unwrap();
        engine
            .store()
            .update(id, |r| {
                r.status = RequestStatus::Running;
                Ok(())
            })
            .await
            .unwrap();
        engine
            .store()
            .update(id, |r| {
                r.status = RequestStatus::Succeeded;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(
            engine.abort(id).await.unwrap(),
            AbortOutcome::AlreadyFinished {
                status: RequestStatus::Succeeded
            }
        );
    }

    #[sqlx::test]
    async fn abort_all_covers_pending_and_running_but_not_kill_jobs(pool: SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = EntrypointRegistry::with_builtins();
        registry.register("counter", Arc::new(Counter(counter)));
        let engine = engine(pool, registry, dir.path().to_path_buf());

        let pending = RequestId::from(Uuid::new_v4());
        engine
            .submit(submission(pending, "counter", ScheduleType::NonBlocking))
            .await
            .unwrap();

        let running = RequestId::from(Uuid::new_v4());
        engine
            .submit(submission(running, "counter", ScheduleType::NonBlocking))
            .await
            .unwrap();
        engine
            .store()
            .update(running, |r| {
                r.pid = Some(515151);
                r.status = RequestStatus::Running;
                Ok(())
            })
            .await
            .unwrap();

        let outcomes = engine.abort_all().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(
            outcomes
                .iter()
                .all(|(_, outcome)| *outcome == AbortOutcome::Aborted)
        );

        // A second sweep only sees the kill job, which it skips.
        let outcomes = engine.abort_all().await.unwrap();
        assert!(outcomes.is_empty());
    }

    #[sqlx::test]
    async fn workers_follow_the_plan(pool: SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            pool,
            EntrypointRegistry::with_builtins(),
            dir.path().to_path_buf(),
        );
        let workers = engine.build_workers();
        // 2 blocking workers + 1 non-blocking.
        assert_eq!(workers.len(), 3);
        assert_eq!(workers[0].0, "worker-blocking-0");
        assert_eq!(workers[2].0, "worker-non-blocking-0");
    }

    #[sqlx::test]
    async fn end_to_end_submit_runs_through_workers(pool: SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = EntrypointRegistry::with_builtins();
        registry.register("counter", Arc::new(Counter(counter.clone())));
        let engine = Arc::new(engine(pool, registry, dir.path().to_path_buf()));

        let shutdown = CancellationToken::new();
        for (_, worker) in engine.build_workers() {
            tokio::spawn(worker.run(shutdown.clone()));
        }

        let id = RequestId::from(Uuid::new_v4());
        engine
            .submit(submission(id, "counter", ScheduleType::Blocking))
            .await
            .unwrap();

        let start = std::time::Instant::now();
        loop {
            let record = engine.store().get(id).await.unwrap().unwrap();
            if record.status.is_terminal() {
                assert_eq!(record.status, RequestStatus::Succeeded);
                assert_eq!(record.return_value, Some(json!("counted")));
                break;
            }
            assert!(start.elapsed() < Duration::from_secs(5));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        shutdown.cancel();
    }
}
