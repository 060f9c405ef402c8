//! Shared helpers for handler and lifecycle tests.
//!
//! Tests run the real router and engine with an [`InlineChildRunner`], so
//! every request exercises the same store transitions and override scoping
//! as production without spawning processes.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::SqlitePool;
use stratus::{
    Engine, EngineConfig, ExecSettings, InlineChildRunner, RequestId, RequestQueue, RequestStore,
    ScheduleType, SqliteRequestStore, WorkerConfig, WorkerPlan, queue::memory::MemoryQueue,
};
use tokio_util::sync::CancellationToken;

use crate::{AppState, Config, build_router, operations};

type TestRunner = InlineChildRunner<SqliteRequestStore>;

/// Everything a test needs to poke at the app behind the HTTP surface.
/// Dropping it cancels the worker loops and removes the state directory.
pub struct TestApp {
    pub state: AppState<TestRunner>,
    pub shutdown: CancellationToken,
    _state_dir: tempfile::TempDir,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Build a test server around a fresh engine with inline execution and
/// in-process queues.
pub async fn create_test_app(pool: SqlitePool) -> (axum_test::TestServer, TestApp) {
    let state_dir = tempfile::tempdir().expect("create state dir");
    let config = Config {
        state_dir: state_dir.path().to_path_buf(),
        poll_interval_ms: 10,
        stream_poll_interval_ms: 10,
        ..Config::default()
    };

    let store = Arc::new(SqliteRequestStore::new(pool));
    let registry = Arc::new(operations::build_registry());
    let mut lanes: HashMap<ScheduleType, Arc<dyn RequestQueue>> = HashMap::new();
    for lane in ScheduleType::lanes() {
        lanes.insert(lane, Arc::new(MemoryQueue::new()));
    }
    let runner = Arc::new(InlineChildRunner::new(
        store.clone(),
        registry.clone(),
        ExecSettings {
            base_config: config.workload_config.clone(),
            config_deny_keys: config.config_deny_keys.clone(),
        },
    ));
    let engine = Arc::new(Engine::new(
        store,
        lanes,
        WorkerPlan {
            blocking_workers: 2,
            nonblocking_slots: 8,
        },
        runner,
        registry,
        EngineConfig {
            log_dir: config.log_dir(),
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(10),
            },
        },
    ));

    let shutdown = CancellationToken::new();
    for (_name, worker) in engine.build_workers() {
        tokio::spawn(worker.run(shutdown.clone()));
    }

    let state = AppState { config, engine };
    let server = axum_test::TestServer::new(build_router(state.clone())).expect("test server");
    (
        server,
        TestApp {
            state,
            shutdown,
            _state_dir: state_dir,
        },
    )
}

/// Poll the store until the request reaches `status`.
pub async fn wait_for_status(app: &TestApp, request_id: &str, status: &str, timeout: Duration) {
    let id = RequestId::from_str(request_id).expect("valid request id");
    let start = Instant::now();
    loop {
        let record = app
            .state
            .engine
            .store()
            .get(id)
            .await
            .expect("read store")
            .expect("request exists");
        if record.status.as_str() == status {
            return;
        }
        assert!(
            start.elapsed() < timeout,
            "request {request_id} stuck in {} waiting for {status}",
            record.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll the store until the request reaches any terminal status.
pub async fn wait_for_terminal(app: &TestApp, request_id: &str, timeout: Duration) {
    let id = RequestId::from_str(request_id).expect("valid request id");
    let start = Instant::now();
    loop {
        let record = app
            .state
            .engine
            .store()
            .get(id)
            .await
            .expect("read store")
            .expect("request exists");
        if record.status.is_terminal() {
            return;
        }
        assert!(
            start.elapsed() < timeout,
            "request {request_id} stuck in {}",
            record.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
