//! Request execution engine for a control-plane API server.
//!
//! This crate accepts submitted operations, materializes a durable record
//! per request, places it on one of two FIFO lanes, and executes it in an
//! isolated child process with redirected output and request-scoped
//! environment overrides. Behind the scenes, per-lane workers sized from
//! host resources pull from the lanes, spawn one child per request, and
//! track every record through a monotonic status state machine with
//! cooperative cancellation.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use stratus::{
//!     Engine, EngineConfig, EntrypointRegistry, ProcessChildRunner, QueueBackend,
//!     SqliteRequestStore, WorkerConfig, WorkerPlan, PlannerConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteRequestStore::connect("state/requests.db".as_ref()).await?);
//!     let lanes = stratus::queue::open_lanes(QueueBackend::Memory, None).await?;
//!     let plan = WorkerPlan::detect(&PlannerConfig::default(), false);
//!     let runner = Arc::new(ProcessChildRunner::current_exe(vec!["run-request".into()])?);
//!     let registry = Arc::new(EntrypointRegistry::with_builtins());
//!
//!     let engine = Arc::new(Engine::new(
//!         store,
//!         lanes,
//!         plan,
//!         runner,
//!         registry,
//!         EngineConfig {
//!             log_dir: "state/logs".into(),
//!             worker: WorkerConfig::default(),
//!         },
//!     ));
//!
//!     let shutdown = tokio_util::sync::CancellationToken::new();
//!     for (_name, worker) in engine.build_workers() {
//!         tokio::spawn(worker.run(shutdown.clone()));
//!     }
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod error;
pub mod exec;
pub mod plan;
pub mod queue;
pub mod registry;
pub mod request;
pub mod store;

// Re-export the types most users touch so `stratus::Engine` works without
// spelling out the module tree.
pub use engine::{AbortOutcome, Engine, EngineConfig, SubmitRequest};
pub use error::{Result, StratusError};
pub use exec::{
    ChildOutcome, ChildRunner, EnvGuard, ExecSettings, InlineChildRunner, ProcessChildRunner,
    Worker, WorkerConfig, execute_request, merge_config_overrides, spawn_term_handler,
};
pub use plan::{PlannerConfig, WorkerPlan, detect_resources};
pub use queue::{QueueBackend, RequestQueue, detect_backend, open_lanes};
pub use registry::{Entrypoint, EntrypointRegistry, ExecutionContext, KILL_PROCESS_TREE};
pub use request::{
    ENV_VAR_PREFIX, FORCE_COLOR_ENV_VAR, QueueElement, RequestError, RequestId, RequestPayload,
    RequestRecord, RequestStatus, ScheduleType, USER_ID_ENV_VAR,
};
pub use store::sqlite::{SqliteRequestStore, migrator};
pub use store::{RequestFilter, RequestStore};
