//! # nimctl: Control Plane for Cloud Workload Operations
//!
//! `nimctl` is the API server of the Nimbus workload manager. Clients
//! submit long-running operations (cluster provisioning, job launch, log
//! tailing, storage management) over HTTP; the server enqueues each one on
//! the [stratus] execution engine, which runs it asynchronously in an
//! isolated child process, persists per-request state and logs, and lets
//! clients poll status, stream logs, and abort in-flight work.
//!
//! ## Architecture
//!
//! The application is built on [Axum](https://github.com/tokio-rs/axum)
//! for the HTTP layer, with a SQLite file as the durable request store.
//! A submission handler creates the durable record and places it on one of
//! two FIFO lanes (BLOCKING for heavy serialized operations, NON_BLOCKING
//! for short multiplexed ones); per-lane workers sized from host resources
//! spawn one child process per request by re-executing this binary with
//! the `run-request` subcommand. The child's stdout/stderr are mapped onto
//! the request's log file, which `/stream` tails for clients.
//!
//! Every HTTP response carries an `X-Request-ID` header; for submission
//! endpoints that id is the durable request id, which `/get` long-polls to
//! a terminal state.
//!
//! **Background services** run alongside the HTTP server: the engine's
//! worker loops, and a reaper that marks RUNNING records whose child died
//! without reporting a result.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use nimctl::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = nimctl::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     nimctl::telemetry::init_telemetry()?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod child;
pub mod config;
pub mod errors;
pub mod middleware;
pub mod operations;
pub mod reaper;
pub mod telemetry;

#[cfg(test)]
pub mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router,
    routing::{get, post},
};
pub use config::Config;
use stratus::{
    ChildRunner, Engine, EngineConfig, ProcessChildRunner, SqliteRequestStore, WorkerConfig,
    WorkerPlan,
};
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, instrument};

/// Application state shared across all request handlers.
///
/// Generic over the child runner so tests can execute requests inline while
/// production spawns real processes.
pub struct AppState<R: ChildRunner + 'static> {
    pub config: Config,
    pub engine: Arc<Engine<SqliteRequestStore, R>>,
}

impl<R: ChildRunner + 'static> Clone for AppState<R> {
    fn clone(&self) -> Self {
        AppState {
            config: self.config.clone(),
            engine: self.engine.clone(),
        }
    }
}

/// Build the application router with all endpoints and middleware.
///
/// Domain operations follow one pattern: `(name, entrypoint kind, schedule
/// type)` bound over the shared submission path. The engine-observation
/// endpoints (`/get`, `/stream`, `/abort`, `/requests`, `/health`) sit next
/// to them.
pub fn build_router<R: ChildRunner + 'static>(state: AppState<R>) -> Router {
    Router::new()
        // Domain operations
        .route("/launch", post(api::handlers::operations::launch))
        .route("/exec", post(api::handlers::operations::exec))
        .route("/stop", post(api::handlers::operations::stop))
        .route("/start", post(api::handlers::operations::start))
        .route("/down", post(api::handlers::operations::down))
        .route("/status", post(api::handlers::operations::status))
        .route("/logs", post(api::handlers::operations::logs))
        .route("/cost_report", get(api::handlers::operations::cost_report))
        .route("/storage/ls", get(api::handlers::operations::storage_ls))
        .route(
            "/storage/delete",
            post(api::handlers::operations::storage_delete),
        )
        // Engine observation and control
        .route("/get", get(api::handlers::requests::get_request))
        .route("/stream", get(api::handlers::stream::stream))
        .route("/abort", post(api::handlers::requests::abort))
        .route(
            "/requests",
            get(api::handlers::requests::list_requests)
                .post(api::handlers::requests::list_requests_body),
        )
        .route("/upload", post(api::handlers::uploads::upload))
        .route("/health", get(api::handlers::health::health))
        .with_state(state)
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(middleware::cors_layer())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// The engine's long-lived tasks: the per-lane worker loops and the
/// reaper.
///
/// The set is fixed at startup, so any member stopping while the server is
/// still serving would leave requests sitting on a lane forever; the
/// server treats that as fatal. Each task resolves to its own name plus
/// outcome, so failures are attributable without bookkeeping.
pub struct BackgroundServices {
    tasks: tokio::task::JoinSet<(String, anyhow::Result<()>)>,
    shutdown_token: tokio_util::sync::CancellationToken,
    _drop_guard: tokio_util::sync::DropGuard,
}

impl BackgroundServices {
    /// Spawn the workers the plan calls for, plus the reaper.
    fn start(
        engine: &Arc<Engine<SqliteRequestStore, ProcessChildRunner>>,
        config: &Config,
    ) -> Self {
        let shutdown_token = tokio_util::sync::CancellationToken::new();
        let mut tasks = tokio::task::JoinSet::new();

        for (name, worker) in engine.build_workers() {
            let worker_shutdown = shutdown_token.clone();
            tasks.spawn(async move {
                let result = worker.run(worker_shutdown).await.map_err(Into::into);
                (name, result)
            });
        }

        if config.reaper.enabled {
            let store = engine.store().clone();
            let interval = Duration::from_millis(config.reaper.interval_ms);
            let reaper_shutdown = shutdown_token.clone();
            tasks.spawn(async move {
                let result = reaper::run_reaper(store, interval, reaper_shutdown).await;
                ("reaper".to_string(), result)
            });
        } else {
            info!("Reaper disabled by configuration");
        }

        BackgroundServices {
            tasks,
            _drop_guard: shutdown_token.clone().drop_guard(),
            shutdown_token,
        }
    }

    /// Resolve with the reason once any task stops.
    ///
    /// A worker or the reaper returning at all (cleanly or not) before
    /// shutdown is a failure of the engine, not a normal completion.
    pub async fn failed(&mut self) -> anyhow::Error {
        match self.tasks.join_next().await {
            // The plan guarantees at least two workers, so an empty set is
            // unreachable in practice; park instead of spinning if it ever
            // happens.
            None => std::future::pending::<anyhow::Error>().await,
            Some(Ok((name, Ok(())))) => {
                anyhow::anyhow!("{name} stopped while the server was still running")
            }
            Some(Ok((name, Err(err)))) => err.context(format!("{name} failed")),
            Some(Err(join_err)) => anyhow::anyhow!("a background task panicked: {join_err}"),
        }
    }

    /// Stop the workers and the reaper, waiting for in-flight children to
    /// settle.
    pub async fn shutdown(mut self) {
        self.shutdown_token.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    tracing::debug!(task = %name, "Background task stopped");
                }
                Ok((name, Err(err))) => {
                    tracing::warn!(task = %name, error = %err, "Background task stopped with an error");
                }
                Err(join_err) => {
                    tracing::warn!(error = %join_err, "Background task panicked during shutdown");
                }
            }
        }
    }
}

/// Main application struct that owns all resources and lifecycle.
///
/// 1. **Create**: [`Application::new`] opens the store, probes the queue
///    backend, computes the worker plan, and starts background services.
/// 2. **Serve**: [`Application::serve`] binds the TCP port and handles
///    requests until the shutdown signal.
/// 3. **Shutdown**: background services stop gracefully; in-flight
///    children finish or are left for the reaper.
pub struct Application {
    router: Router,
    config: Config,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    #[instrument(skip_all)]
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        tracing::debug!("Starting control plane with configuration: {:#?}", config);

        tokio::fs::create_dir_all(&config.state_dir)
            .await
            .context("create state directory")?;
        tokio::fs::create_dir_all(config.log_dir())
            .await
            .context("create log directory")?;

        let store = Arc::new(
            SqliteRequestStore::connect(&config.db_path())
                .await
                .context("open request store")?,
        );

        // Queue backend: redis when reachable, in-process otherwise.
        let backend = stratus::detect_backend(
            config.queue.redis_url.as_deref(),
            Duration::from_millis(config.queue.ping_timeout_ms),
        )
        .await;
        let lanes = stratus::open_lanes(backend, config.queue.redis_url.as_deref())
            .await
            .context("open request queues")?;

        let plan = WorkerPlan::detect(&config.planner, config.deploy);

        // Children re-exec this binary with the same config.
        let runner = Arc::new(
            ProcessChildRunner::current_exe(vec![
                "--config".to_string(),
                config.config_path.clone(),
                "run-request".to_string(),
            ])
            .context("resolve server binary for child spawning")?,
        );

        let registry = Arc::new(operations::build_registry());
        let engine = Arc::new(Engine::new(
            store,
            lanes,
            plan,
            runner,
            registry,
            EngineConfig {
                log_dir: config.log_dir(),
                worker: WorkerConfig {
                    poll_interval: Duration::from_millis(config.poll_interval_ms),
                },
            },
        ));

        let bg_services = BackgroundServices::start(&engine, &config);

        let state = AppState {
            config: config.clone(),
            engine,
        };
        let router = build_router(state);

        Ok(Self {
            router,
            config,
            bg_services,
        })
    }

    /// Start serving the application
    pub async fn serve<F>(mut self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("bind {bind_addr}"))?;
        info!("Control plane listening on http://{}", bind_addr);

        // Race the server against background task failures (fail-fast)
        let server_error: Option<anyhow::Error> = tokio::select! {
            result = axum::serve(listener, self.router).with_graceful_shutdown(shutdown) => {
                result.err().map(Into::into) // None if server shut down cleanly
            }
            err = self.bg_services.failed() => {
                tracing::error!(error = %err, "Background service stopped, shutting down");
                Some(err)
            }
        };

        info!("Shutting down background services...");
        self.bg_services.shutdown().await;

        if let Some(e) = server_error {
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::test_utils::*;
    use axum::http::StatusCode;
    use serde_json::{Value, json};
    use sqlx::SqlitePool;
    use std::time::Duration;

    #[sqlx::test(migrations = "../stratus/migrations")]
    async fn health_banner_with_request_id_header(pool: SqlitePool) {
        let (server, _app) = create_test_app(pool).await;
        let response = server.get("/health").await;
        response.assert_status_ok();
        assert!(response.text().contains("healthy"));
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[sqlx::test(migrations = "../stratus/migrations")]
    #[test_log::test]
    async fn launch_runs_to_succeeded_via_long_poll(pool: SqlitePool) {
        let (server, app) = create_test_app(pool).await;

        let response = server
            .post("/launch")
            .json(&json!({
                "cluster_name": "dev",
                "task": "resources: {}",
                "env_vars": {"NIMBUS_USER_ID": "abc123"},
                "entrypoint_command": "nimbus launch task.yaml"
            }))
            .await;
        response.assert_status(StatusCode::ACCEPTED);
        let request_id = response
            .headers()
            .get("x-request-id")
            .expect("request id header")
            .to_str()
            .unwrap()
            .to_string();

        // Long-poll until terminal.
        let record: Value = server
            .get("/get")
            .add_query_param("request_id", &request_id)
            .await
            .json();
        assert_eq!(record["status"], "SUCCEEDED");
        assert_eq!(record["return_value"]["cluster_name"], "dev");
        assert_eq!(record["return_value"]["job_id"], 1);
        assert_eq!(record["user_id"], "abc123");
        assert!(record["error"].is_null());

        // The log file existed from creation.
        let log_path = std::path::PathBuf::from(record["log_path"].as_str().unwrap());
        assert!(log_path.exists());

        drop(app);
    }

    #[sqlx::test(migrations = "../stratus/migrations")]
    async fn malformed_operation_bodies_are_rejected_up_front(pool: SqlitePool) {
        let (server, _app) = create_test_app(pool).await;

        // cluster_name is required and typed; the body never reaches the
        // engine.
        let response = server.post("/launch").json(&json!({})).await;
        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);

        let listing: Value = server.get("/requests").await.json();
        assert!(listing.as_array().unwrap().is_empty());
    }

    #[sqlx::test(migrations = "../stratus/migrations")]
    async fn get_unknown_request_is_404(pool: SqlitePool) {
        let (server, _app) = create_test_app(pool).await;
        let response = server
            .get("/get")
            .add_query_param("request_id", uuid::Uuid::new_v4().to_string())
            .await;
        response.assert_status(StatusCode::NOT_FOUND);

        let response = server
            .get("/get")
            .add_query_param("request_id", "not-a-uuid")
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[sqlx::test(migrations = "../stratus/migrations")]
    async fn abort_interrupts_a_running_request(pool: SqlitePool) {
        let (server, app) = create_test_app(pool).await;

        // `logs` with follow=true runs until aborted.
        let response = server
            .post("/logs")
            .json(&json!({"cluster_name": "dev", "follow": true}))
            .await;
        response.assert_status(StatusCode::ACCEPTED);
        let request_id = response
            .headers()
            .get("x-request-id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        wait_for_status(&app, &request_id, "RUNNING", Duration::from_secs(5)).await;

        let response = server
            .post("/abort")
            .json(&json!({"request_id": request_id}))
            .await;
        response.assert_status_ok();
        let outcomes: Value = response.json();
        assert_eq!(outcomes[0]["outcome"], "aborted");

        wait_for_status(&app, &request_id, "ABORTED", Duration::from_secs(5)).await;

        // Aborting again is a no-op reporting the terminal state.
        let response = server
            .post("/abort")
            .json(&json!({"request_id": request_id}))
            .await;
        response.assert_status_ok();
        let outcomes: Value = response.json();
        assert_eq!(outcomes[0]["outcome"], "already_finished");

        drop(app);
    }

    #[sqlx::test(migrations = "../stratus/migrations")]
    async fn abort_unknown_request_is_404(pool: SqlitePool) {
        let (server, _app) = create_test_app(pool).await;
        let response = server
            .post("/abort")
            .json(&json!({"request_id": uuid::Uuid::new_v4().to_string()}))
            .await;
        response.assert_status(StatusCode::NOT_FOUND);
    }

    #[sqlx::test(migrations = "../stratus/migrations")]
    async fn abort_without_id_sweeps_all_active_requests(pool: SqlitePool) {
        let (server, app) = create_test_app(pool).await;

        let mut ids = Vec::new();
        for _ in 0..2 {
            let response = server
                .post("/logs")
                .json(&json!({"cluster_name": "dev", "follow": true}))
                .await;
            response.assert_status(StatusCode::ACCEPTED);
            ids.push(
                response
                    .headers()
                    .get("x-request-id")
                    .unwrap()
                    .to_str()
                    .unwrap()
                    .to_string(),
            );
        }
        for id in &ids {
            wait_for_status(&app, id, "RUNNING", Duration::from_secs(5)).await;
        }

        let response = server.post("/abort").json(&json!({})).await;
        response.assert_status_ok();
        let outcomes: Value = response.json();
        assert_eq!(outcomes.as_array().unwrap().len(), 2);

        for id in &ids {
            wait_for_status(&app, id, "ABORTED", Duration::from_secs(5)).await;
        }

        drop(app);
    }

    #[sqlx::test(migrations = "../stratus/migrations")]
    async fn requests_listing_is_human_readable(pool: SqlitePool) {
        let (server, app) = create_test_app(pool).await;

        let response = server
            .post("/status")
            .json(&json!({"refresh": true}))
            .await;
        response.assert_status(StatusCode::ACCEPTED);
        let request_id = response
            .headers()
            .get("x-request-id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let listing: Value = server.get("/requests").await.json();
        let entries = listing.as_array().unwrap();
        assert!(!entries.is_empty());
        // A refreshing status schedules on the blocking lane.
        let entry = entries
            .iter()
            .find(|e| e["request_id"] == request_id.as_str())
            .expect("submitted request listed");
        assert_eq!(entry["schedule_type"], "BLOCKING");
        // Summaries carry no payload or result blobs.
        assert!(entry.get("request_body").is_none());
        assert!(entry.get("return_value").is_none());

        // Addressed lookup via POST body.
        let single: Value = server
            .post("/requests")
            .json(&json!({"request_id": request_id}))
            .await
            .json();
        assert_eq!(single.as_array().unwrap().len(), 1);

        // Unknown id is 404.
        let response = server
            .post("/requests")
            .json(&json!({"request_id": uuid::Uuid::new_v4().to_string()}))
            .await;
        response.assert_status(StatusCode::NOT_FOUND);

        drop(app);
    }

    #[sqlx::test(migrations = "../stratus/migrations")]
    async fn stream_plays_back_a_finished_request(pool: SqlitePool) {
        let (server, app) = create_test_app(pool).await;

        let response = server
            .post("/launch")
            .json(&json!({"cluster_name": "dev"}))
            .await;
        let request_id = response
            .headers()
            .get("x-request-id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        wait_for_terminal(&app, &request_id, Duration::from_secs(5)).await;

        let response = server
            .get("/stream")
            .add_query_param("request_id", &request_id)
            .await;
        response.assert_status_ok();
        assert!(
            response
                .headers()
                .get("content-type")
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );

        // Unknown request is 404 up front.
        let response = server
            .get("/stream")
            .add_query_param("request_id", uuid::Uuid::new_v4().to_string())
            .await;
        response.assert_status(StatusCode::NOT_FOUND);

        drop(app);
    }

    #[sqlx::test(migrations = "../stratus/migrations")]
    async fn uploads_land_in_the_user_mounts_tree(pool: SqlitePool) {
        use axum_test::multipart::{MultipartForm, Part};

        let (server, app) = create_test_app(pool).await;

        let form = MultipartForm::new().add_part(
            "file",
            Part::bytes(b"resources: {}".as_slice()).file_name("workdir/task.yaml"),
        );
        let response = server
            .post("/upload")
            .add_query_param("user_hash", "abc123")
            .multipart(form)
            .await;
        response.assert_status_ok();

        let stored = app
            .state
            .config
            .uploads_dir()
            .join("abc123")
            .join("file_mounts")
            .join("workdir/task.yaml");
        assert!(stored.exists());

        // Traversal is rejected.
        let form = MultipartForm::new().add_part(
            "file",
            Part::bytes(b"x".as_slice()).file_name("../escape.txt"),
        );
        let response = server
            .post("/upload")
            .add_query_param("user_hash", "abc123")
            .multipart(form)
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);

        drop(app);
    }
}
