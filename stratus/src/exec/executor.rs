//! The code that runs inside a child execution.
//!
//! Whether the child is a real spawned process or an inline task in tests,
//! the sequence is the same: record the pid and go RUNNING, apply the
//! request's scoped overrides, invoke the registered entrypoint, and write
//! the terminal state. The environment guard restores the process state on
//! every exit path, because the inline runner shares its process with the
//! worker.

use tokio_util::sync::CancellationToken;

use crate::error::{Result, StratusError};
use crate::exec::overrides::{EnvGuard, merge_config_overrides};
use crate::registry::{EntrypointRegistry, ExecutionContext};
use crate::request::{RequestError, RequestId, RequestStatus};
use crate::store::RequestStore;

/// Server-side settings the executor needs beyond the record itself.
#[derive(Debug, Clone, Default)]
pub struct ExecSettings {
    /// The server's own config; request overrides are merged over it.
    pub base_config: serde_json::Value,
    /// Dot-separated config paths clients may not override.
    pub config_deny_keys: Vec<String>,
}

enum Outcome {
    Succeeded(serde_json::Value),
    Failed(RequestError),
    Interrupted,
}

/// Bridge SIGTERM to a cancellation token (the cooperative interrupt).
///
/// Must be called from within a tokio runtime. Only the first TERM matters;
/// a repeat signal is left to the default disposition once the process is
/// already unwinding.
pub fn spawn_term_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let handler_token = token.clone();
        tokio::spawn(async move {
            sigterm.recv().await;
            tracing::info!("Received TERM, raising cooperative interrupt");
            handler_token.cancel();
        });
    }
    Ok(token)
}

/// Write a terminal state, tolerating a concurrent abort that got there
/// first (the record keeps the aborter's state).
async fn finalize<S, F>(store: &S, request_id: RequestId, mutate: F) -> Result<()>
where
    S: RequestStore,
    F: FnMut(&mut crate::request::RequestRecord) -> Result<()> + Send,
{
    match store.update(request_id, mutate).await {
        Ok(_) => Ok(()),
        Err(StratusError::InvalidTransition { from, to, .. }) => {
            tracing::debug!(from = %from, to = %to, "Record already terminal, leaving it as-is");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Run one request to a terminal state.
///
/// `pid` is the child's own OS pid, or `None` for inline execution.
/// Returns `Ok(())` for every request-level outcome (success, failure,
/// interrupt); an `Err` means the engine itself could not make progress.
#[tracing::instrument(skip_all, fields(request_id = %request_id))]
pub async fn execute_request<S: RequestStore>(
    store: &S,
    registry: &EntrypointRegistry,
    settings: &ExecSettings,
    request_id: RequestId,
    ignore_return_value: bool,
    pid: Option<i64>,
    cancel: CancellationToken,
) -> Result<()> {
    // PENDING -> RUNNING, recording the pid in the same atomic update so no
    // reader ever observes RUNNING without a pid (for process children).
    let record = match store
        .update(request_id, |r| {
            r.pid = pid;
            r.status = RequestStatus::Running;
            Ok(())
        })
        .await
    {
        Ok(record) => record,
        Err(StratusError::InvalidTransition { from, .. }) => {
            // Aborted (or otherwise finished) before we started.
            tracing::info!(from = %from, "Request no longer runnable, skipping execution");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    tracing::info!(name = %record.name, pid = ?pid, "Running request");

    let Some(entrypoint) = registry.get(&record.entrypoint) else {
        let kind = record.entrypoint.clone();
        store
            .update(request_id, move |r| {
                r.status = RequestStatus::Failed;
                r.error = Some(RequestError {
                    kind: "UnknownEntrypoint".to_string(),
                    message: format!("no entrypoint registered for kind {kind:?}"),
                    stacktrace: String::new(),
                });
                Ok(())
            })
            .await?;
        return Ok(());
    };

    let payload = record.request_body;
    let ctx = ExecutionContext {
        request_id,
        kwargs: payload.kwargs.clone(),
        env_vars: payload.env_vars.clone(),
        config: merge_config_overrides(
            &settings.base_config,
            &payload.config_overrides,
            &settings.config_deny_keys,
        ),
        cancel: cancel.clone(),
    };

    let outcome = {
        let _overrides = EnvGuard::for_request(&payload.env_vars);
        // A spawned task turns entrypoint panics into JoinErrors instead of
        // unwinding through the executor.
        let mut handle = tokio::spawn(async move { entrypoint.run(ctx).await });
        tokio::select! {
            _ = cancel.cancelled() => {
                handle.abort();
                Outcome::Interrupted
            }
            joined = &mut handle => match joined {
                Ok(Ok(value)) => Outcome::Succeeded(value),
                Ok(Err(err)) => Outcome::Failed(RequestError::from_error(&err)),
                Err(join_err) if join_err.is_panic() => Outcome::Failed(RequestError {
                    kind: "Panic".to_string(),
                    message: "entrypoint panicked".to_string(),
                    stacktrace: format!("{join_err}"),
                }),
                Err(join_err) => Outcome::Failed(RequestError {
                    kind: "ExecutionError".to_string(),
                    message: format!("entrypoint task ended unexpectedly: {join_err}"),
                    stacktrace: String::new(),
                }),
            }
        }
        // Guard drops here: prior environment restored on every path.
    };

    match outcome {
        Outcome::Succeeded(value) => {
            finalize(store, request_id, move |r| {
                r.status = RequestStatus::Succeeded;
                if !ignore_return_value {
                    r.return_value = Some(value.clone());
                }
                Ok(())
            })
            .await?;
            tracing::info!("Request succeeded");
        }
        Outcome::Failed(error) => {
            tracing::info!(error = %error.message, "Request failed");
            finalize(store, request_id, move |r| {
                r.status = RequestStatus::Failed;
                r.error = Some(error.clone());
                Ok(())
            })
            .await?;
        }
        Outcome::Interrupted => {
            // The aborter normally set ABORTED already; writing it again is
            // a no-op, and covers a TERM that arrived outside the abort
            // protocol while we were still RUNNING.
            finalize(store, request_id, |r| {
                r.status = RequestStatus::Aborted;
                Ok(())
            })
            .await?;
            tracing::info!("Request interrupted");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Entrypoint;
    use crate::request::{RequestPayload, RequestRecord, ScheduleType};
    use crate::store::sqlite::SqliteRequestStore;
    use async_trait::async_trait;
    use serde_json::json;
    use sqlx::SqlitePool;
    use std::sync::Arc;
    use uuid::Uuid;

    struct Sum;

    #[async_trait]
    impl Entrypoint for Sum {
        async fn run(&self, ctx: ExecutionContext) -> anyhow::Result<serde_json::Value> {
            let a = ctx.kwargs["a"].as_i64().unwrap_or(0);
            let b = ctx.kwargs["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        }
    }

    struct Fails;

    #[async_trait]
    impl Entrypoint for Fails {
        async fn run(&self, _ctx: ExecutionContext) -> anyhow::Result<serde_json::Value> {
            anyhow::bail!("bad cluster name")
        }
    }

    struct Panics;

    #[async_trait]
    impl Entrypoint for Panics {
        async fn run(&self, _ctx: ExecutionContext) -> anyhow::Result<serde_json::Value> {
            panic!("unreachable state")
        }
    }

    struct SleepForever;

    #[async_trait]
    impl Entrypoint for SleepForever {
        async fn run(&self, ctx: ExecutionContext) -> anyhow::Result<serde_json::Value> {
            ctx.cancel.cancelled().await;
            anyhow::bail!("interrupted")
        }
    }

    fn registry() -> EntrypointRegistry {
        let mut registry = EntrypointRegistry::with_builtins();
        registry.register("sum", Arc::new(Sum));
        registry.register("fails", Arc::new(Fails));
        registry.register("panics", Arc::new(Panics));
        registry.register("sleep_forever", Arc::new(SleepForever));
        registry
    }

    async fn submit(
        store: &SqliteRequestStore,
        entrypoint: &str,
        kwargs: serde_json::Value,
    ) -> RequestId {
        let id = RequestId::from(Uuid::new_v4());
        let record = RequestRecord::new(
            id,
            entrypoint,
            entrypoint,
            RequestPayload {
                kwargs,
                ..RequestPayload::default()
            },
            ScheduleType::NonBlocking,
            std::env::temp_dir().join(format!("{id}.log")),
        );
        assert!(store.create_if_not_exists(&record).await.unwrap());
        id
    }

    #[sqlx::test]
    async fn success_records_the_return_value(pool: SqlitePool) {
        let store = SqliteRequestStore::new(pool);
        let id = submit(&store, "sum", json!({"a": 2, "b": 3})).await;

        execute_request(
            &store,
            &registry(),
            &ExecSettings::default(),
            id,
            false,
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Succeeded);
        assert_eq!(record.return_value, Some(json!(5)));
        assert!(record.error.is_none());
    }

    #[sqlx::test]
    async fn ignore_return_value_drops_the_result(pool: SqlitePool) {
        let store = SqliteRequestStore::new(pool);
        let id = submit(&store, "sum", json!({"a": 2, "b": 3})).await;

        execute_request(
            &store,
            &registry(),
            &ExecSettings::default(),
            id,
            true,
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Succeeded);
        assert!(record.return_value.is_none());
    }

    #[sqlx::test]
    async fn failure_captures_a_structured_error(pool: SqlitePool) {
        let store = SqliteRequestStore::new(pool);
        let id = submit(&store, "fails", json!({})).await;

        execute_request(
            &store,
            &registry(),
            &ExecSettings::default(),
            id,
            false,
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Failed);
        assert!(record.return_value.is_none());
        let error = record.error.unwrap();
        assert_eq!(error.kind, "ExecutionError");
        assert_eq!(error.message, "bad cluster name");
        assert!(!error.stacktrace.is_empty());
    }

    #[sqlx::test]
    async fn panic_is_contained_and_recorded(pool: SqlitePool) {
        let store = SqliteRequestStore::new(pool);
        let id = submit(&store, "panics", json!({})).await;

        execute_request(
            &store,
            &registry(),
            &ExecSettings::default(),
            id,
            false,
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Failed);
        assert_eq!(record.error.unwrap().kind, "Panic");
    }

    #[sqlx::test]
    async fn cancellation_leaves_the_aborted_status(pool: SqlitePool) {
        let store = SqliteRequestStore::new(pool.clone());
        let id = submit(&store, "sleep_forever", json!({})).await;

        let cancel = CancellationToken::new();
        let exec_store = store.clone();
        let exec_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            execute_request(
                &exec_store,
                &registry(),
                &ExecSettings::default(),
                id,
                false,
                None,
                exec_cancel,
            )
            .await
        });

        // Wait until RUNNING, then abort the way the handler does.
        loop {
            if let Some(record) = store.get(id).await.unwrap() {
                if record.status == RequestStatus::Running {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        store
            .update(id, |r| {
                r.status = RequestStatus::Aborted;
                Ok(())
            })
            .await
            .unwrap();
        cancel.cancel();

        task.await.unwrap().unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Aborted);
        assert!(record.return_value.is_none());
        assert!(record.error.is_none());
    }

    #[sqlx::test]
    async fn aborted_before_start_is_skipped(pool: SqlitePool) {
        let store = SqliteRequestStore::new(pool);
        let id = submit(&store, "sum", json!({"a": 1, "b": 1})).await;
        store
            .update(id, |r| {
                r.status = RequestStatus::Aborted;
                Ok(())
            })
            .await
            .unwrap();

        execute_request(
            &store,
            &registry(),
            &ExecSettings::default(),
            id,
            false,
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Aborted);
        assert!(record.pid.is_none());
    }

    #[sqlx::test]
    async fn unknown_entrypoint_fails_the_request(pool: SqlitePool) {
        let store = SqliteRequestStore::new(pool);
        let id = submit(&store, "no_such_kind", json!({})).await;

        execute_request(
            &store,
            &registry(),
            &ExecSettings::default(),
            id,
            false,
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Failed);
        assert_eq!(record.error.unwrap().kind, "UnknownEntrypoint");
    }
}
