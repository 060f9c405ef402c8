//! Reaper: reconciles RUNNING records whose child died without writing a
//! terminal state (signal, OOM kill, machine reset mid-request).
//!
//! The worker only observes the child's exit; if the child never reached
//! its terminal update, the record would stay RUNNING forever. This loop
//! probes pid liveness at an interval and marks orphans FAILED with a
//! synthetic error.

use std::sync::Arc;
use std::time::Duration;

use stratus::exec::child::pid_alive;
use stratus::{RequestError, RequestFilter, RequestStatus, RequestStore, StratusError};
use tokio_util::sync::CancellationToken;

pub async fn run_reaper<S: RequestStore>(
    store: Arc<S>,
    interval: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    tracing::info!(interval_ms = interval.as_millis() as u64, "Reaper started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }

        if let Err(err) = sweep(store.as_ref()).await {
            tracing::warn!(error = %err, "Reaper sweep failed");
        }
    }
}

async fn sweep<S: RequestStore>(store: &S) -> stratus::Result<()> {
    let running = store
        .list(&RequestFilter::with_status(RequestStatus::Running))
        .await?;
    for record in running {
        // Inline executions carry no pid and are reconciled by their own
        // process; only real children are probed.
        let Some(pid) = record.pid else { continue };
        if pid_alive(pid as i32) {
            continue;
        }

        tracing::warn!(
            request_id = %record.request_id,
            pid,
            "Child process died without a terminal state, marking failed"
        );
        match store
            .update(record.request_id, move |r| {
                r.status = RequestStatus::Failed;
                r.error = Some(RequestError {
                    kind: "WorkerCrashed".to_string(),
                    message: format!("worker process {pid} died without reporting a result"),
                    stacktrace: String::new(),
                });
                Ok(())
            })
            .await
        {
            Ok(_) => {}
            // The child won the race and wrote its state after our probe.
            Err(StratusError::InvalidTransition { .. }) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;
    use stratus::{RequestId, RequestPayload, RequestRecord, ScheduleType, SqliteRequestStore};
    use uuid::Uuid;

    async fn running_record(store: &SqliteRequestStore, pid: Option<i64>) -> RequestId {
        let id = RequestId::from(Uuid::new_v4());
        let record = RequestRecord::new(
            id,
            "launch",
            "launch",
            RequestPayload::default(),
            ScheduleType::Blocking,
            std::env::temp_dir().join(format!("{id}.log")),
        );
        store.create_if_not_exists(&record).await.unwrap();
        store
            .update(id, move |r| {
                r.pid = pid;
                r.status = RequestStatus::Running;
                Ok(())
            })
            .await
            .unwrap();
        id
    }

    #[sqlx::test(migrations = "../stratus/migrations")]
    async fn dead_pids_are_marked_failed(pool: SqlitePool) {
        let store = SqliteRequestStore::new(pool);

        // A process that has already exited: spawn and reap one.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id() as i64;
        child.wait().unwrap();
        let orphan = running_record(&store, Some(dead_pid)).await;

        // Our own pid is alive.
        let live = running_record(&store, Some(std::process::id() as i64)).await;

        // Inline execution: no pid recorded.
        let inline = running_record(&store, None).await;

        sweep(&store).await.unwrap();

        let orphan_record = store.get(orphan).await.unwrap().unwrap();
        assert_eq!(orphan_record.status, RequestStatus::Failed);
        assert_eq!(orphan_record.error.unwrap().kind, "WorkerCrashed");

        assert_eq!(
            store.get(live).await.unwrap().unwrap().status,
            RequestStatus::Running
        );
        assert_eq!(
            store.get(inline).await.unwrap().unwrap().status,
            RequestStatus::Running
        );
    }
}
