//! Server-side callables for the domain operations.
//!
//! The control plane treats these as opaque: each one is a stand-in
//! controller client that reports progress on stdout (which the worker has
//! mapped onto the request's log file) and returns a structured
//! acknowledgement. Long waits select on the cancellation token so aborts
//! unwind them cooperatively.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use stratus::{Entrypoint, EntrypointRegistry, ExecutionContext};

use crate::api::models::requests::{
    ExecArgs, LaunchArgs, LogsArgs, StartArgs, StatusArgs, StopOrDownArgs, StorageDeleteArgs,
};

/// Build the registry every server and child process shares.
///
/// Each HTTP endpoint binds one of these kinds at a fixed schedule type;
/// the engine's built-ins (the kill job) come along via `with_builtins`.
pub fn build_registry() -> EntrypointRegistry {
    let mut registry = EntrypointRegistry::with_builtins();
    registry.register("launch", Arc::new(Launch));
    registry.register("exec", Arc::new(Exec));
    registry.register("stop", Arc::new(Stop));
    registry.register("start", Arc::new(Start));
    registry.register("down", Arc::new(Down));
    registry.register("status", Arc::new(Status));
    registry.register("logs", Arc::new(Logs));
    registry.register("cost_report", Arc::new(CostReport));
    registry.register("storage_ls", Arc::new(StorageLs));
    registry.register("storage_delete", Arc::new(StorageDelete));
    registry
}

/// Sleep in small steps, bailing out on cancellation.
async fn cancellable_step(ctx: &ExecutionContext, what: &str, pause: Duration) -> anyhow::Result<()> {
    println!("{what}");
    tokio::select! {
        _ = tokio::time::sleep(pause) => Ok(()),
        _ = ctx.cancel.cancelled() => anyhow::bail!("{what}: interrupted"),
    }
}

struct Launch;

#[async_trait]
impl Entrypoint for Launch {
    async fn run(&self, ctx: ExecutionContext) -> anyhow::Result<Value> {
        let args: LaunchArgs = serde_json::from_value(ctx.kwargs.clone())?;
        println!("Launching on cluster {}...", args.cluster_name);
        if args.dryrun {
            return Ok(json!({"cluster_name": args.cluster_name, "dryrun": true}));
        }
        for step in ["Provisioning", "Syncing file mounts", "Starting job"] {
            cancellable_step(
                &ctx,
                &format!("{step} ({})", args.cluster_name),
                Duration::from_millis(100),
            )
            .await?;
        }
        println!("Cluster {} is up.", args.cluster_name);
        Ok(json!({"cluster_name": args.cluster_name, "job_id": 1}))
    }
}

struct Exec;

#[async_trait]
impl Entrypoint for Exec {
    async fn run(&self, ctx: ExecutionContext) -> anyhow::Result<Value> {
        let args: ExecArgs = serde_json::from_value(ctx.kwargs.clone())?;
        cancellable_step(
            &ctx,
            &format!("Submitting task to cluster {}", args.cluster_name),
            Duration::from_millis(100),
        )
        .await?;
        Ok(json!({"cluster_name": args.cluster_name, "job_id": 1}))
    }
}

struct Stop;

#[async_trait]
impl Entrypoint for Stop {
    async fn run(&self, ctx: ExecutionContext) -> anyhow::Result<Value> {
        let args: StopOrDownArgs = serde_json::from_value(ctx.kwargs.clone())?;
        cancellable_step(
            &ctx,
            &format!("Stopping cluster {}", args.cluster_name),
            Duration::from_millis(100),
        )
        .await?;
        Ok(json!({"cluster_name": args.cluster_name, "stopped": true}))
    }
}

struct Start;

#[async_trait]
impl Entrypoint for Start {
    async fn run(&self, ctx: ExecutionContext) -> anyhow::Result<Value> {
        let args: StartArgs = serde_json::from_value(ctx.kwargs.clone())?;
        cancellable_step(
            &ctx,
            &format!("Restarting cluster {}", args.cluster_name),
            Duration::from_millis(100),
        )
        .await?;
        Ok(json!({"cluster_name": args.cluster_name, "started": true}))
    }
}

struct Down;

#[async_trait]
impl Entrypoint for Down {
    async fn run(&self, ctx: ExecutionContext) -> anyhow::Result<Value> {
        let args: StopOrDownArgs = serde_json::from_value(ctx.kwargs.clone())?;
        cancellable_step(
            &ctx,
            &format!("Tearing down cluster {}", args.cluster_name),
            Duration::from_millis(100),
        )
        .await?;
        Ok(json!({"cluster_name": args.cluster_name, "purge": args.purge, "down": true}))
    }
}

struct Status;

#[async_trait]
impl Entrypoint for Status {
    async fn run(&self, ctx: ExecutionContext) -> anyhow::Result<Value> {
        let args: StatusArgs = serde_json::from_value(ctx.kwargs.clone())?;
        if args.refresh {
            cancellable_step(&ctx, "Refreshing cluster status", Duration::from_millis(100))
                .await?;
        }
        let clusters = args.cluster_names.unwrap_or_default();
        println!("Reporting status for {} cluster(s)", clusters.len());
        Ok(json!({"clusters": clusters, "refreshed": args.refresh}))
    }
}

struct Logs;

#[async_trait]
impl Entrypoint for Logs {
    async fn run(&self, ctx: ExecutionContext) -> anyhow::Result<Value> {
        let args: LogsArgs = serde_json::from_value(ctx.kwargs.clone())?;
        println!(
            "Tailing logs for cluster {} job {:?}",
            args.cluster_name, args.job_id
        );
        if args.follow {
            // Follow until the client aborts the request.
            ctx.cancel.cancelled().await;
            anyhow::bail!("log tail interrupted");
        }
        Ok(json!({"cluster_name": args.cluster_name, "job_id": args.job_id}))
    }
}

struct CostReport;

#[async_trait]
impl Entrypoint for CostReport {
    async fn run(&self, _ctx: ExecutionContext) -> anyhow::Result<Value> {
        println!("Computing cost report");
        Ok(json!({"clusters": [], "total_cost": 0.0}))
    }
}

struct StorageLs;

#[async_trait]
impl Entrypoint for StorageLs {
    async fn run(&self, _ctx: ExecutionContext) -> anyhow::Result<Value> {
        println!("Listing storage objects");
        Ok(json!({"storages": []}))
    }
}

struct StorageDelete;

#[async_trait]
impl Entrypoint for StorageDelete {
    async fn run(&self, ctx: ExecutionContext) -> anyhow::Result<Value> {
        let args: StorageDeleteArgs = serde_json::from_value(ctx.kwargs.clone())?;
        cancellable_step(
            &ctx,
            &format!("Deleting storage {}", args.name),
            Duration::from_millis(100),
        )
        .await?;
        Ok(json!({"name": args.name, "deleted": true}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use stratus::RequestId;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn context(kwargs: Value) -> ExecutionContext {
        ExecutionContext {
            request_id: RequestId::from(Uuid::new_v4()),
            kwargs,
            env_vars: HashMap::new(),
            config: json!({}),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn registry_contains_every_bound_operation() {
        let registry = build_registry();
        for kind in [
            "launch",
            "exec",
            "stop",
            "start",
            "down",
            "status",
            "logs",
            "cost_report",
            "storage_ls",
            "storage_delete",
            stratus::KILL_PROCESS_TREE,
        ] {
            assert!(registry.get(kind).is_some(), "missing entrypoint {kind}");
        }
    }

    #[tokio::test]
    async fn launch_returns_an_acknowledgement() {
        let registry = build_registry();
        let launch = registry.get("launch").unwrap();
        let result = launch
            .run(context(json!({"cluster_name": "dev"})))
            .await
            .unwrap();
        assert_eq!(result["cluster_name"], "dev");
        assert_eq!(result["job_id"], 1);
    }

    #[tokio::test]
    async fn launch_rejects_a_missing_cluster_name() {
        let registry = build_registry();
        let launch = registry.get("launch").unwrap();
        assert!(launch.run(context(json!({}))).await.is_err());
    }

    #[tokio::test]
    async fn cancelled_launch_unwinds_with_an_error() {
        let registry = build_registry();
        let launch = registry.get("launch").unwrap();
        let ctx = context(json!({"cluster_name": "dev"}));
        ctx.cancel.cancel();
        let err = launch.run(ctx).await.unwrap_err();
        assert!(err.to_string().contains("interrupted"));
    }

    #[tokio::test]
    async fn following_logs_waits_for_cancellation() {
        let registry = build_registry();
        let logs = registry.get("logs").unwrap();
        let ctx = context(json!({"cluster_name": "dev", "follow": true}));
        let cancel = ctx.cancel.clone();

        let task = tokio::spawn(async move { logs.run(ctx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        cancel.cancel();
        let result = task.await.unwrap();
        assert!(result.is_err());
    }
}
