//! Entrypoint registry: stable names bound to server-side callables.
//!
//! Requests persist the kind string, never a closure. Each HTTP endpoint
//! binds a kind to a typed handler at server startup; the child executor
//! resolves the kind here before running.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::exec::child::{pid_alive, signal_process_tree};
use crate::request::RequestId;

/// Kind of the built-in kill entrypoint used by the abort path.
pub const KILL_PROCESS_TREE: &str = "kill_process_tree";

/// Everything an entrypoint sees about its request.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub request_id: RequestId,
    /// Kind-specific keyword arguments from the request body.
    pub kwargs: Value,
    /// The client's forwarded environment map (already applied to the
    /// process environment by the executor).
    pub env_vars: HashMap<String, String>,
    /// Server config with the request's overrides merged in.
    pub config: Value,
    /// Cooperative cancellation: flips when the request is aborted.
    /// Long-running entrypoints must poll or select on it.
    pub cancel: CancellationToken,
}

/// A server-side callable.
#[async_trait]
pub trait Entrypoint: Send + Sync {
    async fn run(&self, ctx: ExecutionContext) -> anyhow::Result<Value>;
}

/// Name -> handler table, built once at startup.
#[derive(Default)]
pub struct EntrypointRegistry {
    entries: HashMap<String, Arc<dyn Entrypoint>>,
}

impl EntrypointRegistry {
    pub fn new() -> Self {
        EntrypointRegistry::default()
    }

    /// A registry pre-populated with the engine's built-ins.
    pub fn with_builtins() -> Self {
        let mut registry = EntrypointRegistry::new();
        registry.register(KILL_PROCESS_TREE, Arc::new(KillProcessTree));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, entrypoint: Arc<dyn Entrypoint>) {
        self.entries.insert(kind.into(), entrypoint);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Entrypoint>> {
        self.entries.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

/// TERM-signals the process tree of each target pid; with `force`, follows
/// up with KILL for anything still alive after a short grace period.
///
/// Submitted on the BLOCKING lane by the abort handler.
struct KillProcessTree;

#[derive(Debug, Deserialize)]
struct KillProcessTreeArgs {
    parent_pids: Vec<i32>,
    #[serde(default)]
    force: bool,
}

const KILL_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

#[async_trait]
impl Entrypoint for KillProcessTree {
    async fn run(&self, ctx: ExecutionContext) -> anyhow::Result<Value> {
        let args: KillProcessTreeArgs = serde_json::from_value(ctx.kwargs.clone())?;
        tracing::info!(pids = ?args.parent_pids, force = args.force, "Signalling process trees");

        for pid in &args.parent_pids {
            signal_process_tree(*pid, libc::SIGTERM);
        }

        let mut killed = 0;
        if args.force {
            tokio::time::sleep(KILL_GRACE).await;
            for pid in &args.parent_pids {
                if pid_alive(*pid) {
                    signal_process_tree(*pid, libc::SIGKILL);
                    killed += 1;
                }
            }
        }

        Ok(json!({
            "signalled": args.parent_pids.len(),
            "killed": killed,
        }))
    }
}
