//! Child execution: the runner seam and process utilities.
//!
//! Production uses [`ProcessChildRunner`], which spawns a clean child
//! process per request (never a fork) with its stdout/stderr mapped onto
//! the request's log file. Tests use [`InlineChildRunner`], which runs the
//! same executor sequence inside the current process.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StratusError};
use crate::exec::executor::{ExecSettings, execute_request};
use crate::registry::EntrypointRegistry;
use crate::request::{RequestRecord, RequestStatus};
use crate::store::RequestStore;

/// Whether a pid refers to a live process.
pub fn pid_alive(pid: i32) -> bool {
    // Signal 0 probes without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Deliver `signal` to the process group led by `pid`, falling back to the
/// single process when it leads no group.
pub fn signal_process_tree(pid: i32, signal: i32) {
    unsafe {
        if libc::kill(-(pid as libc::pid_t), signal) != 0 {
            libc::kill(pid as libc::pid_t, signal);
        }
    }
}

/// How a child execution ended, as observed by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    /// Process exited with a status code.
    Exited(i32),
    /// Process was killed by a signal (TERM during abort, OOM kill, ...).
    Signalled(Option<i32>),
    /// Inline execution ran to completion.
    Completed,
}

impl ChildOutcome {
    /// A normal ending: the record holds whatever terminal state the child
    /// wrote. Anything else means the child may have died mid-flight.
    pub fn is_normal(&self) -> bool {
        matches!(self, ChildOutcome::Exited(0) | ChildOutcome::Completed)
    }
}

impl From<std::process::ExitStatus> for ChildOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ChildOutcome::Signalled(Some(signal));
            }
        }
        ChildOutcome::Exited(status.code().unwrap_or(-1))
    }
}

/// Runs one request to completion and reports how it ended.
///
/// The record is mutated only through the store, by the execution itself;
/// the runner never touches request state.
#[async_trait]
pub trait ChildRunner: Send + Sync {
    async fn run(&self, record: &RequestRecord, ignore_return_value: bool) -> Result<ChildOutcome>;
}

/// Spawns a fresh OS process per request by re-executing the server binary
/// with its child-mode arguments.
///
/// The child is made its own process-group leader so an abort can TERM the
/// whole tree, including anything the entrypoint itself spawned.
#[derive(Debug, Clone)]
pub struct ProcessChildRunner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessChildRunner {
    /// `args` is everything up to and including the child-mode subcommand,
    /// e.g. `["--config", "/etc/nimctl.yaml", "run-request"]`.
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        ProcessChildRunner { program, args }
    }

    /// Re-exec the currently running binary.
    pub fn current_exe(args: Vec<String>) -> Result<Self> {
        Ok(ProcessChildRunner {
            program: std::env::current_exe()?,
            args,
        })
    }
}

#[async_trait]
impl ChildRunner for ProcessChildRunner {
    #[tracing::instrument(skip_all, fields(request_id = %record.request_id))]
    async fn run(&self, record: &RequestRecord, ignore_return_value: bool) -> Result<ChildOutcome> {
        // The log file exists since creation; append keeps anything an
        // earlier attempt wrote.
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&record.log_path)?;
        let log_err = log.try_clone()?;

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--request-id")
            .arg(record.request_id.to_string());
        if ignore_return_value {
            command.arg("--ignore-return-value");
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|err| StratusError::Internal(format!("failed to spawn child: {err}")))?;
        tracing::debug!(pid = ?child.id(), "Spawned child process");

        let status = child.wait().await?;
        Ok(ChildOutcome::from(status))
    }
}

/// Runs the executor inline, in the worker's own process.
///
/// This is the test seam: it exercises the identical state transitions and
/// override scoping without process isolation. Aborts are delivered by a
/// watcher task that polls the record and cancels the token when the
/// status flips to ABORTED.
pub struct InlineChildRunner<S> {
    store: Arc<S>,
    registry: Arc<EntrypointRegistry>,
    settings: ExecSettings,
    poll_interval: Duration,
}

impl<S> InlineChildRunner<S> {
    pub fn new(store: Arc<S>, registry: Arc<EntrypointRegistry>, settings: ExecSettings) -> Self {
        InlineChildRunner {
            store,
            registry,
            settings,
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[async_trait]
impl<S: RequestStore + 'static> ChildRunner for InlineChildRunner<S> {
    async fn run(&self, record: &RequestRecord, ignore_return_value: bool) -> Result<ChildOutcome> {
        let cancel = CancellationToken::new();
        let request_id = record.request_id;

        let watcher_store = self.store.clone();
        let watcher_cancel = cancel.clone();
        let poll_interval = self.poll_interval;
        let watcher = tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                match watcher_store.get(request_id).await {
                    Ok(Some(current)) if current.status == RequestStatus::Aborted => {
                        watcher_cancel.cancel();
                        break;
                    }
                    Ok(Some(current)) if current.status.is_terminal() => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "Abort watcher failed to read the store");
                    }
                }
            }
        });

        let result = execute_request(
            self.store.as_ref(),
            self.registry.as_ref(),
            &self.settings,
            request_id,
            ignore_return_value,
            None,
            cancel,
        )
        .await;
        watcher.abort();
        result.map(|_| ChildOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn pid_probe_distinguishes_live_and_dead() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        assert!(pid_alive(pid));

        child.kill().unwrap();
        child.wait().unwrap();
        assert!(!pid_alive(pid));
    }

    #[test]
    fn exit_statuses_map_to_outcomes() {
        let ok = Command::new("true").status().unwrap();
        assert_eq!(ChildOutcome::from(ok), ChildOutcome::Exited(0));
        assert!(ChildOutcome::from(ok).is_normal());

        let failed = Command::new("false").status().unwrap();
        assert_eq!(ChildOutcome::from(failed), ChildOutcome::Exited(1));
        assert!(!ChildOutcome::from(failed).is_normal());
    }

    #[test]
    fn signalled_children_are_not_normal() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        child.kill().unwrap();
        let status = child.wait().unwrap();
        let outcome = ChildOutcome::from(status);
        assert_eq!(outcome, ChildOutcome::Signalled(Some(libc::SIGKILL)));
        assert!(!outcome.is_normal());
    }
}
