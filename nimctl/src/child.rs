//! Child mode: the `run-request` subcommand.
//!
//! The worker spawns `nimctl --config <path> run-request --request-id <id>`
//! with stdout/stderr already mapped onto the request's log file. This
//! process opens the shared store, installs the TERM-to-token bridge, and
//! runs the executor sequence to a terminal record state. Exit codes are
//! not part of the protocol; the record carries the outcome.

use std::str::FromStr;

use anyhow::Context;
use stratus::{ExecSettings, RequestId, SqliteRequestStore};

use crate::config::Config;
use crate::operations;

pub async fn run_request(
    config: &Config,
    request_id: &str,
    ignore_return_value: bool,
) -> anyhow::Result<()> {
    let request_id = RequestId::from_str(request_id)
        .with_context(|| format!("invalid request id {request_id:?}"))?;

    // Cooperative interrupt: TERM cancels the token, which unwinds the
    // entrypoint through its normal error path so scoped overrides restore.
    let cancel = stratus::spawn_term_handler()?;

    let store = SqliteRequestStore::connect(&config.db_path())
        .await
        .context("open request store")?;
    let registry = operations::build_registry();
    let settings = ExecSettings {
        base_config: config.workload_config.clone(),
        config_deny_keys: config.config_deny_keys.clone(),
    };

    let pid = std::process::id() as i64;
    stratus::execute_request(
        &store,
        &registry,
        &settings,
        request_id,
        ignore_return_value,
        Some(pid),
        cancel,
    )
    .await
    .context("execute request")?;
    Ok(())
}
