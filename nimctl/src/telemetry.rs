//! Tracing initialization.
//!
//! Log level is controlled with `RUST_LOG`; the default is `info`. Child
//! executions run with their stdout/stderr mapped onto the request's log
//! file, so their tracing output lands there too.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the tracing subscriber.
///
/// Safe to call from both server and child mode; a second initialization in
/// the same process is an error from tracing, surfaced as anyhow.
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
