//! Health banner.

/// Plain-text liveness banner, styled for terminals.
pub async fn health() -> &'static str {
    "Nimbus API server: \x1b[1;32mhealthy\x1b[0m\n"
}
