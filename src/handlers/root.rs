//! Root endpoint handler for the landing page.

use axum::{
    extract::State,
    response::{Html, IntoResponse},
};
use tracing::{debug, instrument};

use crate::state::SharedState;

/// Handler for the root `/` endpoint.
#[instrument(skip(state))]
pub async fn root_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing / request");

    let version = env!("CARGO_PKG_VERSION");
    let uptime_secs = state.start_time.elapsed().as_secs();
    let uptime = format!(
        "{}h {}m {}s",
        uptime_secs / 3600,
        (uptime_secs % 3600) / 60,
        uptime_secs % 60
    );

    let html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>DCGM GPU Exporter</title>
</head>
<body>
    <h1>DCGM GPU Exporter</h1>
    <p>Version {version} &mdash; up {uptime}</p>
    <ul>
        <li><a href="/metrics">/metrics</a> &mdash; Prometheus metrics</li>
        <li><a href="/health">/health</a> &mdash; liveness canary</li>
    </ul>
</body>
</html>
"#
    );
    Html(html)
}
