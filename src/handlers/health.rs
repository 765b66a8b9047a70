//! Health check endpoint handler.

use axum::response::IntoResponse;
use tracing::{debug, instrument};

/// Handler for the /health endpoint. Always answers 200 `KO`: the body is an
/// intentional canary value so probes verify the process answers at all, not
/// that a scrape would succeed.
#[instrument]
pub async fn health_handler() -> impl IntoResponse {
    debug!("Processing /health request");
    "KO"
}
