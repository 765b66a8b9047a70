//! Metrics endpoint handler for Prometheus scraping.
//!
//! Drives one full scrape: gather from every registered collector, enrich
//! each entity kind's slice through the transformer chain with the inventory
//! it was collected against, then render into an in-memory buffer. Nothing is
//! written to the response until the whole scrape succeeded.

use axum::{extract::State, http::header::CONTENT_TYPE, http::StatusCode, response::IntoResponse};
use prometheus::{Encoder, TextEncoder};
use std::time::Instant;
use tracing::{debug, error, instrument};

use crate::dcgm::EntityGroup;
use crate::error::Result;
use crate::render::{render_group, METRICS_CONTENT_TYPE};
use crate::state::{AppState, SharedState};
use crate::transform::run_transforms;

/// Handler for the /metrics endpoint.
#[instrument(skip(state))]
pub async fn metrics_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let start = Instant::now();
    debug!("Processing /metrics request");
    state.scrapes_total.inc();

    match render_scrape(&state).await {
        Ok(body) => {
            state.scrape_duration.set(start.elapsed().as_secs_f64());
            ([(CONTENT_TYPE, METRICS_CONTENT_TYPE)], body).into_response()
        }
        Err(e) => {
            error!("scrape failed: {e}");
            state.scrape_errors_total.inc();
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
        }
    }
}

async fn render_scrape(state: &AppState) -> Result<String> {
    let mut snapshot = state.registry.gather().await?;
    let manager = state.watch_lists.read().await;

    let mut buf = String::new();
    let mut groups: Vec<EntityGroup> = snapshot.keys().copied().collect();
    groups.sort_by_key(|g| g.tag());
    for group in groups {
        let Some(metrics) = snapshot.get_mut(&group) else {
            continue;
        };
        if let Some(list) = manager.get(group) {
            run_transforms(&state.transforms, metrics, &list.device_info).await?;
        }
        render_group(&mut buf, group, metrics)?;
    }

    append_self_telemetry(state, &mut buf);
    Ok(buf)
}

fn append_self_telemetry(state: &AppState, buf: &mut String) {
    let encoder = TextEncoder::new();
    let mut raw = Vec::new();
    if let Err(e) = encoder.encode(&state.self_registry.gather(), &mut raw) {
        debug!("self-telemetry encoding skipped: {e}");
        return;
    }
    buf.push_str(&String::from_utf8_lossy(&raw));
}
