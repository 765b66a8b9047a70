//! Application state shared across HTTP handlers.

use crate::dcgm::DcgmClient;
use crate::error::{ExporterError, Result};
use crate::registry::Registry;
use crate::transform::Transform;
use crate::watchlist::SharedWatchListManager;
use prometheus::{Gauge, IntCounter};
use std::sync::Arc;
use std::time::Instant;

/// Type alias for shared application state.
pub type SharedState = Arc<AppState>;

/// Global application state shared across requests and the teardown path.
pub struct AppState {
    pub registry: Registry,
    pub watch_lists: SharedWatchListManager,
    pub transforms: Vec<Box<dyn Transform>>,
    pub client: Arc<dyn DcgmClient>,
    /// Exporter self-telemetry, exposed alongside the DCGM series.
    pub self_registry: prometheus::Registry,
    pub scrape_duration: Gauge,
    pub scrapes_total: IntCounter,
    pub scrape_errors_total: IntCounter,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        registry: Registry,
        watch_lists: SharedWatchListManager,
        transforms: Vec<Box<dyn Transform>>,
        client: Arc<dyn DcgmClient>,
    ) -> Result<Self> {
        let self_registry = prometheus::Registry::new();
        let scrape_duration = Gauge::new(
            "dcgm_exporter_scrape_duration_seconds",
            "Wall time of the last /metrics scrape.",
        )
        .map_err(|e| ExporterError::Config(e.to_string()))?;
        let scrapes_total = IntCounter::new(
            "dcgm_exporter_scrapes_total",
            "Number of /metrics scrapes served.",
        )
        .map_err(|e| ExporterError::Config(e.to_string()))?;
        let scrape_errors_total = IntCounter::new(
            "dcgm_exporter_scrape_errors_total",
            "Number of /metrics scrapes that ended in an error.",
        )
        .map_err(|e| ExporterError::Config(e.to_string()))?;
        for collector in [
            Box::new(scrape_duration.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(scrapes_total.clone()),
            Box::new(scrape_errors_total.clone()),
        ] {
            self_registry
                .register(collector)
                .map_err(|e| ExporterError::Config(e.to_string()))?;
        }

        Ok(Self {
            registry,
            watch_lists,
            transforms,
            client,
            self_registry,
            scrape_duration,
            scrapes_total,
            scrape_errors_total,
            start_time: Instant::now(),
        })
    }

    /// Releases collectors first, then every watch handle in reverse
    /// acquisition order.
    pub async fn teardown(&self) {
        self.registry.cleanup();
        self.watch_lists.write().await.cleanup(self.client.as_ref());
    }
}
