//! DCGM GPU exporter core.
//!
//! Collects NVIDIA data-center GPU telemetry through an abstract DCGM client,
//! enriches it with Kubernetes and HPC identity, and renders it in Prometheus
//! exposition format. The library half carries everything the binary needs:
//!
//! - **Inventory & watch-lists**: device topology discovery (GPU, MIG,
//!   NVSwitch/NVLink, Grace CPU), inclusion filters, entity/field groups.
//! - **Collectors & registry**: concurrent per-kind collection merged into a
//!   per-counter snapshot.
//! - **Transformers**: kubelet pod-resources join, pod labels, HPC jobs, DRA
//!   device index.
//! - **Renderer & HTTP surface**: exposition text, `/metrics`, `/health`, `/`.
//!
//! The native library is only ever reached through [`dcgm::DcgmClient`]; the
//! deterministic [`dcgm::fake::FakeDcgmClient`] backs tests and the
//! `--fake-gpus` dev mode.

pub mod cli;
pub mod collectors;
pub mod config;
pub mod counters;
pub mod dcgm;
pub mod error;
pub mod handlers;
pub mod inventory;
pub mod metrics;
pub mod registry;
pub mod render;
pub mod selector;
pub mod state;
pub mod transform;
pub mod watchlist;

// Re-export main types for convenience
pub use counters::{Counter, PromType};
pub use dcgm::{DcgmClient, EntityGroup};
pub use error::{ExporterError, Result};
pub use inventory::{DeviceInfo, DeviceOptions};
pub use metrics::{Metric, MetricsByCounter, MetricsByCounterGroup};
pub use registry::Registry;
pub use watchlist::{build_watch_list, WatchList, WatchListManager};
