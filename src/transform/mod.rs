//! Label transformers: join raw samples with external identity sources.
//!
//! Transformers run in configured order on each scrape; the first error
//! aborts the scrape. Each receives the mutable per-kind snapshot slice and
//! the frozen inventory the metrics were collected against.

pub mod dra;
pub mod hpc;
pub mod lru;
pub mod podlabels;
pub mod podresources;
pub mod podresources_api;

pub use hpc::HpcJobMapper;
pub use podresources::PodMapper;

use crate::error::Result;
use crate::inventory::DeviceInfo;
use crate::metrics::MetricsByCounter;
use async_trait::async_trait;

#[async_trait]
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    /// Mutates or expands the snapshot slice in place.
    async fn process(&self, metrics: &mut MetricsByCounter, device_info: &DeviceInfo) -> Result<()>;
}

/// Runs every transformer in order, stopping at the first error.
pub async fn run_transforms(
    transforms: &[Box<dyn Transform>],
    metrics: &mut MetricsByCounter,
    device_info: &DeviceInfo,
) -> Result<()> {
    for transform in transforms {
        transform.process(metrics, device_info).await?;
    }
    Ok(())
}
