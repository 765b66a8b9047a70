//! Metric collectors.
//!
//! One collector per entity kind pulls the latest watched field values out of
//! the library and turns them into identity-labeled [`Metric`] records. The
//! experimental collectors (clock events, XID, GPU health) derive extra
//! series over the same selector output.

pub mod clock_events;
pub mod gpu_health;
pub mod xid;

pub use clock_events::ClockEventsCollector;
pub use gpu_health::GpuHealthCollector;
pub use xid::XidCollector;

use crate::counters::Counter;
use crate::dcgm::{
    is_blank, DcgmClient, EntityGroup, FieldScalar, FieldValue, GroupEntityPair,
    DCGM_FV_FLAG_LIVE_DATA,
};
use crate::error::{ExporterError, Result};
use crate::metrics::{Metric, MetricsByCounter};
use crate::selector::{self, MonitoredEntity};
use crate::watchlist::WatchList;
use ahash::AHashMap as HashMap;
use std::sync::Arc;
use tracing::debug;

/// Contract every collector fulfils toward the registry.
pub trait Collector: Send + Sync {
    /// The snapshot group this collector's metrics land under.
    fn group(&self) -> EntityGroup;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// One metric per (selected entity, counter). Called from a blocking
    /// worker; must not assume an async context.
    fn get_metrics(&self) -> Result<MetricsByCounter>;

    /// Releases transient resources. Best effort, never propagates.
    fn cleanup(&self) {}
}

/// The main collector: latest values for every watched field on one kind.
pub struct DcgmCollector {
    client: Arc<dyn DcgmClient>,
    kind: EntityGroup,
    counters: Vec<Counter>,
    fields: Vec<u16>,
    entities: Vec<MonitoredEntity>,
    hostname: String,
}

impl DcgmCollector {
    pub fn from_watch_list(
        client: Arc<dyn DcgmClient>,
        list: &WatchList,
        hostname: String,
    ) -> Self {
        Self {
            client,
            kind: list.device_info.kind,
            counters: list.counters.clone(),
            fields: list.fields.clone(),
            entities: selector::enumerate(&list.device_info),
            hostname,
        }
    }
}

impl Collector for DcgmCollector {
    fn group(&self) -> EntityGroup {
        self.kind
    }

    fn name(&self) -> &'static str {
        "dcgm"
    }

    fn get_metrics(&self) -> Result<MetricsByCounter> {
        if self.entities.is_empty() || self.fields.is_empty() {
            return Ok(MetricsByCounter::default());
        }
        let pairs: Vec<GroupEntityPair> = self.entities.iter().map(|e| e.entity).collect();
        let values = self
            .client
            .entities_get_latest_values(&pairs, &self.fields, DCGM_FV_FLAG_LIVE_DATA)
            .map_err(|e| ExporterError::Collection(e.to_string()))?;

        let by_field: HashMap<u16, &Counter> =
            self.counters.iter().map(|c| (c.field_id, c)).collect();
        let by_entity: HashMap<GroupEntityPair, &MonitoredEntity> =
            self.entities.iter().map(|e| (e.entity, e)).collect();

        let mut out = MetricsByCounter::default();
        for value in values {
            let Some(counter) = by_field.get(&value.field_id) else {
                debug!("dropping value for unwatched field {}", value.field_id);
                continue;
            };
            let key = GroupEntityPair {
                entity_group: value.entity_group,
                entity_id: value.entity_id,
            };
            let Some(entity) = by_entity.get(&key) else {
                debug!("dropping value for unselected entity {key:?}");
                continue;
            };
            let metric = build_metric((*counter).clone(), entity, &value, &self.hostname);
            out.entry((*counter).clone()).or_default().push(metric);
        }
        Ok(out)
    }
}

/// Fills the identity fields of a metric from its monitored entity.
pub(crate) fn identify_metric(metric: &mut Metric, entity: &MonitoredEntity, hostname: &str) {
    metric.hostname = hostname.to_string();
    metric.entity_id = entity.entity.entity_id;
    if let Some(parent) = entity.parent_id {
        metric.parent_id = parent;
    }
    match entity.entity.entity_group {
        EntityGroup::Gpu | EntityGroup::GpuInstance | EntityGroup::ComputeInstance => {
            if let Some(gpu) = &entity.gpu {
                metric.gpu = gpu.index.to_string();
                metric.gpu_uuid = gpu.uuid.clone();
                metric.gpu_device = format!("nvidia{}", gpu.index);
                metric.gpu_model_name = gpu.model.clone();
                metric.gpu_pci_bus_id = gpu.pci_bus_id.clone();
            }
            if let Some(instance) = &entity.instance {
                metric.mig_profile = instance.profile_name.clone();
                metric.gpu_instance_id = instance.nvml_instance_id.to_string();
            }
            metric.parent_kind = EntityGroup::Gpu;
        }
        EntityGroup::Link => metric.parent_kind = EntityGroup::Switch,
        EntityGroup::CpuCore => metric.parent_kind = EntityGroup::Cpu,
        _ => metric.parent_kind = EntityGroup::None,
    }
}

fn build_metric(
    counter: Counter,
    entity: &MonitoredEntity,
    value: &FieldValue,
    hostname: &str,
) -> Metric {
    let rendered = if value.status != 0 || is_blank(&value.value) {
        "0".to_string()
    } else {
        render_scalar(&value.value)
    };
    let mut metric = Metric::new(counter, rendered);
    identify_metric(&mut metric, entity, hostname);
    metric
}

/// Renders a sample the way the exposition format expects: integral doubles
/// lose their trailing `.0`.
pub(crate) fn render_scalar(value: &FieldScalar) -> String {
    match value {
        FieldScalar::Int64(v) => v.to_string(),
        FieldScalar::Double(v) => {
            if v.fract() == 0.0 && v.abs() < 1e15 {
                format!("{}", *v as i64)
            } else {
                format!("{v}")
            }
        }
        FieldScalar::Str(s) => s.clone(),
        FieldScalar::Blob(b) => format!("{} bytes", b.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::PromType;
    use crate::dcgm::fake::FakeDcgmClient;
    use crate::dcgm::{FieldKind, FieldMeta, DCGM_INT64_BLANK};
    use crate::inventory::{DeviceInfo, DeviceOptions};
    use crate::watchlist::build_watch_list;

    fn power_counter() -> Counter {
        Counter::new(155, "DCGM_FI_DEV_POWER_USAGE", PromType::Gauge, "Power (W).")
    }

    fn client_with_two_gpus() -> FakeDcgmClient {
        FakeDcgmClient::new()
            .with_gpu(0, "NVIDIA H100")
            .with_gpu(1, "NVIDIA H100")
            .with_field(FieldMeta {
                field_id: 155,
                field_name: "DCGM_FI_DEV_POWER_USAGE".to_string(),
                kind: FieldKind::Double,
                entity_level: EntityGroup::Gpu,
            })
            .with_value(EntityGroup::Gpu, 0, 155, FieldScalar::Double(42.0))
            .with_value(EntityGroup::Gpu, 1, 155, FieldScalar::Double(97.25))
    }

    fn collector_for(client: Arc<FakeDcgmClient>) -> DcgmCollector {
        let info = DeviceInfo::initialize(
            client.as_ref(),
            DeviceOptions::default(),
            DeviceOptions::default(),
            DeviceOptions::default(),
            false,
            EntityGroup::Gpu,
        )
        .unwrap();
        let list = build_watch_list(client.as_ref(), &[power_counter()], info, 30_000_000).unwrap();
        DcgmCollector::from_watch_list(client, &list, "testhost".to_string())
    }

    #[test]
    fn collects_one_metric_per_entity() {
        let client = Arc::new(client_with_two_gpus());
        let collector = collector_for(client);
        let metrics = collector.get_metrics().unwrap();
        let list = metrics.get(&power_counter()).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].value, "42");
        assert_eq!(list[0].gpu, "0");
        assert_eq!(list[0].gpu_device, "nvidia0");
        assert_eq!(list[0].hostname, "testhost");
        assert_eq!(list[1].value, "97.25");
    }

    #[test]
    fn blank_samples_become_zero() {
        let client = Arc::new(
            client_with_two_gpus().with_value(
                EntityGroup::Gpu,
                1,
                155,
                FieldScalar::Int64(DCGM_INT64_BLANK),
            ),
        );
        let collector = collector_for(client);
        let metrics = collector.get_metrics().unwrap();
        let list = metrics.get(&power_counter()).unwrap();
        assert_eq!(list[1].value, "0");
    }

    #[test]
    fn library_failure_is_a_collection_error() {
        let client = Arc::new(client_with_two_gpus());
        let collector = collector_for(client.clone());
        client.fail_call("entities_get_latest_values");
        assert!(matches!(
            collector.get_metrics(),
            Err(ExporterError::Collection(_))
        ));
    }

    #[test]
    fn scalar_rendering_trims_integral_doubles() {
        assert_eq!(render_scalar(&FieldScalar::Double(42.0)), "42");
        assert_eq!(render_scalar(&FieldScalar::Double(0.5)), "0.5");
        assert_eq!(render_scalar(&FieldScalar::Int64(-3)), "-3");
        assert_eq!(render_scalar(&FieldScalar::Str("x".to_string())), "x");
    }
}
