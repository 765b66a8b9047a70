//! Clock event collector: decodes the throttle-reason bitmask into one
//! labeled series per active reason.

use super::{identify_metric, Collector};
use crate::counters::{Counter, PromType};
use crate::dcgm::{
    is_blank, DcgmClient, EntityGroup, FieldScalar, GroupEntityPair,
    DCGM_FI_DEV_CLOCK_THROTTLE_REASONS, DCGM_FV_FLAG_LIVE_DATA,
};
use crate::error::{ExporterError, Result};
use crate::metrics::{Metric, MetricsByCounter};
use crate::selector::{self, MonitoredEntity};
use crate::watchlist::WatchList;
use std::sync::Arc;

/// NVML clock event reason bits.
const CLOCK_EVENT_REASONS: &[(i64, &str)] = &[
    (0x0001, "gpus_idle"),
    (0x0002, "applications_clocks_setting"),
    (0x0004, "sw_power_cap"),
    (0x0008, "hw_slowdown"),
    (0x0010, "sync_boost"),
    (0x0020, "sw_thermal_slowdown"),
    (0x0040, "hw_thermal_slowdown"),
    (0x0080, "hw_power_brake_slowdown"),
    (0x0100, "display_clock_setting"),
];

fn clock_events_counter() -> Counter {
    Counter::new(
        DCGM_FI_DEV_CLOCK_THROTTLE_REASONS,
        "DCGM_EXP_CLOCK_EVENTS_COUNT",
        PromType::Gauge,
        "Count of clock events within the collection window.",
    )
}

pub struct ClockEventsCollector {
    client: Arc<dyn DcgmClient>,
    kind: EntityGroup,
    entities: Vec<MonitoredEntity>,
    hostname: String,
}

impl ClockEventsCollector {
    pub fn from_watch_list(
        client: Arc<dyn DcgmClient>,
        list: &WatchList,
        hostname: String,
    ) -> Self {
        Self {
            client,
            kind: list.device_info.kind,
            entities: selector::enumerate(&list.device_info),
            hostname,
        }
    }
}

impl Collector for ClockEventsCollector {
    fn group(&self) -> EntityGroup {
        self.kind
    }

    fn name(&self) -> &'static str {
        "clock_events"
    }

    fn get_metrics(&self) -> Result<MetricsByCounter> {
        let counter = clock_events_counter();
        let pairs: Vec<GroupEntityPair> = self.entities.iter().map(|e| e.entity).collect();
        let values = self
            .client
            .entities_get_latest_values(&pairs, &[counter.field_id], DCGM_FV_FLAG_LIVE_DATA)
            .map_err(|e| ExporterError::Collection(e.to_string()))?;

        let mut out = MetricsByCounter::default();
        let list = out.entry(counter.clone()).or_default();
        for value in values {
            let Some(entity) = self
                .entities
                .iter()
                .find(|e| e.entity.entity_id == value.entity_id && e.entity.entity_group == value.entity_group)
            else {
                continue;
            };
            let mask = match value.value {
                FieldScalar::Int64(v) if !is_blank(&value.value) => v,
                _ => 0,
            };
            let active: Vec<&str> = CLOCK_EVENT_REASONS
                .iter()
                .filter(|(bit, _)| mask & bit != 0)
                .map(|(_, name)| *name)
                .collect();
            if active.is_empty() {
                let mut metric = Metric::new(counter.clone(), "0");
                identify_metric(&mut metric, entity, &self.hostname);
                list.push(metric);
                continue;
            }
            for reason in active {
                let mut metric = Metric::new(counter.clone(), "1");
                identify_metric(&mut metric, entity, &self.hostname);
                metric
                    .attributes
                    .insert("clock_event".to_string(), reason.to_string());
                list.push(metric);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcgm::fake::FakeDcgmClient;
    use crate::inventory::{DeviceInfo, DeviceOptions};
    use crate::watchlist::build_watch_list;

    #[test]
    fn active_reasons_become_labeled_metrics() {
        let client = Arc::new(FakeDcgmClient::new().with_gpu(0, "NVIDIA H100").with_value(
            EntityGroup::Gpu,
            0,
            DCGM_FI_DEV_CLOCK_THROTTLE_REASONS,
            FieldScalar::Int64(0x0004 | 0x0040),
        ));
        let info = DeviceInfo::initialize(
            client.as_ref(),
            DeviceOptions::default(),
            DeviceOptions::default(),
            DeviceOptions::default(),
            false,
            EntityGroup::Gpu,
        )
        .unwrap();
        let list = build_watch_list(client.as_ref(), &[], info, 30_000_000).unwrap();
        let collector =
            ClockEventsCollector::from_watch_list(client, &list, "testhost".to_string());
        let metrics = collector.get_metrics().unwrap();
        let series = metrics.values().next().unwrap();
        assert_eq!(series.len(), 2);
        let reasons: Vec<&str> = series
            .iter()
            .map(|m| m.attributes.get("clock_event").unwrap().as_str())
            .collect();
        assert_eq!(reasons, vec!["sw_power_cap", "hw_thermal_slowdown"]);
    }

    #[test]
    fn idle_gpu_emits_a_zero_series() {
        let client = Arc::new(FakeDcgmClient::new().with_gpu(0, "NVIDIA H100"));
        let info = DeviceInfo::initialize(
            client.as_ref(),
            DeviceOptions::default(),
            DeviceOptions::default(),
            DeviceOptions::default(),
            false,
            EntityGroup::Gpu,
        )
        .unwrap();
        let list = build_watch_list(client.as_ref(), &[], info, 30_000_000).unwrap();
        let collector =
            ClockEventsCollector::from_watch_list(client, &list, "testhost".to_string());
        let metrics = collector.get_metrics().unwrap();
        let series = metrics.values().next().unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].value, "0");
        assert!(series[0].attributes.is_empty());
    }
}
