//! XID error collector: surfaces the most recent XID per GPU as a labeled
//! series.

use super::{identify_metric, Collector};
use crate::counters::{Counter, PromType};
use crate::dcgm::{
    is_blank, DcgmClient, EntityGroup, FieldScalar, GroupEntityPair, DCGM_FI_DEV_XID_ERRORS,
    DCGM_FV_FLAG_LIVE_DATA,
};
use crate::error::{ExporterError, Result};
use crate::metrics::{Metric, MetricsByCounter};
use crate::selector::{self, MonitoredEntity};
use crate::watchlist::WatchList;
use std::sync::Arc;

fn xid_counter() -> Counter {
    Counter::new(
        DCGM_FI_DEV_XID_ERRORS,
        "DCGM_EXP_XID_ERRORS_COUNT",
        PromType::Gauge,
        "Count of XID errors within the collection window.",
    )
}

pub struct XidCollector {
    client: Arc<dyn DcgmClient>,
    kind: EntityGroup,
    entities: Vec<MonitoredEntity>,
    hostname: String,
}

impl XidCollector {
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

impl Collector for XidCollector {
    fn group(&self) -> EntityGroup {
        self.kind
    }

    fn name(&self) -> &'static str {
        "xid"
    }

    fn get_metrics(&self) -> Result<MetricsByCounter> {
        let counter = xid_counter();
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
            let xid = match value.value {
                FieldScalar::Int64(v) if !is_blank(&value.value) => v,
                _ => 0,
            };
            let mut metric = Metric::new(counter.clone(), if xid != 0 { "1" } else { "0" });
            identify_metric(&mut metric, entity, &self.hostname);
            if xid != 0 {
                metric.attributes.insert("xid".to_string(), xid.to_string());
            }
            list.push(metric);
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
    fn nonzero_xid_is_labeled() {
        let client = Arc::new(
            FakeDcgmClient::new()
                .with_gpu(0, "NVIDIA H100")
                .with_gpu(1, "NVIDIA H100")
                .with_value(
                    EntityGroup::Gpu,
                    1,
                    DCGM_FI_DEV_XID_ERRORS,
                    FieldScalar::Int64(79),
                ),
        );
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
        let collector = XidCollector::from_watch_list(client, &list, "testhost".to_string());
        let metrics = collector.get_metrics().unwrap();
        let series = metrics.values().next().unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].value, "0");
        assert!(series[0].attributes.get("xid").is_none());
        assert_eq!(series[1].value, "1");
        assert_eq!(series[1].attributes.get("xid").unwrap(), "79");
    }
}
