//! GPU health collector: owns a health watch on its own entity group and
//! reports per-subsystem verdicts.

use super::{identify_metric, Collector};
use crate::counters::{Counter, PromType};
use crate::dcgm::{DcgmClient, EntityGroup, GroupHandle, HealthResult};
use crate::error::{ExporterError, Result};
use crate::metrics::{Metric, MetricsByCounter};
use crate::selector::{self, MonitoredEntity};
use crate::watchlist::WatchList;
use std::sync::{Arc, Mutex};
use tracing::warn;

fn health_counter() -> Counter {
    Counter::new(
        0,
        "DCGM_EXP_GPU_HEALTH_STATUS",
        PromType::Gauge,
        "GPU health status: 0 pass, 10 warn, 20 fail.",
    )
}

fn health_value(result: HealthResult) -> &'static str {
    match result {
        HealthResult::Pass => "0",
        HealthResult::Warn => "10",
        HealthResult::Fail => "20",
    }
}

pub struct GpuHealthCollector {
    client: Arc<dyn DcgmClient>,
    kind: EntityGroup,
    entities: Vec<MonitoredEntity>,
    hostname: String,
    // The health watch needs its own group; released in cleanup().
    group: Mutex<Option<GroupHandle>>,
}

impl GpuHealthCollector {
    pub fn from_watch_list(
        client: Arc<dyn DcgmClient>,
        list: &WatchList,
        hostname: String,
    ) -> Result<Self> {
        let entities = selector::enumerate(&list.device_info);
        let group = client.create_group(&format!(
            "dcgm-exporter-health-{:016x}",
            rand::random::<u64>()
        ))?;
        for entity in &entities {
            if let Err(e) =
                client.add_entity_to_group(group, entity.entity.entity_group, entity.entity.entity_id)
            {
                let _ = client.destroy_group(group);
                return Err(e.into());
            }
        }
        if let Err(e) = client.health_set(group) {
            let _ = client.destroy_group(group);
            return Err(e.into());
        }
        Ok(Self {
            client,
            kind: list.device_info.kind,
            entities,
            hostname,
            group: Mutex::new(Some(group)),
        })
    }
}

impl Collector for GpuHealthCollector {
    fn group(&self) -> EntityGroup {
        self.kind
    }

    fn name(&self) -> &'static str {
        "gpu_health"
    }

    fn get_metrics(&self) -> Result<MetricsByCounter> {
        let group = self
            .group
            .lock()
            .unwrap()
            .ok_or_else(|| ExporterError::Collection("health collector already cleaned up".to_string()))?;
        let response = self
            .client
            .health_check(group)
            .map_err(|e| ExporterError::Collection(e.to_string()))?;

        let counter = health_counter();
        let mut out = MetricsByCounter::default();
        let list = out.entry(counter.clone()).or_default();
        for entity in &self.entities {
            let incidents: Vec<_> = response
                .incidents
                .iter()
                .filter(|i| i.entity == entity.entity)
                .collect();
            if incidents.is_empty() {
                let mut metric = Metric::new(counter.clone(), health_value(HealthResult::Pass));
                identify_metric(&mut metric, entity, &self.hostname);
                list.push(metric);
                continue;
            }
            for incident in incidents {
                let mut metric = Metric::new(counter.clone(), health_value(incident.health));
                identify_metric(&mut metric, entity, &self.hostname);
                metric
                    .attributes
                    .insert("health_watch".to_string(), incident.system.to_string());
                metric
                    .attributes
                    .insert("health_error".to_string(), incident.error_message.clone());
                list.push(metric);
            }
        }
        Ok(out)
    }

    fn cleanup(&self) {
        if let Some(group) = self.group.lock().unwrap().take() {
            if let Err(e) = self.client.destroy_group(group) {
                warn!("failed to destroy health group: {e}");
            }
        }
    }
}
