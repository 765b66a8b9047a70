//! The per-scrape metric record and snapshot containers.
//!
//! Collectors produce [`Metric`]s, transformers mutate them in place, and the
//! renderer consumes them. Nothing here outlives a scrape.

use crate::counters::Counter;
use crate::dcgm::EntityGroup;
use crate::error::{ExporterError, Result};
use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One sample for one counter on one entity, carrying the identity fields the
/// renderer and transformers key on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub counter: Counter,
    pub value: String,

    /// GPU index as a decimal string; empty for non-GPU kinds.
    #[serde(default)]
    pub gpu: String,
    #[serde(default)]
    pub gpu_uuid: String,
    /// Device node name, e.g. `nvidia0`.
    #[serde(default)]
    pub gpu_device: String,
    #[serde(default)]
    pub gpu_model_name: String,
    #[serde(default)]
    pub gpu_pci_bus_id: String,

    /// MIG profile name; non-empty marks this as a MIG-instance metric.
    #[serde(default)]
    pub mig_profile: String,
    #[serde(default)]
    pub gpu_instance_id: String,

    #[serde(default)]
    pub hostname: String,

    /// Entity kind of the parent for child kinds (core→CPU, link→switch).
    pub parent_kind: EntityGroup,
    /// Entity id within its kind (switch id, CPU id, core id, link index).
    #[serde(default)]
    pub entity_id: u32,
    /// Parent entity id for child kinds.
    #[serde(default)]
    pub parent_id: u32,

    /// Kubernetes pod labels after allowlist filtering.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Joined identity tags: pod, namespace, container, vgpu, hpc_job.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Metric {
    pub fn new(counter: Counter, value: impl Into<String>) -> Self {
        Self {
            counter,
            value: value.into(),
            gpu: String::new(),
            gpu_uuid: String::new(),
            gpu_device: String::new(),
            gpu_model_name: String::new(),
            gpu_pci_bus_id: String::new(),
            mig_profile: String::new(),
            gpu_instance_id: String::new(),
            hostname: String::new(),
            parent_kind: EntityGroup::None,
            entity_id: 0,
            parent_id: 0,
            labels: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }
}

/// Snapshot slice for one entity kind.
pub type MetricsByCounter = HashMap<Counter, Vec<Metric>>;

/// Full snapshot: one slice per entity kind in the watch list.
pub type MetricsByCounterGroup = HashMap<EntityGroup, MetricsByCounter>;

/// Serializes a per-kind snapshot keyed by counter field name.
pub fn encode_metrics_by_counter(metrics: &MetricsByCounter) -> Result<String> {
    let keyed: BTreeMap<&str, &Vec<Metric>> = metrics
        .iter()
        .map(|(counter, list)| (counter.field_name.as_str(), list))
        .collect();
    serde_json::to_string(&keyed).map_err(|e| ExporterError::Render(e.to_string()))
}

/// Inverse of [`encode_metrics_by_counter`]. Counter identity is re-derived
/// from the first metric of each list; empty lists are dropped.
pub fn decode_metrics_by_counter(raw: &str) -> Result<MetricsByCounter> {
    let keyed: BTreeMap<String, Vec<Metric>> =
        serde_json::from_str(raw).map_err(|e| ExporterError::Render(e.to_string()))?;
    let mut out = MetricsByCounter::default();
    for (_, list) in keyed {
        if let Some(first) = list.first() {
            out.insert(first.counter.clone(), list);
        }
    }
    Ok(out)
}

/// Node hostname for metric identity. `NODE_NAME` (set by the Kubernetes
/// downward API in the usual deployment) wins over the kernel hostname.
pub fn node_hostname() -> String {
    if let Ok(name) = std::env::var("NODE_NAME") {
        if !name.is_empty() {
            return name;
        }
    }
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::PromType;

    fn sample_snapshot() -> MetricsByCounter {
        let power = Counter::new(155, "DCGM_FI_DEV_POWER_USAGE", PromType::Gauge, "Power (W).");
        let temp = Counter::new(150, "DCGM_FI_DEV_GPU_TEMP", PromType::Gauge, "Temp (C).");
        let mut m0 = Metric::new(power.clone(), "42.5");
        m0.gpu = "0".to_string();
        m0.gpu_uuid = "GPU-aaaa".to_string();
        m0.attributes.insert("pod".to_string(), "trainer-0".to_string());
        let m1 = Metric::new(temp.clone(), "61");
        let mut snapshot = MetricsByCounter::default();
        snapshot.insert(power, vec![m0]);
        snapshot.insert(temp, vec![m1]);
        snapshot
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let snapshot = sample_snapshot();
        let encoded = encode_metrics_by_counter(&snapshot).unwrap();
        let decoded = decode_metrics_by_counter(&encoded).unwrap();
        assert_eq!(decoded.len(), snapshot.len());
        for (counter, list) in &snapshot {
            assert_eq!(decoded.get(counter), Some(list));
        }
    }

    #[test]
    fn decode_drops_empty_lists() {
        let decoded = decode_metrics_by_counter(r#"{"DCGM_FI_DEV_GPU_TEMP":[]}"#).unwrap();
        assert!(decoded.is_empty());
    }
}
