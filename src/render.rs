//! Prometheus exposition-format rendering of a gathered snapshot.

use crate::counters::{Counter, PromType};
use crate::dcgm::EntityGroup;
use crate::error::{ExporterError, Result};
use crate::metrics::{Metric, MetricsByCounterGroup};
use std::fmt::Write;

pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Renders every group of the snapshot into one text buffer. Counters are
/// emitted in field-name order so successive scrapes diff cleanly.
pub fn render_snapshot(snapshot: &MetricsByCounterGroup) -> Result<String> {
    let mut buf = String::new();
    let mut groups: Vec<&EntityGroup> = snapshot.keys().collect();
    groups.sort_by_key(|g| g.tag());
    for group in groups {
        render_group(&mut buf, *group, &snapshot[group])?;
    }
    Ok(buf)
}

/// One `# HELP` / `# TYPE` / samples section per counter of the group.
pub fn render_group(
    buf: &mut String,
    group: EntityGroup,
    metrics: &crate::metrics::MetricsByCounter,
) -> Result<()> {
    let mut counters: Vec<&Counter> = metrics.keys().collect();
    counters.sort_by(|a, b| a.field_name.cmp(&b.field_name));
    for counter in counters {
        // Label-typed counters ride on sibling series, never as their own.
        if counter.prom_type == PromType::Label {
            continue;
        }
        let list = &metrics[counter];
        if list.is_empty() {
            continue;
        }
        if counter.help.is_empty() {
            writeln!(buf, "# HELP {}", counter.field_name).ok();
        } else {
            writeln!(buf, "# HELP {} {}", counter.field_name, counter.help).ok();
        }
        writeln!(buf, "# TYPE {} {}", counter.field_name, type_name(counter.prom_type)).ok();
        for metric in list {
            let labels = label_set(group, metric)?;
            writeln!(buf, "{}{{{}}} {}", counter.field_name, labels, metric.value).ok();
        }
    }
    Ok(())
}

fn type_name(prom_type: PromType) -> &'static str {
    match prom_type {
        PromType::Gauge => "gauge",
        PromType::Counter => "counter",
        PromType::Histogram => "histogram",
        PromType::Label => "label",
    }
}

fn label_set(group: EntityGroup, metric: &Metric) -> Result<String> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    match group {
        EntityGroup::Gpu | EntityGroup::GpuInstance | EntityGroup::ComputeInstance
        | EntityGroup::Vgpu => {
            pairs.push(("gpu".to_string(), metric.gpu.clone()));
            pairs.push(("UUID".to_string(), metric.gpu_uuid.clone()));
            pairs.push(("pci_bus_id".to_string(), metric.gpu_pci_bus_id.clone()));
            pairs.push(("device".to_string(), metric.gpu_device.clone()));
            pairs.push(("modelName".to_string(), metric.gpu_model_name.clone()));
            if !metric.mig_profile.is_empty() {
                pairs.push(("GPU_I_PROFILE".to_string(), metric.mig_profile.clone()));
                pairs.push(("GPU_I_ID".to_string(), metric.gpu_instance_id.clone()));
            }
        }
        EntityGroup::Switch => {
            pairs.push(("nvswitch".to_string(), metric.entity_id.to_string()));
        }
        EntityGroup::Link => {
            pairs.push(("nvlink".to_string(), metric.entity_id.to_string()));
            pairs.push(("nvswitch".to_string(), metric.parent_id.to_string()));
        }
        EntityGroup::Cpu => {
            pairs.push(("cpu".to_string(), metric.entity_id.to_string()));
        }
        EntityGroup::CpuCore => {
            pairs.push(("cpucore".to_string(), metric.entity_id.to_string()));
            pairs.push(("cpu".to_string(), metric.parent_id.to_string()));
        }
        EntityGroup::None => {
            return Err(ExporterError::Render(format!(
                "no label schema for entity group {group}"
            )));
        }
    }
    pairs.push(("Hostname".to_string(), metric.hostname.clone()));
    for (k, v) in metric.labels.iter().chain(metric.attributes.iter()) {
        pairs.push((k.clone(), v.clone()));
    }

    let mut out = String::new();
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write!(out, "{k}=\"{}\"", escape_label_value(v)).ok();
    }
    Ok(out)
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::Counter;
    use crate::metrics::{Metric, MetricsByCounter};

    fn power_metric() -> Metric {
        let counter = Counter::new(155, "DCGM_FI_DEV_POWER_USAGE", PromType::Gauge, "Power (W).");
        let mut metric = Metric::new(counter, "42");
        metric.gpu = "0".to_string();
        metric.gpu_uuid = "GPU-00000000-0000-0000-0000-000000000000".to_string();
        metric.gpu_device = "nvidia0".to_string();
        metric.gpu_model_name = "NVIDIA T400 4GB".to_string();
        metric.hostname = "testhost".to_string();
        metric
    }

    fn snapshot_of(metric: Metric) -> MetricsByCounter {
        let mut out = MetricsByCounter::default();
        out.insert(metric.counter.clone(), vec![metric]);
        out
    }

    #[test]
    fn gpu_block_matches_the_exposition_format() {
        let mut buf = String::new();
        render_group(&mut buf, EntityGroup::Gpu, &snapshot_of(power_metric())).unwrap();
        assert_eq!(
            buf,
            "# HELP DCGM_FI_DEV_POWER_USAGE Power (W).\n\
             # TYPE DCGM_FI_DEV_POWER_USAGE gauge\n\
             DCGM_FI_DEV_POWER_USAGE{gpu=\"0\",\
             UUID=\"GPU-00000000-0000-0000-0000-000000000000\",\
             pci_bus_id=\"\",device=\"nvidia0\",\
             modelName=\"NVIDIA T400 4GB\",Hostname=\"testhost\"} 42\n"
        );
    }

    #[test]
    fn mig_metrics_carry_instance_labels() {
        let mut metric = power_metric();
        metric.mig_profile = "1g.10gb".to_string();
        metric.gpu_instance_id = "1".to_string();
        let mut buf = String::new();
        render_group(&mut buf, EntityGroup::Gpu, &snapshot_of(metric)).unwrap();
        assert!(buf.contains("GPU_I_PROFILE=\"1g.10gb\",GPU_I_ID=\"1\""));
    }

    #[test]
    fn attributes_and_labels_append_in_key_order() {
        let mut metric = power_metric();
        metric.attributes.insert("pod".to_string(), "trainer-0".to_string());
        metric.attributes.insert("namespace".to_string(), "ml".to_string());
        metric.labels.insert("team".to_string(), "infra".to_string());
        let mut buf = String::new();
        render_group(&mut buf, EntityGroup::Gpu, &snapshot_of(metric)).unwrap();
        assert!(buf.contains("team=\"infra\",namespace=\"ml\",pod=\"trainer-0\""));
    }

    #[test]
    fn switch_and_link_schemas() {
        let counter = Counter::new(700, "DCGM_FI_DEV_NVSWITCH_TEMP", PromType::Gauge, "");
        let mut switch = Metric::new(counter.clone(), "35");
        switch.entity_id = 3;
        switch.hostname = "testhost".to_string();
        let mut buf = String::new();
        render_group(&mut buf, EntityGroup::Switch, &snapshot_of(switch)).unwrap();
        assert!(buf.contains("{nvswitch=\"3\",Hostname=\"testhost\"} 35"));

        let mut link = Metric::new(counter, "1");
        link.entity_id = 7;
        link.parent_id = 3;
        link.hostname = "testhost".to_string();
        buf.clear();
        render_group(&mut buf, EntityGroup::Link, &snapshot_of(link)).unwrap();
        assert!(buf.contains("{nvlink=\"7\",nvswitch=\"3\",Hostname=\"testhost\"} 1"));
    }

    #[test]
    fn cpu_core_schema_names_its_parent() {
        let counter = Counter::new(1100, "DCGM_FI_DEV_CPU_UTIL_TOTAL", PromType::Gauge, "");
        let mut metric = Metric::new(counter, "12.5");
        metric.entity_id = 66;
        metric.parent_id = 1;
        metric.hostname = "testhost".to_string();
        let mut buf = String::new();
        render_group(&mut buf, EntityGroup::CpuCore, &snapshot_of(metric)).unwrap();
        assert!(buf.contains("{cpucore=\"66\",cpu=\"1\",Hostname=\"testhost\"} 12.5"));
    }

    #[test]
    fn unknown_group_is_a_render_error() {
        let mut buf = String::new();
        let err =
            render_group(&mut buf, EntityGroup::None, &snapshot_of(power_metric())).unwrap_err();
        assert!(matches!(err, ExporterError::Render(_)));
    }

    #[test]
    fn label_values_are_escaped() {
        assert_eq!(escape_label_value(r#"a"b\c"#), r#"a\"b\\c"#);
        assert_eq!(escape_label_value("line\nbreak"), "line\\nbreak");
    }

    #[test]
    fn label_typed_counters_are_skipped() {
        let counter = Counter::new(50, "DCGM_FI_DEV_NAME", PromType::Label, "");
        let mut metric = power_metric();
        metric.counter = counter.clone();
        let mut snapshot = MetricsByCounter::default();
        snapshot.insert(counter, vec![metric]);
        let mut buf = String::new();
        render_group(&mut buf, EntityGroup::Gpu, &snapshot).unwrap();
        assert!(buf.is_empty());
    }
}
