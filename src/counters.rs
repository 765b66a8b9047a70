//! Counter descriptors: the user-facing metric definitions.
//!
//! Counters are loaded from a YAML file (`--collectors <file>`), one entry per
//! DCGM field to export. The watch-list manager later resolves each counter's
//! native entity level through the library.

use crate::dcgm::EntityGroup;
use crate::error::{ExporterError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Output type of a counter in the exposition format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromType {
    Gauge,
    Counter,
    /// Exported as a label on sibling metrics rather than a series of its own.
    Label,
    Histogram,
}

impl fmt::Display for PromType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
            Self::Label => "label",
            Self::Histogram => "histogram",
        };
        f.write_str(s)
    }
}

/// One user-facing metric definition tied to a DCGM field id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Counter {
    pub field_id: u16,
    pub field_name: String,
    pub prom_type: PromType,
    #[serde(default)]
    pub help: String,
}

impl Counter {
    pub fn new(field_id: u16, field_name: &str, prom_type: PromType, help: &str) -> Self {
        Self {
            field_id,
            field_name: field_name.to_string(),
            prom_type,
            help: help.to_string(),
        }
    }
}

/// Counters plus the entity level DCGM reports for each, frozen per watch-list.
#[derive(Debug, Clone)]
pub struct CounterSet {
    pub counters: Vec<Counter>,
}

#[derive(Debug, Deserialize)]
struct CounterFile {
    counters: Vec<Counter>,
}

/// Loads the counter definitions from a YAML file.
///
/// Duplicate field ids and empty names are configuration errors; the exporter
/// refuses to start rather than exporting ambiguous series.
pub fn load_counter_file(path: &Path) -> Result<Vec<Counter>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ExporterError::Config(format!("cannot read {}: {e}", path.display())))?;
    let parsed: CounterFile = serde_yaml::from_str(&raw)
        .map_err(|e| ExporterError::Config(format!("invalid counter file {}: {e}", path.display())))?;
    validate_counters(&parsed.counters)?;
    Ok(parsed.counters)
}

pub fn validate_counters(counters: &[Counter]) -> Result<()> {
    let mut seen = ahash::AHashSet::new();
    for counter in counters {
        if counter.field_name.is_empty() {
            return Err(ExporterError::Config(format!(
                "counter for field {} has an empty name",
                counter.field_id
            )));
        }
        if !seen.insert(counter.field_id) {
            return Err(ExporterError::Config(format!(
                "duplicate counter field id {}",
                counter.field_id
            )));
        }
    }
    Ok(())
}

/// Entity levels a counter of the given level may attach to for a watch-list
/// of kind `kind`. `EntityGroup::None` attaches everywhere.
pub fn should_include(kind: EntityGroup, entity_level: EntityGroup) -> bool {
    if entity_level == EntityGroup::None || entity_level == kind {
        return true;
    }
    match kind {
        EntityGroup::Gpu => matches!(
            entity_level,
            EntityGroup::GpuInstance | EntityGroup::ComputeInstance | EntityGroup::Vgpu
        ),
        EntityGroup::Cpu => entity_level == EntityGroup::CpuCore,
        EntityGroup::Switch => entity_level == EntityGroup::Link,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_yaml_counter_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "counters:\n  - field_id: 155\n    field_name: DCGM_FI_DEV_POWER_USAGE\n    prom_type: gauge\n    help: Power draw (W).\n  - field_id: 150\n    field_name: DCGM_FI_DEV_GPU_TEMP\n    prom_type: gauge\n"
        )
        .unwrap();
        let counters = load_counter_file(file.path()).unwrap();
        assert_eq!(counters.len(), 2);
        assert_eq!(counters[0].field_name, "DCGM_FI_DEV_POWER_USAGE");
        assert_eq!(counters[1].help, "");
    }

    #[test]
    fn rejects_duplicate_field_ids() {
        let counters = vec![
            Counter::new(155, "A", PromType::Gauge, ""),
            Counter::new(155, "B", PromType::Gauge, ""),
        ];
        assert!(validate_counters(&counters).is_err());
    }

    #[test]
    fn compatibility_sets_per_kind() {
        use EntityGroup::*;
        assert!(should_include(Gpu, Gpu));
        assert!(should_include(Gpu, None));
        assert!(should_include(Gpu, GpuInstance));
        assert!(should_include(Gpu, ComputeInstance));
        assert!(should_include(Gpu, Vgpu));
        assert!(!should_include(Gpu, Cpu));
        assert!(should_include(Cpu, CpuCore));
        assert!(!should_include(Cpu, Gpu));
        assert!(should_include(Switch, Link));
        assert!(!should_include(Switch, Gpu));
        assert!(!should_include(Link, Switch));
    }
}
