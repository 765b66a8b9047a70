//! Value and topology types shared with the backing DCGM library.
//!
//! These mirror the wire-level structures of the GPU management library closely
//! enough that a remote or in-process client can fill them without translation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity kind tags. The numeric values are fixed by the backing library and
/// must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum EntityGroup {
    None = 0,
    Gpu = 1,
    Vgpu = 2,
    Switch = 3,
    GpuInstance = 4,
    ComputeInstance = 5,
    Link = 6,
    Cpu = 7,
    CpuCore = 8,
}

impl EntityGroup {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Gpu),
            2 => Some(Self::Vgpu),
            3 => Some(Self::Switch),
            4 => Some(Self::GpuInstance),
            5 => Some(Self::ComputeInstance),
            6 => Some(Self::Link),
            7 => Some(Self::Cpu),
            8 => Some(Self::CpuCore),
            _ => None,
        }
    }

    pub fn tag(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for EntityGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "NONE",
            Self::Gpu => "GPU",
            Self::Vgpu => "vGPU",
            Self::Switch => "NvSwitch",
            Self::GpuInstance => "GPU_I",
            Self::ComputeInstance => "GPU_CI",
            Self::Link => "NvLink",
            Self::Cpu => "CPU",
            Self::CpuCore => "CPU_CORE",
        };
        f.write_str(s)
    }
}

/// An `(entity-group, entity-id)` pair as used in group membership and batched
/// field requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupEntityPair {
    pub entity_group: EntityGroup,
    pub entity_id: u32,
}

/// Opaque handle to a library-side entity group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupHandle(pub u64);

/// Opaque handle to a library-side field group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldGroupHandle(pub u64);

/// Scalar kinds a field can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Double,
    Int64,
    String,
    Blob,
}

/// A single sampled value for one field on one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldScalar {
    Int64(i64),
    Double(f64),
    Str(String),
    Blob(Vec<u8>),
}

/// Sample returned by `entities_get_latest_values`.
#[derive(Debug, Clone)]
pub struct FieldValue {
    pub entity_group: EntityGroup,
    pub entity_id: u32,
    pub field_id: u16,
    pub value: FieldScalar,
    /// Library status for this individual sample; nonzero maps to a blank.
    pub status: i32,
}

/// Field metadata from `field_get_by_id`.
#[derive(Debug, Clone)]
pub struct FieldMeta {
    pub field_id: u16,
    pub field_name: String,
    pub kind: FieldKind,
    /// The entity kind this field is natively attached to.
    pub entity_level: EntityGroup,
}

/// Device descriptor from `get_device_info`.
#[derive(Debug, Clone, Default)]
pub struct DeviceIdentifier {
    pub gpu_id: u32,
    pub uuid: String,
    pub pci_bus_id: String,
    pub model: String,
    pub driver_version: String,
}

/// One row of the flattened MIG hierarchy.
#[derive(Debug, Clone)]
pub struct MigHierarchyEntry {
    pub entity: GroupEntityPair,
    pub parent: GroupEntityPair,
    /// NVML-side index of the owning physical GPU.
    pub nvml_gpu_index: u32,
    pub nvml_instance_id: u32,
    pub nvml_compute_instance_id: u32,
}

/// Flattened MIG hierarchy as emitted by the library.
#[derive(Debug, Clone, Default)]
pub struct MigHierarchy {
    pub entries: Vec<MigHierarchyEntry>,
}

/// One CPU socket with its owned-core bitmask, 64 cores per word.
#[derive(Debug, Clone)]
pub struct CpuHierarchyCpu {
    pub cpu_id: u32,
    pub owned_cores: Vec<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct CpuHierarchy {
    pub cpus: Vec<CpuHierarchyCpu>,
}

/// NVLink state as reported by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    NotSupported,
    Disabled,
    Down,
    Up,
}

/// Raw per-link status row from `get_nvlink_link_status`.
#[derive(Debug, Clone, Copy)]
pub struct RawNvLinkStatus {
    pub parent_type: EntityGroup,
    pub parent_id: u32,
    pub index: u32,
    pub state: LinkState,
}

/// Subsystems the health watch covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSystem {
    Pcie,
    NvLink,
    Pmu,
    Mcu,
    Memory,
    Sm,
    InfoRom,
    Thermal,
    Power,
    Driver,
}

impl fmt::Display for HealthSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pcie => "PCIe",
            Self::NvLink => "NvLink",
            Self::Pmu => "PMU",
            Self::Mcu => "MCU",
            Self::Memory => "Memory",
            Self::Sm => "SM",
            Self::InfoRom => "InfoROM",
            Self::Thermal => "Thermal",
            Self::Power => "Power",
            Self::Driver => "Driver",
        };
        f.write_str(s)
    }
}

/// Overall and per-incident health verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthResult {
    Pass,
    Warn,
    Fail,
}

/// One health incident attributed to an entity.
#[derive(Debug, Clone)]
pub struct HealthIncident {
    pub entity: GroupEntityPair,
    pub system: HealthSystem,
    pub health: HealthResult,
    pub error_message: String,
    pub error_code: u32,
}

/// Response of `health_check` on a group.
#[derive(Debug, Clone, Default)]
pub struct HealthCheckResponse {
    pub incidents: Vec<HealthIncident>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_group_tags_round_trip() {
        for tag in 0..=8 {
            let group = EntityGroup::from_tag(tag).unwrap();
            assert_eq!(group.tag(), tag);
        }
        assert!(EntityGroup::from_tag(9).is_none());
    }

    #[test]
    fn entity_group_display_names() {
        assert_eq!(EntityGroup::Gpu.to_string(), "GPU");
        assert_eq!(EntityGroup::GpuInstance.to_string(), "GPU_I");
        assert_eq!(EntityGroup::CpuCore.to_string(), "CPU_CORE");
    }
}
