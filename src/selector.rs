//! Monitored-entity enumeration.
//!
//! Pure functions over a frozen [`DeviceInfo`]: produce the flat, ordered list
//! of entities the collectors iterate and the watch-list manager groups.
//! Enumeration order is deterministic (discovery order, ascending ids), which
//! fixes the order of rendered series within a counter.

use crate::dcgm::{EntityGroup, GroupEntityPair, LinkState};
use crate::inventory::{should_monitor, DeviceInfo, GpuInfo, GpuInstanceInfo};

/// One entity selected for monitoring, with the identity needed to label its
/// metrics.
#[derive(Debug, Clone)]
pub struct MonitoredEntity {
    pub entity: GroupEntityPair,
    pub parent_id: Option<u32>,
    pub gpu: Option<GpuInfo>,
    pub instance: Option<GpuInstanceInfo>,
}

impl MonitoredEntity {
    fn plain(group: EntityGroup, entity_id: u32, parent_id: Option<u32>) -> Self {
        Self {
            entity: GroupEntityPair {
                entity_group: group,
                entity_id,
            },
            parent_id,
            gpu: None,
            instance: None,
        }
    }

    fn for_gpu(gpu: &GpuInfo) -> Self {
        Self {
            entity: GroupEntityPair {
                entity_group: EntityGroup::Gpu,
                entity_id: gpu.index,
            },
            parent_id: None,
            gpu: Some(gpu.clone()),
            instance: None,
        }
    }

    fn for_instance(gpu: &GpuInfo, instance: &GpuInstanceInfo) -> Self {
        Self {
            entity: GroupEntityPair {
                entity_group: EntityGroup::GpuInstance,
                entity_id: instance.entity_id,
            },
            parent_id: Some(gpu.index),
            gpu: Some(gpu.clone()),
            instance: Some(instance.clone()),
        }
    }
}

/// Enumerates the entities of `info.kind` selected by the inventory's options.
pub fn enumerate(info: &DeviceInfo) -> Vec<MonitoredEntity> {
    match info.kind {
        EntityGroup::Gpu => enumerate_gpus(info),
        EntityGroup::GpuInstance => enumerate_instances(info),
        EntityGroup::ComputeInstance => enumerate_compute_instances(info),
        EntityGroup::Switch => info
            .switches
            .iter()
            .filter(|s| info.is_switch_watched(s.entity_id))
            .map(|s| MonitoredEntity::plain(EntityGroup::Switch, s.entity_id, None))
            .collect(),
        EntityGroup::Link => info
            .switches
            .iter()
            .flat_map(|s| s.nvlinks.iter().map(move |l| (s.entity_id, l)))
            .filter(|(switch_id, l)| {
                l.state == LinkState::Up && info.is_link_watched(l.index, *switch_id)
            })
            .map(|(switch_id, l)| {
                MonitoredEntity::plain(EntityGroup::Link, l.index, Some(switch_id))
            })
            .collect(),
        EntityGroup::Cpu => info
            .cpus
            .iter()
            .filter(|c| info.is_cpu_watched(c.entity_id))
            .map(|c| MonitoredEntity::plain(EntityGroup::Cpu, c.entity_id, None))
            .collect(),
        EntityGroup::CpuCore => info
            .cpus
            .iter()
            .flat_map(|c| c.cores.iter().map(move |&core| (c.entity_id, core)))
            .filter(|(cpu_id, core)| info.is_core_watched(*core, *cpu_id))
            .map(|(cpu_id, core)| MonitoredEntity::plain(EntityGroup::CpuCore, core, Some(cpu_id)))
            .collect(),
        _ => Vec::new(),
    }
}

/// GPU-kind enumeration.
///
/// With `flex`, MIG partitions stand in for their parent: every instance is
/// emitted, and a GPU itself only when it has none. With explicit ranges the
/// major range selects whole GPUs and the minor range selects instances; the
/// two selections are emitted as a union. Ranges filter strictly: a GPU or
/// instance outside the range is never emitted.
fn enumerate_gpus(info: &DeviceInfo) -> Vec<MonitoredEntity> {
    let mut out = Vec::new();
    if info.g_opts.flex {
        for gpu in &info.gpus {
            if gpu.instances.is_empty() {
                out.push(MonitoredEntity::for_gpu(gpu));
            } else {
                for instance in &gpu.instances {
                    out.push(MonitoredEntity::for_instance(gpu, instance));
                }
            }
        }
        return out;
    }

    for gpu in &info.gpus {
        if should_monitor(&info.g_opts.major_range, gpu.index as i32) {
            out.push(MonitoredEntity::for_gpu(gpu));
        }
    }
    for gpu in &info.gpus {
        for instance in &gpu.instances {
            if should_monitor(&info.g_opts.minor_range, instance.entity_id as i32) {
                out.push(MonitoredEntity::for_instance(gpu, instance));
            }
        }
    }
    out
}

fn enumerate_instances(info: &DeviceInfo) -> Vec<MonitoredEntity> {
    info.gpus
        .iter()
        .flat_map(|g| g.instances.iter().map(move |i| (g, i)))
        .filter(|(g, i)| {
            info.g_opts.flex
                || (should_monitor(&info.g_opts.major_range, g.index as i32)
                    && should_monitor(&info.g_opts.minor_range, i.entity_id as i32))
        })
        .map(|(g, i)| MonitoredEntity::for_instance(g, i))
        .collect()
}

fn enumerate_compute_instances(info: &DeviceInfo) -> Vec<MonitoredEntity> {
    let mut out = Vec::new();
    for gpu in &info.gpus {
        for instance in &gpu.instances {
            for ci in &instance.compute_instances {
                let mut entity = MonitoredEntity::for_instance(gpu, instance);
                entity.entity = GroupEntityPair {
                    entity_group: EntityGroup::ComputeInstance,
                    entity_id: ci.entity_id,
                };
                entity.parent_id = Some(instance.entity_id);
                out.push(entity);
            }
        }
    }
    out
}
