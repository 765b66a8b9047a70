//! Watch-list construction: field selection, library-side groups and watches.
//!
//! One watch-list per entity kind in use. Group and field-group handles are
//! unmanaged library resources; every acquisition registers a releaser, and
//! releasers run in LIFO order on build failure and at shutdown.

use crate::counters::{should_include, Counter};
use crate::dcgm::{
    DcgmClient, EntityGroup, FieldGroupHandle, GroupHandle, GROUP_MAX_ENTITIES, MAX_KEEP_AGE_SECS,
    MAX_KEEP_SAMPLES,
};
use crate::error::Result;
use crate::inventory::DeviceInfo;
use crate::selector::{self, MonitoredEntity};
use ahash::AHashMap as HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A releaser for one acquired library handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupHandle {
    Group(GroupHandle),
    FieldGroup(FieldGroupHandle),
}

/// Frozen watch state for one entity kind.
pub struct WatchList {
    pub device_info: DeviceInfo,
    /// Counters whose field made it through entity-level selection.
    pub counters: Vec<Counter>,
    pub fields: Vec<u16>,
    pub group_handles: Vec<GroupHandle>,
    pub field_group_handle: Option<FieldGroupHandle>,
    cleanups: Vec<CleanupHandle>,
}

impl WatchList {
    /// Runs every registered releaser in LIFO order. Failures are logged and
    /// swallowed; releasing is best effort.
    pub fn cleanup(&mut self, client: &dyn DcgmClient) {
        while let Some(handle) = self.cleanups.pop() {
            let result = match handle {
                CleanupHandle::Group(g) => client.destroy_group(g),
                CleanupHandle::FieldGroup(fg) => client.field_group_destroy(fg),
            };
            if let Err(e) = result {
                warn!("failed to release {handle:?}: {e}");
            }
        }
        self.group_handles.clear();
        self.field_group_handle = None;
    }
}

/// Builds the watch-list for `device_info.kind`: selects the counters whose
/// entity level is compatible, creates entity groups and a field group in the
/// library, and registers the watch at `update_freq_us`.
pub fn build_watch_list(
    client: &dyn DcgmClient,
    counters: &[Counter],
    device_info: DeviceInfo,
    update_freq_us: i64,
) -> Result<WatchList> {
    let kind = device_info.kind;

    let mut selected = Vec::new();
    let mut fields = Vec::new();
    for counter in counters {
        let meta = client.field_get_by_id(counter.field_id)?;
        if should_include(kind, meta.entity_level) {
            fields.push(counter.field_id);
            selected.push(counter.clone());
        }
    }

    let mut list = WatchList {
        device_info,
        counters: selected,
        fields,
        group_handles: Vec::new(),
        field_group_handle: None,
        cleanups: Vec::new(),
    };

    if list.fields.is_empty() {
        debug!("no counters apply to {kind}; skipping watch registration");
        return Ok(list);
    }

    if let Err(e) = build_groups_and_watch(client, &mut list, update_freq_us) {
        list.cleanup(client);
        return Err(e);
    }

    info!(
        "watching {} fields on {} across {} groups",
        list.fields.len(),
        kind,
        list.group_handles.len()
    );
    Ok(list)
}

fn build_groups_and_watch(
    client: &dyn DcgmClient,
    list: &mut WatchList,
    update_freq_us: i64,
) -> Result<()> {
    let kind = list.device_info.kind;
    let memberships = group_memberships(&list.device_info);

    for members in memberships {
        if members.is_empty() {
            continue;
        }
        let group = client.create_group(&group_name(kind))?;
        list.group_handles.push(group);
        list.cleanups.push(CleanupHandle::Group(group));
        for entity in &members {
            client.add_entity_to_group(group, entity.entity.entity_group, entity.entity.entity_id)?;
        }
    }

    if list.group_handles.is_empty() {
        debug!("no entities selected for {kind}; skipping watch registration");
        return Ok(());
    }

    let field_group = client.field_group_create(&field_group_name(kind), &list.fields)?;
    list.field_group_handle = Some(field_group);
    list.cleanups.push(CleanupHandle::FieldGroup(field_group));

    for &group in &list.group_handles {
        client.watch_fields_with_group_ex(
            field_group,
            group,
            update_freq_us,
            MAX_KEEP_AGE_SECS,
            MAX_KEEP_SAMPLES,
        )?;
    }
    Ok(())
}

/// Partitions the selected entities into library groups.
///
/// Most kinds get a single group. CPU cores get one group per CPU, split again
/// whenever a group reaches `GROUP_MAX_ENTITIES`. NVLinks get one group per
/// switch holding only its UP links.
fn group_memberships(info: &DeviceInfo) -> Vec<Vec<MonitoredEntity>> {
    let entities = selector::enumerate(info);
    match info.kind {
        EntityGroup::CpuCore => {
            let mut by_cpu: HashMap<u32, Vec<MonitoredEntity>> = HashMap::new();
            let mut cpu_order = Vec::new();
            for entity in entities {
                let cpu = entity.parent_id.unwrap_or(0);
                if !by_cpu.contains_key(&cpu) {
                    cpu_order.push(cpu);
                }
                by_cpu.entry(cpu).or_default().push(entity);
            }
            let mut groups = Vec::new();
            for cpu in cpu_order {
                let cores = by_cpu.remove(&cpu).unwrap_or_default();
                for chunk in cores.chunks(GROUP_MAX_ENTITIES) {
                    groups.push(chunk.to_vec());
                }
            }
            groups
        }
        EntityGroup::Link => {
            let mut by_switch: HashMap<u32, Vec<MonitoredEntity>> = HashMap::new();
            let mut switch_order = Vec::new();
            for entity in entities {
                let switch = entity.parent_id.unwrap_or(0);
                if !by_switch.contains_key(&switch) {
                    switch_order.push(switch);
                }
                by_switch.entry(switch).or_default().push(entity);
            }
            switch_order
                .into_iter()
                .filter_map(|s| by_switch.remove(&s))
                .collect()
        }
        _ => vec![entities],
    }
}

// Group names carry a 64-bit random suffix so concurrent exporter processes
// sharing one host engine never collide.
fn group_name(kind: EntityGroup) -> String {
    format!("dcgm-exporter-{}-{:016x}", kind, rand::random::<u64>())
}

fn field_group_name(kind: EntityGroup) -> String {
    format!("dcgm-exporter-fields-{}-{:016x}", kind, rand::random::<u64>())
}

/// All watch-lists by entity kind, as handed to the HTTP surface.
#[derive(Default)]
pub struct WatchListManager {
    lists: HashMap<EntityGroup, WatchList>,
}

impl WatchListManager {
    pub fn insert(&mut self, list: WatchList) {
        self.lists.insert(list.device_info.kind, list);
    }

    pub fn get(&self, kind: EntityGroup) -> Option<&WatchList> {
        self.lists.get(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WatchList> {
        self.lists.values()
    }

    /// Tears every watch-list down, LIFO within each list.
    pub fn cleanup(&mut self, client: &dyn DcgmClient) {
        for list in self.lists.values_mut() {
            list.cleanup(client);
        }
    }
}

/// Shared handle used by collectors; cleanup runs through the manager.
pub type SharedWatchListManager = Arc<tokio::sync::RwLock<WatchListManager>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::PromType;
    use crate::dcgm::fake::FakeDcgmClient;
    use crate::dcgm::{CpuHierarchy, CpuHierarchyCpu, FieldKind, FieldMeta};
    use crate::inventory::DeviceOptions;

    fn meta(field_id: u16, level: EntityGroup) -> FieldMeta {
        FieldMeta {
            field_id,
            field_name: format!("DCGM_FI_{field_id}"),
            kind: FieldKind::Double,
            entity_level: level,
        }
    }

    fn counter(field_id: u16) -> Counter {
        Counter::new(field_id, &format!("DCGM_FI_{field_id}"), PromType::Gauge, "")
    }

    fn gpu_inventory(client: &FakeDcgmClient) -> DeviceInfo {
        DeviceInfo::initialize(
            client,
            DeviceOptions::default(),
            DeviceOptions::default(),
            DeviceOptions::default(),
            false,
            EntityGroup::Gpu,
        )
        .unwrap()
    }

    #[test]
    fn field_selection_follows_entity_level() {
        let client = FakeDcgmClient::new()
            .with_gpu(0, "NVIDIA H100")
            .with_field(meta(100, EntityGroup::Gpu))
            .with_field(meta(101, EntityGroup::GpuInstance))
            .with_field(meta(102, EntityGroup::Cpu))
            .with_field(meta(103, EntityGroup::None));
        let info = gpu_inventory(&client);
        let list = build_watch_list(
            &client,
            &[counter(100), counter(101), counter(102), counter(103)],
            info,
            30_000_000,
        )
        .unwrap();
        assert_eq!(list.fields, vec![100, 101, 103]);
    }

    #[test]
    fn registers_one_watch_per_group() {
        let client = FakeDcgmClient::new()
            .with_gpu(0, "NVIDIA H100")
            .with_gpu(1, "NVIDIA H100")
            .with_field(meta(100, EntityGroup::Gpu));
        let info = gpu_inventory(&client);
        let list = build_watch_list(&client, &[counter(100)], info, 10_000_000).unwrap();
        assert_eq!(list.group_handles.len(), 1);
        let members = client.group_members(list.group_handles[0]).unwrap();
        assert_eq!(members.len(), 2);
        let watches = client.watches();
        assert_eq!(watches.len(), 1);
        assert_eq!(watches[0].2, 10_000_000);
    }

    #[test]
    fn core_groups_partition_at_group_capacity() {
        let mut client = FakeDcgmClient::new().with_field(meta(200, EntityGroup::CpuCore));
        client.cpu_hierarchy = CpuHierarchy {
            cpus: vec![
                CpuHierarchyCpu {
                    cpu_id: 0,
                    // 150 cores on CPU 0.
                    owned_cores: vec![u64::MAX, u64::MAX, (1 << 22) - 1],
                },
                CpuHierarchyCpu {
                    cpu_id: 1,
                    owned_cores: vec![0, 0, 0, u64::MAX],
                },
            ],
        };
        let info = DeviceInfo::initialize(
            &client,
            DeviceOptions::default(),
            DeviceOptions::default(),
            DeviceOptions::default(),
            false,
            EntityGroup::CpuCore,
        )
        .unwrap();
        let list = build_watch_list(&client, &[counter(200)], info, 30_000_000).unwrap();

        // CPU 0: 150 cores -> 64 + 64 + 22; CPU 1: 64 cores -> one group.
        assert_eq!(list.group_handles.len(), 4);
        let mut seen = std::collections::HashSet::new();
        for &group in &list.group_handles {
            let members = client.group_members(group).unwrap();
            assert!(members.len() <= GROUP_MAX_ENTITIES);
            for member in members {
                assert!(seen.insert(member), "core listed in two groups: {member:?}");
            }
        }
        assert_eq!(seen.len(), 150 + 64);
    }

    #[test]
    fn failed_build_releases_handles_lifo() {
        let client = FakeDcgmClient::new()
            .with_gpu(0, "NVIDIA H100")
            .with_field(meta(100, EntityGroup::Gpu));
        client.fail_call("watch_fields_with_group_ex");
        let info = gpu_inventory(&client);
        let err = build_watch_list(&client, &[counter(100)], info, 30_000_000);
        assert!(err.is_err());

        // Field group (created last) released first, then the entity group.
        let order = client.destroy_order();
        assert_eq!(order.len(), 2);
        assert!(order[0] > order[1]);
        assert_eq!(client.live_groups(), 0);
    }

    #[test]
    fn no_matching_counters_builds_an_inert_list() {
        let client = FakeDcgmClient::new()
            .with_gpu(0, "NVIDIA H100")
            .with_field(meta(102, EntityGroup::Cpu));
        let info = gpu_inventory(&client);
        let list = build_watch_list(&client, &[counter(102)], info, 30_000_000).unwrap();
        assert!(list.fields.is_empty());
        assert!(list.group_handles.is_empty());
        assert!(client.watches().is_empty());
    }
}
