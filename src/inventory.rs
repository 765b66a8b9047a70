//! Device inventory: topology discovery and inclusion filtering.
//!
//! Built once per entity kind at startup and published immutably; collectors
//! and transformers only ever read it. Discovery failures are fatal unless the
//! fake-GPU degradation is enabled for development hosts.

use crate::dcgm::{
    DcgmClient, DeviceIdentifier, EntityGroup, FieldScalar, GroupEntityPair, LinkState,
    DCGM_FI_DEV_NAME, DCGM_FV_FLAG_LIVE_DATA,
};
use crate::error::{ExporterError, Result};
use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Upper bound on core-bitmask words per CPU (64 cores per word).
pub const MAX_CPU_BITMASK_WORDS: usize = 16;

/// Per-entity-kind inclusion policy.
///
/// `flex` means "everything, preferring MIG partitions over whole GPUs".
/// Otherwise `major_range` addresses parents (GPU / switch / CPU) and
/// `minor_range` children (GPU instance / NVLink / core); `[-1]` means all at
/// that level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOptions {
    pub flex: bool,
    pub major_range: Vec<i32>,
    pub minor_range: Vec<i32>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            flex: true,
            major_range: Vec::new(),
            minor_range: Vec::new(),
        }
    }
}

impl DeviceOptions {
    pub fn all() -> Self {
        Self {
            flex: false,
            major_range: vec![-1],
            minor_range: vec![-1],
        }
    }
}

/// True if `range` admits `id`: non-empty and either the `[-1]` wildcard or an
/// explicit member.
pub fn should_monitor(range: &[i32], id: i32) -> bool {
    match range.first() {
        None => false,
        Some(-1) => true,
        Some(_) => range.contains(&id),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeInstanceInfo {
    pub entity_id: u32,
    pub nvml_compute_instance_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuInstanceInfo {
    pub entity_id: u32,
    pub nvml_instance_id: u32,
    pub profile_name: String,
    pub compute_instances: Vec<ComputeInstanceInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub uuid: String,
    pub pci_bus_id: String,
    pub model: String,
    pub driver_version: String,
    pub mig_enabled: bool,
    pub instances: Vec<GpuInstanceInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvLinkInfo {
    pub index: u32,
    pub parent_id: u32,
    pub state: LinkState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwitchInfo {
    pub entity_id: u32,
    pub nvlinks: Vec<NvLinkInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub entity_id: u32,
    pub cores: Vec<u32>,
}

/// The frozen inventory for one entity kind plus the options it was built with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub kind: EntityGroup,
    pub gpu_count: u32,
    pub gpus: Vec<GpuInfo>,
    pub switches: Vec<SwitchInfo>,
    pub cpus: Vec<CpuInfo>,
    pub g_opts: DeviceOptions,
    pub s_opts: DeviceOptions,
    pub c_opts: DeviceOptions,
}

impl DeviceInfo {
    /// Discovers the inventory for `kind` and verifies the user's ranges
    /// against it. Fatal on any missing entity or library failure, except the
    /// fake-GPU degradation path.
    pub fn initialize(
        client: &dyn DcgmClient,
        g_opts: DeviceOptions,
        s_opts: DeviceOptions,
        c_opts: DeviceOptions,
        use_fake_gpus: bool,
        kind: EntityGroup,
    ) -> Result<Self> {
        let mut info = Self {
            kind,
            gpu_count: 0,
            gpus: Vec::new(),
            switches: Vec::new(),
            cpus: Vec::new(),
            g_opts,
            s_opts,
            c_opts,
        };

        match kind {
            EntityGroup::Gpu | EntityGroup::GpuInstance | EntityGroup::ComputeInstance => {
                info.discover_gpus(client, use_fake_gpus)?;
            }
            EntityGroup::Switch | EntityGroup::Link => {
                info.discover_switches(client)?;
            }
            EntityGroup::Cpu | EntityGroup::CpuCore => {
                info.discover_cpus(client)?;
            }
            other => {
                return Err(ExporterError::Config(format!(
                    "cannot build an inventory for entity kind {other}"
                )));
            }
        }

        info.verify_device_presence()?;
        Ok(info)
    }

    fn discover_gpus(&mut self, client: &dyn DcgmClient, use_fake_gpus: bool) -> Result<()> {
        let count = client
            .get_all_device_count()
            .map_err(|e| ExporterError::Discovery(e.to_string()))?;
        self.gpu_count = count;

        for index in 0..count {
            match client.get_device_info(index) {
                Ok(device) => self.gpus.push(gpu_from_identifier(index, device)),
                Err(e) if use_fake_gpus => {
                    warn!("GPU {index} unreadable ({e}); synthesizing fake device");
                    self.gpus.push(GpuInfo {
                        index,
                        uuid: format!("fake{index}"),
                        ..GpuInfo::default()
                    });
                }
                Err(e) => return Err(ExporterError::Discovery(e.to_string())),
            }
        }

        let hierarchy = client
            .get_gpu_instance_hierarchy()
            .map_err(|e| ExporterError::Discovery(e.to_string()))?;

        // Instances first, compute instances second. Re-associating by parent
        // entity id makes the walk independent of the order the library emits
        // the flat list in.
        let mut instance_slot: HashMap<u32, (usize, usize)> = HashMap::new();
        for entry in &hierarchy.entries {
            if entry.parent.entity_group != EntityGroup::Gpu {
                continue;
            }
            let gpu_pos = self
                .gpus
                .iter()
                .position(|g| g.index == entry.parent.entity_id)
                .ok_or_else(|| {
                    ExporterError::Discovery(format!(
                        "GPU instance {} references unknown GPU {}",
                        entry.entity.entity_id, entry.parent.entity_id
                    ))
                })?;
            let gpu = &mut self.gpus[gpu_pos];
            gpu.mig_enabled = true;
            gpu.instances.push(GpuInstanceInfo {
                entity_id: entry.entity.entity_id,
                nvml_instance_id: entry.nvml_instance_id,
                profile_name: String::new(),
                compute_instances: Vec::new(),
            });
            instance_slot.insert(entry.entity.entity_id, (gpu_pos, gpu.instances.len() - 1));
        }

        for entry in &hierarchy.entries {
            if entry.parent.entity_group != EntityGroup::GpuInstance {
                continue;
            }
            let (gpu_pos, inst_pos) =
                *instance_slot.get(&entry.parent.entity_id).ok_or_else(|| {
                    ExporterError::Discovery(format!(
                        "compute instance {} references unknown GPU instance {}",
                        entry.entity.entity_id, entry.parent.entity_id
                    ))
                })?;
            self.gpus[gpu_pos].instances[inst_pos]
                .compute_instances
                .push(ComputeInstanceInfo {
                    entity_id: entry.entity.entity_id,
                    nvml_compute_instance_id: entry.nvml_compute_instance_id,
                });
        }

        self.populate_mig_profile_names(client)?;

        info!(
            "discovered {} GPUs, {} MIG-enabled",
            self.gpus.len(),
            self.gpus.iter().filter(|g| g.mig_enabled).count()
        );
        Ok(())
    }

    /// Batch-fetches `DCGM_FI_DEV_NAME` for every GPU instance to fill in the
    /// MIG profile names.
    fn populate_mig_profile_names(&mut self, client: &dyn DcgmClient) -> Result<()> {
        let entities: Vec<GroupEntityPair> = self
            .gpus
            .iter()
            .flat_map(|g| g.instances.iter())
            .map(|i| GroupEntityPair {
                entity_group: EntityGroup::GpuInstance,
                entity_id: i.entity_id,
            })
            .collect();
        if entities.is_empty() {
            return Ok(());
        }

        let values = client
            .entities_get_latest_values(&entities, &[DCGM_FI_DEV_NAME], DCGM_FV_FLAG_LIVE_DATA)
            .map_err(|e| ExporterError::Discovery(e.to_string()))?;

        let mut names: HashMap<u32, String> = HashMap::new();
        let mut mismatched = Vec::new();
        for value in values {
            if value.entity_group != EntityGroup::GpuInstance {
                mismatched.push(format!("{}:{}", value.entity_group, value.entity_id));
                continue;
            }
            match value.value {
                FieldScalar::Str(name) => {
                    names.insert(value.entity_id, name);
                }
                other => {
                    mismatched.push(format!("{} returned {other:?}", value.entity_id));
                }
            }
        }
        for gpu in &mut self.gpus {
            for instance in &mut gpu.instances {
                match names.get(&instance.entity_id) {
                    Some(name) => instance.profile_name = name.clone(),
                    None => mismatched.push(format!("no profile name for {}", instance.entity_id)),
                }
            }
        }
        if !mismatched.is_empty() {
            return Err(ExporterError::Discovery(format!(
                "MIG profile lookup mismatches: {}",
                mismatched.join(", ")
            )));
        }
        Ok(())
    }

    fn discover_switches(&mut self, client: &dyn DcgmClient) -> Result<()> {
        let switch_ids = client
            .get_entity_group_entities(EntityGroup::Switch)
            .map_err(|e| ExporterError::Discovery(e.to_string()))?;
        if switch_ids.is_empty() {
            return Err(ExporterError::Discovery("no NVSwitches found".to_string()));
        }
        let links = client
            .get_nvlink_link_status()
            .map_err(|e| ExporterError::Discovery(e.to_string()))?;

        for switch_id in switch_ids {
            if !self.s_opts.flex && !should_monitor(&self.s_opts.major_range, switch_id as i32) {
                continue;
            }
            let nvlinks: Vec<NvLinkInfo> = links
                .iter()
                .filter(|l| l.parent_type == EntityGroup::Switch && l.parent_id == switch_id)
                .filter(|l| {
                    self.s_opts.flex || should_monitor(&self.s_opts.minor_range, l.index as i32)
                })
                .map(|l| NvLinkInfo {
                    index: l.index,
                    parent_id: l.parent_id,
                    state: l.state,
                })
                .collect();
            self.switches.push(SwitchInfo {
                entity_id: switch_id,
                nvlinks,
            });
        }
        debug!("discovered {} NVSwitches", self.switches.len());
        Ok(())
    }

    fn discover_cpus(&mut self, client: &dyn DcgmClient) -> Result<()> {
        let hierarchy = client
            .get_cpu_hierarchy()
            .map_err(|e| ExporterError::Discovery(e.to_string()))?;
        if hierarchy.cpus.is_empty() {
            return Err(ExporterError::Discovery("no CPUs found".to_string()));
        }
        for cpu in &hierarchy.cpus {
            if !self.c_opts.flex && !should_monitor(&self.c_opts.major_range, cpu.cpu_id as i32) {
                continue;
            }
            let cores = decode_core_bitmask(&cpu.owned_cores)?
                .into_iter()
                .filter(|&core| {
                    self.c_opts.flex || should_monitor(&self.c_opts.minor_range, core as i32)
                })
                .collect();
            self.cpus.push(CpuInfo {
                entity_id: cpu.cpu_id,
                cores,
            });
        }
        debug!("discovered {} CPUs", self.cpus.len());
        Ok(())
    }

    /// Checks that every explicitly listed id in the active ranges exists in
    /// the discovered inventory.
    pub fn verify_device_presence(&self) -> Result<()> {
        match self.kind {
            EntityGroup::Gpu | EntityGroup::GpuInstance | EntityGroup::ComputeInstance => {
                if self.g_opts.flex {
                    return Ok(());
                }
                for &gpu_id in explicit_ids(&self.g_opts.major_range) {
                    if !self.gpus.iter().any(|g| g.index as i32 == gpu_id) {
                        return Err(ExporterError::Config(format!(
                            "GPU {gpu_id} in the device range was not found"
                        )));
                    }
                }
                for &instance_id in explicit_ids(&self.g_opts.minor_range) {
                    let found = self
                        .gpus
                        .iter()
                        .flat_map(|g| g.instances.iter())
                        .any(|i| i.entity_id as i32 == instance_id);
                    if !found {
                        return Err(ExporterError::Config(format!(
                            "GPU instance {instance_id} in the device range was not found"
                        )));
                    }
                }
            }
            EntityGroup::Switch | EntityGroup::Link => {
                if self.s_opts.flex {
                    return Ok(());
                }
                for &switch_id in explicit_ids(&self.s_opts.major_range) {
                    if !self.switches.iter().any(|s| s.entity_id as i32 == switch_id) {
                        return Err(ExporterError::Config(format!(
                            "NVSwitch {switch_id} in the device range was not found"
                        )));
                    }
                }
                for &link_id in explicit_ids(&self.s_opts.minor_range) {
                    let found = self
                        .switches
                        .iter()
                        .flat_map(|s| s.nvlinks.iter())
                        .any(|l| l.index as i32 == link_id);
                    if !found {
                        return Err(ExporterError::Config(format!(
                            "NVLink {link_id} in the device range was not found"
                        )));
                    }
                }
            }
            EntityGroup::Cpu | EntityGroup::CpuCore => {
                if self.c_opts.flex {
                    return Ok(());
                }
                for &cpu_id in explicit_ids(&self.c_opts.major_range) {
                    if !self.cpus.iter().any(|c| c.entity_id as i32 == cpu_id) {
                        return Err(ExporterError::Config(format!(
                            "CPU {cpu_id} in the device range was not found"
                        )));
                    }
                }
                for &core_id in explicit_ids(&self.c_opts.minor_range) {
                    let found = self
                        .cpus
                        .iter()
                        .flat_map(|c| c.cores.iter())
                        .any(|&c| c as i32 == core_id);
                    if !found {
                        return Err(ExporterError::Config(format!(
                            "CPU core {core_id} in the device range was not found"
                        )));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn is_cpu_watched(&self, cpu_id: u32) -> bool {
        if !self.cpus.iter().any(|c| c.entity_id == cpu_id) {
            return false;
        }
        if self.c_opts.flex {
            return true;
        }
        should_monitor(&self.c_opts.major_range, cpu_id as i32)
    }

    pub fn is_core_watched(&self, core_id: u32, cpu_id: u32) -> bool {
        if self.c_opts.flex {
            return true;
        }
        self.is_cpu_watched(cpu_id) && should_monitor(&self.c_opts.minor_range, core_id as i32)
    }

    pub fn is_switch_watched(&self, switch_id: u32) -> bool {
        if !self.switches.iter().any(|s| s.entity_id == switch_id) {
            return false;
        }
        if self.s_opts.flex {
            return true;
        }
        should_monitor(&self.s_opts.major_range, switch_id as i32)
    }

    pub fn is_link_watched(&self, link_index: u32, switch_id: u32) -> bool {
        let Some(switch) = self.switches.iter().find(|s| s.entity_id == switch_id) else {
            return false;
        };
        if !switch.nvlinks.iter().any(|l| l.index == link_index) {
            return false;
        }
        if self.s_opts.flex {
            return true;
        }
        self.is_switch_watched(switch_id)
            && should_monitor(&self.s_opts.minor_range, link_index as i32)
    }

    /// The GPU owning a given instance entity id, with the instance itself.
    pub fn find_instance(&self, entity_id: u32) -> Option<(&GpuInfo, &GpuInstanceInfo)> {
        self.gpus.iter().find_map(|g| {
            g.instances
                .iter()
                .find(|i| i.entity_id == entity_id)
                .map(|i| (g, i))
        })
    }
}

fn explicit_ids(range: &[i32]) -> impl Iterator<Item = &i32> {
    range.iter().filter(|&&id| id != -1)
}

fn gpu_from_identifier(index: u32, device: DeviceIdentifier) -> GpuInfo {
    GpuInfo {
        index,
        uuid: device.uuid,
        pci_bus_id: device.pci_bus_id,
        model: device.model,
        driver_version: device.driver_version,
        mig_enabled: false,
        instances: Vec::new(),
    }
}

/// Decodes owned-core bitmask words into sorted global core indexes: bit `k`
/// of word `w` is core `64*w + k`. Inputs beyond [`MAX_CPU_BITMASK_WORDS`]
/// are rejected rather than silently truncated.
pub fn decode_core_bitmask(words: &[u64]) -> Result<Vec<u32>> {
    if words.len() > MAX_CPU_BITMASK_WORDS {
        return Err(ExporterError::Config(format!(
            "core bitmask has {} words, maximum is {MAX_CPU_BITMASK_WORDS}",
            words.len()
        )));
    }
    let mut cores = Vec::new();
    for (word_index, &word) in words.iter().enumerate() {
        let mut remaining = word;
        while remaining != 0 {
            let bit = remaining.trailing_zeros();
            cores.push(64 * word_index as u32 + bit);
            remaining &= remaining - 1;
        }
    }
    Ok(cores)
}
