//! Deterministic in-memory DCGM client.
//!
//! Backs the `--fake-gpus` development mode and every test that exercises
//! discovery, watch-list construction or collection without real hardware.
//! Topology and sample values are scripted up front; group and field-group
//! bookkeeping behaves like the real library, including destroy-order
//! recording and per-call failure injection.

use super::*;
use ahash::AHashMap as HashMap;
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Default)]
struct FakeState {
    groups: HashMap<u64, Vec<GroupEntityPair>>,
    field_groups: HashMap<u64, Vec<u16>>,
    next_handle: u64,
    /// Handles in the order they were destroyed, for teardown-order assertions.
    destroy_order: Vec<u64>,
    watches: Vec<(u64, u64, i64)>,
    fail_calls: HashSet<&'static str>,
    healthy_groups: HashSet<u64>,
}

/// Scripted DCGM client. All getters are cheap clones of the scripted data.
pub struct FakeDcgmClient {
    pub devices: Vec<DeviceIdentifier>,
    pub mig: MigHierarchy,
    pub cpu_hierarchy: CpuHierarchy,
    pub switch_ids: Vec<u32>,
    pub links: Vec<RawNvLinkStatus>,
    pub fields: HashMap<u16, FieldMeta>,
    pub values: HashMap<(EntityGroup, u32, u16), FieldScalar>,
    pub incidents: Vec<HealthIncident>,
    /// Device indexes whose `get_device_info` call fails, for fake-GPU paths.
    pub broken_devices: HashSet<u32>,
    state: Mutex<FakeState>,
}

impl Default for FakeDcgmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDcgmClient {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            mig: MigHierarchy::default(),
            cpu_hierarchy: CpuHierarchy::default(),
            switch_ids: Vec::new(),
            links: Vec::new(),
            fields: HashMap::new(),
            values: HashMap::new(),
            incidents: Vec::new(),
            broken_devices: HashSet::new(),
            state: Mutex::new(FakeState {
                next_handle: 1,
                ..FakeState::default()
            }),
        }
    }

    /// Adds a whole (non-MIG) GPU with a generated uuid and bus id.
    pub fn with_gpu(mut self, index: u32, model: &str) -> Self {
        self.devices.push(DeviceIdentifier {
            gpu_id: index,
            uuid: format!("GPU-{:08x}-0000-0000-0000-000000000000", index),
            pci_bus_id: format!("00000000:{:02x}:00.0", index + 1),
            model: model.to_string(),
            driver_version: "550.54".to_string(),
        });
        self
    }

    /// Registers field metadata the watch-list manager will query.
    pub fn with_field(mut self, meta: FieldMeta) -> Self {
        self.fields.insert(meta.field_id, meta);
        self
    }

    /// Scripts the latest value for one `(entity, field)` pair.
    pub fn with_value(
        mut self,
        group: EntityGroup,
        entity_id: u32,
        field_id: u16,
        value: FieldScalar,
    ) -> Self {
        self.values.insert((group, entity_id, field_id), value);
        self
    }

    /// Makes the named client call fail until cleared.
    pub fn fail_call(&self, call: &'static str) {
        self.state.lock().unwrap().fail_calls.insert(call);
    }

    /// Handles destroyed so far, most recent last.
    pub fn destroy_order(&self) -> Vec<u64> {
        self.state.lock().unwrap().destroy_order.clone()
    }

    /// Registered watches as `(field_group, group, update_freq_us)`.
    pub fn watches(&self) -> Vec<(u64, u64, i64)> {
        self.state.lock().unwrap().watches.clone()
    }

    /// Members of a live group.
    pub fn group_members(&self, group: GroupHandle) -> Option<Vec<GroupEntityPair>> {
        self.state.lock().unwrap().groups.get(&group.0).cloned()
    }

    /// Number of live (not yet destroyed) groups.
    pub fn live_groups(&self) -> usize {
        self.state.lock().unwrap().groups.len()
    }

    fn check_fail(&self, call: &'static str) -> Result<(), DcgmError> {
        if self.state.lock().unwrap().fail_calls.contains(call) {
            return Err(DcgmError::call(call, "injected failure"));
        }
        Ok(())
    }
}

impl DcgmClient for FakeDcgmClient {
    fn get_all_device_count(&self) -> Result<u32, DcgmError> {
        self.check_fail("get_all_device_count")?;
        Ok(self.devices.len() as u32)
    }

    fn get_device_info(&self, index: u32) -> Result<DeviceIdentifier, DcgmError> {
        self.check_fail("get_device_info")?;
        if self.broken_devices.contains(&index) {
            return Err(DcgmError::call("get_device_info", format!("GPU {index} unreadable")));
        }
        self.devices
            .iter()
            .find(|d| d.gpu_id == index)
            .cloned()
            .ok_or_else(|| DcgmError::call("get_device_info", format!("no GPU at index {index}")))
    }

    fn get_gpu_instance_hierarchy(&self) -> Result<MigHierarchy, DcgmError> {
        self.check_fail("get_gpu_instance_hierarchy")?;
        Ok(self.mig.clone())
    }

    fn get_cpu_hierarchy(&self) -> Result<CpuHierarchy, DcgmError> {
        self.check_fail("get_cpu_hierarchy")?;
        Ok(self.cpu_hierarchy.clone())
    }

    fn get_entity_group_entities(&self, group: EntityGroup) -> Result<Vec<u32>, DcgmError> {
        self.check_fail("get_entity_group_entities")?;
        match group {
            EntityGroup::Switch => Ok(self.switch_ids.clone()),
            EntityGroup::Gpu => Ok(self.devices.iter().map(|d| d.gpu_id).collect()),
            _ => Ok(Vec::new()),
        }
    }

    fn get_nvlink_link_status(&self) -> Result<Vec<RawNvLinkStatus>, DcgmError> {
        self.check_fail("get_nvlink_link_status")?;
        Ok(self.links.clone())
    }

    fn create_group(&self, _name: &str) -> Result<GroupHandle, DcgmError> {
        self.check_fail("create_group")?;
        let mut state = self.state.lock().unwrap();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.groups.insert(handle, Vec::new());
        Ok(GroupHandle(handle))
    }

    fn add_entity_to_group(
        &self,
        group: GroupHandle,
        entity_group: EntityGroup,
        entity_id: u32,
    ) -> Result<(), DcgmError> {
        self.check_fail("add_entity_to_group")?;
        let mut state = self.state.lock().unwrap();
        let members = state.groups.get_mut(&group.0).ok_or(DcgmError::UnknownHandle)?;
        if members.len() >= GROUP_MAX_ENTITIES {
            return Err(DcgmError::call("add_entity_to_group", "group is full"));
        }
        members.push(GroupEntityPair {
            entity_group,
            entity_id,
        });
        Ok(())
    }

    fn destroy_group(&self, group: GroupHandle) -> Result<(), DcgmError> {
        self.check_fail("destroy_group")?;
        let mut state = self.state.lock().unwrap();
        state.groups.remove(&group.0).ok_or(DcgmError::UnknownHandle)?;
        state.destroy_order.push(group.0);
        Ok(())
    }

    fn field_group_create(&self, _name: &str, fields: &[u16]) -> Result<FieldGroupHandle, DcgmError> {
        self.check_fail("field_group_create")?;
        let mut state = self.state.lock().unwrap();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.field_groups.insert(handle, fields.to_vec());
        Ok(FieldGroupHandle(handle))
    }

    fn field_group_destroy(&self, fields: FieldGroupHandle) -> Result<(), DcgmError> {
        self.check_fail("field_group_destroy")?;
        let mut state = self.state.lock().unwrap();
        state.field_groups.remove(&fields.0).ok_or(DcgmError::UnknownHandle)?;
        state.destroy_order.push(fields.0);
        Ok(())
    }

    fn watch_fields_with_group_ex(
        &self,
        fields: FieldGroupHandle,
        group: GroupHandle,
        update_freq_us: i64,
        _max_keep_age: f64,
        _max_keep_samples: i32,
    ) -> Result<(), DcgmError> {
        self.check_fail("watch_fields_with_group_ex")?;
        let mut state = self.state.lock().unwrap();
        if !state.groups.contains_key(&group.0) || !state.field_groups.contains_key(&fields.0) {
            return Err(DcgmError::UnknownHandle);
        }
        state.watches.push((fields.0, group.0, update_freq_us));
        Ok(())
    }

    fn entities_get_latest_values(
        &self,
        entities: &[GroupEntityPair],
        fields: &[u16],
        _flags: u32,
    ) -> Result<Vec<FieldValue>, DcgmError> {
        self.check_fail("entities_get_latest_values")?;
        let mut out = Vec::with_capacity(entities.len() * fields.len());
        for entity in entities {
            for &field_id in fields {
                let key = (entity.entity_group, entity.entity_id, field_id);
                let value = match self.values.get(&key) {
                    Some(v) => v.clone(),
                    None => FieldScalar::Int64(DCGM_INT64_BLANK),
                };
                out.push(FieldValue {
                    entity_group: entity.entity_group,
                    entity_id: entity.entity_id,
                    field_id,
                    value,
                    status: 0,
                });
            }
        }
        Ok(out)
    }

    fn field_get_by_id(&self, field_id: u16) -> Result<FieldMeta, DcgmError> {
        self.check_fail("field_get_by_id")?;
        if let Some(meta) = self.fields.get(&field_id) {
            return Ok(meta.clone());
        }
        // Unregistered fields default to GPU-level gauges so tests stay terse.
        Ok(FieldMeta {
            field_id,
            field_name: format!("DCGM_FI_{field_id}"),
            kind: FieldKind::Double,
            entity_level: EntityGroup::Gpu,
        })
    }

    fn health_set(&self, group: GroupHandle) -> Result<(), DcgmError> {
        self.check_fail("health_set")?;
        let mut state = self.state.lock().unwrap();
        if !state.groups.contains_key(&group.0) {
            return Err(DcgmError::UnknownHandle);
        }
        state.healthy_groups.insert(group.0);
        Ok(())
    }

    fn health_check(&self, group: GroupHandle) -> Result<HealthCheckResponse, DcgmError> {
        self.check_fail("health_check")?;
        let state = self.state.lock().unwrap();
        if !state.healthy_groups.contains(&group.0) {
            return Err(DcgmError::call("health_check", "health watch not enabled"));
        }
        let members: HashSet<GroupEntityPair> = state
            .groups
            .get(&group.0)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        Ok(HealthCheckResponse {
            incidents: self
                .incidents
                .iter()
                .filter(|i| members.contains(&i.entity))
                .cloned()
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_lifecycle_records_destroy_order() {
        let client = FakeDcgmClient::new();
        let a = client.create_group("a").unwrap();
        let b = client.create_group("b").unwrap();
        client.destroy_group(b).unwrap();
        client.destroy_group(a).unwrap();
        assert_eq!(client.destroy_order(), vec![b.0, a.0]);
    }

    #[test]
    fn group_rejects_overflow() {
        let client = FakeDcgmClient::new();
        let group = client.create_group("full").unwrap();
        for id in 0..GROUP_MAX_ENTITIES as u32 {
            client
                .add_entity_to_group(group, EntityGroup::CpuCore, id)
                .unwrap();
        }
        let err = client.add_entity_to_group(group, EntityGroup::CpuCore, 999);
        assert!(err.is_err());
    }

    #[test]
    fn unscripted_values_come_back_blank() {
        let client = FakeDcgmClient::new().with_gpu(0, "NVIDIA H100");
        let values = client
            .entities_get_latest_values(
                &[GroupEntityPair {
                    entity_group: EntityGroup::Gpu,
                    entity_id: 0,
                }],
                &[1001],
                DCGM_FV_FLAG_LIVE_DATA,
            )
            .unwrap();
        assert_eq!(values.len(), 1);
        assert!(is_blank(&values[0].value));
    }

    #[test]
    fn injected_failures_surface() {
        let client = FakeDcgmClient::new();
        client.fail_call("create_group");
        assert!(client.create_group("x").is_err());
    }
}
