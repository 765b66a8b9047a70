//! Abstract interface to the DCGM GPU management library.
//!
//! The exporter core never links the native library directly; everything goes
//! through [`DcgmClient`] so the backend can live in-process, behind a remote
//! host engine, or be a deterministic fake in tests.

pub mod fake;
pub mod types;

pub use types::*;

use thiserror::Error;

/// Maximum number of entities a single library-side group may hold.
pub const GROUP_MAX_ENTITIES: usize = 64;

/// Field id of the device/profile name string field.
pub const DCGM_FI_DEV_NAME: u16 = 50;

/// Field id of the clock event (throttle) reason bitmask.
pub const DCGM_FI_DEV_CLOCK_THROTTLE_REASONS: u16 = 112;

/// Field id of the most recent XID error.
pub const DCGM_FI_DEV_XID_ERRORS: u16 = 230;

/// Request live (unbuffered) samples from the library.
pub const DCGM_FV_FLAG_LIVE_DATA: u32 = 0x0000_0001;

/// Blank sentinel for int64 fields: this value and above mean "no sample".
pub const DCGM_INT64_BLANK: i64 = 0x7FFF_FFFF_FFFF_FFF0;

/// Blank sentinel base for double fields.
pub const DCGM_FP64_BLANK: f64 = 140_737_488_355_328.0;

/// Blank sentinel for string fields.
pub const DCGM_STR_BLANK: &str = "<<<NULL>>>";

/// How long the library retains watched samples, in seconds.
pub const MAX_KEEP_AGE_SECS: f64 = 600.0;

/// How many samples per field the library retains.
pub const MAX_KEEP_SAMPLES: i32 = 1;

/// Returns true if the sample carries a blank sentinel instead of a value.
pub fn is_blank(value: &FieldScalar) -> bool {
    match value {
        FieldScalar::Int64(v) => *v >= DCGM_INT64_BLANK,
        FieldScalar::Double(v) => *v >= DCGM_FP64_BLANK,
        FieldScalar::Str(s) => s == DCGM_STR_BLANK,
        FieldScalar::Blob(_) => false,
    }
}

/// Errors surfaced by a [`DcgmClient`] implementation.
#[derive(Debug, Error)]
pub enum DcgmError {
    #[error("DCGM call {call} failed: {message}")]
    Call { call: &'static str, message: String },

    #[error("unknown field id {0}")]
    UnknownField(u16),

    #[error("unknown handle")]
    UnknownHandle,
}

impl DcgmError {
    pub fn call(call: &'static str, message: impl Into<String>) -> Self {
        Self::Call {
            call,
            message: message.into(),
        }
    }
}

/// The operations the exporter core needs from the GPU management library.
///
/// Implementations must be safe to call from blocking worker threads; calls are
/// expected to complete in sub-millisecond time except for discovery.
pub trait DcgmClient: Send + Sync {
    /// Number of GPUs visible to the library.
    fn get_all_device_count(&self) -> Result<u32, DcgmError>;

    /// Descriptor for the GPU at `index`.
    fn get_device_info(&self, index: u32) -> Result<DeviceIdentifier, DcgmError>;

    /// Flattened MIG hierarchy over all GPUs.
    fn get_gpu_instance_hierarchy(&self) -> Result<MigHierarchy, DcgmError>;

    /// CPU sockets with owned-core bitmasks.
    fn get_cpu_hierarchy(&self) -> Result<CpuHierarchy, DcgmError>;

    /// Entity ids of the given kind known to the library.
    fn get_entity_group_entities(&self, group: EntityGroup) -> Result<Vec<u32>, DcgmError>;

    /// Per-link status rows across all NVLink parents.
    fn get_nvlink_link_status(&self) -> Result<Vec<RawNvLinkStatus>, DcgmError>;

    /// Creates an empty entity group.
    fn create_group(&self, name: &str) -> Result<GroupHandle, DcgmError>;

    /// Adds one entity to a group.
    fn add_entity_to_group(
        &self,
        group: GroupHandle,
        entity_group: EntityGroup,
        entity_id: u32,
    ) -> Result<(), DcgmError>;

    /// Destroys an entity group.
    fn destroy_group(&self, group: GroupHandle) -> Result<(), DcgmError>;

    /// Creates a field group over the given field ids.
    fn field_group_create(&self, name: &str, fields: &[u16]) -> Result<FieldGroupHandle, DcgmError>;

    /// Destroys a field group.
    fn field_group_destroy(&self, fields: FieldGroupHandle) -> Result<(), DcgmError>;

    /// Registers a watch of `fields` on `group` at `update_freq_us`.
    fn watch_fields_with_group_ex(
        &self,
        fields: FieldGroupHandle,
        group: GroupHandle,
        update_freq_us: i64,
        max_keep_age: f64,
        max_keep_samples: i32,
    ) -> Result<(), DcgmError>;

    /// Latest sample for every `(entity, field)` combination.
    fn entities_get_latest_values(
        &self,
        entities: &[GroupEntityPair],
        fields: &[u16],
        flags: u32,
    ) -> Result<Vec<FieldValue>, DcgmError>;

    /// Metadata for a field id, including its native entity level.
    fn field_get_by_id(&self, field_id: u16) -> Result<FieldMeta, DcgmError>;

    /// Enables health watches on a group.
    fn health_set(&self, group: GroupHandle) -> Result<(), DcgmError>;

    /// Runs the health check on a group.
    fn health_check(&self, group: GroupHandle) -> Result<HealthCheckResponse, DcgmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_detection() {
        assert!(is_blank(&FieldScalar::Int64(DCGM_INT64_BLANK)));
        assert!(is_blank(&FieldScalar::Int64(i64::MAX)));
        assert!(!is_blank(&FieldScalar::Int64(42)));
        assert!(is_blank(&FieldScalar::Double(DCGM_FP64_BLANK)));
        assert!(!is_blank(&FieldScalar::Double(99.5)));
        assert!(is_blank(&FieldScalar::Str(DCGM_STR_BLANK.to_string())));
        assert!(!is_blank(&FieldScalar::Str("NVIDIA H100".to_string())));
    }
}
