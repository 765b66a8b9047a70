//! Pod-resources mapper: attributes metrics to the Kubernetes pods their
//! devices are assigned to.
//!
//! Per scrape this lists the kubelet pod-resources endpoint, parses every
//! GPU-related device id into a device key, and joins metrics against the
//! resulting `device-key -> pod` mapping. With shared GPUs enabled a key may
//! resolve to several pods and the metric fans out into one copy per pod.

use super::dra::DraIndex;
use super::podlabels::{sanitize_label_key, LabelFilter, PodLabelSource};
use super::podresources_api::{ListPodResourcesResponse, PodResourcesClient};
use super::Transform;
use crate::error::{ExporterError, Result};
use crate::inventory::DeviceInfo;
use crate::metrics::MetricsByCounter;
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Resource names with this prefix are MIG partitions of a device plugin.
pub const MIG_RESOURCE_PREFIX: &str = "nvidia.com/mig-";

/// Default device-plugin resource name for whole GPUs.
pub const NVIDIA_RESOURCE_NAME: &str = "nvidia.com/gpu";

/// Deadline for the kubelet gRPC call and API label lookups.
pub const K8S_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

static GKE_MIG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^nvidia(\d+)/gi(\d+)(?:/vgpu(\d+))?$").unwrap());
static VGPU_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+)/vgpu(\d+)$").unwrap());

/// Which metric field is used as the device key for whole GPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum KubernetesGpuIdType {
    #[serde(rename = "uid")]
    GpuUid,
    #[serde(rename = "device-name")]
    DeviceName,
}

#[derive(Debug, Clone)]
pub struct PodMapperSettings {
    pub socket_path: PathBuf,
    pub gpu_id_type: KubernetesGpuIdType,
    /// Resource names treated as GPUs, in addition to the MIG prefix.
    pub nvidia_resource_names: Vec<String>,
    pub use_old_namespace: bool,
    pub virtual_gpus: bool,
    pub enable_pod_labels: bool,
}

impl Default for PodMapperSettings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/lib/kubelet/pod-resources/kubelet.sock"),
            gpu_id_type: KubernetesGpuIdType::GpuUid,
            nvidia_resource_names: vec![NVIDIA_RESOURCE_NAME.to_string()],
            use_old_namespace: false,
            virtual_gpus: false,
            enable_pod_labels: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub container: String,
    pub vgpu: Option<String>,
}

pub struct PodMapper {
    settings: PodMapperSettings,
    label_source: Option<Arc<dyn PodLabelSource>>,
    label_filter: LabelFilter,
    dra: Option<DraIndex>,
}

impl PodMapper {
    pub fn new(
        settings: PodMapperSettings,
        label_source: Option<Arc<dyn PodLabelSource>>,
        label_filter: LabelFilter,
    ) -> Self {
        Self {
            settings,
            label_source,
            label_filter,
            dra: None,
        }
    }

    /// Resolves `<pool>/<device>` ids through the DRA resource-slice index
    /// before the legacy device-plugin parse table.
    pub fn with_dra_index(mut self, index: DraIndex) -> Self {
        self.dra = Some(index);
        self
    }

    fn dra_keys(&self, device_id: &str) -> Option<Vec<(String, Option<String>)>> {
        let index = self.dra.as_ref()?;
        let (pool, device) = device_id.split_once('/')?;
        let info = index.get(pool, device)?;
        let mut keys = vec![(info.parent_uuid.clone(), None)];
        if let Some(mig) = &info.mig {
            keys.push((format!("{}-{}", mig.gpu_index, mig.gpu_instance_id), None));
        }
        Some(keys)
    }

    fn is_gpu_resource(&self, resource_name: &str) -> bool {
        resource_name.starts_with(MIG_RESOURCE_PREFIX)
            || self
                .settings
                .nvidia_resource_names
                .iter()
                .any(|n| n == resource_name)
    }

    /// Flattens the List response into `device-key -> pods`.
    fn to_device_to_pods(
        &self,
        response: &ListPodResourcesResponse,
        device_info: &DeviceInfo,
    ) -> HashMap<String, Vec<PodInfo>> {
        let mut map: HashMap<String, Vec<PodInfo>> = HashMap::new();
        for pod in &response.pod_resources {
            for container in &pod.containers {
                for device in &container.devices {
                    if !self.is_gpu_resource(&device.resource_name) {
                        continue;
                    }
                    for device_id in &device.device_ids {
                        let keys = self
                            .dra_keys(device_id)
                            .unwrap_or_else(|| parse_device_id(device_id, device_info));
                        for (key, vgpu) in keys {
                            map.entry(key).or_default().push(PodInfo {
                                name: pod.name.clone(),
                                namespace: pod.namespace.clone(),
                                container: container.name.clone(),
                                vgpu,
                            });
                        }
                    }
                }
            }
        }
        map
    }

    fn device_key_for(&self, metric: &crate::metrics::Metric) -> String {
        if !metric.mig_profile.is_empty() {
            return format!("{}-{}", metric.gpu, metric.gpu_instance_id);
        }
        match self.settings.gpu_id_type {
            KubernetesGpuIdType::GpuUid => metric.gpu_uuid.clone(),
            KubernetesGpuIdType::DeviceName => metric.gpu_device.clone(),
        }
    }

    /// Joins the snapshot against the pod map, fanning out shared devices
    /// when virtual GPUs are enabled. Metrics with no mapping pass through
    /// untouched.
    fn apply(&self, metrics: &mut MetricsByCounter, map: &HashMap<String, Vec<PodInfo>>) {
        let (pod_key, namespace_key, container_key) = attribute_names(self.settings.use_old_namespace);
        for list in metrics.values_mut() {
            let mut out = Vec::with_capacity(list.len());
            for metric in list.drain(..) {
                let key = self.device_key_for(&metric);
                let pods = match map.get(&key) {
                    Some(pods) if !pods.is_empty() => pods,
                    _ => {
                        out.push(metric);
                        continue;
                    }
                };
                let selected: &[PodInfo] = if self.settings.virtual_gpus {
                    pods
                } else {
                    &pods[..1]
                };
                for pod in selected {
                    let mut copy = metric.clone();
                    copy.attributes.insert(pod_key.to_string(), pod.name.clone());
                    copy.attributes
                        .insert(namespace_key.to_string(), pod.namespace.clone());
                    copy.attributes
                        .insert(container_key.to_string(), pod.container.clone());
                    if let Some(vgpu) = &pod.vgpu {
                        copy.attributes.insert("vgpu".to_string(), vgpu.clone());
                    }
                    out.push(copy);
                }
            }
            *list = out;
        }
    }

    /// Fetches pod labels for every attributed metric, one API call per
    /// distinct pod per scrape. Failed lookups negative-cache an empty map.
    async fn attach_pod_labels(&self, metrics: &mut MetricsByCounter) {
        let Some(source) = &self.label_source else {
            return;
        };
        let (pod_key, namespace_key, _) = attribute_names(self.settings.use_old_namespace);

        let mut cache: HashMap<(String, String), BTreeMap<String, String>> = HashMap::new();
        for list in metrics.values_mut() {
            for metric in list.iter_mut() {
                let (Some(pod), Some(namespace)) = (
                    metric.attributes.get(pod_key).cloned(),
                    metric.attributes.get(namespace_key).cloned(),
                ) else {
                    continue;
                };
                let key = (namespace.clone(), pod.clone());
                if !cache.contains_key(&key) {
                    let labels = match source.pod_labels(&namespace, &pod).await {
                        Ok(raw) => raw
                            .into_iter()
                            .filter(|(k, _)| self.label_filter.allows(k))
                            .map(|(k, v)| (sanitize_label_key(&k), v))
                            .collect(),
                        Err(e) => {
                            warn!("pod label lookup for {namespace}/{pod} failed: {e}");
                            BTreeMap::new()
                        }
                    };
                    cache.insert(key.clone(), labels);
                }
                for (k, v) in &cache[&key] {
                    metric.labels.insert(k.clone(), v.clone());
                }
            }
        }
    }
}

#[async_trait]
impl Transform for PodMapper {
    fn name(&self) -> &str {
        "podMapper"
    }

    async fn process(&self, metrics: &mut MetricsByCounter, device_info: &DeviceInfo) -> Result<()> {
        if !self.settings.socket_path.exists() {
            info!(
                "pod-resources socket {} not found; metrics go out without pod attribution",
                self.settings.socket_path.display()
            );
            return Ok(());
        }

        let response = tokio::time::timeout(K8S_REQUEST_TIMEOUT, async {
            let mut client = PodResourcesClient::connect_uds(&self.settings.socket_path).await?;
            client.list().await
        })
        .await
        .map_err(|_| ExporterError::Enrichment("pod-resources List timed out".to_string()))??;

        let map = self.to_device_to_pods(&response, device_info);
        self.apply(metrics, &map);
        if self.settings.enable_pod_labels {
            self.attach_pod_labels(metrics).await;
        }
        Ok(())
    }
}

fn attribute_names(use_old_namespace: bool) -> (&'static str, &'static str, &'static str) {
    if use_old_namespace {
        ("pod_name", "pod_namespace", "container_name")
    } else {
        ("pod", "namespace", "container")
    }
}

/// Parses one kubelet device id into device keys, with an optional virtual
/// GPU share. Patterns are tried in order:
///
/// 1. `MIG-<parent-uuid>`: the parent uuid itself, plus the derived MIG key
///    `"<gpu>-<gpu-instance>"` for every instance found under that uuid.
/// 2. GKE MIG `nvidia<I>/gi<J>[/vgpu<K>]`: the key `"<I>-<J>"`.
/// 3. `<id>::<share>`: the prefix, with the share as vgpu.
/// 4. `<prefix>/vgpu<K>`: the prefix, with `K` as vgpu.
/// 5. Anything else: the literal id.
pub fn parse_device_id(device_id: &str, device_info: &DeviceInfo) -> Vec<(String, Option<String>)> {
    if let Some(uuid) = device_id.strip_prefix("MIG-") {
        let mut keys = vec![(uuid.to_string(), None)];
        if let Some(gpu) = device_info.gpus.iter().find(|g| g.uuid == uuid) {
            for instance in &gpu.instances {
                keys.push((format!("{}-{}", gpu.index, instance.nvml_instance_id), None));
            }
        }
        return keys;
    }
    if let Some(captures) = GKE_MIG_RE.captures(device_id) {
        let key = format!("{}-{}", &captures[1], &captures[2]);
        let vgpu = captures.get(3).map(|m| m.as_str().to_string());
        return vec![(key, vgpu)];
    }
    if let Some((prefix, share)) = device_id.split_once("::") {
        return vec![(prefix.to_string(), Some(share.to_string()))];
    }
    if let Some(captures) = VGPU_SUFFIX_RE.captures(device_id) {
        return vec![(captures[1].to_string(), Some(captures[2].to_string()))];
    }
    vec![(device_id.to_string(), None)]
}
