//! Configuration management for dcgm-gpu-exporter.
//!
//! This module handles loading, merging, and validating configuration from
//! files, environment variables and CLI arguments. Precedence is
//! CLI (if provided) > config file > default.

use crate::cli::{Args, GpuIdType};
use crate::error::{ExporterError, Result};
use crate::inventory::DeviceOptions;
use crate::transform::podlabels::LabelFilter;
use crate::transform::podresources::{KubernetesGpuIdType, PodMapperSettings};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

// Default configuration constants
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:9400";
pub const DEFAULT_COUNTERS_FILE: &str = "/etc/dcgm-exporter/counters.yaml";
pub const DEFAULT_COLLECT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_POD_RESOURCES_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Server configuration
    pub address: Option<String>,

    // Metrics collection
    #[serde(alias = "collectors")]
    pub collectors_file: Option<PathBuf>,
    #[serde(alias = "collect-interval")]
    pub collect_interval_ms: Option<u64>,

    // Kubernetes integration
    pub kubernetes: Option<bool>,
    #[serde(alias = "kubernetes-gpu-id-type")]
    pub kubernetes_gpu_id_type: Option<KubernetesGpuIdType>,
    #[serde(alias = "pod-resources-socket")]
    pub pod_resources_socket: Option<PathBuf>,
    #[serde(alias = "nvidia-resource-names")]
    pub nvidia_resource_names: Option<Vec<String>>,
    #[serde(alias = "kubernetes-enable-pod-labels")]
    pub kubernetes_enable_pod_labels: Option<bool>,
    #[serde(alias = "kubernetes-pod-label-allowlist")]
    pub kubernetes_pod_label_allowlist: Option<Vec<String>>,
    #[serde(alias = "kubernetes-virtual-gpus")]
    pub kubernetes_virtual_gpus: Option<bool>,
    #[serde(alias = "use-old-namespace")]
    pub use_old_namespace: Option<bool>,

    // HPC integration
    #[serde(alias = "hpc-job-mapping-dir")]
    pub hpc_job_mapping_dir: Option<PathBuf>,

    // Device selection, shared grammar: `f` | `g[:1,3]` optionally followed
    // by `;i:<minor ids>`
    pub devices: Option<String>,
    #[serde(alias = "switch-devices")]
    pub switch_devices: Option<String>,
    #[serde(alias = "cpu-devices")]
    pub cpu_devices: Option<String>,

    // Feature flags
    #[serde(alias = "fake-gpus")]
    pub fake_gpus: Option<bool>,
    #[serde(alias = "enable-clock-events")]
    pub enable_clock_events: Option<bool>,
    #[serde(alias = "enable-xid-errors")]
    pub enable_xid_errors: Option<bool>,
    #[serde(alias = "enable-health-monitor")]
    pub enable_health_monitor: Option<bool>,
    #[serde(alias = "enable-dcgm-log")]
    pub enable_dcgm_log: Option<bool>,

    // Logging
    #[serde(alias = "log-level")]
    pub log_level: Option<String>,

    // TLS/SSL Configuration
    #[serde(alias = "enable-tls")]
    pub enable_tls: Option<bool>,
    #[serde(alias = "tls-cert-path")]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(alias = "tls-key-path")]
    pub tls_key_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: Some(DEFAULT_LISTEN_ADDRESS.to_string()),
            collectors_file: Some(PathBuf::from(DEFAULT_COUNTERS_FILE)),
            collect_interval_ms: Some(DEFAULT_COLLECT_INTERVAL_MS),
            kubernetes: Some(false),
            kubernetes_gpu_id_type: Some(KubernetesGpuIdType::GpuUid),
            pod_resources_socket: Some(PathBuf::from(DEFAULT_POD_RESOURCES_SOCKET)),
            nvidia_resource_names: None,
            kubernetes_enable_pod_labels: Some(false),
            kubernetes_pod_label_allowlist: None,
            kubernetes_virtual_gpus: Some(false),
            use_old_namespace: Some(false),
            hpc_job_mapping_dir: None,
            devices: Some("f".to_string()),
            switch_devices: Some("f".to_string()),
            cpu_devices: Some("f".to_string()),
            fake_gpus: Some(false),
            enable_clock_events: Some(false),
            enable_xid_errors: Some(false),
            enable_health_monitor: Some(false),
            enable_dcgm_log: Some(false),
            log_level: Some("info".into()),
            enable_tls: Some(false),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl Config {
    pub fn listen_address(&self) -> String {
        self.address
            .clone()
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string())
    }

    pub fn counters_file(&self) -> PathBuf {
        self.collectors_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_COUNTERS_FILE))
    }

    /// Watch update frequency in microseconds, as the library expects it.
    pub fn update_frequency_us(&self) -> i64 {
        (self.collect_interval_ms.unwrap_or(DEFAULT_COLLECT_INTERVAL_MS) * 1000) as i64
    }

    pub fn gpu_device_options(&self) -> Result<DeviceOptions> {
        parse_device_options(self.devices.as_deref().unwrap_or("f"))
    }

    pub fn switch_device_options(&self) -> Result<DeviceOptions> {
        parse_device_options(self.switch_devices.as_deref().unwrap_or("f"))
    }

    pub fn cpu_device_options(&self) -> Result<DeviceOptions> {
        parse_device_options(self.cpu_devices.as_deref().unwrap_or("f"))
    }

    pub fn pod_mapper_settings(&self) -> PodMapperSettings {
        let mut settings = PodMapperSettings {
            use_old_namespace: self.use_old_namespace.unwrap_or(false),
            virtual_gpus: self.kubernetes_virtual_gpus.unwrap_or(false),
            enable_pod_labels: self.kubernetes_enable_pod_labels.unwrap_or(false),
            ..PodMapperSettings::default()
        };
        if let Some(id_type) = self.kubernetes_gpu_id_type {
            settings.gpu_id_type = id_type;
        }
        if let Some(socket) = &self.pod_resources_socket {
            settings.socket_path = socket.clone();
        }
        if let Some(names) = &self.nvidia_resource_names {
            settings.nvidia_resource_names.extend(names.iter().cloned());
        }
        settings
    }

    pub fn pod_label_filter(&self) -> Result<LabelFilter> {
        match &self.kubernetes_pod_label_allowlist {
            Some(patterns) => LabelFilter::from_patterns(patterns),
            None => Ok(LabelFilter::allow_all()),
        }
    }
}

/// Parses a device-selection string into [`DeviceOptions`].
///
/// Grammar, semicolon-separated segments:
/// - `f` — flex (everything, instances preferred over whole GPUs)
/// - `g` / `s` / `c` — every major device of the kind
/// - `g:0,2` — explicit major ids
/// - `i:1,3` — explicit minor ids (instances, links or cores)
pub fn parse_device_options(spec: &str) -> Result<DeviceOptions> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(DeviceOptions::default());
    }
    if spec == "f" {
        return Ok(DeviceOptions::default());
    }

    let mut opts = DeviceOptions::all();
    for segment in spec.split(';') {
        let segment = segment.trim();
        let (prefix, ids) = match segment.split_once(':') {
            Some((p, ids)) => (p.trim(), Some(ids)),
            None => (segment, None),
        };
        let range = match prefix {
            "g" | "s" | "c" => &mut opts.major_range,
            "i" => &mut opts.minor_range,
            other => {
                return Err(ExporterError::Config(format!(
                    "bad device selection {spec:?}: unknown segment prefix {other:?}"
                )));
            }
        };
        if let Some(ids) = ids {
            let parsed: Vec<i32> = ids
                .split(',')
                .map(|id| {
                    id.trim().parse::<i32>().map_err(|_| {
                        ExporterError::Config(format!(
                            "bad device selection {spec:?}: {id:?} is not a device id"
                        ))
                    })
                })
                .collect::<Result<_>>()?;
            if parsed.is_empty() {
                return Err(ExporterError::Config(format!(
                    "bad device selection {spec:?}: empty id list"
                )));
            }
            *range = parsed;
        }
    }
    Ok(opts)
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<()> {
    if cfg.collect_interval_ms == Some(0) {
        return Err(ExporterError::Config(
            "collect-interval must be greater than zero".to_string(),
        ));
    }

    cfg.gpu_device_options()?;
    cfg.switch_device_options()?;
    cfg.cpu_device_options()?;
    cfg.pod_label_filter()?;

    // TLS validation
    if cfg.enable_tls.unwrap_or(false) {
        match (&cfg.tls_cert_path, &cfg.tls_key_path) {
            (None, _) => {
                return Err(ExporterError::Config(
                    "TLS is enabled but tls_cert_path is not set".to_string(),
                ));
            }
            (_, None) => {
                return Err(ExporterError::Config(
                    "TLS is enabled but tls_key_path is not set".to_string(),
                ));
            }
            (Some(cert), Some(key)) => {
                for (label, path) in [("certificate", cert), ("private key", key)] {
                    match fs::metadata(path) {
                        Ok(meta) if meta.len() == 0 => {
                            return Err(ExporterError::Config(format!(
                                "TLS {label} file is empty: {}",
                                path.display()
                            )));
                        }
                        Err(e) => {
                            return Err(ExporterError::Config(format!(
                                "TLS {label} file is not readable: {} ({e})",
                                path.display()
                            )));
                        }
                        Ok(_) => {}
                    }
                }
            }
        }
    }

    Ok(())
}

/// Resolves configuration from CLI args, config file, and defaults.
pub fn resolve_config(args: &Args) -> Result<Config> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref())?
    };

    if let Some(address) = &args.address {
        config.address = Some(address.clone());
    }
    if let Some(collectors) = &args.collectors {
        config.collectors_file = Some(collectors.clone());
    }
    if let Some(interval) = args.collect_interval {
        config.collect_interval_ms = Some(interval);
    }

    if args.kubernetes {
        config.kubernetes = Some(true);
    }
    if let Some(id_type) = args.kubernetes_gpu_id_type {
        config.kubernetes_gpu_id_type = Some(match id_type {
            GpuIdType::Uid => KubernetesGpuIdType::GpuUid,
            GpuIdType::DeviceName => KubernetesGpuIdType::DeviceName,
        });
    }
    if let Some(socket) = &args.pod_resources_socket {
        config.pod_resources_socket = Some(socket.clone());
    }
    if let Some(names) = &args.nvidia_resource_names {
        config.nvidia_resource_names = Some(split_list(names));
    }
    if args.kubernetes_enable_pod_labels {
        config.kubernetes_enable_pod_labels = Some(true);
    }
    if let Some(allowlist) = &args.kubernetes_pod_label_allowlist {
        config.kubernetes_pod_label_allowlist = Some(split_list(allowlist));
    }
    if args.kubernetes_virtual_gpus {
        config.kubernetes_virtual_gpus = Some(true);
    }
    if args.use_old_namespace {
        config.use_old_namespace = Some(true);
    }

    if let Some(dir) = &args.hpc_job_mapping_dir {
        config.hpc_job_mapping_dir = Some(dir.clone());
    }

    if let Some(devices) = &args.devices {
        config.devices = Some(devices.clone());
    }
    if let Some(devices) = &args.switch_devices {
        config.switch_devices = Some(devices.clone());
    }
    if let Some(devices) = &args.cpu_devices {
        config.cpu_devices = Some(devices.clone());
    }

    if args.fake_gpus {
        config.fake_gpus = Some(true);
    }
    if args.enable_clock_events {
        config.enable_clock_events = Some(true);
    }
    if args.enable_xid_errors {
        config.enable_xid_errors = Some(true);
    }
    if args.enable_health_monitor {
        config.enable_health_monitor = Some(true);
    }
    if args.enable_dcgm_log {
        config.enable_dcgm_log = Some(true);
    }

    if args.enable_tls {
        config.enable_tls = Some(true);
    }
    if let Some(cert) = &args.tls_cert {
        config.tls_cert_path = Some(cert.clone());
    }
    if let Some(key) = &args.tls_key {
        config.tls_key_path = Some(key.clone());
    }

    Ok(config)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Loads the YAML config file, falling back to default locations and then to
/// built-in defaults when no file exists.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = if let Some(p) = path {
        p.to_path_buf()
    } else {
        let defaults = [
            "/etc/dcgm-exporter/config.yaml",
            "/etc/dcgm-exporter/config.yml",
            "./dcgm-exporter.yaml",
            "./dcgm-exporter.yml",
        ];
        match defaults.iter().find(|p| Path::new(p).exists()) {
            Some(p) => PathBuf::from(p),
            None => return Ok(Config::default()),
        }
    };

    let content = fs::read_to_string(&path)
        .map_err(|e| ExporterError::Config(format!("read {}: {e}", path.display())))?;
    let config: Config = serde_yaml::from_str(&content)
        .map_err(|e| ExporterError::Config(format!("parse {}: {e}", path.display())))?;
    info!("Loaded configuration from: {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn flex_selection_keeps_defaults() {
        let opts = parse_device_options("f").unwrap();
        assert!(opts.flex);
        assert_eq!(opts, DeviceOptions::default());
    }

    #[test]
    fn explicit_major_and_minor_ranges() {
        let opts = parse_device_options("g:0,2;i:1,3").unwrap();
        assert!(!opts.flex);
        assert_eq!(opts.major_range, vec![0, 2]);
        assert_eq!(opts.minor_range, vec![1, 3]);

        let opts = parse_device_options("s").unwrap();
        assert!(!opts.flex);
        assert_eq!(opts.major_range, vec![-1]);
    }

    #[test]
    fn bad_selections_are_config_errors() {
        assert!(matches!(
            parse_device_options("x:1"),
            Err(ExporterError::Config(_))
        ));
        assert!(matches!(
            parse_device_options("g:zero"),
            Err(ExporterError::Config(_))
        ));
        assert!(matches!(
            parse_device_options("g:"),
            Err(ExporterError::Config(_))
        ));
    }

    #[test]
    fn cli_overrides_config_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(file, "address: \"1.2.3.4:9400\"\ncollect-interval: 5000").unwrap();

        let args = Args::parse_from([
            "dcgm-gpu-exporter",
            "--config",
            file.path().to_str().unwrap(),
            "--address",
            "0.0.0.0:9999",
        ]);
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.listen_address(), "0.0.0.0:9999");
        assert_eq!(config.collect_interval_ms, Some(5000));
        assert_eq!(config.update_frequency_us(), 5_000_000);
    }

    #[test]
    fn tls_requires_both_halves() {
        let config = Config {
            enable_tls: Some(true),
            tls_cert_path: Some(PathBuf::from("/tmp/cert.pem")),
            tls_key_path: None,
            ..Config::default()
        };
        assert!(matches!(
            validate_effective_config(&config),
            Err(ExporterError::Config(_))
        ));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = Config {
            collect_interval_ms: Some(0),
            ..Config::default()
        };
        assert!(validate_effective_config(&config).is_err());
    }

    #[test]
    fn pod_mapper_settings_reflect_config() {
        let config = Config {
            kubernetes: Some(true),
            kubernetes_virtual_gpus: Some(true),
            kubernetes_gpu_id_type: Some(KubernetesGpuIdType::DeviceName),
            nvidia_resource_names: Some(vec!["example.com/gpu".to_string()]),
            ..Config::default()
        };
        let settings = config.pod_mapper_settings();
        assert!(settings.virtual_gpus);
        assert_eq!(settings.gpu_id_type, KubernetesGpuIdType::DeviceName);
        assert!(settings
            .nvidia_resource_names
            .contains(&"example.com/gpu".to_string()));
        assert!(settings
            .nvidia_resource_names
            .contains(&"nvidia.com/gpu".to_string()));
    }
}
