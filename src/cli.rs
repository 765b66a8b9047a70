//! CLI arguments for dcgm-gpu-exporter.
//!
//! Every flag has a `DCGM_EXPORTER_*` environment fallback so the exporter
//! drops into container manifests without argument plumbing.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// How whole-GPU metrics are keyed when joining against kubelet device ids.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum GpuIdType {
    /// Join on the GPU UUID.
    Uid,
    /// Join on the `/dev/nvidiaN` device name.
    DeviceName,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "dcgm-gpu-exporter",
    about = "Prometheus exporter for NVIDIA data-center GPU metrics via DCGM",
    long_about = "Prometheus exporter for NVIDIA data-center GPU metrics via DCGM.\n\n\
                  Watches DCGM fields across GPUs, MIG instances, NVSwitches, NVLinks and \
                  Grace CPUs, and exposes them in Prometheus exposition format with optional \
                  Kubernetes pod attribution.",
    version = "0.1.0",
    propagate_version = true
)]
pub struct Args {
    /// Listen address for the metrics server
    #[arg(short = 'a', long, env = "DCGM_EXPORTER_LISTEN")]
    pub address: Option<String>,

    /// Path to the counters YAML file
    #[arg(short = 'f', long, env = "DCGM_EXPORTER_COLLECTORS")]
    pub collectors: Option<PathBuf>,

    /// Field update interval in milliseconds
    #[arg(short = 'c', long, env = "DCGM_EXPORTER_INTERVAL")]
    pub collect_interval: Option<u64>,

    /// Enable kubelet pod-resources mapping
    #[arg(short = 'k', long, env = "DCGM_EXPORTER_KUBERNETES")]
    pub kubernetes: bool,

    /// Device-id join key for whole GPUs
    #[arg(long, value_enum, env = "DCGM_EXPORTER_KUBERNETES_GPU_ID_TYPE")]
    pub kubernetes_gpu_id_type: Option<GpuIdType>,

    /// Path to the kubelet pod-resources socket
    #[arg(long, env = "DCGM_EXPORTER_POD_RESOURCES_KUBELET_SOCKET")]
    pub pod_resources_socket: Option<PathBuf>,

    /// Extra device-plugin resource names treated as GPUs (comma-separated)
    #[arg(long, env = "DCGM_EXPORTER_NVIDIA_RESOURCE_NAMES")]
    pub nvidia_resource_names: Option<String>,

    /// Attach pod metadata labels to attributed metrics
    #[arg(long, env = "DCGM_EXPORTER_KUBERNETES_ENABLE_POD_LABELS")]
    pub kubernetes_enable_pod_labels: bool,

    /// Regex allowlist for pod label keys (comma-separated)
    #[arg(long, env = "DCGM_EXPORTER_KUBERNETES_POD_LABEL_ALLOWLIST")]
    pub kubernetes_pod_label_allowlist: Option<String>,

    /// Fan metrics out to every pod sharing a GPU
    #[arg(long, env = "DCGM_EXPORTER_KUBERNETES_VIRTUAL_GPUS")]
    pub kubernetes_virtual_gpus: bool,

    /// Use legacy pod_name/pod_namespace/container_name attribute keys
    #[arg(long, env = "DCGM_EXPORTER_USE_OLD_NAMESPACE")]
    pub use_old_namespace: bool,

    /// Directory of per-GPU HPC job files
    #[arg(long, env = "DCGM_EXPORTER_HPC_JOB_MAPPING_DIR")]
    pub hpc_job_mapping_dir: Option<PathBuf>,

    /// GPU devices to monitor: f (flex), g (all), major[:minor,...] ranges
    #[arg(short = 'd', long, env = "DCGM_EXPORTER_DEVICES")]
    pub devices: Option<String>,

    /// NVSwitch devices to monitor, same grammar as --devices
    #[arg(long, env = "DCGM_EXPORTER_OTHER_DEVICES")]
    pub switch_devices: Option<String>,

    /// CPU devices to monitor, same grammar as --devices
    #[arg(long, env = "DCGM_EXPORTER_CPU_DEVICES")]
    pub cpu_devices: Option<String>,

    /// Accept GPUs the library failed to identify, with placeholder identity
    #[arg(long, env = "DCGM_EXPORTER_USE_FAKE_GPUS")]
    pub fake_gpus: bool,

    /// Enable the experimental clock-events collector
    #[arg(long, env = "DCGM_EXPORTER_CLOCK_EVENTS_COUNT_WINDOW_SIZE")]
    pub enable_clock_events: bool,

    /// Enable the experimental XID-errors collector
    #[arg(long, env = "DCGM_EXPORTER_XID_COUNT_WINDOW_SIZE")]
    pub enable_xid_errors: bool,

    /// Enable the DCGM health-watch collector
    #[arg(long, env = "DCGM_EXPORTER_HEALTH_MONITOR")]
    pub enable_health_monitor: bool,

    /// Forward DCGM library logging at this severity
    #[arg(long, env = "DCGM_EXPORTER_ENABLE_DCGM_LOG")]
    pub enable_dcgm_log: bool,

    /// Log level
    #[arg(long, value_enum, default_value = "info", env = "DCGM_EXPORTER_LOG_LEVEL")]
    pub log_level: LogLevel,

    /// Enable TLS on the metrics server
    #[arg(long, env = "DCGM_EXPORTER_WEB_TLS_ENABLED")]
    pub enable_tls: bool,

    /// TLS certificate file (PEM)
    #[arg(long, env = "DCGM_EXPORTER_WEB_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM)
    #[arg(long, env = "DCGM_EXPORTER_WEB_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Config file (YAML)
    #[arg(long, env = "DCGM_EXPORTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,
}
