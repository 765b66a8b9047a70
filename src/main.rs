//! dcgm-gpu-exporter entry point.
//!
//! Bootstraps config, discovers the device inventory, registers watches and
//! collectors, and serves the metrics endpoint until SIGINT/SIGTERM.

use anyhow::{bail, Context};
use axum::{routing::get, Router};
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn, Level};

use dcgm_gpu_exporter::cli::{Args, LogLevel};
use dcgm_gpu_exporter::collectors::{
    ClockEventsCollector, DcgmCollector, GpuHealthCollector, XidCollector,
};
use dcgm_gpu_exporter::config::{resolve_config, validate_effective_config, Config};
use dcgm_gpu_exporter::counters::{load_counter_file, validate_counters, Counter};
use dcgm_gpu_exporter::dcgm::fake::FakeDcgmClient;
use dcgm_gpu_exporter::dcgm::{DcgmClient, EntityGroup, FieldKind, FieldMeta, FieldScalar};
use dcgm_gpu_exporter::handlers::{health_handler, metrics_handler, root_handler};
use dcgm_gpu_exporter::metrics::node_hostname;
use dcgm_gpu_exporter::registry::Registry;
use dcgm_gpu_exporter::state::{AppState, SharedState};
use dcgm_gpu_exporter::transform::podlabels::{KubeApiClient, PodLabelSource};
use dcgm_gpu_exporter::transform::{HpcJobMapper, PodMapper, Transform};
use dcgm_gpu_exporter::watchlist::{build_watch_list, SharedWatchListManager, WatchListManager};
use dcgm_gpu_exporter::DeviceInfo;

/// Initializes tracing logging subsystem with configured log level.
fn setup_logging(args: &Args) {
    let log_level = match args.log_level {
        LogLevel::Off => Level::ERROR,
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Logging initialized with level: {:?}", args.log_level);
}

/// Synthetic backend for `--fake-gpus` dev runs: two GPUs, every configured
/// counter registered as a GPU-level field with a random sample.
fn build_fake_client(counters: &[Counter]) -> FakeDcgmClient {
    let mut client = FakeDcgmClient::new()
        .with_gpu(0, "NVIDIA H100 80GB HBM3")
        .with_gpu(1, "NVIDIA H100 80GB HBM3");
    for counter in counters {
        client = client.with_field(FieldMeta {
            field_id: counter.field_id,
            field_name: counter.field_name.clone(),
            kind: FieldKind::Double,
            entity_level: EntityGroup::Gpu,
        });
        for gpu in 0..2 {
            client = client.with_value(
                EntityGroup::Gpu,
                gpu,
                counter.field_id,
                FieldScalar::Double((rand::random::<f64>() * 100.0).round()),
            );
        }
    }
    client
}

/// Builds inventory, watch-list and collectors for every entity kind. Only
/// the GPU kind is fatal on failure; absent switch or CPU hardware is normal.
async fn setup_collection(
    client: Arc<dyn DcgmClient>,
    config: &Config,
    counters: &[Counter],
    registry: &Registry,
    watch_lists: &SharedWatchListManager,
    hostname: &str,
) -> anyhow::Result<()> {
    let g_opts = config.gpu_device_options()?;
    let s_opts = config.switch_device_options()?;
    let c_opts = config.cpu_device_options()?;
    let use_fake = config.fake_gpus.unwrap_or(false);
    let update_freq = config.update_frequency_us();

    let kinds = [
        EntityGroup::Gpu,
        EntityGroup::Switch,
        EntityGroup::Link,
        EntityGroup::Cpu,
        EntityGroup::CpuCore,
    ];
    for kind in kinds {
        let info = match DeviceInfo::initialize(
            client.as_ref(),
            g_opts.clone(),
            s_opts.clone(),
            c_opts.clone(),
            use_fake,
            kind,
        ) {
            Ok(info) => info,
            Err(e) if kind == EntityGroup::Gpu => {
                return Err(e).context("GPU discovery failed");
            }
            Err(e) => {
                info!("not collecting {kind} metrics: {e}");
                continue;
            }
        };

        let list = build_watch_list(client.as_ref(), counters, info, update_freq)
            .with_context(|| format!("building {kind} watch list"))?;
        if list.fields.is_empty() {
            info!("no configured counters apply to {kind}; skipping");
            continue;
        }

        registry.register(
            kind,
            Arc::new(DcgmCollector::from_watch_list(
                Arc::clone(&client),
                &list,
                hostname.to_string(),
            )),
        );

        if kind == EntityGroup::Gpu {
            if config.enable_clock_events.unwrap_or(false) {
                registry.register(
                    kind,
                    Arc::new(ClockEventsCollector::from_watch_list(
                        Arc::clone(&client),
                        &list,
                        hostname.to_string(),
                    )),
                );
            }
            if config.enable_xid_errors.unwrap_or(false) {
                registry.register(
                    kind,
                    Arc::new(XidCollector::from_watch_list(
                        Arc::clone(&client),
                        &list,
                        hostname.to_string(),
                    )),
                );
            }
            if config.enable_health_monitor.unwrap_or(false) {
                let collector = GpuHealthCollector::from_watch_list(
                    Arc::clone(&client),
                    &list,
                    hostname.to_string(),
                )
                .context("setting up health watches")?;
                registry.register(kind, Arc::new(collector));
            }
        }

        watch_lists.write().await.insert(list);
    }
    Ok(())
}

/// Assembles the transformer chain in its fixed run order.
fn setup_transforms(config: &Config) -> anyhow::Result<Vec<Box<dyn Transform>>> {
    let mut transforms: Vec<Box<dyn Transform>> = Vec::new();

    if config.kubernetes.unwrap_or(false) {
        let label_filter = config.pod_label_filter()?;
        let label_source = if config.kubernetes_enable_pod_labels.unwrap_or(false) {
            match KubeApiClient::in_cluster() {
                Ok(client) => Some(Arc::new(client) as Arc<dyn PodLabelSource>),
                Err(e) => {
                    warn!("pod labels enabled but kubernetes api unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };
        transforms.push(Box::new(PodMapper::new(
            config.pod_mapper_settings(),
            label_source,
            label_filter,
        )));
    }

    if let Some(dir) = &config.hpc_job_mapping_dir {
        transforms.push(Box::new(HpcJobMapper::new(dir.clone())));
    }

    Ok(transforms)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.check_config {
        let config = resolve_config(&args)?;
        if let Err(e) = validate_effective_config(&config) {
            eprintln!("Configuration invalid: {e}");
            std::process::exit(1);
        }
        println!("Configuration is valid");
        return Ok(());
    }

    setup_logging(&args);

    let config = Arc::new(resolve_config(&args)?);
    validate_effective_config(&config).context("invalid configuration")?;

    let counters_file = config.counters_file();
    let counters = load_counter_file(&counters_file)
        .with_context(|| format!("loading counters from {}", counters_file.display()))?;
    validate_counters(&counters)?;
    info!("Loaded {} counters from {}", counters.len(), counters_file.display());

    let client: Arc<dyn DcgmClient> = if config.fake_gpus.unwrap_or(false) {
        info!("Running against the synthetic DCGM backend (--fake-gpus)");
        Arc::new(build_fake_client(&counters))
    } else {
        // The host-engine client is pluggable and lives out of tree.
        bail!(
            "no DCGM host-engine backend is linked into this build; \
             run with --fake-gpus or plug in a host-engine client"
        );
    };

    let hostname = node_hostname();
    let registry = Registry::new();
    let watch_lists: SharedWatchListManager =
        Arc::new(tokio::sync::RwLock::new(WatchListManager::default()));

    if let Err(e) = setup_collection(
        Arc::clone(&client),
        &config,
        &counters,
        &registry,
        &watch_lists,
        &hostname,
    )
    .await
    {
        // Init errors still release every handle acquired so far.
        watch_lists.write().await.cleanup(client.as_ref());
        return Err(e);
    }
    info!(
        "Collection ready: {} collectors on host {hostname}",
        registry.collector_count()
    );

    let transforms = setup_transforms(&config)?;
    let state: SharedState = Arc::new(AppState::new(
        registry,
        Arc::clone(&watch_lists),
        transforms,
        Arc::clone(&client),
    )?);

    let app = Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::clone(&state));

    let addr: SocketAddr = config
        .listen_address()
        .parse()
        .with_context(|| format!("bad listen address {:?}", config.listen_address()))?;

    if config.enable_tls.unwrap_or(false) {
        let (cert, key) = match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert), Some(key)) => (cert.clone(), key.clone()),
            _ => bail!("TLS enabled without certificate and key"),
        };
        let tls_config = RustlsConfig::from_pem_file(cert, key)
            .await
            .context("loading TLS certificate")?;
        info!("Serving HTTPS on {addr}");
        let server = axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service());
        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    error!("Server error: {e}");
                }
            }
            _ = shutdown_signal() => {
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    } else {
        let listener = TcpListener::bind(addr).await?;
        info!("Serving HTTP on {addr}");
        let server = axum::serve(listener, app);
        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    error!("Server error: {e}");
                }
            }
            _ = shutdown_signal() => {
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }

    state.teardown().await;
    info!("Shutdown complete");
    Ok(())
}
