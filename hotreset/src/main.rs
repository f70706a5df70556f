//! NPU hot-reset agent
//!
//! Runs as a DaemonSet on NPU nodes. Each scan reads device state, recovers
//! faulty interconnect rings in place where the fault allows it and keeps the
//! task and node reset records in the cluster current.

mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::Config;
use hotreset_core::device::{create_device_interface, DryRunDevice, Health};
use hotreset_core::metrics::MetricsRegistry;
use hotreset_core::{ClusterClient, DeviceInterface, DeviceManager};
use hotreset_k8s::{EventMirror, K8sClient, KubeLedger};

/// Initialize the tracing/logging subsystem
fn init_logging(log_level: &str, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// Run one scan and log the resulting device health
async fn scan_once(manager: &DeviceManager) {
    match manager.scan().await {
        Ok(devices) => {
            let unhealthy: Vec<i32> = devices
                .iter()
                .filter(|d| d.health == Health::Unhealthy)
                .map(|d| d.logic_id)
                .collect();
            if unhealthy.is_empty() {
                info!(devices = devices.len(), "Scan complete, all devices healthy");
            } else {
                warn!(devices = devices.len(), unhealthy = ?unhealthy, "Scan complete");
            }
        }
        Err(e) => error!(error = %e, "Device scan failed"),
    }
}

/// Build the engine and run the scan loop until shutdown
async fn run(config: Config, once: bool, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let node_name = config
        .node_name
        .clone()
        .context("Node name must be specified via config, --node-name, or NODE_NAME env")?;

    info!(node = %node_name, "Starting hot-reset agent on node");

    let mut device: Arc<dyn DeviceInterface> = create_device_interface(config.device_type)
        .await
        .context("Failed to create device interface")?;
    if config.dry_run {
        info!("Dry run enabled, reset commands will only be logged");
        device = Arc::new(DryRunDevice::new(device));
    }

    let devices = device.list_devices().await?;
    info!(count = devices.len(), family = %device.hardware_family(), "Discovered NPU devices");
    if devices.is_empty() {
        warn!("No NPU devices found on this node");
    }

    let metrics = MetricsRegistry::new();
    metrics.set_npu_count(devices.len() as i64);

    let k8s_client = K8sClient::new().await?;
    let ledger: Arc<dyn ClusterClient> = Arc::new(KubeLedger::new(k8s_client.clone(), node_name.clone()));

    let manager = DeviceManager::new(
        device,
        ledger,
        config.hot_reset_config(),
        config.fault_code_table()?,
        metrics,
    );

    if once {
        info!("Running single scan (--once mode)");
        scan_once(&manager).await;
        manager.shutdown().await;
        return Ok(());
    }

    if config.mirror.enabled {
        let mirror = EventMirror::new(k8s_client, node_name.clone(), config.mirror_config());
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = mirror.run(rx).await {
                error!(error = %e, "Event mirror failed");
            }
        });
    }

    if config.metrics.enabled {
        let port = config.metrics.port;
        let path = config.metrics.path.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port, path).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let mut shutdown_rx = shutdown_rx;
    let mut ticker = tokio::time::interval(config.scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => scan_once(&manager).await,
            _ = shutdown_rx.changed() => {
                info!("Shutdown requested, waiting for recovery workers");
                break;
            }
        }
    }

    manager.shutdown().await;
    info!("Hot-reset agent shutdown complete");
    Ok(())
}

/// Start the Prometheus metrics HTTP server
async fn start_metrics_server(port: u16, path: String) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = port, path = %path, "Metrics server listening");

    let path = Arc::new(path);
    loop {
        let (mut socket, _) = listener.accept().await?;
        let path = path.clone();

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..n]);
            let requested = request.split_whitespace().nth(1).unwrap_or("/");

            let response = if requested == path.as_str() {
                let metrics_output = prometheus::TextEncoder::new()
                    .encode_to_string(&prometheus::gather())
                    .unwrap_or_default();
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                    metrics_output.len(),
                    metrics_output
                )
            } else {
                "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
            };

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Hot-reset agent starting");

    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        warn!(path = ?cli.config, "Config file not found, using defaults");
        Config::default()
    };

    if cli.dry_run {
        config.dry_run = true;
    }
    if cli.node_name.is_some() {
        config.node_name = cli.node_name;
    }
    config = config.with_node_name_from_env();

    config.validate().context("Invalid configuration")?;

    info!(
        dry_run = config.dry_run,
        device_type = %config.device_type,
        scan_interval = ?config.scan_interval,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating shutdown");
            }
        }

        let _ = shutdown_tx.send(true);
    });

    run(config, cli.once, shutdown_rx).await
}
