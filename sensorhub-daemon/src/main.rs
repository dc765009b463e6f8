// Sensor session coordinator daemon: node transport, discovery beacon, operator console.

mod config;
mod console;
mod discovery;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::Parser;
use sensorhub_core::{Coordinator, CoordinatorEvent, Keypair, SessionStore};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::transport::Hub;

const TICK_INTERVAL: Duration = Duration::from_millis(500);
const EVENT_BUFFER: usize = 1024;
/// Grace period for writers to flush stop commands before the process exits.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "sensorhub-daemon", version, about = "Sensor session coordinator")]
struct Cli {
    /// Config file (default ~/.config/sensorhub/config.toml, then /etc/sensorhub/config.toml).
    #[arg(long, env = "SENSORHUB_CONFIG")]
    config: Option<PathBuf>,
    /// Session data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Node transport TCP port.
    #[arg(long)]
    port: Option<u16>,
    /// Discovery UDP port.
    #[arg(long)]
    discovery_port: Option<u16>,
    /// Log filter, e.g. `info` or `sensorhub_core=debug`. RUST_LOG wins if set.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, cfg: &mut config::Config) {
        if let Some(d) = self.data_dir {
            cfg.data_dir = d;
        }
        if let Some(p) = self.port {
            cfg.transport_port = p;
        }
        if let Some(p) = self.discovery_port {
            cfg.discovery_port = p;
        }
        if let Some(l) = self.log_level {
            cfg.log_level = l;
        }
    }
}

/// Wall clock in ms since the Unix epoch; the time base handed to the coordinator.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    cli.apply(&mut cfg);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("creating data dir {}", cfg.data_dir.display()))?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %cfg.data_dir.display(),
        "sensorhub starting"
    );

    let keypair = Arc::new(Keypair::generate());
    let core = Coordinator::new(cfg.coordinator.clone(), SessionStore::new(&cfg.data_dir));
    let (events, _) = broadcast::channel(EVENT_BUFFER);
    let hub = Hub::new(Arc::new(Mutex::new(core)), events);

    tokio::spawn(log_events(hub.subscribe()));
    tokio::spawn(tick_loop(hub.clone()));
    tokio::spawn(console::run_console(hub.clone()));

    let keypair_disc = keypair.clone();
    let (disc_port, transport_port) = (cfg.discovery_port, cfg.transport_port);
    tokio::spawn(async move {
        if let Err(e) = discovery::run_discovery(keypair_disc, disc_port, transport_port).await {
            warn!(error = %e, "discovery stopped; nodes must be configured with the address");
        }
    });

    let transport = tokio::spawn(transport::run_transport(hub.clone(), keypair, transport_port));

    tokio::select! {
        res = shutdown_signal() => res?,
        res = transport => {
            let err = match res {
                Ok(Ok(())) => anyhow::anyhow!("transport exited"),
                Ok(Err(e)) => anyhow::Error::new(e),
                Err(e) => anyhow::Error::new(e),
            };
            error!(error = %err, "transport failed");
            return Err(err.context(format!("transport on port {transport_port}")));
        }
    }

    info!("shutting down");
    let actions = hub.core().lock().await.shutdown(now_ms());
    hub.dispatch(actions).await;
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    Ok(())
}

/// Drive coordinator timeouts and sync rounds.
async fn tick_loop(hub: Hub) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let actions = hub.core().lock().await.tick(now_ms());
        hub.dispatch(actions).await;
    }
}

/// Log every coordinator event; faults at warn.
async fn log_events(mut rx: broadcast::Receiver<CoordinatorEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => log_event(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "event log lagged"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &CoordinatorEvent) {
    match event {
        CoordinatorEvent::Fault(f) => warn!(fault = %f, "fault"),
        CoordinatorEvent::NodeRegistered {
            device_id,
            capabilities,
            reconnect,
        } => info!(device_id = %device_id, ?capabilities, reconnect, "node registered"),
        CoordinatorEvent::NodeStateChanged { device_id, from, to } => {
            info!(device_id = %device_id, ?from, ?to, "node state")
        }
        CoordinatorEvent::SyncUpdated {
            device_id,
            offset_ms,
            rtt_ms,
            quality,
            accepted,
        } => debug!(device_id = %device_id, offset_ms, rtt_ms, quality, accepted, "sync"),
        CoordinatorEvent::SessionStateChanged {
            session_id,
            from,
            to,
        } => info!(session_id = %session_id, %from, %to, "session state"),
        CoordinatorEvent::StimulusRecorded { session_id, event } => info!(
            session_id = %session_id,
            label = %event.label,
            at = event.timestamp_ms,
            source = %event.source,
            "stimulus"
        ),
        CoordinatorEvent::FileCommitted(record) => info!(
            device_id = %record.device_id,
            file = %record.name,
            bytes = record.size_bytes,
            status = ?record.status,
            "file committed"
        ),
        CoordinatorEvent::SensorData {
            device_id, samples, ..
        } => debug!(device_id = %device_id, samples = samples.len(), "sensor data"),
        CoordinatorEvent::PreviewFrame { device_id, .. } => {
            debug!(device_id = %device_id, "preview frame")
        }
        CoordinatorEvent::Notification {
            device_id, label, ..
        } => info!(device_id = %device_id, label = %label, "node notification"),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("waiting for Ctrl+C")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    }
    Ok(())
}
