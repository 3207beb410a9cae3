use shared::ipc::StatusInfo;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::satellite::{self, SatelliteStatus};

pub struct DaemonState {
    pub config: Config,
    pub status: Arc<SatelliteStatus>,
    record_enabled: Arc<AtomicBool>,
    satellite_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl DaemonState {
    pub fn new(config: Config) -> Self {
        let record_enabled = Arc::new(AtomicBool::new(config.recording.dir.is_some()));
        Self {
            config,
            status: Arc::new(SatelliteStatus::new()),
            record_enabled,
            satellite_task: None,
            shutdown_tx: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.satellite_task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Validates the configuration and launches the satellite loop.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.is_active() {
            anyhow::bail!("satellite already running");
        }

        satellite::validate(&self.config)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(satellite::run(
            self.config.clone(),
            Arc::clone(&self.status),
            Arc::clone(&self.record_enabled),
            shutdown_rx,
        ));

        self.shutdown_tx = Some(shutdown_tx);
        self.satellite_task = Some(task);
        info!("Satellite started");
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(task) = self.satellite_task.take() {
            let abort_handle = task.abort_handle();
            if tokio::time::timeout(std::time::Duration::from_secs(5), task)
                .await
                .is_err()
            {
                warn!("Satellite did not stop in time, aborting");
                abort_handle.abort();
            }
        }
        info!("Satellite stopped");
    }

    /// Takes effect at the start of the next connection cycle.
    pub fn set_recording(&self, enabled: bool) -> Result<(), String> {
        if self.config.recording.dir.is_none() {
            return Err("recording.dir is not configured".to_string());
        }
        self.record_enabled.store(enabled, Ordering::SeqCst);
        info!(
            "Debug recording {} for the next session",
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub fn get_status(&self) -> StatusInfo {
        StatusInfo {
            is_running: self.is_active(),
            connected: self.status.connected.load(Ordering::SeqCst),
            session_state: self.status.state(),
            pipeline_runs: self.status.pipeline_runs.load(Ordering::Relaxed),
            recording: self.status.recording.load(Ordering::SeqCst),
        }
    }
}
