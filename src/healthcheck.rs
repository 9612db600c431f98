//! Health checker for the backend server
//!
//! Periodically sends a status query to the target and publishes the outcome
//! as an immutable [`HealthSnapshot`]. Readers always see a whole snapshot;
//! each cycle swaps in a new `Arc`.

use crate::config::{HealthConfig, TargetConfig};
use crate::error::GateError;
use crate::protocol::{self, StatusResponse};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Interval between probes
    pub interval: Duration,
    /// Timeout for each probe (connect, query, and read)
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(3),
        }
    }
}

impl From<&HealthConfig> for HealthCheckConfig {
    fn from(config: &HealthConfig) -> Self {
        Self {
            interval: config.interval(),
            timeout: config.timeout(),
        }
    }
}

/// Point-in-time view of the backend
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    /// Whether the most recent probe got a status response
    pub reachable: bool,
    /// Metadata from the most recent successful probe. Kept across misses so
    /// synthetic responses can still show the backend's icon.
    pub metadata: Option<Arc<StatusResponse>>,
    pub observed_at: Instant,
}

impl HealthSnapshot {
    /// Snapshot before any probe has completed
    pub fn initial() -> Self {
        Self {
            reachable: false,
            metadata: None,
            observed_at: Instant::now(),
        }
    }

    pub fn reachable(metadata: StatusResponse, observed_at: Instant) -> Self {
        Self {
            reachable: true,
            metadata: Some(Arc::new(metadata)),
            observed_at,
        }
    }

    /// A failed probe: unreachable, previous metadata retained
    pub fn missed(previous: &HealthSnapshot, observed_at: Instant) -> Self {
        Self {
            reachable: false,
            metadata: previous.metadata.clone(),
            observed_at,
        }
    }

    /// Online players according to the metadata (zero when unknown)
    pub fn online_players(&self) -> u32 {
        self.metadata
            .as_ref()
            .map(|m| m.online_players())
            .unwrap_or(0)
    }

    /// The backend's favicon, if it ever reported one
    pub fn favicon(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.favicon.as_deref())
    }
}

/// Probes the single backend and publishes snapshots
pub struct HealthChecker {
    target: TargetConfig,
    config: HealthCheckConfig,
    snapshot_tx: watch::Sender<Arc<HealthSnapshot>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthChecker {
    pub fn new(target: TargetConfig, config: HealthCheckConfig) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(Arc::new(HealthSnapshot::initial()));
        Arc::new(Self {
            target,
            config,
            snapshot_tx,
            task: Mutex::new(None),
        })
    }

    /// Receiver that always holds the freshest snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<HealthSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// The freshest completed snapshot
    pub fn current(&self) -> Arc<HealthSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Start the recurring probe cycle. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        info!(
            backend = %self.target.addr(),
            interval_ms = self.config.interval.as_millis() as u64,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "Health checker started"
        );

        let checker = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            loop {
                checker.probe_once().await;
                tokio::time::sleep(checker.config.interval).await;
            }
        }));
    }

    /// Stop the probe cycle and drop any probe in flight. Idempotent.
    pub fn close(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            info!("Health checker stopped");
        }
    }

    /// Run one probe and publish its outcome
    pub async fn probe_once(&self) -> Arc<HealthSnapshot> {
        let result = self.probe().await;
        let now = Instant::now();
        let previous = self.current();

        let snapshot = match result {
            Ok(status) => {
                if !previous.reachable {
                    info!(
                        backend = %self.target.addr(),
                        version = %status.version.name,
                        players = status.players.online,
                        "Backend is reachable"
                    );
                }
                HealthSnapshot::reachable(status, now)
            }
            Err(reason) => {
                if previous.reachable {
                    info!(backend = %self.target.addr(), reason = %reason, "Backend is unreachable");
                } else {
                    debug!(backend = %self.target.addr(), reason = %reason, "Health check failed");
                }
                HealthSnapshot::missed(&previous, now)
            }
        };

        let snapshot = Arc::new(snapshot);
        self.snapshot_tx.send_replace(Arc::clone(&snapshot));
        snapshot
    }

    /// Connect, query status, and parse the reply within the probe timeout
    async fn probe(&self) -> Result<StatusResponse, String> {
        let addr = self.target.addr();
        let attempt = async {
            let mut stream = TcpStream::connect(&addr).await?;
            let status =
                protocol::query_status(&mut stream, &self.target.host, self.target.port).await?;
            Ok::<_, GateError>(status)
        };

        match tokio::time::timeout(self.config.timeout, attempt).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("timeout".to_string()),
        }
    }
}
