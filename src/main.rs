use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use wakegate::auth::{Authorizer, Whitelist};
use wakegate::commands::CommandInvoker;
use wakegate::config::Config;
use wakegate::healthcheck::{HealthCheckConfig, HealthChecker};
use wakegate::lifecycle::{LifecycleOrchestrator, LifecyclePolicy};
use wakegate::proxy::{ConnectionRouter, ProxyServer};
use wakegate::{PKG_NAME, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=info".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("wakegate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    // The membership file must be usable before anyone can log in
    if config.whitelist.enabled {
        let whitelist = Whitelist::new(&config.whitelist.path);
        let members = whitelist.load().await.map_err(|e| {
            error!(path = %whitelist.path().display(), error = %e, "Failed to load whitelist");
            anyhow::anyhow!("Whitelist is enabled but unusable: {}", e)
        })?;
        info!(path = %whitelist.path().display(), entries = members.len(), "Whitelist loaded");
    }

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Health checker first so the first snapshot is real before clients arrive
    let checker = HealthChecker::new(
        config.target.clone(),
        HealthCheckConfig::from(&config.health),
    );
    checker.probe_once().await;
    checker.start();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let orchestrator = LifecycleOrchestrator::new(
        LifecyclePolicy::from(&config.lifecycle),
        checker.subscribe(),
        events_tx,
    );
    orchestrator.tick();
    orchestrator.start();

    let invoker = CommandInvoker::new(config.commands.clone());
    let invoker_handle = tokio::spawn(invoker.run(events_rx));

    let router = ConnectionRouter::new(
        config.target.clone(),
        checker.subscribe(),
        orchestrator.clone(),
        Authorizer::from_config(&config.whitelist),
        config.server.client_timeout(),
    );
    let proxy = ProxyServer::new(bind_addr, router, shutdown_rx.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    orchestrator.close();
    checker.close();

    // Wait for the listener to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
    })
    .await;

    // Commands already dispatched keep running in their own tasks
    invoker_handle.abort();

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another gate is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gate");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        client_timeout_secs = config.server.client_timeout_secs,
        "Listener settings"
    );
    info!(backend = %config.target.addr(), "Backend target");
    info!(
        idle_timeout_secs = config.lifecycle.idle_timeout_secs,
        transition_timeout_secs = config.lifecycle.transition_timeout_secs,
        tick_interval_ms = config.lifecycle.tick_interval_ms,
        "Lifecycle settings"
    );
    info!(
        interval_ms = config.health.interval_ms,
        timeout_ms = config.health.timeout_ms,
        "Health check settings"
    );
    info!(
        enabled = config.whitelist.enabled,
        path = %config.whitelist.path.display(),
        working_dir = ?config.commands.working_dir,
        "Authorization and commands"
    );
}
