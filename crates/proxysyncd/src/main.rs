// # proxysyncd - proxysync Daemon
//
// Thin integration layer keeping a proxysync cache in step with a running
// mihomo core. All refresh, fallback, dedupe and probe logic lives in
// proxysync-core; this binary only:
//
// 1. Reads configuration from environment variables
// 2. Initializes tracing and the runtime
// 3. Wires backend, hub, scheduler, event bridge and probe manager
// 4. Turns OS signals into push notifications and shutdown
//
// ## Configuration
//
// ### Controller
// - `PROXYSYNC_CONTROLLER_URL`: External controller URL (default http://127.0.0.1:9097)
// - `PROXYSYNC_SECRET`: Controller secret (optional)
//
// ### Probes
// - `PROXYSYNC_PROBE_TIMEOUT_MS`: Delay test timeout (default 10000)
// - `PROXYSYNC_MAX_CONCURRENT_PROBES`: Worker pool size, 0 = unbounded (default 32)
// - `PROXYSYNC_PROBE_GROUP`: Group whose members are probed at startup and on SIGUSR2
//
// ### System Proxy Address
// - `PROXYSYNC_AUTO_CONFIG`: Ignore the OS proxy setting and always use host:port (true/false)
// - `PROXYSYNC_PROXY_HOST`: Host override (default 127.0.0.1)
// - `PROXYSYNC_MIXED_PORT`: Port override
//
// ### Logging
// - `PROXYSYNC_LOG_LEVEL`: trace, debug, info, warn, error (default info)
//
// ## Signals
//
// | Signal          | Effect                                   |
// |-----------------|------------------------------------------|
// | SIGHUP          | Configuration changed (config + proxies) |
// | SIGUSR1         | Topology changed (proxies)               |
// | SIGUSR2         | Re-probe `PROXYSYNC_PROBE_GROUP`         |
// | SIGTERM, SIGINT | Graceful shutdown                        |
//
// ## Example
//
// ```bash
// export PROXYSYNC_CONTROLLER_URL=http://127.0.0.1:9097
// export PROXYSYNC_SECRET=your_secret
// export PROXYSYNC_PROBE_GROUP=Auto
//
// proxysyncd
// ```

use anyhow::{Context, Result};
use proxysync_core::probe::DelayListener;
use proxysync_core::sync::SkipReason;
use proxysync_core::{
    CoreBackend, DataSyncHub, DelayUpdate, EventBridge, EventChannel, LatencyProbeManager,
    LocalEventBus, ProbeOutcome, SyncConfig, SyncEvent, SyncScheduler,
};
use proxysync_mihomo::{DEFAULT_CONTROLLER_URL, MihomoBackend};
use std::env;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Upper bound on waiting for in-flight refreshes at shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum SyncdExitCode {
    CleanShutdown = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<SyncdExitCode> for ExitCode {
    fn from(code: SyncdExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
struct Config {
    controller_url: String,
    secret: Option<String>,
    probe_timeout_ms: Option<u64>,
    max_concurrent_probes: Option<usize>,
    probe_group: Option<String>,
    auto_config: bool,
    proxy_host: Option<String>,
    mixed_port: Option<u16>,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`; unset and empty are the same
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Ok(Self {
            controller_url: var("PROXYSYNC_CONTROLLER_URL")
                .unwrap_or_else(|| DEFAULT_CONTROLLER_URL.to_string()),
            secret: var("PROXYSYNC_SECRET"),
            probe_timeout_ms: parse_var("PROXYSYNC_PROBE_TIMEOUT_MS", var("PROXYSYNC_PROBE_TIMEOUT_MS"))?,
            max_concurrent_probes: parse_var(
                "PROXYSYNC_MAX_CONCURRENT_PROBES",
                var("PROXYSYNC_MAX_CONCURRENT_PROBES"),
            )?,
            probe_group: var("PROXYSYNC_PROBE_GROUP"),
            auto_config: parse_bool("PROXYSYNC_AUTO_CONFIG", var("PROXYSYNC_AUTO_CONFIG"))?,
            proxy_host: var("PROXYSYNC_PROXY_HOST"),
            mixed_port: parse_var("PROXYSYNC_MIXED_PORT", var("PROXYSYNC_MIXED_PORT"))?,
            log_level: var("PROXYSYNC_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if !self.controller_url.starts_with("http://") && !self.controller_url.starts_with("https://") {
            anyhow::bail!(
                "PROXYSYNC_CONTROLLER_URL must use HTTP or HTTPS scheme. Got: {}",
                self.controller_url
            );
        }

        if let Some(ref secret) = self.secret {
            let lower = secret.to_lowercase();
            if lower.contains("your_secret") || lower.contains("replace_me") {
                anyhow::bail!(
                    "PROXYSYNC_SECRET appears to be a placeholder. \
                    Use the secret from the core's external-controller settings."
                );
            }
        }

        if let Some(timeout) = self.probe_timeout_ms
            && !(100..=60_000).contains(&timeout)
        {
            anyhow::bail!(
                "PROXYSYNC_PROBE_TIMEOUT_MS must be between 100 and 60000. Got: {}",
                timeout
            );
        }

        if let Some(pool) = self.max_concurrent_probes
            && pool > 1024
        {
            anyhow::bail!(
                "PROXYSYNC_MAX_CONCURRENT_PROBES must be at most 1024 (0 = unbounded). Got: {}",
                pool
            );
        }

        if self.mixed_port == Some(0) {
            anyhow::bail!("PROXYSYNC_MIXED_PORT cannot be 0");
        }

        if let Some(ref host) = self.proxy_host
            && (host.contains("://") || host.contains('/'))
        {
            anyhow::bail!(
                "PROXYSYNC_PROXY_HOST must be a bare host name or address. Got: {}",
                host
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "PROXYSYNC_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    /// Library configuration with the environment overrides applied
    fn sync_config(&self) -> SyncConfig {
        let mut sync = SyncConfig::default();

        if let Some(timeout) = self.probe_timeout_ms {
            sync.probe.default_timeout_ms = timeout;
        }
        if let Some(pool) = self.max_concurrent_probes {
            sync.probe.max_concurrent_probes = pool;
        }

        sync.address.auto_config = self.auto_config;
        sync.address.proxy_host = self.proxy_host.clone();
        sync.address.mixed_port = self.mixed_port;
        sync
    }

    fn log_level(&self) -> Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

fn parse_var<T>(name: &str, raw: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.map(|value| {
        value
            .parse()
            .with_context(|| format!("{} is not a valid number: '{}'", name, value))
    })
    .transpose()
}

fn parse_bool(name: &str, raw: Option<String>) -> Result<bool> {
    match raw.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("0" | "false" | "no" | "off") => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some(other) => anyhow::bail!("{} must be true or false. Got: '{}'", name, other),
    }
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return SyncdExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return SyncdExitCode::ConfigError.into();
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level())
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return SyncdExitCode::ConfigError.into();
    }

    info!("Starting proxysyncd");

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return SyncdExitCode::RuntimeError.into();
        }
    };

    rt.block_on(async {
        match run_daemon(config).await {
            Ok(()) => SyncdExitCode::CleanShutdown,
            Err(DaemonError::Startup(e)) => {
                error!("Startup error: {:#}", e);
                SyncdExitCode::ConfigError
            }
            Err(DaemonError::Runtime(e)) => {
                error!("Daemon error: {:#}", e);
                SyncdExitCode::RuntimeError
            }
        }
    })
    .into()
}

/// Failure phase, mapped onto exit codes
enum DaemonError {
    Startup(anyhow::Error),
    Runtime(anyhow::Error),
}

/// Run the daemon until a shutdown signal
async fn run_daemon(config: Config) -> std::result::Result<(), DaemonError> {
    let sync_config = config.sync_config();
    sync_config
        .validate()
        .map_err(|e| DaemonError::Startup(e.into()))?;

    let backend = Arc::new(
        MihomoBackend::new(
            &config.controller_url,
            config.secret.clone(),
            sync_config.probe.test_url.clone(),
        )
        .map_err(|e| DaemonError::Startup(e.into()))?,
    );
    info!(
        "Using {} controller at {}",
        backend.backend_name(),
        backend.controller_url()
    );

    let (hub, events) =
        DataSyncHub::new(backend.clone(), &sync_config).map_err(|e| DaemonError::Startup(e.into()))?;
    let hub = Arc::new(hub);
    let probes = LatencyProbeManager::new(backend, &sync_config.probe);

    let event_logger = tokio::spawn(log_sync_events(events));

    let (scheduler, invalidator) = SyncScheduler::new(Arc::clone(&hub));
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let scheduler_handle = tokio::spawn(scheduler.run_with_shutdown(Some(shutdown_rx)));

    let bus = LocalEventBus::new();
    let bridge = EventBridge::start(Arc::new(bus.clone()), invalidator);
    bridge.wait_for_setup().await;
    info!("Listening on {} push channel(s)", bridge.active_channels().len());

    hub.refresh_all().await;
    let topology = hub.proxies();
    info!(
        "Initial sync complete: {} group(s), {} node(s), proxy address {}",
        topology.groups.len(),
        topology.by_name.len(),
        hub.system_proxy_address()
    );

    if let Some(ref group) = config.probe_group {
        probe_configured_group(&hub, &probes, group).await;
    }

    let signal = wait_for_shutdown(&bus, &hub, &probes, config.probe_group.as_deref())
        .await
        .map_err(DaemonError::Runtime)?;
    info!("Received shutdown signal: {}", signal);

    let released = bridge.teardown();
    debug!("Released {} subscription(s)", released);

    if shutdown_tx.send(()).is_err() {
        warn!("Scheduler already stopped");
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, scheduler_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => return Err(DaemonError::Runtime(e.into())),
        Ok(Err(e)) => {
            return Err(DaemonError::Runtime(anyhow::anyhow!(
                "Scheduler task failed: {}",
                e
            )));
        }
        Err(_) => {
            return Err(DaemonError::Runtime(anyhow::anyhow!(
                "Shutdown timeout after {:?}",
                SHUTDOWN_TIMEOUT
            )));
        }
    }

    // The hub owns the event sender; dropping it ends the logger
    drop(hub);
    if let Err(e) = event_logger.await {
        warn!("Event logger ended abnormally: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Log every sync event until the hub is dropped
async fn log_sync_events(mut events: tokio::sync::mpsc::Receiver<SyncEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::RefreshStarted { source, forced } => {
                debug!("Refreshing {} (forced: {})", source, forced);
            }
            SyncEvent::RefreshSucceeded { source } => debug!("Refreshed {}", source),
            SyncEvent::FallbackApplied {
                source,
                error,
                replaced,
            } => {
                if replaced {
                    warn!("{} unavailable, serving fallback: {}", source, error);
                } else {
                    warn!("{} unavailable, keeping last value: {}", source, error);
                }
            }
            SyncEvent::RefreshSkipped { source, reason } => match reason {
                SkipReason::DedupeWindow => debug!("{} served from cache", source),
                SkipReason::JoinedInFlight => debug!("{} joined running fetch", source),
            },
        }
    }
}

/// Probe every member of `group_name` once, logging each result
async fn probe_configured_group(hub: &DataSyncHub, probes: &LatencyProbeManager, group_name: &str) {
    let topology = hub.proxies();
    let Some(group) = topology.group(group_name) else {
        warn!("Probe group '{}' not found in topology", group_name);
        return;
    };

    let listener: DelayListener = Arc::new(|update: &DelayUpdate| {
        debug!("{} -> {:?}", update.key, update.state);
    });

    let handles: Vec<_> = group
        .member_names()
        .into_iter()
        .filter_map(|member| probes.register(member, group.name(), Arc::clone(&listener)))
        .collect();

    for (member, outcome) in probes.probe_group(group, None).await {
        match outcome {
            ProbeOutcome::Completed(state) => info!("{} @ {}: {:?}", member, group.name(), state),
            ProbeOutcome::AlreadyTesting => debug!("{} already being probed", member),
            other => debug!("{} @ {}: {:?}", member, group.name(), other),
        }
    }

    for handle in handles {
        probes.unregister(handle);
    }
}

/// Wait for SIGTERM/SIGINT, forwarding the other signals meanwhile
///
/// # Returns
///
/// Returns the name of the shutdown signal received.
#[cfg(unix)]
async fn wait_for_shutdown(
    bus: &LocalEventBus,
    hub: &DataSyncHub,
    probes: &LatencyProbeManager,
    probe_group: Option<&str>,
) -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGHUP handler: {}", e))?;
    let mut sigusr1 = signal(SignalKind::user_defined1())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGUSR1 handler: {}", e))?;
    let mut sigusr2 = signal(SignalKind::user_defined2())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGUSR2 handler: {}", e))?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => return Ok("SIGTERM"),
            _ = sigint.recv() => return Ok("SIGINT"),
            _ = sighup.recv() => notify(bus, EventChannel::ConfigChanged),
            _ = sigusr1.recv() => notify(bus, EventChannel::TopologyChanged),
            _ = sigusr2.recv() => match probe_group {
                Some(group) => probe_configured_group(hub, probes, group).await,
                None => info!("SIGUSR2 ignored: PROXYSYNC_PROBE_GROUP is not set"),
            },
        }
    }
}

/// Wait for Ctrl-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown(
    _bus: &LocalEventBus,
    _hub: &DataSyncHub,
    _probes: &LatencyProbeManager,
    _probe_group: Option<&str>,
) -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}

#[cfg(unix)]
fn notify(bus: &LocalEventBus, channel: EventChannel) {
    let delivered = bus.emit(channel);
    info!("Pushed {} to {} subscriber(s)", channel, delivered);
}
