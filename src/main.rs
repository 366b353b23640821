//! ironprobe binary: configuration, wiring, and shutdown handling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use ironprobe::config::{ClientConfig, SessionTunables};
use ironprobe::diagnostics::spawn_diagnostics;
use ironprobe::session::SessionRegistry;
use ironprobe::transport::Transport;
use ironprobe::transport::sim::SimTransport;

#[derive(Parser, Debug)]
#[command(
    name = "ironprobe",
    version,
    about = "Persistent endpoint probing client: keeps sessions alive and runs scheduled reads"
)]
struct Cli {
    /// Config file with endpoint and action definitions.
    #[arg(short, long, default_value = "ironprobe.json", env = "IRONPROBE_CONFIG")]
    config: PathBuf,

    /// Default endpoint targeted by the built-in connectivity probe.
    #[arg(
        long,
        default_value = "opc.tcp://localhost:4840",
        env = "IRONPROBE_ENDPOINT"
    )]
    endpoint: String,

    /// Disable security for the built-in probe endpoint.
    #[arg(long)]
    no_security: bool,

    /// Schedule the built-in current-time probe against the default endpoint.
    #[arg(long)]
    default_probe: bool,

    /// Also schedule the probe on a security-disabled variant of the endpoint.
    #[arg(long, requires = "default_probe")]
    probe_insecure: bool,

    /// Interval of the built-in probe, in seconds.
    #[arg(long, default_value_t = 30)]
    probe_interval: u64,

    /// Base connect timeout in seconds, scaled by the backoff multiplier.
    #[arg(long, default_value_t = 5)]
    session_timeout: u64,

    /// Cap on the backoff multiplier for failed connects.
    #[arg(long, default_value_t = 10)]
    backoff_max: u32,

    /// Missed keep-alives tolerated before a connection is replaced.
    #[arg(long, default_value_t = 3)]
    keep_alive_threshold: u32,

    /// Fixed control-loop poll interval, in seconds.
    #[arg(long, default_value_t = 10)]
    poll_interval: u64,

    /// Seconds between diagnostics reports.
    #[arg(long, default_value_t = 60)]
    diagnostics_interval: u64,

    /// Upper bound for the simulated transport's per-call latency, in
    /// milliseconds.
    #[arg(long, default_value_t = 25)]
    sim_latency_ms: u64,
}

impl Cli {
    fn tunables(&self) -> SessionTunables {
        SessionTunables {
            session_timeout_base: Duration::from_secs(self.session_timeout),
            backoff_max: self.backoff_max,
            keep_alive_threshold: self.keep_alive_threshold,
            poll_interval: Duration::from_secs(self.poll_interval),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // Configuration errors are fatal before any session starts.
    let mut config = ClientConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.default_probe {
        config = config.with_default_probe(
            &cli.endpoint,
            !cli.no_security,
            Duration::from_secs(cli.probe_interval),
            cli.probe_insecure,
        );
    }
    if config.endpoints.is_empty() {
        tracing::warn!("no endpoints configured, nothing to do");
    }

    // The simulated stack stands in for a real protocol library; anything
    // implementing `Transport` can be wired here instead.
    let transport: Arc<dyn Transport> =
        Arc::new(SimTransport::new().with_latency(Duration::from_millis(cli.sim_latency_ms)));
    let registry = Arc::new(SessionRegistry::new(transport, cli.tunables()));

    for endpoint in &config.endpoints {
        registry
            .create_session(
                &endpoint.endpoint_url,
                endpoint.use_security,
                endpoint.action_specs(),
            )
            .await;
    }
    tracing::info!(
        sessions = registry.count_all().await,
        actions = registry.count_actions().await,
        "configuration loaded"
    );

    registry.start_all().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let diagnostics = spawn_diagnostics(
        Arc::clone(&registry),
        Duration::from_secs(cli.diagnostics_interval),
        shutdown_rx,
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    registry.shutdown_all().await;
    let _ = diagnostics.await;

    Ok(())
}
