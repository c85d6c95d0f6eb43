mod collectors;
mod config;
mod http;
mod metrics;
mod reporter;
mod session;
mod snapshot;
mod state;

use axum::serve;
use clap::Parser;
use collectors::probe::{run_probe_loop, ProbeSet, TcpProber};
use collectors::rate::spawn_disk_io_sampler;
use collectors::system::SysinfoSource;
use collectors::{Collector, MetricsSource};
use config::{Config, ConfigError, ProtocolFamily};
use metrics::{now_unix, Metrics};
use reporter::ReportingLoop;
use session::TcpConnector;
use state::State;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "reportd")]
#[command(version)]
struct Cli {
    /// YAML config file; built-in defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long)]
    server: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Seconds between reports.
    #[arg(long)]
    interval: Option<u64>,
    #[arg(long, value_enum)]
    protocol: Option<ProtocolFamily>,
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let resolved = resolve_config(&cli);
    init_tracing(cli.debug || resolved.as_ref().map(|c| c.debug).unwrap_or(false));
    let cfg = match resolved {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(
        server = %cfg.server_address(),
        interval_secs = cfg.interval_secs,
        probe_targets = cfg.probe.targets.len(),
        "starting reportd"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };
    let shared_state = Arc::new(RwLock::new(State::new(cfg.server_address(), now_unix())));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let source: Arc<dyn MetricsSource> = Arc::new(SysinfoSource::new());
    let probes = ProbeSet::new(cfg.probe.targets.clone(), cfg.probe.history_len);
    let prober = Arc::new(TcpProber {
        timeout: cfg.probe.timeout(),
        family: cfg.protocol,
    });
    for target in probes.targets().to_vec() {
        tasks.push(tokio::spawn(run_probe_loop(
            probes.clone(),
            target,
            prober.clone(),
            cfg.probe.interval(),
            shutdown_rx.clone(),
        )));
    }

    let (disk_io, disk_io_task) = spawn_disk_io_sampler(
        source.clone(),
        Duration::from_secs(cfg.disk_io_interval_secs),
        shutdown_rx.clone(),
    );
    tasks.push(disk_io_task);

    if let Some(listen) = cfg.status_listen.clone() {
        let metrics = metrics.clone();
        let http_state = shared_state.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let app = http::build_router(metrics, http_state);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid status_listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to bind status endpoint");
                    return;
                }
            };
            info!(listen = %addr, "status endpoint listening");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "status endpoint error");
            }
        }));
    }

    let collector = Collector::new(source, probes, disk_io, metrics.clone());
    let reporter = match ReportingLoop::start(
        TcpConnector::from_config(&cfg),
        collector,
        cfg.interval(),
        metrics,
        shared_state,
    )
    .await
    {
        Ok(reporter) => reporter,
        Err(err) => {
            error!(server = %cfg.server_address(), error = %err, "initial connection failed");
            let _ = shutdown_tx.send(true);
            std::process::exit(1);
        }
    };
    let reporter_task = tokio::spawn(reporter.run(shutdown_rx.clone()));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for Ctrl+C");
    }
    info!("Ctrl+C received, shutting down");

    let _ = shutdown_tx.send(true);
    let _ = reporter_task.await;
    for task in tasks {
        let _ = task.await;
    }
}

fn resolve_config(cli: &Cli) -> Result<Config, ConfigError> {
    let mut cfg = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    if let Some(server) = &cli.server {
        cfg.server = server.clone();
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(user) = &cli.user {
        cfg.username = user.clone();
    }
    if let Some(password) = &cli.password {
        cfg.password = password.clone();
    }
    if let Some(interval) = cli.interval {
        cfg.interval_secs = interval;
    }
    if let Some(protocol) = cli.protocol {
        cfg.protocol = protocol;
    }
    if cli.debug {
        cfg.debug = true;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn init_tracing(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_apply_on_top_of_defaults() {
        let cli = Cli::parse_from([
            "reportd",
            "--server",
            "10.0.0.5",
            "--user",
            "node7",
            "--interval",
            "10",
            "--protocol",
            "ip6",
        ]);
        let cfg = resolve_config(&cli).expect("valid");
        assert_eq!(cfg.server_address(), "10.0.0.5:35601");
        assert_eq!(cfg.username, "node7");
        assert_eq!(cfg.password, "USER_DEFAULT_PASSWORD");
        assert_eq!(cfg.interval_secs, 10);
        assert_eq!(cfg.protocol, ProtocolFamily::Ip6);
    }

    #[test]
    fn zero_interval_override_is_rejected() {
        let cli = Cli::parse_from(["reportd", "--interval", "0"]);
        assert!(matches!(resolve_config(&cli), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn missing_config_file_is_a_read_error() {
        let cli = Cli::parse_from(["reportd", "--config", "/nonexistent/reportd.yaml"]);
        assert!(matches!(resolve_config(&cli), Err(ConfigError::Read { .. })));
    }
}
