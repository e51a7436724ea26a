use std::path::PathBuf;

use clap::Parser;
use devrelay_server::settings::{self, FileSettings};
use devrelay_server::{NetworkModule, RelayApp};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "devrelay", version, about = "HTTP RPC relay to device-control delegates")]
struct Cli {
    /// TOML settings file.
    #[arg(long, env = "DEVRELAY_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "DEVRELAY_HOST")]
    host: Option<String>,

    #[arg(long, env = "DEVRELAY_PORT")]
    port: Option<u16>,

    /// Device backend endpoint, e.g. `memory://lab`.
    #[arg(long, env = "DEVRELAY_BACKEND")]
    backend: Option<String>,

    /// Require authentication through the configured identity resolver.
    #[arg(long, env = "DEVRELAY_SECURITY")]
    security: Option<bool>,

    /// Identity resolver name (`equality`, `static`).
    #[arg(long, env = "DEVRELAY_IDENTITY_RESOLVER")]
    identity_resolver: Option<String>,

    #[arg(long, env = "DEVRELAY_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[arg(long, env = "DEVRELAY_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Output logs as JSON.
    #[arg(long, env = "DEVRELAY_LOG_JSON", default_value_t = false)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let file = match &cli.config {
        Some(path) => FileSettings::load(path)?,
        None => FileSettings::default(),
    };
    let (mut relay, mut network) = file.into_configs()?;

    if let Some(host) = cli.host {
        network.host = host;
    }
    if let Some(port) = cli.port {
        network.port = port;
    }
    if let Some(backend) = cli.backend {
        relay.backend_endpoint = backend;
    }
    if let Some(security) = cli.security {
        relay.security_enabled = security;
    }
    if let Some(resolver) = cli.identity_resolver {
        relay.identity_resolver = resolver;
    }
    if let Some(tls) = settings::tls_config(cli.tls_cert, cli.tls_key)? {
        network.tls = Some(tls);
    }

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(error = %err, "prometheus recorder not installed");
            None
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), "devrelay starting");

    let app = RelayApp::build(relay)?;
    let mut module = NetworkModule::new(network, app, prometheus);
    module.start().await?;
    module.serve(shutdown_signal()).await?;

    info!("devrelay stopped");
    Ok(())
}
