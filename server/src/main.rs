//! SMS spam classification service.

use camino::Utf8PathBuf;
use clap::Parser;
use snafu::ResultExt;
use sms_spam::{SpamService, Truncation};
use sms_spam_server::{config::ServerConfig, create_router, AppState};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sms-spam-server", about = "SMS spam classification service")]
struct Cli {
    /// Configuration file path. Defaults are used when absent.
    #[arg(short, long, env = "SPAM_SERVER_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Listen address.
    #[arg(short = 'l', long)]
    listen: Option<String>,

    /// Listen port.
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// Directory with the trained model.
    #[arg(long, env = "SPAM_ARTIFACTS")]
    artifacts: Option<Utf8PathBuf>,

    /// Which end of long messages is cut off: `pre` or `post`.
    #[arg(long, value_parser = parse_truncation)]
    truncation: Option<Truncation>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

fn parse_truncation(value: &str) -> Result<Truncation, String> {
    match value {
        "pre" => Ok(Truncation::Pre),
        "post" => Ok(Truncation::Post),
        other => Err(format!("expected \"pre\" or \"post\", got {other:?}")),
    }
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig, snafu::Whatever> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path).whatever_context("Can't load configuration")?,
            None => ServerConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(artifacts) = self.artifacts {
            config.artifacts = artifacts;
        }
        if let Some(truncation) = self.truncation {
            config.truncation = truncation;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> snafu::Report<snafu::Whatever> {
    snafu::Report::from(run().await)
}

async fn run() -> Result<(), snafu::Whatever> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = cli.into_config()?;

    // The service keeps answering without a model, every prediction fails.
    let service =
        SpamService::from_artifacts(&config.model_artifacts(), config.truncation, config.device());
    if !service.is_loaded() {
        warn!(artifacts = %config.artifacts, "Serving without a model");
    }
    let app = create_router(AppState::new(service));

    let address = config.address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_whatever_context(|_| format!("Can't listen on {address}"))?;
    info!("Listening on http://{address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .whatever_context("Server failed")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!(%error, "Can't listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                warn!(%error, "Can't listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    warn!("Shutdown signal received, stopping server...");
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("sms_spam=debug,sms_spam_server=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sms_spam=info,sms_spam_server=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
