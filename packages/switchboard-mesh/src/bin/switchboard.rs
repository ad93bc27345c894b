//! `switchboard` runs the orchestration layer until Ctrl-C.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use switchboard_core::{MessageType, QueueMessage};
use switchboard_mesh::bus::handler_fn;
use switchboard_mesh::config::service_ids;
use switchboard_mesh::{MeshConfig, Orchestrator};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "switchboard", version, about = "In-process service orchestration runtime")]
struct Args {
    /// Base URL of the deployment service.
    #[arg(long, env = "SWITCHBOARD_DEPLOYMENT_URL", default_value = "http://localhost:4100")]
    deployment_url: String,

    /// Base URL of the data-analysis service.
    #[arg(long, env = "SWITCHBOARD_ANALYTICS_URL", default_value = "http://localhost:4200")]
    analytics_url: String,

    /// Base URL of the AI-processing service.
    #[arg(long, env = "SWITCHBOARD_AI_URL", default_value = "http://localhost:4300")]
    ai_url: String,

    /// Default timeout for calls to registered services.
    #[arg(long, env = "SWITCHBOARD_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    request_timeout_ms: u64,

    /// HMAC secret for service and user tokens. Random per process if unset.
    #[arg(long, env = "SWITCHBOARD_TOKEN_SECRET", hide_env_values = true)]
    token_secret: Option<String>,

    /// Address for the Prometheus scrape endpoint. Disabled if unset.
    #[arg(long, env = "SWITCHBOARD_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "SWITCHBOARD_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn mesh_config(&self) -> MeshConfig {
        let mut config = MeshConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            ..MeshConfig::default()
        }
        .with_base_address(service_ids::DEPLOYMENT, &self.deployment_url)
        .with_base_address(service_ids::ANALYTICS, &self.analytics_url)
        .with_base_address(service_ids::AI, &self.ai_url);
        if let Some(secret) = &self.token_secret {
            config.auth.secret.clone_from(secret);
        }
        config
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let orchestrator = Orchestrator::new(args.mesh_config());
    let _dead_letters = orchestrator.bus().subscribe(
        MessageType::DeadLetter,
        handler_fn(|msg: QueueMessage| async move {
            warn!(payload = %msg.payload, "dead letter");
            Ok(())
        }),
    );

    let initial = orchestrator
        .initialize()
        .await
        .context("failed to initialize orchestrator")?;
    info!(
        healthy = initial.healthy_services,
        total = initial.total_services,
        "switchboard running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown signal received");
    orchestrator.shutdown().await;
    Ok(())
}
