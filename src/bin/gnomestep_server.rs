//! gnomestep HTTP server
//!
//! Serves `/step`, `/rewind` and `/model` for reference models over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gnomestep::transport::{router, AppState, ReferenceModelFactory};
use gnomestep::{InMemorySessionRegistry, MissingFieldPolicy, ServerConfig, StepOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "gnomestep-server")]
#[command(about = "Gated step/rewind API for spill trajectory models")]
#[command(version)]
struct Cli {
    /// JSON server configuration; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// TCP address to bind
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Upper bound on one request, gate wait included
    #[arg(long)]
    request_timeout_ms: Option<u64>,

    /// Maximum sessions holding an active model
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Maximum wait for a model's step gate
    #[arg(long)]
    gate_timeout_ms: Option<u64>,

    /// Maximum time for one uncertain-model fan-out
    #[arg(long)]
    replica_timeout_ms: Option<u64>,

    /// Fail steps whose replicas disagree on reported fields
    #[arg(long)]
    reject_missing_fields: bool,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_json(&std::fs::read_to_string(path)?)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(ms) = self.request_timeout_ms {
            config.request_timeout_ms = ms;
        }
        if let Some(max) = self.max_sessions {
            config.max_sessions = max;
        }
        if let Some(ms) = self.gate_timeout_ms {
            config.orchestrator.gate_timeout_ms = Some(ms);
        }
        if let Some(ms) = self.replica_timeout_ms {
            config.orchestrator.replica_timeout_ms = ms;
        }
        if self.reject_missing_fields {
            config.orchestrator.missing_fields = MissingFieldPolicy::Reject;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gnomestep=info,gnomestep_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Cli::parse().into_config()?;

    let registry = Arc::new(InMemorySessionRegistry::with_capacity(config.max_sessions));
    let orchestrator = Arc::new(StepOrchestrator::new(registry, config.orchestrator)?);
    let state = AppState::new(
        orchestrator,
        Arc::new(ReferenceModelFactory),
        config.request_timeout(),
    );
    let app = router(state);

    let listener = match TcpListener::bind(config.bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to bind {}: {err}", config.bind);
            return Err(err.into());
        }
    };

    info!(
        bind = %config.bind,
        max_sessions = config.max_sessions,
        request_timeout_ms = config.request_timeout_ms,
        "gnomestep server v{} listening",
        env!("CARGO_PKG_VERSION")
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    info!("Shut down");
    Ok(())
}
