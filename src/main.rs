use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use llama_adapter::bootstrap::{BootstrapCoordinator, ReadinessFlag};
use llama_adapter::config::{Cli, Config};
use llama_adapter::engine::process::LlamaServerProcess;
use llama_adapter::engine::supervisor::EngineSupervisor;
use llama_adapter::model::converter::{ConverterRunner, SystemToolRunner};
use llama_adapter::model::resolver::ArtifactResolver;
use llama_adapter::model::sources::{HfHubClient, S3ObjectStore};
use llama_adapter::server::metrics::AdapterMetrics;
use llama_adapter::server::proxy::EngineClient;
use llama_adapter::server::router::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let default_filter = if cli.verbose {
        "llama_adapter=debug,engine=debug,tool=debug,tower_http=debug"
    } else {
        "llama_adapter=info,engine=info,tool=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    info!("llama-adapter v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::from_cli(&cli)?;
    let spec = cli.model_spec()?;

    info!(
        source = %spec.source,
        model = spec.identifier,
        quantization = %spec.quantization,
        models_dir = %config.storage.models_dir.display(),
        engine = %config.engine.base_url(),
        "Configuration loaded"
    );

    let models_dir = config.storage.models_dir.clone();
    tokio::fs::create_dir_all(&models_dir).await?;

    // Model preparation pipeline.
    let resolver = ArtifactResolver::new(
        models_dir.clone(),
        Arc::new(HfHubClient::new(config.storage.hub_cache_dir())),
        Arc::new(S3ObjectStore),
    );
    let converter = ConverterRunner::new(
        models_dir,
        config.tools.clone(),
        Arc::new(SystemToolRunner),
    );
    let supervisor = EngineSupervisor::new(
        Box::new(LlamaServerProcess::new(config.engine.clone())),
        config.engine.clone(),
    );
    let readiness = ReadinessFlag::new();

    // Build application state.
    let state = Arc::new(AppState {
        engine: supervisor.handle(),
        readiness: readiness.clone(),
        client: EngineClient::new(&config.server)?,
        metrics: AdapterMetrics::new()?,
    });

    // The listener comes up first so health probes see 503 while preparing.
    let app = build_router(state);
    let listen_addr = config.server.listen_addr();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    });

    let coordinator = BootstrapCoordinator::new(spec, resolver, converter, supervisor, readiness);
    let engine = tokio::select! {
        result = coordinator.run() => result?,
        served = &mut server => {
            info!("Shut down before bootstrap completed");
            served??;
            return Ok(());
        }
    };

    let served = server.await;
    engine.shutdown().await;
    served??;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
