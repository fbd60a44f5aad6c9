use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use agentvisor::api::{self, AppState};
use agentvisor::tracing::{init_tracing, shutdown_tracing};
use agentvisor::transcript::TranscriptStore;
use agentvisor::{Args, GcloudCompute, JsonTaskStore, Orchestrator, OrchestratorConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // 1. Logging first so config errors are reported through it
    init_tracing("agentvisor", args.otlp_endpoint.as_deref(), args.log_json)?;

    // 2. Configuration
    let config = OrchestratorConfig::resolve(&args)?;
    let data_dir = args.data_dir();
    info!(
        project = %config.project,
        zone = %config.zone,
        data_dir = %data_dir.display(),
        "Configuration loaded"
    );

    // 3. Stores
    let store = Arc::new(JsonTaskStore::new(data_dir.join("tasks"))?);
    let transcripts = Arc::new(TranscriptStore::new(data_dir.join("transcripts"))?);

    // 4. Cloud access through the gcloud CLI
    let cloud = Arc::new(GcloudCompute::new(config.gcloud.clone()));

    // 5. Orchestrator + health sweep
    let orchestrator = Arc::new(Orchestrator::new(
        cloud.clone(),
        cloud,
        store.clone(),
        transcripts,
        config,
    ));
    let health = orchestrator.spawn_health_monitor();

    // 6. Connection state is in-memory only; rebuild it for live tasks
    if args.reattach {
        match store.list() {
            Ok(tasks) => {
                orchestrator.reattach(&tasks).await;
            }
            Err(e) => warn!(error = %e, "Could not list tasks for reattach"),
        }
    }

    // 7. HTTP API
    let app = api::router(AppState {
        orchestrator: orchestrator.clone(),
        store,
    });
    let listener = TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "agentvisor listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for ctrl-c");
            }
            info!("Shutdown signal received");
        })
        .await?;

    // 8. Teardown. VMs keep running; a restart with --reattach picks them up.
    health.abort();
    shutdown_tracing();
    Ok(())
}
