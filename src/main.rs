// Main entry point for the infuse compositing server

use infuse_server::{
    core::Config,
    orchestration::InfuseOrchestrator,
    server::{router, AppState},
    services::{ObjectStitchModel, RandomSource, Sampler},
    utils::Metrics,
};

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new().context("Failed to load configuration")?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "infuse_server={},ort=off",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== INFUSE COMPOSITING SERVER ===");
    info!(
        "Config: canvas={} guidance={} steps={} (max {}) max_batch={} seed={:?}",
        config.canvas_size(),
        config.guidance_scale(),
        config.sampler.default_step_count,
        config.sampler.max_step_count,
        config.max_batch_count(),
        config.sampler.seed
    );

    // Load the model once; it is shared read-only for the process lifetime
    info!("Loading sampler checkpoints...");
    let model_dir = config.sampler.model_dir.clone();
    let backend = config.sampler.inference_backend.clone();
    let model = tokio::task::spawn_blocking(move || {
        ObjectStitchModel::load(&model_dir, backend.as_deref())
    })
    .await
    .context("Model loading task failed")??;
    info!("Sampler backend: {}", model.backend());

    let sampler: Arc<dyn Sampler> = Arc::new(model);
    let random: Arc<dyn RandomSource> = Arc::new(config.sampler.seed);

    let metrics = Metrics::new();
    let orchestrator = Arc::new(InfuseOrchestrator::new(
        config.clone(),
        sampler,
        random,
        metrics.clone(),
    ));

    let app = router(AppState {
        config: config.clone(),
        orchestrator,
        metrics,
    });

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /            - Root endpoint");
    info!("  GET  /health      - Health check");
    info!("  GET  /metrics     - Prometheus metrics");
    info!("  GET  /stats       - Detailed statistics");
    info!("  POST /api/infuse  - Composite foreground into background (multipart/form-data)");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
