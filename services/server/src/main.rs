use anyhow::{Context, Result};
use halo_server::api::{start_api_server, AppState};
use halo_server::camera_gst::GstCamera;
use halo_server::config::{Config, LoggingConfig};
use halo_server::{
    CaptureService, CaptureSettings, ClassificationService, EventStore, FrameArchive,
    HttpClassifier, InMemoryEventStore, PgEventStore, RequestHandler,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.logging);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting HALO classification server"
    );

    config.validate().context("Invalid configuration")?;

    // Initialize metrics
    if config.service.metrics_port > 0 {
        init_metrics(config.service.metrics_port)?;
    }

    // Initialize components
    let store = init_store(&config).await?;

    let camera = GstCamera::new(&config.camera).context("Failed to initialize GStreamer")?;
    let mut capture = CaptureService::new(Box::new(camera), CaptureSettings::from(&config.camera));
    if let Some(dir) = &config.archive.dir {
        let archive = FrameArchive::new(dir);
        info!(dir = %archive.dir().display(), "Archiving captured frames");
        capture = capture.with_archive(archive);
    }

    let classifier = HttpClassifier::new(&config.classifier.endpoint, config.classifier_timeout())
        .context("Failed to build inference client")?;
    info!(endpoint = %classifier.endpoint(), "Using remote classifier");
    let classification = ClassificationService::new(Arc::new(classifier), config.classifier.input_size)?;
    info!(input_size = classification.input_size(), "Classification service ready");

    let handler = RequestHandler::new(capture, classification, store, config.db_write_wait());

    let api_state = AppState {
        handler,
        service_name: config.service.name.clone(),
    };

    // Spawn API server task
    let shutdown = CancellationToken::new();
    let api_config = config.api.clone();
    let api_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = start_api_server(api_state, &api_config, shutdown).await {
                error!(error = %e, "API server error");
            }
        }
    });

    info!("Classification server started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down classification server");

    // In-flight requests finish before the server stops.
    shutdown.cancel();
    if let Err(e) = api_handle.await {
        warn!(error = %e, "API server task did not stop cleanly");
    }

    info!("Classification server stopped");

    Ok(())
}

/// Pick the event store: PostgreSQL when a URL is configured, memory otherwise
async fn init_store(config: &Config) -> Result<Arc<dyn EventStore>> {
    if config.database.url.is_empty() {
        warn!("No database configured, classification events are kept in memory only");
        return Ok(Arc::new(InMemoryEventStore::new()));
    }

    let store = PgEventStore::connect(&config.database)
        .await
        .context("Failed to initialize event store")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    Ok(Arc::new(store))
}

/// Initialize tracing/logging
fn init_tracing(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("halo_server={},tower_http=info", config.level)));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
