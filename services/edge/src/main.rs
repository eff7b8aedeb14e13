//! HALO Edge Controller
//!
//! Watches the PIR sensor over the drop chute, asks the classification server
//! what each item is and sweeps the servo of the matching bin.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/edge.toml, /etc/halo/edge.toml)
//! 2. Environment variables (prefixed with EDGE__)
//!
//! See `config.rs` for detailed configuration options.

use halo_edge::config::{EdgeConfig, LoggingConfig};
use halo_edge::hardware::{SysfsGpioInput, SysfsPwm, WifiLink};
use halo_edge::{
    ActuatorDriver, ConnectivityManager, ControllerStats, EdgeController, ReqwestTransport,
    SensorMonitor, ServoChannel, SweepProfile, TriggerClient,
};
use halo_protocol::{Pause, TokenTable};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> anyhow::Result<()> {
    let config = EdgeConfig::load()?;

    init_logging(&config.logging)?;

    info!(
        service = "halo-edge",
        version = env!("CARGO_PKG_VERSION"),
        server = %config.server.base_url,
        "Starting edge controller"
    );

    config.validate()?;

    // One task does all the work; a single-threaded runtime is enough.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let stats = runtime.block_on(run(config))?;
    log_final_stats(&stats);

    info!("Shutdown complete");
    Ok(())
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("halo_edge={}", level).parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("hyper=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Bring up the hardware and run the control loop until shutdown.
async fn run(config: EdgeConfig) -> anyhow::Result<ControllerStats> {
    let shutdown = CancellationToken::new();

    let input = SysfsGpioInput::open(&config.sensor.gpio_root, config.sensor.gpio_pin).await?;
    let monitor = SensorMonitor::new(input, config.sensor.poll_interval());

    let profile = SweepProfile::from(&config.actuator);
    let mut channels = Vec::with_capacity(config.actuator.channels.len());
    for (bin, &channel) in config.actuator.channels.iter().enumerate() {
        let pwm = SysfsPwm::open(&config.actuator.pwm_chip, channel, config.actuator.period_ns).await?;
        channels.push(ServoChannel::new(format!("bin-{}", bin), Box::new(pwm), &profile));
    }
    // A sweep in progress finishes even if shutdown is requested.
    let actuator = ActuatorDriver::new(channels, profile);
    info!(bins = actuator.channel_count(), "Actuator ready");

    let link = WifiLink::new(
        config.network.interface.clone(),
        config.network.ssid.clone(),
        config.network.password.clone(),
    );
    let connectivity = ConnectivityManager::new(
        link,
        config.network.max_attempts,
        config.network.attempt_interval(),
    )
    .with_pause(Pause::with_token(shutdown.clone()));

    let transport = ReqwestTransport::new(
        &config.server.base_url,
        &config.server.trigger_path,
        config.server.request_timeout(),
        config.server.probe_timeout(),
    )?;

    let mut client = TriggerClient::new(
        transport,
        actuator,
        connectivity,
        TokenTable::new(&config.trigger.recognized_labels),
        config.server.request_timeout(),
    );

    if !client.connectivity_mut().ensure_connected().await {
        warn!("Network unavailable at startup; will retry on each presence");
    } else if !client.preflight().await {
        warn!("Classification server not reachable yet; continuing");
    }

    let controller = EdgeController::new(monitor, client);
    let handle = tokio::spawn(controller.run(shutdown.clone()));

    shutdown_signal().await;
    info!("Initiating graceful shutdown...");
    shutdown.cancel();

    Ok(handle.await?)
}

/// Wait for a shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Received shutdown signal");
}

/// Log final statistics on shutdown.
fn log_final_stats(stats: &ControllerStats) {
    info!("=== Final Statistics ===");
    info!(
        presences = stats.presences,
        actuations = stats.actuations,
        dropped = stats.dropped,
        sensor_errors = stats.sensor_errors,
        "Edge final stats"
    );
}
