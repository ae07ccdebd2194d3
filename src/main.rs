use log::{error, info};
use std::sync::Arc;

use zonefan::bluetooth::{BleTransport, RuuviScanner};
use zonefan::config::AppConfig;
use zonefan::error::ConfigError;
use zonefan::fan::{CachedFan, FanProfileController, SimulatedFan};
use zonefan::performance::PerformanceAggregator;
use zonefan::sensors::{
    open_with_retry, FanMode, LatestAmbient, SensorConnectionManager, SensorTransport,
};
use zonefan::shutdown::{FaultReporter, ShutdownCoordinator, EXIT_FAULT};
use zonefan::utils::format_datetime;

fn build_manager(
    config: &AppConfig,
    faults: FaultReporter,
) -> Result<Arc<SensorConnectionManager>, ConfigError> {
    // No appliance driver is linked in; commands are logged by the simulated fan
    let fan = Arc::new(CachedFan::new(SimulatedFan::new(), config.fan_state_cache));
    let controller = FanProfileController::new(
        config.fan.clone(),
        config.hr_zones()?,
        config.power_zones()?,
        fan,
    )
    .with_fault_reporter(faults);

    let ambient = LatestAmbient::new();
    let fan_mode = FanMode::new(
        PerformanceAggregator::new(config.aggregator_config()?),
        Arc::new(controller),
        ambient.clone(),
    );

    let mut manager =
        SensorConnectionManager::new(config.manager.clone()).with_handler(Arc::new(fan_mode));
    if config.ruuvi_tags.is_empty() {
        info!("No RuuviTag sensors configured, using the fan's own temperature reading");
    } else {
        let scanner = RuuviScanner::new(
            config.ruuvi_tags.clone(),
            config.ambient_scan_interval,
            ambient,
        );
        manager = manager.with_ambient_sensor(Arc::new(scanner));
    }
    Ok(Arc::new(manager))
}

async fn run(config: AppConfig) -> i32 {
    let mut coordinator = ShutdownCoordinator::new(config.shutdown_timeout);
    coordinator.install_panic_hook();

    let manager = match build_manager(&config, coordinator.reporter()) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return EXIT_FAULT;
        }
    };

    let transport = BleTransport::new();
    let open = open_with_retry(
        &transport,
        config.transport_retries,
        config.transport_retry_delay,
    );
    let opened = tokio::select! {
        result = open => Ok(result),
        reason = coordinator.wait() => Err(reason),
    };
    let events = match opened {
        Ok(Ok(events)) => events,
        Ok(Err(e)) => {
            error!("Failed to open sensor transport: {}", e);
            return EXIT_FAULT;
        }
        Err(reason) => return coordinator.run_cleanup(&reason, manager.shutdown()).await,
    };

    let router = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.run(events).await }
    });
    info!("Waiting for sensors");

    let reason = coordinator.wait().await;
    coordinator
        .run_cleanup(&reason, async {
            transport.close().await;
            router.abort();
            manager.shutdown().await;
        })
        .await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(EXIT_FAULT);
        }
    };

    info!(
        "Starting zonefan at {}",
        format_datetime(&time::OffsetDateTime::now_utc())
    );
    let code = run(config).await;
    info!("Exiting with code {}", code);
    std::process::exit(code);
}
