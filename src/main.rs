use anyhow::{Context, Result};
use ess_regulator::{config, controller, hardware, telemetry};
use config::Config;
use controller::{local_now, SystemController};
use hardware::SimulatedTransport;
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = Config::load().context("loading configuration")?;
    let _log_guard = init_tracing(&cfg.logging);

    if !cfg.controller.pv_controllable {
        warn!("PV control disabled by configuration");
    }

    info!(
        loop_check_time_s = cfg.controller.loop_check_time_s,
        pv_lines = cfg.pv_lines.len(),
        "starting ESS regulator"
    );

    let transport = SimulatedTransport::from_config(&cfg);
    let mut controller = SystemController::new(&cfg, transport, local_now());
    controller.run_until(telemetry::shutdown_signal()).await;

    info!("shutdown complete");
    Ok(())
}
