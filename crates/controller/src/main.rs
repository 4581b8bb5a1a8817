#[cfg(feature = "adc")]
mod adc;
mod command;
mod config;
mod controller;
mod filter;
mod link;
mod machine;
mod outputs;
mod sensor;
#[cfg(feature = "sim")]
mod sim;
mod telemetry;
#[cfg(test)]
mod testing;

#[cfg(not(any(feature = "sim", feature = "adc")))]
compile_error!("enable a moisture source: feature `sim` or `adc`");

use anyhow::{Context, Result};
use std::env;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use controller::{Controller, NoUpdates};
use outputs::OutputBoard;
use telemetry::Telemetry;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load_or_default(&config_path)
        .with_context(|| format!("loading config from {config_path}"))?;

    tracing::info!(
        threshold = cfg.thresholds.moisture_threshold,
        anomaly = cfg.thresholds.anomaly_threshold,
        watering_ticks = cfg.thresholds.watering_ticks(),
        cooldown_ticks = cfg.thresholds.cooldown_ticks(),
        "config loaded"
    );

    // ── MQTT session ────────────────────────────────────────────────
    let (link, events) = link::spawn(&cfg.mqtt, &cfg.topics);
    let telemetry = Telemetry::new(link.client(), cfg.topics.clone(), link.state());

    // ── Outputs (forced off) ────────────────────────────────────────
    let board = OutputBoard::new(&cfg.hardware).context("initialising output board")?;

    // ── Moisture source ─────────────────────────────────────────────
    #[cfg(feature = "adc")]
    let (sensor, outputs) = {
        let adc = adc::Ads1115::new(cfg.hardware.adc_address, cfg.hardware.adc_channel)
            .context("initialising ADS1115")?;
        (adc, board)
    };

    #[cfg(not(feature = "adc"))]
    let (sensor, outputs) = {
        let scenario = sim::Scenario::from_str_lossy(
            &env::var("SIM_SCENARIO").unwrap_or_else(|_| "drying".to_string()),
        );
        tracing::info!(%scenario, "[sim] using simulated soil moisture probe");
        let probe = sim::SoilMoistureSim::new(scenario, 3300.0, 1300.0)
            .with_sentinel(cfg.thresholds.sentinel);
        let plant = sim::SimulatedPlant::new(probe);
        let outputs = plant.outputs(board);
        (plant, outputs)
    };

    // Firmware updates are not pulled by the controller itself.
    let controller = Controller::new(&cfg, sensor, outputs, telemetry, Instant::now())
        .with_maintenance(NoUpdates);

    tracing::info!(
        connected = link.is_connected(),
        grace_secs = cfg.mqtt.boot_grace_secs,
        "control loop starting"
    );

    controller::run(
        controller,
        events,
        cfg.mqtt.boot_grace(),
        cfg.timing.pass_interval(),
    )
    .await
}
