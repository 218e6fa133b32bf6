//! birdwatch - motion-triggered feeder camera
//!
//! This daemon:
//! 1. Arms a PIR motion sensor on a GPIO pin
//! 2. Captures a still image on each rising edge of the motion signal
//! 3. Classifies the image with a Custom Vision prediction endpoint
//! 4. Uploads images that contain the gate label to Azure Blob Storage
//! 5. Publishes one metadata document per trigger to Azure IoT Hub
//!
//! Ctrl-C (or SIGTERM) releases the GPIO pin and disconnects from IoT Hub.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use birdwatch::{
    ensure_image_dir, AzureBlobStore, BirdwatchConfig, Collaborators, CustomVisionClient,
    IotHubClient, IotHubConnectionString, LoopSettings, PredictionEndpoint, StillCamera,
    StorageConnectionString, SysfsMotionSensor, TriggerLoop,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Motion-triggered bird feeder camera")]
struct Args {
    /// JSON or TOML config file. Environment variables override its values.
    #[arg(long, env = "BIRDWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Exit after this many trigger cycles.
    #[arg(long)]
    max_cycles: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = BirdwatchConfig::load_from(args.config.as_deref())?;
    log::debug!("configuration: {:?}", cfg);

    ensure_image_dir(&cfg.image_dir)?;

    // Installed before the pin is exported so a signal during setup still
    // reaches the orderly shutdown path.
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("error setting Ctrl-C handler")?;

    let sensor = SysfsMotionSensor::open(&cfg.sensor).context("motion sensor setup")?;

    let camera = StillCamera::new(cfg.camera.clone())?;
    camera.probe().context("camera setup")?;

    let endpoint = PredictionEndpoint::parse(&cfg.custom_vision.prediction_url)?;
    let classifier = CustomVisionClient::new(
        &endpoint,
        &cfg.custom_vision.prediction_key,
        cfg.request_timeout,
    )?;

    let storage = StorageConnectionString::parse(&cfg.blob.connection_string)
        .context("AZURE_BLOB_CONNECTION_STRING")?;
    let store = AzureBlobStore::new(storage, &cfg.blob.container, cfg.request_timeout)?;

    let hub = IotHubConnectionString::parse(&cfg.iot_hub.connection_string)
        .context("AZURE_IOT_HUB_CONNECTION_STRING")?;
    if hub.device_id != cfg.device_id {
        log::info!(
            "metadata device_id '{}' differs from iot hub device '{}'",
            cfg.device_id,
            hub.device_id
        );
    }
    let telemetry = IotHubClient::connect(hub, cfg.iot_hub.sas_ttl, cfg.request_timeout)
        .context("iot hub setup")?;

    let settings = LoopSettings {
        device_id: cfg.device_id.clone(),
        image_dir: cfg.image_dir.clone(),
        gate_label: cfg.gate_label.clone(),
        threshold: cfg.threshold,
        poll_interval: cfg.poll_interval,
        max_cycles: args.max_cycles,
    };
    let mut trigger_loop = TriggerLoop::new(
        Collaborators {
            sensor: Box::new(sensor),
            camera: Box::new(camera),
            classifier: Box::new(classifier),
            store: Box::new(store),
            telemetry: Box::new(telemetry),
        },
        settings,
    );

    log::info!("Motion sensor armed... Waiting for motion...");
    let stats = trigger_loop.run(&shutdown)?;
    if shutdown.load(Ordering::SeqCst) {
        log::info!("shutdown signal received");
    }
    let result = trigger_loop.shutdown();
    log::info!(
        "shutdown complete: {} cycles, {} uploads, {} with failures",
        stats.cycles,
        stats.uploads,
        stats.failures
    );
    result
}
