//! motion_probe - print the PIR sensor level for bench testing.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use birdwatch::sensor::{DEFAULT_PIR_PIN, DEFAULT_SYSFS_ROOT};
use birdwatch::{MotionSensor, SysfsMotionSensor, SysfsSensorConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Print the motion sensor state")]
struct Args {
    /// BCM pin the PIR output is wired to.
    #[arg(long, env = "BIRDWATCH_PIR_PIN", default_value_t = DEFAULT_PIR_PIN)]
    pin: u32,

    /// Offset of the GPIO chip (512 on recent Raspberry Pi kernels).
    #[arg(long, env = "BIRDWATCH_GPIO_BASE", default_value_t = 0)]
    chip_base: u32,

    #[arg(long, default_value = DEFAULT_SYSFS_ROOT)]
    sysfs_root: PathBuf,

    /// Delay between reads.
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,

    /// Only print when the level changes.
    #[arg(long)]
    edges: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut sensor = SysfsMotionSensor::open(&SysfsSensorConfig {
        sysfs_root: args.sysfs_root,
        pin: args.pin,
        chip_base: args.chip_base,
    })?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("error setting Ctrl-C handler")?;

    let interval = Duration::from_millis(args.interval_ms.max(1));
    let mut last = None;
    while !shutdown.load(Ordering::SeqCst) {
        match sensor.read() {
            Ok(level) => {
                if !args.edges || last != Some(level) {
                    println!("Sensor state: {}", u8::from(level));
                }
                last = Some(level);
            }
            Err(e) => log::warn!("{:#}", e),
        }
        std::thread::sleep(interval);
    }

    log::info!("shutdown signal received");
    sensor.release()
}
