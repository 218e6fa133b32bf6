//! PIR sensor on a GPIO line, via the Linux sysfs GPIO interface.
//!
//! The pin is exported on open when needed and unexported again on release.
//! Pull-down resistors cannot be configured through sysfs; set them at the
//! board level (`gpio=5=ip,pd` in config.txt on a Raspberry Pi).

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::MotionSensor;

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";
pub const DEFAULT_PIR_PIN: u32 = 5;

// udev may need a moment to fix permissions on a freshly exported line.
const EXPORT_SETTLE_ATTEMPTS: u32 = 20;
const EXPORT_SETTLE_DELAY: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct SysfsSensorConfig {
    pub sysfs_root: PathBuf,
    /// BCM pin number.
    pub pin: u32,
    /// Added to `pin` to form the kernel line number. Newer kernels place the
    /// Raspberry Pi header lines at 512 and up.
    pub chip_base: u32,
}

impl Default for SysfsSensorConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            pin: DEFAULT_PIR_PIN,
            chip_base: 0,
        }
    }
}

impl SysfsSensorConfig {
    pub fn line(&self) -> u32 {
        self.pin + self.chip_base
    }
}

pub struct SysfsMotionSensor {
    root: PathBuf,
    line: u32,
    value_path: PathBuf,
    exported_by_us: bool,
    released: bool,
}

impl SysfsMotionSensor {
    /// Export (if needed) and configure the line as an input.
    pub fn open(config: &SysfsSensorConfig) -> Result<Self> {
        let line = config.line();
        let root = config.sysfs_root.clone();
        let line_dir = root.join(format!("gpio{}", line));

        let exported_by_us = if line_dir.exists() {
            false
        } else {
            write_attr(&root.join("export"), &line.to_string())
                .with_context(|| format!("failed to export gpio line {}", line))?;
            true
        };

        let mut attempt = 0;
        loop {
            match write_attr(&line_dir.join("direction"), "in") {
                Ok(()) => break,
                Err(e) if attempt + 1 < EXPORT_SETTLE_ATTEMPTS => {
                    log::debug!("gpio{} not ready yet: {}", line, e);
                    attempt += 1;
                    std::thread::sleep(EXPORT_SETTLE_DELAY);
                }
                Err(e) => {
                    return Err(e.context(format!("failed to set gpio{} as input", line)));
                }
            }
        }

        let value_path = line_dir.join("value");
        let mut sensor = Self {
            root,
            line,
            value_path,
            exported_by_us,
            released: false,
        };
        // Surface permission problems at startup rather than on the first poll.
        sensor.read().context("initial motion sensor read")?;
        log::info!(
            "motion sensor on gpio line {} (BCM {}) ready",
            line,
            config.pin
        );
        Ok(sensor)
    }
}

impl MotionSensor for SysfsMotionSensor {
    fn read(&mut self) -> Result<bool> {
        if self.released {
            return Err(anyhow!("gpio{} already released", self.line));
        }
        let raw = std::fs::read_to_string(&self.value_path)
            .with_context(|| format!("failed to read {}", self.value_path.display()))?;
        match raw.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(anyhow!("unexpected gpio value '{}'", other)),
        }
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if self.exported_by_us {
            write_attr(&self.root.join("unexport"), &self.line.to_string())
                .with_context(|| format!("failed to unexport gpio line {}", self.line))?;
        }
        log::info!("gpio line {} released", self.line);
        Ok(())
    }
}

impl Drop for SysfsMotionSensor {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("{:#}", e);
        }
    }
}

fn write_attr(path: &Path, value: &str) -> Result<()> {
    std::fs::write(path, value).with_context(|| format!("failed to write {}", path.display()))
}
