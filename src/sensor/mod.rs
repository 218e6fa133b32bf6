//! Motion sensor collaborators.
//!
//! The loop only needs a boolean reading and a way to hand the pin back to
//! the system on shutdown.

use anyhow::Result;

mod sysfs;

pub use sysfs::{SysfsMotionSensor, SysfsSensorConfig, DEFAULT_PIR_PIN, DEFAULT_SYSFS_ROOT};

pub trait MotionSensor {
    /// Current level of the motion signal. Must not block beyond the read.
    fn read(&mut self) -> Result<bool>;

    /// Release the underlying hardware. Called once on shutdown.
    fn release(&mut self) -> Result<()> {
        Ok(())
    }
}
