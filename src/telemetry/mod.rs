//! Device-to-cloud telemetry.
//!
//! One `DetectionMetadata` JSON document is published per trigger cycle over a
//! connection opened at startup and closed on shutdown.

use anyhow::Result;

mod iot_hub;

pub use iot_hub::{IotHubClient, IotHubConnectionString, DEFAULT_SAS_TTL};

pub trait TelemetrySink {
    fn publish(&mut self, document: &str) -> Result<()>;

    /// Close the connection. Called once on shutdown.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
