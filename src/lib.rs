//! Birdwatch
//!
//! Motion-triggered capture, classification and upload for a feeder camera.
//!
//! # Architecture
//!
//! A single sequential control loop drives five collaborators:
//!
//! 1. **Motion sensor**: a PIR sensor on a GPIO pin, polled at a fixed cadence.
//! 2. **Camera**: writes one JPEG per trigger to the local image directory.
//! 3. **Classifier**: a hosted vision model returning tag/probability pairs.
//! 4. **Blob store**: receives the image when the gate label is present.
//! 5. **Telemetry sink**: receives one metadata document per trigger cycle.
//!
//! The loop owns every collaborator through a trait object so hardware and
//! cloud services can be replaced by fakes.
//!
//! # Module Structure
//!
//! - `pipeline`: the trigger loop and its state machine
//! - `classify`: prediction filtering and the Custom Vision client
//! - `sensor`, `camera`, `storage`, `telemetry`: collaborator traits and
//!   their Raspberry Pi / Azure implementations
//! - `config`: file + environment configuration
//! - Core types: CaptureEvent, DetectionMetadata

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub mod camera;
pub mod classify;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod sensor;
mod signing;
pub mod storage;
pub mod telemetry;

pub use camera::{Camera, StillCamera, StillCameraConfig};
pub use config::BirdwatchConfig;
pub use classify::{Classifier, CustomVisionClient, Prediction, PredictionEndpoint, PredictionSet};
pub use error::{CycleError, CycleStage};
pub use pipeline::{
    next_state, Clock, Collaborators, CycleReport, LoopSettings, LoopState, LoopStats, SystemClock,
    TriggerLoop, UploadOutcome,
};
pub use sensor::{MotionSensor, SysfsMotionSensor, SysfsSensorConfig};
pub use storage::{AzureBlobStore, BlobStore, StorageConnectionString};
pub use telemetry::{IotHubClient, IotHubConnectionString, TelemetrySink};

/// Device identifier reported in metadata when none is configured.
pub const DEFAULT_DEVICE_ID: &str = "feeder-pi";
/// Label whose presence gates the upload.
pub const DEFAULT_GATE_LABEL: &str = "bird";
/// Raw probabilities must be strictly greater than this to be kept.
pub const DEFAULT_THRESHOLD: f64 = 0.5;
pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const IMAGE_PREFIX: &str = "bird_";

// -------------------- Capture naming --------------------

/// Format a capture time the way image names and metadata carry it.
pub fn format_timestamp(at: &DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// `bird_<timestamp>.jpg`; also used unchanged as the blob name.
pub fn image_file_name(timestamp: &str) -> String {
    format!("{}{}.jpg", IMAGE_PREFIX, timestamp)
}

/// Create the image directory if it does not exist yet.
pub fn ensure_image_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create image directory {}", dir.display()))
}

// -------------------- Events --------------------

/// One trigger's capture. The image stays on disk after the cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureEvent {
    pub timestamp: String,
    pub image_path: PathBuf,
}

impl CaptureEvent {
    pub fn new(image_dir: &Path, timestamp: String) -> Self {
        let image_path = image_dir.join(image_file_name(&timestamp));
        Self {
            timestamp,
            image_path,
        }
    }

    /// File name of the image, reused as the blob name.
    pub fn file_name(&self) -> String {
        image_file_name(&self.timestamp)
    }

    pub fn image_path_string(&self) -> String {
        self.image_path.display().to_string()
    }
}

/// Document published to the telemetry sink once per trigger cycle.
///
/// Field order is part of the wire format.
#[derive(Clone, Debug, Serialize)]
pub struct DetectionMetadata {
    pub device_id: String,
    pub timestamp: String,
    pub motion: bool,
    pub image_path: String,
    pub predictions: PredictionSet,
}

impl DetectionMetadata {
    pub fn new(device_id: &str, event: &CaptureEvent, predictions: PredictionSet) -> Self {
        Self {
            device_id: device_id.to_string(),
            timestamp: event.timestamp.clone(),
            motion: true,
            image_path: event.image_path_string(),
            predictions,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize detection metadata")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn image_name_is_derived_from_timestamp() {
        let at = Local.with_ymd_and_hms(2024, 5, 4, 7, 8, 9).unwrap();
        let ts = format_timestamp(&at);
        assert_eq!(ts, "2024-05-04_07-08-09");
        assert_eq!(image_file_name(&ts), "bird_2024-05-04_07-08-09.jpg");
    }

    #[test]
    fn capture_event_reuses_file_name() {
        let event = CaptureEvent::new(Path::new("/home/pi/bird_images"), "2024-05-04_07-08-09".into());
        assert_eq!(
            event.image_path,
            PathBuf::from("/home/pi/bird_images/bird_2024-05-04_07-08-09.jpg")
        );
        assert_eq!(event.file_name(), "bird_2024-05-04_07-08-09.jpg");
        assert!(event.image_path_string().ends_with(&event.file_name()));
    }

    #[test]
    fn metadata_serializes_in_wire_order() {
        let event = CaptureEvent::new(Path::new("imgs"), "2024-05-04_07-08-09".into());
        let predictions = PredictionSet::from_predictions(
            &[Prediction::new("bird", 0.92), Prediction::new("feeder", 0.3)],
            DEFAULT_THRESHOLD,
        );
        let json = DetectionMetadata::new(DEFAULT_DEVICE_ID, &event, predictions)
            .to_json()
            .expect("json");
        assert_eq!(
            json,
            r#"{"device_id":"feeder-pi","timestamp":"2024-05-04_07-08-09","motion":true,"image_path":"imgs/bird_2024-05-04_07-08-09.jpg","predictions":{"bird":92.0}}"#
        );
    }

    #[test]
    fn ensure_image_dir_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("a").join("b");
        ensure_image_dir(&target).expect("first");
        ensure_image_dir(&target).expect("second");
        assert!(target.is_dir());
    }
}
