//! The trigger loop.
//!
//! ```text
//!   Armed --motion--> Triggered --(cycle done)--> WaitingForClear --no motion--> Armed
//! ```
//!
//! One trigger cycle runs per rising edge of the motion signal: capture,
//! classify, upload when the gate label is present, then publish metadata.
//! The loop re-arms only after it has observed the signal low again.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::camera::Camera;
use crate::classify::{Classifier, PredictionSet};
use crate::error::CycleError;
use crate::sensor::MotionSensor;
use crate::storage::BlobStore;
use crate::telemetry::TelemetrySink;
use crate::{
    format_timestamp, CaptureEvent, DetectionMetadata, DEFAULT_DEVICE_ID, DEFAULT_GATE_LABEL,
    DEFAULT_THRESHOLD, JPEG_CONTENT_TYPE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Armed,
    Triggered,
    WaitingForClear,
}

/// Transition for one motion reading.
pub fn next_state(state: LoopState, motion: bool) -> LoopState {
    match (state, motion) {
        (LoopState::Armed, true) => LoopState::Triggered,
        (LoopState::Armed, false) => LoopState::Armed,
        (LoopState::Triggered, _) => LoopState::WaitingForClear,
        (LoopState::WaitingForClear, true) => LoopState::WaitingForClear,
        (LoopState::WaitingForClear, false) => LoopState::Armed,
    }
}

/// Source of capture timestamps.
pub trait Clock {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

pub struct Collaborators {
    pub sensor: Box<dyn MotionSensor>,
    pub camera: Box<dyn Camera>,
    pub classifier: Box<dyn Classifier>,
    pub store: Box<dyn BlobStore>,
    pub telemetry: Box<dyn TelemetrySink>,
}

#[derive(Clone, Debug)]
pub struct LoopSettings {
    pub device_id: String,
    pub image_dir: PathBuf,
    pub gate_label: String,
    pub threshold: f64,
    pub poll_interval: Duration,
    /// Stop after this many trigger cycles.
    pub max_cycles: Option<u64>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            device_id: DEFAULT_DEVICE_ID.to_string(),
            image_dir: PathBuf::from("bird_images"),
            gate_label: DEFAULT_GATE_LABEL.to_string(),
            threshold: DEFAULT_THRESHOLD,
            poll_interval: Duration::from_millis(100),
            max_cycles: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    /// Gate label absent.
    Skipped,
    Failed,
}

/// Result of a cycle that got as far as predictions.
#[derive(Debug)]
pub struct CycleReport {
    pub event: CaptureEvent,
    pub predictions: PredictionSet,
    pub upload: UploadOutcome,
    pub published: bool,
    /// Upload and telemetry failures; logged, not fatal to the cycle.
    pub failures: Vec<CycleError>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    pub uploads: u64,
    /// Cycles with at least one failed step.
    pub failures: u64,
}

pub struct TriggerLoop {
    sensor: Box<dyn MotionSensor>,
    camera: Box<dyn Camera>,
    classifier: Box<dyn Classifier>,
    store: Box<dyn BlobStore>,
    telemetry: Box<dyn TelemetrySink>,
    clock: Box<dyn Clock>,
    settings: LoopSettings,
    state: LoopState,
    stats: LoopStats,
}

impl TriggerLoop {
    pub fn new(collaborators: Collaborators, settings: LoopSettings) -> Self {
        Self {
            sensor: collaborators.sensor,
            camera: collaborators.camera,
            classifier: collaborators.classifier,
            store: collaborators.store,
            telemetry: collaborators.telemetry,
            clock: Box::new(SystemClock),
            settings,
            state: LoopState::Armed,
            stats: LoopStats::default(),
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Read the sensor once and advance the state machine. Returns the
    /// outcome of the trigger cycle when this reading started one.
    pub fn poll_once(&mut self) -> Option<Result<CycleReport, CycleError>> {
        let motion = match self.sensor.read() {
            Ok(motion) => motion,
            Err(e) => {
                log::warn!("motion sensor read failed: {:#}", e);
                return None;
            }
        };

        let next = next_state(self.state, motion);
        match (self.state, next) {
            (LoopState::Armed, LoopState::Triggered) => {
                self.state = LoopState::Triggered;
                log::info!("Motion detected!");
                let outcome = self.run_cycle();
                self.record(&outcome);
                if let Err(e) = &outcome {
                    log::error!("{}", e);
                }
                self.state = next_state(LoopState::Triggered, motion);
                log::info!("Waiting for motion to stop...");
                Some(outcome)
            }
            (LoopState::WaitingForClear, LoopState::Armed) => {
                self.state = next;
                log::info!("Motion cleared. Waiting for motion...");
                None
            }
            _ => {
                self.state = next;
                None
            }
        }
    }

    /// Capture, classify, upload (gated) and publish for one trigger.
    ///
    /// Capture and classification failures end the cycle early. Upload and
    /// telemetry failures are collected in the report.
    pub fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        let event = CaptureEvent::new(&self.settings.image_dir, format_timestamp(&self.clock.now()));

        self.camera
            .capture(&event.image_path)
            .map_err(CycleError::capture)?;
        log::info!("Image saved: {}", event.image_path.display());

        let image = std::fs::read(&event.image_path)
            .with_context(|| format!("failed to read {}", event.image_path.display()))
            .map_err(CycleError::classification)?;
        let raw = self
            .classifier
            .classify(&image)
            .map_err(CycleError::classification)?;

        let predictions = PredictionSet::from_predictions(&raw, self.settings.threshold);
        for (label, value) in predictions.iter() {
            log::info!("{}: {}%", label, value);
        }

        let mut failures = Vec::new();
        let upload = if predictions.contains(&self.settings.gate_label) {
            log::info!("'{}' detected in image, uploading", self.settings.gate_label);
            match self.store.upload(
                &event.image_path,
                &event.file_name(),
                JPEG_CONTENT_TYPE,
                true,
            ) {
                Ok(()) => UploadOutcome::Uploaded,
                Err(e) => {
                    let err = CycleError::upload(e);
                    log::warn!("{}", err);
                    failures.push(err);
                    UploadOutcome::Failed
                }
            }
        } else {
            log::info!("No '{}' detected, not uploading.", self.settings.gate_label);
            UploadOutcome::Skipped
        };

        let metadata = DetectionMetadata::new(&self.settings.device_id, &event, predictions.clone());
        let published = match metadata.to_json().and_then(|doc| self.telemetry.publish(&doc)) {
            Ok(()) => true,
            Err(e) => {
                let err = CycleError::telemetry(e);
                log::warn!("{}", err);
                failures.push(err);
                false
            }
        };

        Ok(CycleReport {
            event,
            predictions,
            upload,
            published,
            failures,
        })
    }

    fn record(&mut self, outcome: &Result<CycleReport, CycleError>) {
        self.stats.cycles += 1;
        match outcome {
            Ok(report) => {
                if report.upload == UploadOutcome::Uploaded {
                    self.stats.uploads += 1;
                }
                if !report.failures.is_empty() {
                    self.stats.failures += 1;
                }
            }
            Err(_) => self.stats.failures += 1,
        }
    }

    fn cycle_limit_reached(&self) -> bool {
        self.settings
            .max_cycles
            .map(|max| self.stats.cycles >= max)
            .unwrap_or(false)
    }

    /// Poll until `shutdown` is set or the cycle limit is reached.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<LoopStats> {
        while !shutdown.load(Ordering::SeqCst) {
            self.poll_once();
            if self.cycle_limit_reached() {
                log::info!("cycle limit reached ({} cycles)", self.stats.cycles);
                break;
            }
            std::thread::sleep(self.settings.poll_interval);
        }
        Ok(self.stats)
    }

    /// Release the sensor and close telemetry. Both are attempted; the first
    /// failure is returned.
    pub fn shutdown(&mut self) -> Result<()> {
        let released = self.sensor.release().context("release motion sensor");
        if let Err(e) = &released {
            log::error!("{:#}", e);
        }
        let closed = self.telemetry.close().context("close telemetry connection");
        if let Err(e) = &closed {
            log::error!("{:#}", e);
        }
        released.and(closed)
    }
}
