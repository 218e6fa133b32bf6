//! Per-cycle failures.
//!
//! Setup failures are plain `anyhow::Error`s returned from startup and end the
//! process. Everything that goes wrong inside one trigger cycle is a
//! `CycleError`: it is logged and the loop keeps sensing.

use std::fmt;

/// Step of the trigger cycle that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CycleStage {
    Capture,
    Classification,
    Upload,
    Telemetry,
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture => write!(f, "capture"),
            Self::Classification => write!(f, "classification"),
            Self::Upload => write!(f, "upload"),
            Self::Telemetry => write!(f, "telemetry"),
        }
    }
}

#[derive(Debug)]
pub struct CycleError {
    pub stage: CycleStage,
    pub source: anyhow::Error,
}

impl CycleError {
    pub fn new(stage: CycleStage, source: anyhow::Error) -> Self {
        Self { stage, source }
    }

    pub fn capture(source: anyhow::Error) -> Self {
        Self::new(CycleStage::Capture, source)
    }

    pub fn classification(source: anyhow::Error) -> Self {
        Self::new(CycleStage::Classification, source)
    }

    pub fn upload(source: anyhow::Error) -> Self {
        Self::new(CycleStage::Upload, source)
    }

    pub fn telemetry(source: anyhow::Error) -> Self {
        Self::new(CycleStage::Telemetry, source)
    }

    /// True when the failure happened before the cycle produced predictions.
    pub fn aborted_cycle(&self) -> bool {
        matches!(self.stage, CycleStage::Capture | CycleStage::Classification)
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {:#}", self.stage, self.source)
    }
}

impl std::error::Error for CycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}
