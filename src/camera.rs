//! Still camera collaborator.
//!
//! `StillCamera` drives the Raspberry Pi `rpicam-still` tool (or the older
//! `libcamera-still`). Resolution and rotation are fixed when the camera is
//! built; each capture writes one JPEG to the requested path.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::{Command, Output};

pub const DEFAULT_CAMERA_PROGRAM: &str = "rpicam-still";
pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;
pub const DEFAULT_ROTATION: u32 = 180;

const NO_CAMERAS_MARKER: &str = "No cameras available";

pub trait Camera {
    /// Write a JPEG image to `path`.
    fn capture(&mut self, path: &Path) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct StillCameraConfig {
    pub program: String,
    /// Passed before the capture arguments (e.g. `--quality 90`).
    pub extra_args: Vec<String>,
    pub width: u32,
    pub height: u32,
    /// Only 0 and 180 are supported by the camera stack.
    pub rotation: u32,
}

impl Default for StillCameraConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_CAMERA_PROGRAM.to_string(),
            extra_args: Vec::new(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            rotation: DEFAULT_ROTATION,
        }
    }
}

pub struct StillCamera {
    config: StillCameraConfig,
}

impl StillCamera {
    pub fn new(config: StillCameraConfig) -> Result<Self> {
        if config.rotation != 0 && config.rotation != 180 {
            return Err(anyhow!(
                "camera rotation must be 0 or 180, got {}",
                config.rotation
            ));
        }
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("camera resolution must be non-zero"));
        }
        Ok(Self { config })
    }

    /// Check that the camera program runs and sees at least one camera.
    pub fn probe(&self) -> Result<()> {
        let output = self.command().arg("--list-cameras").output().with_context(|| {
            format!("failed to run camera program '{}'", self.config.program)
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stdout.contains(NO_CAMERAS_MARKER) || stderr.contains(NO_CAMERAS_MARKER) {
            return Err(anyhow!("no camera detected by {}", self.config.program));
        }
        check_status(&self.config.program, &output)?;
        log::info!(
            "camera ready ({}, {}x{}, rotation {})",
            self.config.program,
            self.config.width,
            self.config.height,
            self.config.rotation
        );
        Ok(())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.extra_args);
        cmd
    }
}

impl Camera for StillCamera {
    fn capture(&mut self, path: &Path) -> Result<()> {
        let output = self
            .command()
            .args(["--nopreview", "--immediate", "--timeout", "1"])
            .arg("--width")
            .arg(self.config.width.to_string())
            .arg("--height")
            .arg(self.config.height.to_string())
            .arg("--rotation")
            .arg(self.config.rotation.to_string())
            .arg("--output")
            .arg(path)
            .output()
            .with_context(|| format!("failed to run camera program '{}'", self.config.program))?;
        check_status(&self.config.program, &output)?;

        let written = std::fs::metadata(path)
            .with_context(|| format!("camera produced no file at {}", path.display()))?;
        if written.len() == 0 {
            return Err(anyhow!("camera wrote an empty file at {}", path.display()));
        }
        Ok(())
    }
}

fn check_status(program: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let last_line = stderr.lines().rev().find(|line| !line.trim().is_empty());
    Err(anyhow!(
        "{} exited with {}: {}",
        program,
        output.status,
        last_line.unwrap_or("no diagnostics")
    ))
}
