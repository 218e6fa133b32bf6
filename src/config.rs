use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::camera::StillCameraConfig;
use crate::sensor::SysfsSensorConfig;
use crate::storage::DEFAULT_CONTAINER;
use crate::telemetry::DEFAULT_SAS_TTL;
use crate::{DEFAULT_DEVICE_ID, DEFAULT_GATE_LABEL, DEFAULT_THRESHOLD};

pub const CONFIG_PATH_ENV: &str = "BIRDWATCH_CONFIG";

const DEFAULT_IMAGE_DIR: &str = "bird_images";
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct BirdwatchConfigFile {
    device_id: Option<String>,
    image_dir: Option<PathBuf>,
    gate_label: Option<String>,
    threshold: Option<f64>,
    poll_interval_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
    sensor: Option<SensorConfigFile>,
    camera: Option<CameraConfigFile>,
    custom_vision: Option<CustomVisionConfigFile>,
    blob: Option<BlobConfigFile>,
    iot_hub: Option<IotHubConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SensorConfigFile {
    pin: Option<u32>,
    chip_base: Option<u32>,
    sysfs_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    program: Option<String>,
    extra_args: Option<Vec<String>>,
    width: Option<u32>,
    height: Option<u32>,
    rotation: Option<u32>,
}

#[derive(Deserialize, Default)]
struct CustomVisionConfigFile {
    prediction_url: Option<String>,
    prediction_key: Option<String>,
}

#[derive(Deserialize, Default)]
struct BlobConfigFile {
    connection_string: Option<String>,
    container: Option<String>,
}

#[derive(Deserialize, Default)]
struct IotHubConfigFile {
    connection_string: Option<String>,
    sas_ttl_secs: Option<u64>,
}

impl fmt::Debug for CustomVisionConfigFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomVisionConfigFile")
            .field("prediction_url", &self.prediction_url)
            .field("prediction_key", &redacted_opt(&self.prediction_key))
            .finish()
    }
}

impl fmt::Debug for BlobConfigFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobConfigFile")
            .field("connection_string", &redacted_opt(&self.connection_string))
            .field("container", &self.container)
            .finish()
    }
}

impl fmt::Debug for IotHubConfigFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IotHubConfigFile")
            .field("connection_string", &redacted_opt(&self.connection_string))
            .field("sas_ttl_secs", &self.sas_ttl_secs)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BirdwatchConfig {
    pub device_id: String,
    pub image_dir: PathBuf,
    pub gate_label: String,
    pub threshold: f64,
    pub poll_interval: Duration,
    /// Bound on every network call.
    pub request_timeout: Duration,
    pub sensor: SysfsSensorConfig,
    pub camera: StillCameraConfig,
    pub custom_vision: CustomVisionSettings,
    pub blob: BlobSettings,
    pub iot_hub: IotHubSettings,
}

#[derive(Clone)]
pub struct CustomVisionSettings {
    pub prediction_url: String,
    pub prediction_key: String,
}

#[derive(Clone)]
pub struct BlobSettings {
    pub connection_string: String,
    pub container: String,
}

#[derive(Clone)]
pub struct IotHubSettings {
    pub connection_string: String,
    pub sas_ttl: Duration,
}

// Credentials never reach log output.
fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

fn redacted_opt(value: &Option<String>) -> &'static str {
    redacted(value.as_deref().unwrap_or(""))
}

impl fmt::Debug for CustomVisionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomVisionSettings")
            .field("prediction_url", &self.prediction_url)
            .field("prediction_key", &redacted(&self.prediction_key))
            .finish()
    }
}

impl fmt::Debug for BlobSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobSettings")
            .field("connection_string", &redacted(&self.connection_string))
            .field("container", &self.container)
            .finish()
    }
}

impl fmt::Debug for IotHubSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IotHubSettings")
            .field("connection_string", &redacted(&self.connection_string))
            .field("sas_ttl", &self.sas_ttl)
            .finish()
    }
}

impl BirdwatchConfig {
    /// Load from the file named by `BIRDWATCH_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|path| !path.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: BirdwatchConfigFile) -> Self {
        let sensor_file = file.sensor.unwrap_or_default();
        let sensor_defaults = SysfsSensorConfig::default();
        let sensor = SysfsSensorConfig {
            sysfs_root: sensor_file.sysfs_root.unwrap_or(sensor_defaults.sysfs_root),
            pin: sensor_file.pin.unwrap_or(sensor_defaults.pin),
            chip_base: sensor_file.chip_base.unwrap_or(sensor_defaults.chip_base),
        };

        let camera_file = file.camera.unwrap_or_default();
        let camera_defaults = StillCameraConfig::default();
        let camera = StillCameraConfig {
            program: camera_file.program.unwrap_or(camera_defaults.program),
            extra_args: camera_file.extra_args.unwrap_or(camera_defaults.extra_args),
            width: camera_file.width.unwrap_or(camera_defaults.width),
            height: camera_file.height.unwrap_or(camera_defaults.height),
            rotation: camera_file.rotation.unwrap_or(camera_defaults.rotation),
        };

        let vision_file = file.custom_vision.unwrap_or_default();
        let blob_file = file.blob.unwrap_or_default();
        let hub_file = file.iot_hub.unwrap_or_default();

        Self {
            device_id: file
                .device_id
                .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string()),
            image_dir: file
                .image_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGE_DIR)),
            gate_label: file
                .gate_label
                .unwrap_or_else(|| DEFAULT_GATE_LABEL.to_string()),
            threshold: file.threshold.unwrap_or(DEFAULT_THRESHOLD),
            poll_interval: Duration::from_millis(
                file.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            request_timeout: Duration::from_secs(
                file.request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            sensor,
            camera,
            custom_vision: CustomVisionSettings {
                prediction_url: vision_file.prediction_url.unwrap_or_default(),
                prediction_key: vision_file.prediction_key.unwrap_or_default(),
            },
            blob: BlobSettings {
                connection_string: blob_file.connection_string.unwrap_or_default(),
                container: blob_file
                    .container
                    .unwrap_or_else(|| DEFAULT_CONTAINER.to_string()),
            },
            iot_hub: IotHubSettings {
                connection_string: hub_file.connection_string.unwrap_or_default(),
                sas_ttl: hub_file
                    .sas_ttl_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_SAS_TTL),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(device_id) = env_string("BIRDWATCH_DEVICE_ID") {
            self.device_id = device_id;
        }
        if let Some(dir) = env_string("BIRDWATCH_IMAGE_DIR") {
            self.image_dir = PathBuf::from(dir);
        }
        if let Some(label) = env_string("BIRDWATCH_GATE_LABEL") {
            self.gate_label = label;
        }
        if let Some(threshold) = env_parse::<f64>("BIRDWATCH_THRESHOLD", "a number")? {
            self.threshold = threshold;
        }
        if let Some(ms) = env_parse::<u64>("BIRDWATCH_POLL_MS", "an integer number of milliseconds")? {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) =
            env_parse::<u64>("BIRDWATCH_TIMEOUT_SECS", "an integer number of seconds")?
        {
            self.request_timeout = Duration::from_secs(secs);
        }
        if let Some(pin) = env_parse::<u32>("BIRDWATCH_PIR_PIN", "a GPIO pin number")? {
            self.sensor.pin = pin;
        }
        if let Some(base) = env_parse::<u32>("BIRDWATCH_GPIO_BASE", "a GPIO line offset")? {
            self.sensor.chip_base = base;
        }
        if let Some(program) = env_string("BIRDWATCH_CAMERA_PROGRAM") {
            self.camera.program = program;
        }
        if let Some(url) = env_string("CUSTOM_VISION_PREDICTION_URL") {
            self.custom_vision.prediction_url = url;
        }
        if let Some(key) = env_string("CUSTOM_VISION_PREDICTION_KEY") {
            self.custom_vision.prediction_key = key;
        }
        if let Some(conn) = env_string("AZURE_BLOB_CONNECTION_STRING") {
            self.blob.connection_string = conn;
        }
        if let Some(container) = env_string("AZURE_BLOB_CONTAINER") {
            self.blob.container = container;
        }
        if let Some(conn) = env_string("AZURE_IOT_HUB_CONNECTION_STRING") {
            self.iot_hub.connection_string = conn;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.threshold) {
            return Err(anyhow!(
                "threshold must be in [0, 1), got {}",
                self.threshold
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll interval must be greater than zero"));
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("request timeout must be greater than zero"));
        }
        if self.camera.rotation != 0 && self.camera.rotation != 180 {
            return Err(anyhow!(
                "camera rotation must be 0 or 180, got {}",
                self.camera.rotation
            ));
        }
        if self.device_id.trim().is_empty() {
            return Err(anyhow!("device id must not be empty"));
        }
        if self.gate_label.is_empty() {
            return Err(anyhow!("gate label must not be empty"));
        }
        require(
            &self.custom_vision.prediction_url,
            "custom_vision.prediction_url",
            "CUSTOM_VISION_PREDICTION_URL",
        )?;
        require(
            &self.custom_vision.prediction_key,
            "custom_vision.prediction_key",
            "CUSTOM_VISION_PREDICTION_KEY",
        )?;
        require(
            &self.blob.connection_string,
            "blob.connection_string",
            "AZURE_BLOB_CONNECTION_STRING",
        )?;
        require(
            &self.iot_hub.connection_string,
            "iot_hub.connection_string",
            "AZURE_IOT_HUB_CONNECTION_STRING",
        )?;
        Ok(())
    }
}

fn require(value: &str, key: &str, env: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("missing {} (set {} or the config file)", key, env));
    }
    Ok(())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str, what: &str) -> Result<Option<T>> {
    match env_string(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be {}", name, what)),
        None => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<BirdwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_credentials(mut cfg: BirdwatchConfig) -> BirdwatchConfig {
        cfg.custom_vision.prediction_url = "https://x/y".to_string();
        cfg.custom_vision.prediction_key = "key".to_string();
        cfg.blob.connection_string = "AccountName=a;AccountKey=b".to_string();
        cfg.iot_hub.connection_string = "HostName=h;DeviceId=d;SharedAccessKey=k".to_string();
        cfg
    }

    #[test]
    fn defaults_match_feeder_setup() {
        let cfg = BirdwatchConfig::from_file(BirdwatchConfigFile::default());
        assert_eq!(cfg.device_id, "feeder-pi");
        assert_eq!(cfg.image_dir, PathBuf::from("bird_images"));
        assert_eq!(cfg.gate_label, "bird");
        assert_eq!(cfg.threshold, 0.5);
        assert_eq!(cfg.poll_interval, Duration::from_millis(100));
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.sensor.pin, 5);
        assert_eq!(cfg.camera.rotation, 180);
        assert_eq!(cfg.blob.container, "images-container");
        assert_eq!(cfg.iot_hub.sas_ttl, Duration::from_secs(86_400));
    }

    #[test]
    fn missing_credentials_fail_validation() {
        let cfg = BirdwatchConfig::from_file(BirdwatchConfigFile::default());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("CUSTOM_VISION_PREDICTION_URL"));
        assert!(with_credentials(cfg).validate().is_ok());
    }

    #[test]
    fn out_of_range_values_fail_validation() {
        let base = with_credentials(BirdwatchConfig::from_file(BirdwatchConfigFile::default()));

        let mut cfg = base.clone();
        cfg.threshold = 1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = base.clone();
        cfg.poll_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = base.clone();
        cfg.camera.rotation = 90;
        assert!(cfg.validate().is_err());

        let mut cfg = base;
        cfg.gate_label = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_file_is_parsed_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("birdwatch.toml");
        std::fs::write(
            &path,
            r#"
device_id = "garden-pi"
poll_interval_ms = 250

[sensor]
pin = 17
chip_base = 512

[camera]
program = "libcamera-still"
rotation = 0
"#,
        )
        .unwrap();
        let cfg = BirdwatchConfig::from_file(read_config_file(&path).expect("read"));
        assert_eq!(cfg.device_id, "garden-pi");
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.sensor.line(), 529);
        assert_eq!(cfg.camera.program, "libcamera-still");
        assert_eq!(cfg.camera.rotation, 0);
    }

    #[test]
    fn parsed_file_debug_hides_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("birdwatch.json");
        std::fs::write(
            &path,
            r#"{
                "device_id": "garden-pi",
                "custom_vision": { "prediction_url": "https://cv/x", "prediction_key": "cv-secret" },
                "blob": { "connection_string": "AccountName=a;AccountKey=blob-secret", "container": "feeder" },
                "iot_hub": { "connection_string": "HostName=h;DeviceId=d;SharedAccessKey=hub-secret" }
            }"#,
        )
        .unwrap();
        let file = read_config_file(&path).expect("read");
        let rendered = format!("{:?}", file);
        assert!(rendered.contains("garden-pi"));
        assert!(rendered.contains("https://cv/x"));
        assert!(rendered.contains("feeder"));
        assert!(!rendered.contains("cv-secret"));
        assert!(!rendered.contains("blob-secret"));
        assert!(!rendered.contains("hub-secret"));
    }

    #[test]
    fn debug_output_hides_credentials() {
        let cfg = with_credentials(BirdwatchConfig::from_file(BirdwatchConfigFile::default()));
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("SharedAccessKey=k"));
        assert!(!rendered.contains("AccountKey=b"));
        assert!(rendered.contains("<redacted>"));
    }
}
