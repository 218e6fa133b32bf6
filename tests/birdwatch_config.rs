use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use birdwatch::config::BirdwatchConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

const ENV_KEYS: [&str; 15] = [
    "BIRDWATCH_CONFIG",
    "BIRDWATCH_DEVICE_ID",
    "BIRDWATCH_IMAGE_DIR",
    "BIRDWATCH_GATE_LABEL",
    "BIRDWATCH_THRESHOLD",
    "BIRDWATCH_POLL_MS",
    "BIRDWATCH_TIMEOUT_SECS",
    "BIRDWATCH_PIR_PIN",
    "BIRDWATCH_GPIO_BASE",
    "BIRDWATCH_CAMERA_PROGRAM",
    "CUSTOM_VISION_PREDICTION_URL",
    "CUSTOM_VISION_PREDICTION_KEY",
    "AZURE_BLOB_CONNECTION_STRING",
    "AZURE_BLOB_CONTAINER",
    "AZURE_IOT_HUB_CONNECTION_STRING",
];

fn clear_env() {
    for key in ENV_KEYS {
        std::env::remove_var(key);
    }
}

fn set_credentials() {
    std::env::set_var(
        "CUSTOM_VISION_PREDICTION_URL",
        "https://westeurope.api.cognitive.microsoft.com/customvision/v3.0/Prediction/p1/classify/iterations/Iteration1/image",
    );
    std::env::set_var("CUSTOM_VISION_PREDICTION_KEY", "prediction-key");
    std::env::set_var(
        "AZURE_BLOB_CONNECTION_STRING",
        "AccountName=feederacct;AccountKey=SmVmZQ==",
    );
    std::env::set_var(
        "AZURE_IOT_HUB_CONNECTION_STRING",
        "HostName=hub.azure-devices.net;DeviceId=feeder-pi;SharedAccessKey=SmVmZQ==",
    );
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "device_id": "garden-pi",
        "image_dir": "/var/lib/birdwatch/images",
        "threshold": 0.6,
        "poll_interval_ms": 200,
        "sensor": { "pin": 17, "chip_base": 512 },
        "camera": { "program": "libcamera-still", "width": 1280, "height": 720, "rotation": 0 },
        "custom_vision": {
            "prediction_url": "https://example.invalid/customvision/v3.0/Prediction/p/classify/iterations/i/image",
            "prediction_key": "file-key"
        },
        "blob": { "connection_string": "AccountName=a;AccountKey=SmVmZQ==", "container": "feeder-images" },
        "iot_hub": { "connection_string": "HostName=h;DeviceId=d;SharedAccessKey=SmVmZQ==", "sas_ttl_secs": 3600 }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("BIRDWATCH_CONFIG", file.path());
    std::env::set_var("BIRDWATCH_PIR_PIN", "23");
    std::env::set_var("BIRDWATCH_GATE_LABEL", "robin");
    std::env::set_var("CUSTOM_VISION_PREDICTION_KEY", "env-key");

    let cfg = BirdwatchConfig::load().expect("load config");

    assert_eq!(cfg.device_id, "garden-pi");
    assert_eq!(cfg.image_dir.to_str(), Some("/var/lib/birdwatch/images"));
    assert_eq!(cfg.threshold, 0.6);
    assert_eq!(cfg.poll_interval, Duration::from_millis(200));
    assert_eq!(cfg.sensor.pin, 23);
    assert_eq!(cfg.sensor.chip_base, 512);
    assert_eq!(cfg.camera.program, "libcamera-still");
    assert_eq!((cfg.camera.width, cfg.camera.height), (1280, 720));
    assert_eq!(cfg.gate_label, "robin");
    assert_eq!(cfg.custom_vision.prediction_key, "env-key");
    assert_eq!(cfg.blob.container, "feeder-images");
    assert_eq!(cfg.iot_hub.sas_ttl, Duration::from_secs(3600));

    clear_env();
}

#[test]
fn env_only_config_uses_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    set_credentials();

    let cfg = BirdwatchConfig::load().expect("load config");
    assert_eq!(cfg.device_id, "feeder-pi");
    assert_eq!(cfg.gate_label, "bird");
    assert_eq!(cfg.threshold, 0.5);
    assert_eq!(cfg.sensor.pin, 5);
    assert_eq!(cfg.blob.container, "images-container");

    clear_env();
}

#[test]
fn missing_credentials_are_setup_failures() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    set_credentials();
    std::env::remove_var("AZURE_IOT_HUB_CONNECTION_STRING");

    let err = BirdwatchConfig::load().unwrap_err();
    assert!(err.to_string().contains("AZURE_IOT_HUB_CONNECTION_STRING"));

    clear_env();
}

#[test]
fn rejects_malformed_numeric_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    set_credentials();
    std::env::set_var("BIRDWATCH_POLL_MS", "fast");

    let err = BirdwatchConfig::load().unwrap_err();
    assert!(err.to_string().contains("BIRDWATCH_POLL_MS"));

    std::env::set_var("BIRDWATCH_POLL_MS", "0");
    assert!(BirdwatchConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_threshold_outside_unit_interval() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    set_credentials();
    std::env::set_var("BIRDWATCH_THRESHOLD", "1.5");

    assert!(BirdwatchConfig::load().is_err());

    clear_env();
}
