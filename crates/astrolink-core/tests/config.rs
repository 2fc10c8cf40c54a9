use astrolink_core::config::{
    ConfigStore, DeviceConfig, HostConfig, JsonConfigStore, MicrotouchConfig, StarGoConfig,
    ToupcamConfig,
};
use astrolink_core::property::PropertyValue;
use pretty_assertions::assert_eq;
use tempfile::tempdir;

#[test]
fn test_host_config_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("host.json");

    let mut mount = StarGoConfig::default();
    mount.serial.port = "/dev/ttyUSB0".into();
    mount.latitude = 52.5;
    mount.longitude = 13.4;
    let mut focuser = MicrotouchConfig::default();
    focuser.serial.tcp_address = Some("192.168.1.20:4030".into());
    let camera = ToupcamConfig {
        simulate: true,
        state_file: Some(dir.path().join("camera.json")),
        ..ToupcamConfig::default()
    };
    let config = HostConfig {
        devices: vec![
            DeviceConfig::StarGo(mount),
            DeviceConfig::Microtouch(focuser),
            DeviceConfig::Toupcam(camera),
        ],
    };

    config.save(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"driver\": \"stargo\""));
    assert!(text.contains("\"driver\": \"toupcam\""));

    let loaded = HostConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_missing_host_config_is_a_config_error() {
    let dir = tempdir().unwrap();
    let err = HostConfig::load(&dir.path().join("absent.json")).unwrap_err();
    assert!(err.to_string().starts_with("configuration error"));
}

#[test]
fn test_json_store_persists_on_flush() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");

    let mut store = JsonConfigStore::open(&path).unwrap();
    store
        .save_item(
            "ToupCam G3M678M",
            "CCD_CONTROLS",
            &PropertyValue::Number(vec![100.0, 0.0, 0.0, 128.0, 0.0, 100.0]),
        )
        .unwrap();
    assert!(!path.exists());
    store.flush().unwrap();

    let mut reopened = JsonConfigStore::open(&path).unwrap();
    assert_eq!(
        reopened.get("ToupCam G3M678M", "CCD_CONTROLS"),
        Some(&PropertyValue::Number(vec![100.0, 0.0, 0.0, 128.0, 0.0, 100.0]))
    );

    // new items keep the ones already on disk
    reopened
        .save_item("ToupCam G3M678M", "CCD_COOLER", &PropertyValue::Switch(vec![true, false]))
        .unwrap();
    reopened.flush().unwrap();
    let again = JsonConfigStore::open(&path).unwrap();
    assert!(again.get("ToupCam G3M678M", "CCD_CONTROLS").is_some());
    assert!(again.get("ToupCam G3M678M", "CCD_COOLER").is_some());
}

#[test]
fn test_zero_poll_interval_is_rejected_on_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("host.json");
    std::fs::write(
        &path,
        r#"{ "devices": [ { "driver": "microtouch", "name": "Bench", "poll_interval_ms": 0 } ] }"#,
    )
    .unwrap();

    let err = HostConfig::load(&path).unwrap_err();
    let message = err.to_string();
    assert!(message.starts_with("configuration error"));
    assert!(message.contains("Bench"));
}
