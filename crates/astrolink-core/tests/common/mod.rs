#![allow(dead_code)]

use std::sync::Arc;

use astrolink_core::config::StarGoConfig;
use astrolink_core::devices::shared_factory;
use astrolink_core::devices::stargo::StarGoMount;
use astrolink_core::driver::Driver;
use astrolink_core::property::RecordingSink;
use astrolink_core::protocol::MockTransport;
use astrolink_core::timer::ManualClock;

/// Route driver logs to the test harness; `RUST_LOG=debug` shows the wire traffic
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn stargo_config() -> StarGoConfig {
    StarGoConfig {
        sync_time_on_connect: false,
        ..StarGoConfig::default()
    }
}

/// Script the mount handshake with the AUX1 focuser reporting `position`
pub fn script_handshake(mock: &MockTransport, position: i64) {
    mock.expect(":GVP#", "Avalon StarGo#")
        .expect(":GVN#", "56.6#")
        .expect_silent(":X205050#")
        .expect(":X0BAUX1AS#", format!("AX1={:07}#", position + 500_000))
        .expect(":X1C1000*05#", "0#");
    mock.always(":GR#", "05:30:00#").always(":GD#", "+20*00:00#");
}

pub struct Rig {
    pub mock: MockTransport,
    pub mount: StarGoMount,
    pub sink: RecordingSink,
    pub focuser_sink: RecordingSink,
    pub clock: Arc<ManualClock>,
}

pub fn connected_mount(position: i64) -> Rig {
    connected_mount_with(stargo_config(), position)
}

pub fn connected_mount_with(config: StarGoConfig, position: i64) -> Rig {
    init_tracing();
    let mock = MockTransport::new();
    script_handshake(&mock, position);
    let sink = RecordingSink::new();
    let focuser_sink = RecordingSink::new();
    let clock = Arc::new(ManualClock::new());
    let mut mount = StarGoMount::new(
        config,
        shared_factory(mock.clone()),
        Box::new(sink.clone()),
        Box::new(focuser_sink.clone()),
        clock.clone(),
    );
    assert!(mount.connect());
    assert_eq!(mock.remaining(), 0);
    mock.clear_written();
    Rig {
        mock,
        mount,
        sink,
        focuser_sink,
        clock,
    }
}
