mod common;

use std::time::Duration;

use astrolink_core::driver::{ConnectionState, Driver};
use astrolink_core::property::{names, PropertyState, PropertyValue};
use pretty_assertions::assert_eq;

use common::{connected_mount, connected_mount_with, stargo_config, Rig};

#[test]
fn test_goto_completes_when_coordinates_settle() {
    let Rig {
        mock,
        mut mount,
        sink,
        ..
    } = connected_mount(1000);
    mock.always(":X0BAUX1AS#", "AX1=0501000#");
    mock.expect(":Sr05:30:00#", "1")
        .expect(":Sd+20*00:00#", "1")
        .expect(":MS#", "0");

    assert!(mount.update_number(names::EQUATORIAL_EOD_COORD, &[5.5, 20.0]));
    assert!(mount.is_slewing());
    assert_eq!(
        sink.last(names::EQUATORIAL_EOD_COORD).unwrap().state,
        PropertyState::Busy
    );

    assert!(mount.timer_tick());
    assert!(mount.is_slewing());
    assert!(mount.timer_tick());
    assert!(!mount.is_slewing());

    let last = sink.last(names::EQUATORIAL_EOD_COORD).unwrap();
    assert_eq!(last.state, PropertyState::Ok);
    assert_eq!(last.value, Some(PropertyValue::Number(vec![5.5, 20.0])));
}

#[test]
fn test_refused_goto_publishes_reason() {
    let Rig {
        mock,
        mut mount,
        sink,
        ..
    } = connected_mount(1000);
    mock.expect(":Sr05:30:00#", "1")
        .expect(":Sd+20*00:00#", "1")
        .expect(":MS#", "1Object below horizon#");

    assert!(!mount.update_number(names::EQUATORIAL_EOD_COORD, &[5.5, 20.0]));
    assert!(!mount.is_slewing());
    let alert = sink.last(names::EQUATORIAL_EOD_COORD).unwrap();
    assert_eq!(alert.state, PropertyState::Alert);
    assert!(alert.message.unwrap().contains("below horizon"));
}

#[test]
fn test_sync_mode_does_not_slew() {
    let Rig {
        mock,
        mut mount,
        sink,
        ..
    } = connected_mount(1000);
    mock.expect(":Sr05:30:00#", "1")
        .expect(":Sd+20*00:00#", "1")
        .expect(":CM#", "M31 EX GAL MAG 3.5 SZ178.0'#");

    assert!(mount.update_switch(names::ON_COORD_SET, &[false, true]));
    assert!(mount.update_number(names::EQUATORIAL_EOD_COORD, &[5.5, 20.0]));
    assert!(!mount.is_slewing());
    assert_eq!(mount.coordinates(), Some((5.5, 20.0)));
    assert_eq!(
        sink.last(names::EQUATORIAL_EOD_COORD).unwrap().state,
        PropertyState::Ok
    );
}

#[test]
fn test_long_pulse_is_busy_until_its_timer() {
    let Rig {
        mock,
        mut mount,
        sink,
        clock,
        ..
    } = connected_mount(1000);
    mock.expect_silent(":Mgn0500#");

    assert!(mount.update_number(names::TELESCOPE_TIMED_GUIDE_NS, &[500.0, 0.0]));
    assert_eq!(
        sink.last(names::TELESCOPE_TIMED_GUIDE_NS).unwrap().state,
        PropertyState::Busy
    );
    assert_eq!(
        mount.next_deadline(),
        Some(clock.at(Duration::from_millis(500)))
    );

    clock.advance(Duration::from_millis(499));
    assert!(mount.run_timers());
    assert_eq!(
        sink.last(names::TELESCOPE_TIMED_GUIDE_NS).unwrap().state,
        PropertyState::Busy
    );

    clock.advance(Duration::from_millis(1));
    assert!(mount.run_timers());
    let done = sink.last(names::TELESCOPE_TIMED_GUIDE_NS).unwrap();
    assert_eq!(done.state, PropertyState::Ok);
    assert_eq!(done.value, Some(PropertyValue::Number(vec![0.0, 0.0])));
    assert_eq!(mount.next_deadline(), None);
}

#[test]
fn test_short_pulse_blocks_and_reports_ok() {
    let Rig {
        mock,
        mut mount,
        sink,
        clock,
        ..
    } = connected_mount(1000);
    mock.expect_silent(":Mge0030#");

    assert!(mount.update_number(names::TELESCOPE_TIMED_GUIDE_WE, &[0.0, 30.0]));
    assert!(clock.elapsed() >= Duration::from_millis(30));
    assert_eq!(
        sink.last(names::TELESCOPE_TIMED_GUIDE_WE).unwrap().state,
        PropertyState::Ok
    );
    assert_eq!(mount.next_deadline(), None);
    assert_eq!(mock.remaining(), 0);
}

#[test]
fn test_new_pulse_completes_the_previous_one_first() {
    let Rig {
        mock,
        mut mount,
        sink,
        ..
    } = connected_mount(1000);
    mock.expect_silent(":Mgn0500#").expect_silent(":Mgs0200#");

    assert!(mount.update_number(names::TELESCOPE_TIMED_GUIDE_NS, &[500.0, 0.0]));
    assert!(mount.update_number(names::TELESCOPE_TIMED_GUIDE_NS, &[0.0, 200.0]));

    let states: Vec<_> = sink
        .updates_for(names::TELESCOPE_TIMED_GUIDE_NS)
        .into_iter()
        .map(|u| (u.value, u.state))
        .collect();
    assert_eq!(
        states,
        vec![
            (
                Some(PropertyValue::Number(vec![500.0, 0.0])),
                PropertyState::Busy
            ),
            (
                Some(PropertyValue::Number(vec![0.0, 0.0])),
                PropertyState::Ok
            ),
            (
                Some(PropertyValue::Number(vec![0.0, 200.0])),
                PropertyState::Busy
            ),
        ]
    );
}

#[test]
fn test_move_and_stop_guiding() {
    let config = astrolink_core::config::StarGoConfig {
        use_pulse_commands: false,
        ..stargo_config()
    };
    let Rig {
        mock,
        mut mount,
        clock,
        ..
    } = connected_mount_with(config, 1000);
    mock.expect_silent(":RG#")
        .expect_silent(":Mw#")
        .expect_silent(":Qw#");

    assert!(mount.update_number(names::TELESCOPE_TIMED_GUIDE_WE, &[300.0, 0.0]));
    clock.advance(Duration::from_millis(300));
    assert!(mount.run_timers());
    assert_eq!(mock.written_text(), vec![":RG#", ":Mw#", ":Qw#"]);
}

#[test]
fn test_abort_cancels_pending_pulses() {
    let Rig {
        mock,
        mut mount,
        sink,
        ..
    } = connected_mount(1000);
    mock.expect_silent(":Mgn2000#")
        .expect_silent(":X0AAUX1ST#")
        .expect_silent(":Q#");

    assert!(mount.update_number(names::TELESCOPE_TIMED_GUIDE_NS, &[2000.0, 0.0]));
    assert!(mount.update_switch(names::TELESCOPE_ABORT_MOTION, &[true]));
    assert_eq!(mount.next_deadline(), None);
    assert_eq!(
        sink.last(names::TELESCOPE_TIMED_GUIDE_NS).unwrap().state,
        PropertyState::Idle
    );
    assert_eq!(
        sink.last(names::TELESCOPE_ABORT_MOTION).unwrap().state,
        PropertyState::Ok
    );
}

#[test]
fn test_disconnect_stops_a_running_slew() {
    let Rig {
        mock, mut mount, ..
    } = connected_mount(1000);
    mock.expect(":Sr05:30:00#", "1")
        .expect(":Sd+20*00:00#", "1")
        .expect(":MS#", "0")
        .expect_silent(":Q#");

    assert!(mount.update_number(names::EQUATORIAL_EOD_COORD, &[5.5, 20.0]));
    assert!(mount.disconnect());
    assert_eq!(mount.connection_state(), ConnectionState::Disconnected);
    assert_eq!(mock.remaining(), 0);

    assert!(!mount.update_number(names::EQUATORIAL_EOD_COORD, &[1.0, 1.0]));
}

#[test]
fn test_disconnect_stops_a_move_and_stop_pulse() {
    let config = astrolink_core::config::StarGoConfig {
        use_pulse_commands: false,
        ..stargo_config()
    };
    let Rig {
        mock,
        mut mount,
        sink,
        ..
    } = connected_mount_with(config, 1000);
    mock.expect_silent(":RG#")
        .expect_silent(":Mn#")
        .expect_silent(":Qn#");

    assert!(mount.update_number(names::TELESCOPE_TIMED_GUIDE_NS, &[2000.0, 0.0]));
    assert!(mount.disconnect());

    assert_eq!(mock.written_text(), vec![":RG#", ":Mn#", ":Qn#"]);
    assert_eq!(mock.remaining(), 0);
    assert_eq!(
        sink.last(names::TELESCOPE_TIMED_GUIDE_NS).unwrap().state,
        PropertyState::Idle
    );
    assert_eq!(mount.next_deadline(), None);
}

#[test]
fn test_abort_stops_a_move_and_stop_pulse_first() {
    let config = astrolink_core::config::StarGoConfig {
        use_pulse_commands: false,
        ..stargo_config()
    };
    let Rig {
        mock, mut mount, ..
    } = connected_mount_with(config, 1000);
    mock.expect_silent(":RG#")
        .expect_silent(":Me#")
        .expect_silent(":Qe#")
        .expect_silent(":X0AAUX1ST#")
        .expect_silent(":Q#");

    assert!(mount.update_number(names::TELESCOPE_TIMED_GUIDE_WE, &[0.0, 1500.0]));
    assert!(mount.update_switch(names::TELESCOPE_ABORT_MOTION, &[true]));
    assert_eq!(
        mock.written_text(),
        vec![":RG#", ":Me#", ":Qe#", ":X0AAUX1ST#", ":Q#"]
    );
}

#[test]
fn test_manual_motion_starts_and_stops() {
    let Rig {
        mock,
        mut mount,
        sink,
        ..
    } = connected_mount(1000);
    mock.expect_silent(":Mn#").expect_silent(":Qn#");

    assert!(mount.update_switch(names::TELESCOPE_MOTION_NS, &[true, false]));
    assert_eq!(
        sink.last(names::TELESCOPE_MOTION_NS).unwrap().state,
        PropertyState::Busy
    );
    assert!(mount.update_switch(names::TELESCOPE_MOTION_NS, &[false, false]));
    assert_eq!(
        sink.last(names::TELESCOPE_MOTION_NS).unwrap().state,
        PropertyState::Idle
    );
    assert_eq!(mock.remaining(), 0);
}
