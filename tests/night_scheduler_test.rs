//! Night-charging scheduler entry/exit sequences.

mod common;

use helia::config::Settings;
use helia::scheduler::NightChargingScheduler;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// CLI stand-in that appends its arguments to a log file
fn write_recording_cli(dir: &std::path::Path) -> String {
    use std::os::unix::fs::PermissionsExt;
    let script = dir.join("e3dc-recorder.sh");
    let log = dir.join("calls.log");
    std::fs::write(
        &script,
        format!("#!/bin/sh\necho \"$@\" >> \"{}\"\n", log.display()),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script.display().to_string()
}

fn recorded_calls(dir: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls.log"))
        .map(|s| s.lines().map(|l| l.to_string()).collect())
        .unwrap_or_default()
}

/// Window of +/- one hour around the current time, in UTC
fn window_containing_now() -> (String, String) {
    let now = chrono::Utc::now();
    let start = now - chrono::Duration::hours(1);
    let end = now + chrono::Duration::hours(1);
    (start.format("%H:%M").to_string(), end.format("%H:%M").to_string())
}

fn night_settings(cli_command: &str, inside: bool) -> Settings {
    let mut settings = Settings::default();
    settings.timezone = "UTC".to_string();
    settings.mock_wallbox_plug_status = 7;
    settings.e3dc.enabled = true;
    settings.e3dc.cli_command = cli_command.to_string();
    settings.e3dc.grid_charge_during_night_charging = true;
    settings.e3dc.modbus_pause_seconds = 0;
    settings.night_charging_schedule.enabled = true;
    let (start, end) = window_containing_now();
    if inside {
        settings.night_charging_schedule.start_time = start;
        settings.night_charging_schedule.end_time = end;
    } else {
        // A window that cannot contain the current minute
        settings.night_charging_schedule.start_time = end.clone();
        settings.night_charging_schedule.end_time = end;
    }
    settings
}

#[tokio::test]
async fn entering_the_window_sets_flags_and_calls_the_inverter_once() {
    let dir = tempfile::tempdir().unwrap();
    let cli = write_recording_cli(dir.path());
    let rig = common::rig_with(night_settings(&cli, true)).await;
    let scheduler = NightChargingScheduler::new(
        Arc::clone(&rig.store),
        Arc::clone(&rig.cli),
        Arc::clone(&rig.transport),
        Arc::clone(&rig.target),
        Arc::clone(&rig.notifier) as Arc<dyn helia::notify::Notifier>,
    );

    scheduler.tick().await;

    let control = rig.store.control_state();
    assert!(control.night_charging);
    assert!(control.battery_lock);
    assert!(control.grid_charging);
    assert!(rig.mock.state.enabled.load(Ordering::SeqCst));

    // One combined call: discharge lock plus grid charge
    let calls = recorded_calls(dir.path());
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], "-d 1 -e 3000");

    // The adjacent tick does not re-enter
    scheduler.tick().await;
    assert_eq!(recorded_calls(dir.path()).len(), 1);
}

#[tokio::test]
async fn leaving_the_window_mirrors_the_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cli = write_recording_cli(dir.path());
    let rig = common::rig_with(night_settings(&cli, true)).await;
    let scheduler = NightChargingScheduler::new(
        Arc::clone(&rig.store),
        Arc::clone(&rig.cli),
        Arc::clone(&rig.transport),
        Arc::clone(&rig.target),
        Arc::clone(&rig.notifier) as Arc<dyn helia::notify::Notifier>,
    );

    scheduler.tick().await;
    assert!(rig.store.control_state().night_charging);

    // Shrink the window so the current minute falls outside
    let (_, end) = {
        let now = chrono::Utc::now();
        let end = now + chrono::Duration::hours(1);
        ("".to_string(), end.format("%H:%M").to_string())
    };
    rig.store
        .update_settings(&move |s| {
            s.night_charging_schedule.start_time = end.clone();
            s.night_charging_schedule.end_time = end.clone();
        })
        .unwrap();
    // An empty window matches nothing, so this forces the exit
    scheduler.tick().await;

    let control = rig.store.control_state();
    assert!(!control.night_charging);
    assert!(!control.battery_lock);
    assert!(!control.grid_charging);
    assert!(!rig.mock.state.enabled.load(Ordering::SeqCst));
    assert_eq!(rig.mock.state.ena_off_count.load(Ordering::SeqCst), 1);

    let calls = recorded_calls(dir.path());
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1], "-d 0 -e 0");
}

#[tokio::test]
async fn disabling_the_schedule_forces_the_exit() {
    let dir = tempfile::tempdir().unwrap();
    let cli = write_recording_cli(dir.path());
    let rig = common::rig_with(night_settings(&cli, true)).await;
    let scheduler = NightChargingScheduler::new(
        Arc::clone(&rig.store),
        Arc::clone(&rig.cli),
        Arc::clone(&rig.transport),
        Arc::clone(&rig.target),
        Arc::clone(&rig.notifier) as Arc<dyn helia::notify::Notifier>,
    );

    scheduler.tick().await;
    assert!(rig.store.control_state().night_charging);

    rig.store
        .update_settings(&|s| s.night_charging_schedule.enabled = false)
        .unwrap();
    scheduler.tick().await;

    assert!(!rig.store.control_state().night_charging);
    assert!(!rig.mock.state.enabled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn inverter_failure_rolls_the_control_state_back() {
    // `false` exits non-zero, so the combined night-charging call fails
    let rig = common::rig_with(night_settings("false", true)).await;
    let scheduler = NightChargingScheduler::new(
        Arc::clone(&rig.store),
        Arc::clone(&rig.cli),
        Arc::clone(&rig.transport),
        Arc::clone(&rig.target),
        Arc::clone(&rig.notifier) as Arc<dyn helia::notify::Notifier>,
    );

    scheduler.tick().await;

    let control = rig.store.control_state();
    assert!(!control.night_charging);
    assert!(!control.battery_lock);
    assert!(!control.grid_charging);
    // The wallbox start was skipped
    assert!(!rig.mock.state.enabled.load(Ordering::SeqCst));
}
