//! X1 contact handling: strategy activation, rollback and persistence.

mod common;

use helia::config::Settings;
use helia::state::ChargingStrategy;
use std::sync::atomic::Ordering;

fn x1_settings(cli_command: &str) -> Settings {
    let mut settings = Settings::default();
    settings.mock_wallbox_plug_status = 7;
    settings.mock_wallbox_phases = 3;
    settings.charging_strategy.input_x1_strategy = ChargingStrategy::MaxWithoutBattery;
    settings.e3dc.enabled = true;
    settings.e3dc.cli_command = cli_command.to_string();
    settings
}

#[tokio::test]
async fn first_input_observation_is_a_baseline() {
    let rig = common::rig_with(x1_settings("true")).await;

    rig.listener
        .handle_broadcast(&serde_json::json!({"Input": 1}))
        .await;

    // No action: the wallbox was not started and no strategy persisted
    assert!(!rig.mock.state.enabled.load(Ordering::SeqCst));
    assert_eq!(
        rig.store.settings().charging_strategy.active_strategy,
        ChargingStrategy::Off
    );
}

#[tokio::test]
async fn input_rising_edge_starts_fast_path_and_persists_strategy() {
    let rig = common::rig_with(x1_settings("true")).await;

    rig.listener
        .handle_broadcast(&serde_json::json!({"Input": 0}))
        .await;
    rig.listener
        .handle_broadcast(&serde_json::json!({"Input": 1}))
        .await;

    // Wallbox running at the 3P ceiling
    assert!(rig.mock.state.enabled.load(Ordering::SeqCst));
    assert_eq!(rig.mock.state.max_curr_ma.load(Ordering::SeqCst), 16_000);

    let ctx = rig.store.charging_context();
    assert!(ctx.is_active);
    assert_eq!(ctx.current_ampere, 16.0);
    assert_eq!(ctx.current_phases, 3);
    assert!(ctx.invariants_hold());

    // Strategy persisted in both places, lock flag set
    assert_eq!(
        rig.store.settings().charging_strategy.active_strategy,
        ChargingStrategy::MaxWithoutBattery
    );
    assert_eq!(ctx.strategy, ChargingStrategy::MaxWithoutBattery);
    assert!(rig.store.control_state().battery_lock);
}

#[tokio::test]
async fn battery_lock_failure_rolls_the_fast_path_back() {
    // `false` exits non-zero, so the discharge-lock call fails
    let rig = common::rig_with(x1_settings("false")).await;

    rig.listener
        .handle_broadcast(&serde_json::json!({"Input": 0}))
        .await;
    rig.listener
        .handle_broadcast(&serde_json::json!({"Input": 1}))
        .await;

    // The wallbox was stopped again and nothing was persisted
    assert!(!rig.mock.state.enabled.load(Ordering::SeqCst));
    assert!(rig.mock.state.ena_off_count.load(Ordering::SeqCst) >= 1);

    let ctx = rig.store.charging_context();
    assert!(!ctx.is_active);
    assert_eq!(ctx.current_ampere, 0.0);
    assert!(ctx.invariants_hold());
    assert_eq!(
        rig.store.settings().charging_strategy.active_strategy,
        ChargingStrategy::Off
    );
    assert!(!rig.store.control_state().battery_lock);
}

#[tokio::test]
async fn input_falling_edge_stops_and_persists_off() {
    let rig = common::rig_with(x1_settings("true")).await;

    rig.listener
        .handle_broadcast(&serde_json::json!({"Input": 0}))
        .await;
    rig.listener
        .handle_broadcast(&serde_json::json!({"Input": 1}))
        .await;
    assert!(rig.mock.state.enabled.load(Ordering::SeqCst));

    rig.listener
        .handle_broadcast(&serde_json::json!({"Input": 0}))
        .await;

    assert!(!rig.mock.state.enabled.load(Ordering::SeqCst));
    let ctx = rig.store.charging_context();
    assert!(!ctx.is_active);
    assert_eq!(ctx.strategy, ChargingStrategy::Off);
    assert_eq!(
        rig.store.settings().charging_strategy.active_strategy,
        ChargingStrategy::Off
    );
}

#[tokio::test]
async fn plug_transitions_fire_only_on_seven_edges() {
    let mut settings = x1_settings("true");
    settings.mock_wallbox_plug_status = 0;
    let rig = common::rig_with(settings).await;

    for plug in [1u8, 3, 5] {
        rig.listener
            .handle_broadcast(&serde_json::json!({"Plug": plug}))
            .await;
    }
    // Intermediate transitions produce no plug notifications
    let events = rig.notifier.snapshot();
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, helia::notify::NotifyEvent::PlugConnected
                | helia::notify::NotifyEvent::PlugDisconnected))
    );

    rig.listener
        .handle_broadcast(&serde_json::json!({"Plug": 7}))
        .await;
    let events = rig.notifier.snapshot();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, helia::notify::NotifyEvent::PlugConnected))
    );

    rig.listener
        .handle_broadcast(&serde_json::json!({"Plug": 5}))
        .await;
    let events = rig.notifier.snapshot();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, helia::notify::NotifyEvent::PlugDisconnected))
    );

    // Plug tracking followed along
    assert_eq!(rig.store.plug_tracking().last_plug_status, 5);
}

#[tokio::test]
async fn session_energy_broadcast_pushes_partial_update() {
    let rig = common::rig_with(x1_settings("true")).await;
    let mut sse_rx = rig.sse.subscribe();

    rig.listener
        .handle_broadcast(&serde_json::json!({"E pres": 22444}))
        .await;

    let event = tokio::time::timeout(std::time::Duration::from_secs(1), sse_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event_name(), "wallbox-partial");
    let payload: serde_json::Value = serde_json::from_str(&event.payload()).unwrap();
    assert_eq!(payload["ePres"], 2244.4);
    assert!(payload.get("lastUpdated").is_some());
}
