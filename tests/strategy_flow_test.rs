//! End-to-end strategy evaluation against the mock wallbox.

mod common;

use chrono::{Duration, Utc};
use helia::config::Settings;
use helia::state::ChargingStrategy;
use std::sync::atomic::Ordering;

fn surplus_settings(strategy: ChargingStrategy) -> Settings {
    let mut settings = Settings::default();
    settings.mock_wallbox_plug_status = 7;
    settings.mock_wallbox_phases = 1;
    settings.charging_strategy.active_strategy = strategy;
    settings
}

#[tokio::test]
async fn matured_start_delay_starts_charging() {
    let rig = common::rig_with(surplus_settings(ChargingStrategy::SurplusBatteryPrio)).await;
    let delay = rig.store.settings().charging_strategy.start_delay_seconds;

    // The start-delay timer has been running long enough
    let armed_at = Utc::now() - Duration::seconds(delay as i64 + 1);
    rig.store
        .update_charging_context(&move |ctx| {
            ctx.start_delay_tracker_since = Some(armed_at);
        })
        .unwrap();

    // pv 6000, house 1000, battery full: 4500 W available to the wallbox
    rig.controller
        .evaluate(common::live(6000.0, 1000.0, 98, 0.0))
        .await;

    let ctx = rig.store.charging_context();
    assert!(ctx.is_active, "session should have started");
    assert_eq!(ctx.current_phases, 1);
    assert_eq!(ctx.current_ampere, 20.0); // round(4500 / 230)
    assert!(ctx.invariants_hold());
    assert!(rig.mock.state.enabled.load(Ordering::SeqCst));
    assert_eq!(rig.mock.state.max_curr_ma.load(Ordering::SeqCst), 20_000);
    assert!(
        rig.notifier
            .snapshot()
            .iter()
            .any(|e| matches!(e, helia::notify::NotifyEvent::ChargingStarted { .. }))
    );
}

#[tokio::test]
async fn surplus_below_start_threshold_arms_the_timer_but_does_not_start() {
    let rig = common::rig_with(surplus_settings(ChargingStrategy::SurplusBatteryPrio)).await;

    // 4500 W available: above the threshold, timer arms on first sight
    rig.controller
        .evaluate(common::live(6000.0, 1000.0, 98, 0.0))
        .await;

    let ctx = rig.store.charging_context();
    assert!(!ctx.is_active);
    assert!(ctx.start_delay_tracker_since.is_some());
    assert!(ctx.remaining_start_delay > 0);
    assert!(!rig.mock.state.enabled.load(Ordering::SeqCst));
    assert!(ctx.invariants_hold());
}

#[tokio::test]
async fn sustained_low_surplus_stops_the_session() {
    let rig = common::rig_with(surplus_settings(ChargingStrategy::SurplusBatteryPrio)).await;
    let stop_delay = rig.store.settings().charging_strategy.stop_delay_seconds;

    // A long-running session whose surplus has been below the threshold for
    // longer than the stop delay
    rig.mock.state.enabled.store(true, Ordering::SeqCst);
    rig.store
        .update_charging_context(&move |ctx| {
            ctx.mark_active(10.0, 1, Utc::now() - Duration::seconds(3600));
            ctx.strategy = ChargingStrategy::SurplusBatteryPrio;
            ctx.below_threshold_since =
                Some(Utc::now() - Duration::seconds(stop_delay as i64 + 1));
        })
        .unwrap();

    rig.controller
        .evaluate(common::live(0.0, 500.0, 50, 0.0))
        .await;

    let ctx = rig.store.charging_context();
    assert!(!ctx.is_active);
    assert_eq!(ctx.current_ampere, 0.0);
    assert!(ctx.invariants_hold());
    assert!(!rig.mock.state.enabled.load(Ordering::SeqCst));
    assert!(
        rig.notifier
            .snapshot()
            .iter()
            .any(|e| matches!(e, helia::notify::NotifyEvent::ChargingStopped { .. }))
    );
}

#[tokio::test]
async fn fresh_session_is_protected_by_the_stabilization_grace() {
    let rig = common::rig_with(surplus_settings(ChargingStrategy::SurplusBatteryPrio)).await;

    rig.mock.state.enabled.store(true, Ordering::SeqCst);
    // Session started moments ago; surplus collapsed immediately
    rig.store
        .update_charging_context(&|ctx| {
            ctx.mark_active(10.0, 1, Utc::now());
            ctx.strategy = ChargingStrategy::SurplusBatteryPrio;
        })
        .unwrap();

    rig.controller
        .evaluate(common::live(0.0, 500.0, 50, 0.0))
        .await;

    // No stop: the inverter snapshot has not yet caught up with the new load
    let ctx = rig.store.charging_context();
    assert!(ctx.is_active);
    assert!(ctx.below_threshold_since.is_none());
    assert!(rig.mock.state.enabled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn small_target_changes_are_buffered_by_the_pacing_rules() {
    let rig = common::rig_with(surplus_settings(ChargingStrategy::SurplusVehiclePrio)).await;

    rig.mock.state.enabled.store(true, Ordering::SeqCst);
    rig.mock.state.max_curr_ma.store(10_000, Ordering::SeqCst);
    // Active at 10 A with an adjustment just sent
    rig.store
        .update_charging_context(&|ctx| {
            ctx.mark_active(10.0, 1, Utc::now() - Duration::seconds(3600));
            ctx.strategy = ChargingStrategy::SurplusVehiclePrio;
            ctx.last_adjustment = Some(Utc::now());
        })
        .unwrap();

    // 3450 W on one phase computes to 15 A, but the minimum change interval
    // has not elapsed: the target is buffered
    rig.controller
        .evaluate(common::live(3450.0, 0.0, 50, 0.0))
        .await;

    let ctx = rig.store.charging_context();
    assert!(ctx.is_active);
    assert_eq!(ctx.current_ampere, 10.0);
    assert_eq!(ctx.target_ampere, 15.0);
    assert_eq!(rig.mock.state.max_curr_ma.load(Ordering::SeqCst), 10_000);

    // Once the interval has passed, the buffered change goes out
    let interval = rig.store.settings().charging_strategy.min_change_interval_seconds;
    rig.store
        .update_charging_context(&move |ctx| {
            ctx.last_adjustment = Some(Utc::now() - Duration::seconds(interval as i64 + 1));
        })
        .unwrap();
    rig.controller
        .evaluate(common::live(3450.0, 0.0, 50, 0.0))
        .await;

    let ctx = rig.store.charging_context();
    assert_eq!(ctx.current_ampere, 15.0);
    assert_eq!(rig.mock.state.max_curr_ma.load(Ordering::SeqCst), 15_000);
    assert!(ctx.adjustment_count >= 1);
}

#[tokio::test]
async fn reconciliation_adopts_a_session_started_behind_our_back() {
    let rig = common::rig_with(surplus_settings(ChargingStrategy::SurplusVehiclePrio)).await;

    // The wallbox is charging but the context knows nothing about it
    rig.mock.state.enabled.store(true, Ordering::SeqCst);
    rig.mock.state.max_curr_ma.store(8_000, Ordering::SeqCst);

    rig.controller
        .evaluate(common::live(3000.0, 0.0, 50, 0.0))
        .await;

    let ctx = rig.store.charging_context();
    assert!(ctx.is_active, "reconciliation should adopt the session");
    assert_eq!(ctx.current_phases, 1);
    assert!(ctx.current_ampere >= 6.0);
    assert!(ctx.last_started_at.is_some());
    assert!(ctx.invariants_hold());
}

#[tokio::test]
async fn reconciliation_clears_a_stale_active_context() {
    let rig = common::rig_with(surplus_settings(ChargingStrategy::SurplusVehiclePrio)).await;

    // Context claims a session but the wallbox is idle
    rig.store
        .update_charging_context(&|ctx| {
            ctx.mark_active(10.0, 1, Utc::now() - Duration::seconds(3600));
            ctx.strategy = ChargingStrategy::SurplusVehiclePrio;
        })
        .unwrap();

    rig.controller
        .evaluate(common::live(3000.0, 0.0, 50, 0.0))
        .await;

    let ctx = rig.store.charging_context();
    assert!(!ctx.is_active);
    assert_eq!(ctx.current_ampere, 0.0);
    assert!(ctx.invariants_hold());
}

#[tokio::test]
async fn stop_for_off_sends_ena_zero_exactly_once() {
    let rig = common::rig_with(surplus_settings(ChargingStrategy::Off)).await;

    // An active session left over while the strategy is already off
    rig.mock.state.enabled.store(true, Ordering::SeqCst);
    rig.store
        .update_charging_context(&|ctx| {
            ctx.mark_active(10.0, 1, Utc::now());
            ctx.strategy = ChargingStrategy::SurplusVehiclePrio;
        })
        .unwrap();

    rig.controller
        .evaluate(common::live(0.0, 0.0, 50, 0.0))
        .await;
    rig.controller
        .evaluate(common::live(0.0, 0.0, 50, 0.0))
        .await;

    assert_eq!(rig.mock.state.ena_off_count.load(Ordering::SeqCst), 1);
    let ctx = rig.store.charging_context();
    assert!(!ctx.is_active);
    assert_eq!(ctx.strategy, ChargingStrategy::Off);
    assert_eq!(
        rig.store.settings().charging_strategy.active_strategy,
        ChargingStrategy::Off
    );
}

#[tokio::test]
async fn night_charging_takes_authority_over_evaluations() {
    let rig = common::rig_with(surplus_settings(ChargingStrategy::SurplusBatteryPrio)).await;

    rig.store
        .update_control_state(&|c| c.night_charging = true)
        .unwrap();
    rig.mock.state.enabled.store(true, Ordering::SeqCst);

    // Even a collapse to zero surplus must not touch the wallbox
    rig.controller
        .evaluate(common::live(0.0, 500.0, 50, 0.0))
        .await;

    assert!(rig.mock.state.enabled.load(Ordering::SeqCst));
    assert_eq!(rig.mock.state.ena_off_count.load(Ordering::SeqCst), 0);
}
