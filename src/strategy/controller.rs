//! Evaluation body of the strategy controller
//!
//! Reconciliation against wallbox ground truth, start/stop hysteresis,
//! current adjustment pacing and the `off` transition.

use super::surplus::{calculate_surplus, calculate_target_current, phases_for_start};
use super::StrategyController;
use crate::config::ChargingStrategySettings;
use crate::e3dc::LiveData;
use crate::error::{HeliaError, Result};
use crate::notify::NotifyEvent;
use crate::state::{ChargingContext, ChargingStrategy, MIN_CURRENT, max_current_for};
use crate::wallbox::{PLUG_CAR_LOCKED, STATE_CHARGING, field_f64, field_u8};
use chrono::{DateTime, Utc};

/// Current adjustments at or above this delta fire a notification (A)
const ADJUSTMENT_NOTIFY_THRESHOLD_A: f64 = 4.0;

/// Per-phase current above which a phase counts during reconciliation (mA)
const RECONCILE_PHASE_THRESHOLD_MA: f64 = 500.0;

/// `report 3` power above which the device counts as really charging (µW)
const REALLY_CHARGING_POWER_UW: f64 = 1_000_000.0;

impl StrategyController {
    pub(super) async fn evaluate_inner(&self, live: LiveData) -> Result<()> {
        let settings = self.store.settings();
        let cfg = settings.charging_strategy.clone();
        let active = cfg.active_strategy;

        // The night scheduler is authoritative while its window is open
        if self.store.control_state().night_charging {
            self.logger
                .debug("Night charging window open, evaluation deferred");
            return Ok(());
        }

        if active == ChargingStrategy::Off {
            return match self.stop_for_off().await {
                Err(HeliaError::Conflict { .. }) => Ok(()),
                other => other,
            };
        }

        // Ground truth first: a stale context must not drive commands
        let plug = self.reconcile(active).await?;

        let surplus = calculate_surplus(active, &live);
        let clamp = self.battery_clamp_active(&live);
        let mut ctx = self.store.charging_context();
        ctx.strategy = active;
        ctx.calculated_surplus = surplus;

        let now = Utc::now();
        if ctx.is_active
            && decide_stop(
                &cfg,
                active,
                surplus,
                settings.e3dc.polling_interval_seconds,
                now,
                &mut ctx,
            )
        {
            self.persist_context(&ctx)?;
            return self.stop_charging("surplus too low").await;
        }

        let phases = if ctx.is_active {
            ctx.current_phases
        } else {
            phases_for_start(active, cfg.physical_phase_switch)
        };

        match calculate_target_current(active, surplus, phases, clamp) {
            None => {
                if ctx.is_active && active == ChargingStrategy::SurplusBatteryPrio {
                    // The battery has absolute priority
                    self.persist_context(&ctx)?;
                    return self.stop_charging("surplus below battery reservation").await;
                }
                // Vehicle-priority keeps running: a 1P->3P transition by the
                // wallbox momentarily looks like "below threshold" in 1P math
                self.persist_context(&ctx)?;
            }
            Some(target) => {
                if ctx.is_active {
                    self.persist_context(&ctx)?;
                    self.adjust_current(target, &cfg).await?;
                } else {
                    let start = decide_start(&cfg, active, surplus, plug, now, &mut ctx);
                    self.persist_context(&ctx)?;
                    if start {
                        self.start_charging(target, phases, active).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Compare the context with `report 2`/`report 3` and correct it; returns
    /// the plug status for the start hysteresis
    pub(super) async fn reconcile(&self, strategy: ChargingStrategy) -> Result<Option<u8>> {
        let target = (self.target)()?;
        let report_2 = self.transport.send_command(target, "report 2").await?;
        let report_3 = self.transport.send_command(target, "report 3").await?;

        let state = field_u8(&report_2, "State").unwrap_or(0);
        let plug = field_u8(&report_2, "Plug").unwrap_or(0);
        let power_uw = field_f64(&report_3, "P").unwrap_or(0.0);
        let currents_ma = [
            field_f64(&report_3, "I1").unwrap_or(0.0),
            field_f64(&report_3, "I2").unwrap_or(0.0),
            field_f64(&report_3, "I3").unwrap_or(0.0),
        ];

        let really_charging = state == STATE_CHARGING && power_uw > REALLY_CHARGING_POWER_UW;
        let phases = if strategy.is_max() {
            match currents_ma
                .iter()
                .filter(|&&ma| ma > RECONCILE_PHASE_THRESHOLD_MA)
                .count()
            {
                0 => 3,
                1 => 1,
                _ => 3,
            }
        } else {
            1
        };

        let before = self.store.charging_context();
        if before.is_active && !really_charging {
            self.logger
                .info("Context says charging but the wallbox does not, marking inactive");
            self.store
                .update_charging_context(&|ctx| ctx.mark_inactive())?;
        } else if !before.is_active && really_charging {
            let max_ma = currents_ma.iter().cloned().fold(0.0f64, f64::max);
            let ampere = (max_ma / 1000.0)
                .round()
                .clamp(MIN_CURRENT, max_current_for(phases));
            let now = Utc::now();
            self.logger.info(&format!(
                "Wallbox is charging outside our bookkeeping, adopting session ({:.0} A, {}P)",
                ampere, phases
            ));
            // The fresh lastStartedAt grants the rediscovered session the
            // stabilization grace
            self.store
                .update_charging_context(&|ctx| ctx.mark_active(ampere, phases, now))?;
        } else if before.is_active && before.current_phases != phases {
            self.logger.debug(&format!(
                "Correcting phase count {} -> {}",
                before.current_phases, phases
            ));
            self.store
                .update_charging_context(&|ctx| ctx.current_phases = phases)?;
        }

        self.remember_plug(plug);
        Ok(Some(plug))
    }

    /// Begin a session: enable, set the current, book the session
    pub(super) async fn start_charging(
        &self,
        ampere: f64,
        phases: u8,
        strategy: ChargingStrategy,
    ) -> Result<()> {
        let target = (self.target)()?;
        self.transport.send_command(target, "ena 1").await?;
        self.transport
            .send_command(target, &format!("curr {}", (ampere * 1000.0) as u32))
            .await?;

        let now = Utc::now();
        self.store
            .update_charging_context(&|ctx| ctx.mark_active(ampere, phases, now))?;
        if strategy.is_surplus() {
            let _ = self.store.update_control_state(&|c| c.pv_surplus = true);
        }
        self.logger.info(&format!(
            "Charging started: {} at {:.0} A on {}P",
            strategy.as_str(),
            ampere,
            phases
        ));
        self.notifier.notify(NotifyEvent::ChargingStarted {
            strategy,
            ampere,
            phases,
        });
        let _ = self.status.refresh().await;
        Ok(())
    }

    /// End the session; sends `ena 0` only while the context says active
    pub(super) async fn stop_charging(&self, reason: &str) -> Result<()> {
        let ctx = self.store.charging_context();
        if !ctx.is_active {
            return Ok(());
        }
        let target = (self.target)()?;
        self.transport.send_command(target, "ena 0").await?;
        self.store
            .update_charging_context(&|c| c.mark_inactive())?;
        let _ = self.store.update_control_state(&|c| c.pv_surplus = false);
        self.logger.info(&format!("Charging stopped: {}", reason));
        self.notifier.notify(NotifyEvent::ChargingStopped {
            reason: reason.to_string(),
        });
        let _ = self.status.refresh().await;
        Ok(())
    }

    /// Pace `curr` commands: small deltas are buffered, close ones wait for
    /// the minimum interval
    pub(super) async fn adjust_current(
        &self,
        target_ampere: f64,
        cfg: &ChargingStrategySettings,
    ) -> Result<()> {
        let mut ctx = self.store.charging_context();
        let delta = (target_ampere - ctx.current_ampere).abs();
        if delta < cfg.min_current_change_ampere {
            ctx.target_ampere = target_ampere;
            return self.persist_context(&ctx);
        }

        let now = Utc::now();
        if let Some(last) = ctx.last_adjustment
            && (now - last).num_seconds() < cfg.min_change_interval_seconds as i64
        {
            // Too soon; keep the target buffered for the next tick
            ctx.target_ampere = target_ampere;
            return self.persist_context(&ctx);
        }

        let wallbox = (self.target)()?;
        self.transport
            .send_command(wallbox, &format!("curr {}", (target_ampere * 1000.0) as u32))
            .await?;

        let from = ctx.current_ampere;
        ctx.current_ampere = target_ampere;
        ctx.target_ampere = target_ampere;
        ctx.last_adjustment = Some(now);
        ctx.adjustment_count += 1;
        self.persist_context(&ctx)?;

        self.logger.info(&format!(
            "Charging current adjusted {:.1} A -> {:.1} A",
            from, target_ampere
        ));
        self.sse
            .send_partial(serde_json::json!({ "maxCurr": target_ampere }));
        if delta >= ADJUSTMENT_NOTIFY_THRESHOLD_A {
            self.notifier.notify(NotifyEvent::CurrentAdjusted {
                from_ampere: from,
                to_ampere: target_ampere,
            });
        }
        Ok(())
    }

    /// Transition to `off`; refuses while the night scheduler has authority
    pub(super) async fn stop_for_off(&self) -> Result<()> {
        let settings_strategy = self.store.settings().charging_strategy.active_strategy;
        let ctx = self.store.charging_context();
        if !ctx.is_active
            && ctx.strategy == ChargingStrategy::Off
            && settings_strategy == ChargingStrategy::Off
        {
            self.logger.debug("Already off");
            return Ok(());
        }
        if self.store.control_state().night_charging {
            return Err(HeliaError::conflict(
                "Night charging holds authority over the wallbox",
            ));
        }

        let previous = if ctx.strategy != ChargingStrategy::Off {
            ctx.strategy
        } else {
            settings_strategy
        };
        self.stop_charging("strategy off").await?;

        if previous.requires_battery_lock() && self.store.control_state().battery_lock {
            match self.cli.set_battery_lock(false).await {
                Ok(()) => {
                    let _ = self
                        .store
                        .update_control_state(&|c| c.battery_lock = false);
                    self.notifier.notify(NotifyEvent::BatteryLockReleased);
                }
                Err(e) => {
                    self.logger
                        .error(&format!("Battery lock release failed: {}", e));
                }
            }
        }

        self.store
            .update_charging_context(&|c| c.strategy = ChargingStrategy::Off)?;
        self.store
            .update_settings(&|s| s.charging_strategy.active_strategy = ChargingStrategy::Off)?;
        Ok(())
    }

    /// X1 0->1: activate the configured strategy. The max-without-battery
    /// fast path starts the wallbox before the battery lock is confirmed and
    /// rolls back when the lock fails.
    pub async fn handle_input_activation(&self, strategy: ChargingStrategy) -> Result<()> {
        let _guard = self.eval_lock.lock().await;
        if strategy == ChargingStrategy::MaxWithoutBattery {
            let settings = self.store.settings();
            let phases = phases_for_start(strategy, settings.charging_strategy.physical_phase_switch);
            let ampere = max_current_for(phases);
            let target = (self.target)()?;

            self.transport.send_command(target, "ena 1").await?;
            self.transport
                .send_command(target, &format!("curr {}", (ampere * 1000.0) as u32))
                .await?;
            let now = Utc::now();
            self.store.update_charging_context(&|ctx| {
                ctx.mark_active(ampere, phases, now);
                ctx.strategy = strategy;
            })?;
            self.notifier.notify(NotifyEvent::ChargingStarted {
                strategy,
                ampere,
                phases,
            });
            let _ = self.status.refresh().await;

            if let Err(e) = self.cli.set_battery_lock(true).await {
                self.logger.error(&format!(
                    "Battery lock failed after fast start, rolling back: {}",
                    e
                ));
                let _ = self.transport.send_command(target, "ena 0").await;
                let _ = self.store.update_charging_context(&|ctx| ctx.mark_inactive());
                self.notifier.notify(NotifyEvent::StrategyError {
                    message: format!("Battery lock activation failed: {}", e),
                });
                let _ = self.status.refresh().await;
                return Err(e);
            }
            let _ = self.store.update_control_state(&|c| c.battery_lock = true);
            self.notifier.notify(NotifyEvent::BatteryLockActivated);
            return Ok(());
        }

        // Surplus / max-with-battery: secure the lock, the event loop starts
        // once inverter data arrives
        let previous = self.store.settings().charging_strategy.active_strategy;
        self.sync_battery_lock(previous, strategy).await;
        Ok(())
    }

    /// X1 1->0: halt the wallbox right away; the lock release happens in the
    /// background because the wallbox has already stopped
    pub async fn handle_input_deactivation(&self) -> Result<()> {
        let _guard = self.eval_lock.lock().await;
        let was_active = self.store.charging_context().is_active;
        let target = (self.target)()?;
        self.transport.send_command(target, "ena 0").await?;
        self.store
            .update_charging_context(&|ctx| ctx.mark_inactive())?;
        let _ = self.store.update_control_state(&|c| c.pv_surplus = false);
        if was_active {
            self.notifier.notify(NotifyEvent::ChargingStopped {
                reason: "input X1 released".to_string(),
            });
        }
        let _ = self.status.refresh().await;

        let store = std::sync::Arc::clone(&self.store);
        let cli = std::sync::Arc::clone(&self.cli);
        let notifier = std::sync::Arc::clone(&self.notifier);
        let logger = self.logger.clone();
        let _ = tokio::spawn(async move {
            if store.control_state().battery_lock {
                match cli.set_battery_lock(false).await {
                    Ok(()) => {
                        let _ = store.update_control_state(&|c| c.battery_lock = false);
                        notifier.notify(NotifyEvent::BatteryLockReleased);
                    }
                    Err(e) => logger.warn(&format!("Battery lock release failed: {}", e)),
                }
            }
        });
        Ok(())
    }

    /// Plug status from the most recent reconciliation (for the web surface)
    pub fn cached_plug(&self) -> Option<u8> {
        self.last_plug()
    }

    fn persist_context(&self, ctx: &ChargingContext) -> Result<()> {
        let snapshot = ctx.clone();
        self.store
            .update_charging_context(&move |c| *c = snapshot.clone())?;
        Ok(())
    }
}

/// Start hysteresis: max strategies start on a locked plug, surplus
/// strategies require the surplus to hold for the configured delay
pub(crate) fn decide_start(
    cfg: &ChargingStrategySettings,
    strategy: ChargingStrategy,
    surplus: f64,
    plug: Option<u8>,
    now: DateTime<Utc>,
    ctx: &mut ChargingContext,
) -> bool {
    if strategy.is_max() {
        return plug == Some(PLUG_CAR_LOCKED);
    }
    if surplus < cfg.min_start_power_watt as f64 {
        ctx.start_delay_tracker_since = None;
        ctx.remaining_start_delay = 0;
        return false;
    }
    match ctx.start_delay_tracker_since {
        None => {
            ctx.start_delay_tracker_since = Some(now);
            ctx.remaining_start_delay = cfg.start_delay_seconds;
            false
        }
        Some(since) => {
            let elapsed = (now - since).num_seconds().max(0) as u32;
            if elapsed >= cfg.start_delay_seconds {
                ctx.start_delay_tracker_since = None;
                ctx.remaining_start_delay = 0;
                // Second look at the plug: without a car the timer is cleared
                plug == Some(PLUG_CAR_LOCKED)
            } else {
                ctx.remaining_start_delay = cfg.start_delay_seconds - elapsed;
                false
            }
        }
    }
}

/// Stop hysteresis: never for max strategies, and suppressed entirely during
/// the stabilization grace after a start
pub(crate) fn decide_stop(
    cfg: &ChargingStrategySettings,
    strategy: ChargingStrategy,
    surplus: f64,
    polling_interval_seconds: u32,
    now: DateTime<Utc>,
    ctx: &mut ChargingContext,
) -> bool {
    if !strategy.is_surplus() {
        return false;
    }
    if let Some(started) = ctx.last_started_at {
        // The inverter snapshot needs a cycle or two to reflect the new load
        let grace = 2 * polling_interval_seconds as i64;
        if (now - started).num_seconds() < grace {
            return false;
        }
    }
    if surplus < cfg.stop_threshold_watt as f64 {
        match ctx.below_threshold_since {
            None => {
                ctx.below_threshold_since = Some(now);
                ctx.remaining_stop_delay = cfg.stop_delay_seconds;
                false
            }
            Some(since) => {
                let elapsed = (now - since).num_seconds().max(0) as u32;
                if elapsed >= cfg.stop_delay_seconds {
                    ctx.below_threshold_since = None;
                    ctx.remaining_stop_delay = 0;
                    true
                } else {
                    ctx.remaining_stop_delay = cfg.stop_delay_seconds - elapsed;
                    false
                }
            }
        }
    } else {
        ctx.below_threshold_since = None;
        ctx.remaining_stop_delay = 0;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cfg() -> ChargingStrategySettings {
        ChargingStrategySettings::default()
    }

    #[test]
    fn start_requires_surplus_to_hold_for_the_delay() {
        let cfg = cfg();
        let mut ctx = ChargingContext::default();
        let t0 = Utc::now();
        let surplus = cfg.min_start_power_watt as f64;

        // First reading arms the timer
        assert!(!decide_start(
            &cfg,
            ChargingStrategy::SurplusBatteryPrio,
            surplus,
            Some(7),
            t0,
            &mut ctx
        ));
        assert!(ctx.start_delay_tracker_since.is_some());
        assert_eq!(ctx.remaining_start_delay, cfg.start_delay_seconds);

        // Halfway: countdown updates
        let halfway = t0 + Duration::seconds(cfg.start_delay_seconds as i64 / 2);
        assert!(!decide_start(
            &cfg,
            ChargingStrategy::SurplusBatteryPrio,
            surplus,
            Some(7),
            halfway,
            &mut ctx
        ));
        assert!(ctx.remaining_start_delay > 0);
        assert!(ctx.remaining_start_delay < cfg.start_delay_seconds);

        // Exactly at the delay: start
        let fire = t0 + Duration::seconds(cfg.start_delay_seconds as i64);
        assert!(decide_start(
            &cfg,
            ChargingStrategy::SurplusBatteryPrio,
            surplus,
            Some(7),
            fire,
            &mut ctx
        ));
        assert!(ctx.start_delay_tracker_since.is_none());
    }

    #[test]
    fn start_timer_resets_below_threshold() {
        let cfg = cfg();
        let mut ctx = ChargingContext::default();
        let t0 = Utc::now();
        decide_start(
            &cfg,
            ChargingStrategy::SurplusVehiclePrio,
            5000.0,
            Some(7),
            t0,
            &mut ctx,
        );
        assert!(ctx.start_delay_tracker_since.is_some());

        // One reading below the threshold clears the timer
        decide_start(
            &cfg,
            ChargingStrategy::SurplusVehiclePrio,
            100.0,
            Some(7),
            t0 + Duration::seconds(10),
            &mut ctx,
        );
        assert!(ctx.start_delay_tracker_since.is_none());
        assert_eq!(ctx.remaining_start_delay, 0);
    }

    #[test]
    fn start_timer_firing_without_a_car_clears_instead_of_starting() {
        let cfg = cfg();
        let mut ctx = ChargingContext::default();
        let t0 = Utc::now();
        decide_start(
            &cfg,
            ChargingStrategy::SurplusBatteryPrio,
            5000.0,
            Some(7),
            t0,
            &mut ctx,
        );
        let fire = t0 + Duration::seconds(cfg.start_delay_seconds as i64);
        assert!(!decide_start(
            &cfg,
            ChargingStrategy::SurplusBatteryPrio,
            5000.0,
            Some(1),
            fire,
            &mut ctx
        ));
        assert!(ctx.start_delay_tracker_since.is_none());
    }

    #[test]
    fn max_strategies_start_on_locked_plug_only() {
        let cfg = cfg();
        let mut ctx = ChargingContext::default();
        let now = Utc::now();
        assert!(decide_start(
            &cfg,
            ChargingStrategy::MaxWithBattery,
            0.0,
            Some(7),
            now,
            &mut ctx
        ));
        assert!(!decide_start(
            &cfg,
            ChargingStrategy::MaxWithoutBattery,
            0.0,
            Some(5),
            now,
            &mut ctx
        ));
        assert!(!decide_start(
            &cfg,
            ChargingStrategy::MaxWithoutBattery,
            0.0,
            None,
            now,
            &mut ctx
        ));
    }

    #[test]
    fn stop_fires_after_the_delay_below_threshold() {
        let cfg = cfg();
        let mut ctx = ChargingContext::default();
        let t0 = Utc::now();
        ctx.mark_active(8.0, 1, t0 - Duration::seconds(3600));
        let below = cfg.stop_threshold_watt as f64 - 1.0;

        assert!(!decide_stop(
            &cfg,
            ChargingStrategy::SurplusBatteryPrio,
            below,
            10,
            t0,
            &mut ctx
        ));
        assert!(ctx.below_threshold_since.is_some());

        let fire = t0 + Duration::seconds(cfg.stop_delay_seconds as i64);
        assert!(decide_stop(
            &cfg,
            ChargingStrategy::SurplusBatteryPrio,
            below,
            10,
            fire,
            &mut ctx
        ));
    }

    #[test]
    fn stop_timer_clears_on_recovery() {
        let cfg = cfg();
        let mut ctx = ChargingContext::default();
        let t0 = Utc::now();
        ctx.mark_active(8.0, 1, t0 - Duration::seconds(3600));

        decide_stop(
            &cfg,
            ChargingStrategy::SurplusVehiclePrio,
            0.0,
            10,
            t0,
            &mut ctx,
        );
        assert!(ctx.below_threshold_since.is_some());

        decide_stop(
            &cfg,
            ChargingStrategy::SurplusVehiclePrio,
            cfg.stop_threshold_watt as f64 + 1.0,
            10,
            t0 + Duration::seconds(30),
            &mut ctx,
        );
        assert!(ctx.below_threshold_since.is_none());
        assert_eq!(ctx.remaining_stop_delay, 0);
    }

    #[test]
    fn stabilization_grace_suppresses_stop_checks() {
        let cfg = cfg();
        let mut ctx = ChargingContext::default();
        let t0 = Utc::now();
        ctx.mark_active(8.0, 1, t0);

        // Within 2 * polling interval nothing happens, not even arming
        assert!(!decide_stop(
            &cfg,
            ChargingStrategy::SurplusBatteryPrio,
            0.0,
            10,
            t0 + Duration::seconds(19),
            &mut ctx
        ));
        assert!(ctx.below_threshold_since.is_none());

        // After the grace the timer arms
        assert!(!decide_stop(
            &cfg,
            ChargingStrategy::SurplusBatteryPrio,
            0.0,
            10,
            t0 + Duration::seconds(20),
            &mut ctx
        ));
        assert!(ctx.below_threshold_since.is_some());
    }

    #[test]
    fn stop_never_fires_for_max_strategies() {
        let cfg = cfg();
        let mut ctx = ChargingContext::default();
        let t0 = Utc::now();
        ctx.mark_active(16.0, 3, t0 - Duration::seconds(3600));
        assert!(!decide_stop(
            &cfg,
            ChargingStrategy::MaxWithBattery,
            0.0,
            10,
            t0,
            &mut ctx
        ));
        assert!(!decide_stop(
            &cfg,
            ChargingStrategy::MaxWithoutBattery,
            0.0,
            10,
            t0,
            &mut ctx
        ));
        assert!(ctx.below_threshold_since.is_none());
    }
}
