//! Charging strategy engine
//!
//! A single-writer reactive state machine: inverter snapshots (and a 15 s
//! fallback tick) drive evaluations that start, stop and adjust the charging
//! session. At most one evaluation runs at a time; snapshots arriving while
//! one is in flight coalesce to the latest value.

use crate::e3dc::{CliGateway, LiveData, LiveDataHub};
use crate::error::Result;
use crate::logging::{LogCategory, StructuredLogger, get_logger};
use crate::notify::{Notifier, NotifyEvent};
use crate::sse::StatusBroadcaster;
use crate::state::ChargingStrategy;
use crate::store::Store;
use crate::wallbox::status::{StatusService, TargetFn};
use crate::wallbox::transport::WallboxTransport;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

mod controller;
mod surplus;

pub use surplus::{
    BATTERY_DRAIN_CLAMP_A, BATTERY_DRAIN_CLAMP_SECONDS, BATTERY_DRAIN_THRESHOLD_W,
    calculate_surplus, calculate_target_current, phases_for_start,
};

/// Fallback evaluation interval when no snapshots arrive
const FALLBACK_TICK_SECONDS: u64 = 15;

/// Small mutable state outside the store
struct EvalState {
    /// Armed while the battery discharges beyond the protection threshold
    battery_drain_since: Option<Instant>,
    /// Plug status read during the last reconciliation
    last_plug: Option<u8>,
}

/// The strategy state machine
pub struct StrategyController {
    store: Arc<dyn Store>,
    transport: Arc<WallboxTransport>,
    status: Arc<StatusService>,
    cli: Arc<CliGateway>,
    hub: Arc<LiveDataHub>,
    notifier: Arc<dyn Notifier>,
    sse: Arc<StatusBroadcaster>,
    target: TargetFn,
    /// Serializes evaluations and externally triggered transitions
    eval_lock: tokio::sync::Mutex<()>,
    inner: std::sync::Mutex<EvalState>,
    logger: StructuredLogger,
}

impl StrategyController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<WallboxTransport>,
        status: Arc<StatusService>,
        cli: Arc<CliGateway>,
        hub: Arc<LiveDataHub>,
        notifier: Arc<dyn Notifier>,
        sse: Arc<StatusBroadcaster>,
        target: TargetFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            status,
            cli,
            hub,
            notifier,
            sse,
            target,
            eval_lock: tokio::sync::Mutex::new(()),
            inner: std::sync::Mutex::new(EvalState {
                battery_drain_since: None,
                last_plug: None,
            }),
            logger: get_logger(LogCategory::Strategy),
        })
    }

    /// React to snapshots until shutdown; the running evaluation always
    /// completes before the loop exits
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut live_rx = self.hub.subscribe();
        let mut fallback =
            tokio::time::interval(std::time::Duration::from_secs(FALLBACK_TICK_SECONDS));
        fallback.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.logger.info("Strategy controller started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                res = live_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                    // Latest-wins: intermediate snapshots are overwritten
                    let live = *live_rx.borrow_and_update();
                    if let Some(live) = live {
                        self.evaluate(live).await;
                    }
                }
                _ = fallback.tick() => {
                    if let Some(live) = self.hub.latest() {
                        self.evaluate(live).await;
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.logger.info("Strategy controller stopped");
    }

    /// One serialized evaluation; transient errors leave the context unchanged
    pub async fn evaluate(&self, live: LiveData) {
        let _guard = self.eval_lock.lock().await;
        if let Err(e) = self.evaluate_inner(live).await {
            self.logger.warn(&format!("Evaluation skipped: {}", e));
        }
    }

    /// Change the active strategy (web surface and X1 path)
    pub async fn set_strategy(&self, strategy: ChargingStrategy) -> Result<()> {
        let previous = self.store.settings().charging_strategy.active_strategy;
        self.store
            .update_settings(&|s| s.charging_strategy.active_strategy = strategy)?;
        self.logger.info(&format!(
            "Active strategy changed: {} -> {}",
            previous.as_str(),
            strategy.as_str()
        ));

        if strategy == ChargingStrategy::Off {
            let _guard = self.eval_lock.lock().await;
            return self.stop_for_off().await;
        }

        self.sync_battery_lock(previous, strategy).await;

        // Max strategies can start without inverter data; surplus strategies
        // wait for the next snapshot
        if strategy.is_max() || self.hub.latest().is_some() {
            let live = self.hub.latest().unwrap_or_default();
            self.evaluate(live).await;
        }
        Ok(())
    }

    /// Stop charging and fall back to `off` (web surface)
    pub async fn stop(&self) -> Result<()> {
        self.store
            .update_settings(&|s| s.charging_strategy.active_strategy = ChargingStrategy::Off)?;
        let _guard = self.eval_lock.lock().await;
        self.stop_for_off().await
    }

    /// Align the persisted battery-lock flag with the strategy requirement
    async fn sync_battery_lock(&self, previous: ChargingStrategy, next: ChargingStrategy) {
        let locked = self.store.control_state().battery_lock;
        if next.requires_battery_lock() && !locked {
            match self.cli.set_battery_lock(true).await {
                Ok(()) => {
                    let _ = self
                        .store
                        .update_control_state(&|c| c.battery_lock = true);
                    self.notifier.notify(NotifyEvent::BatteryLockActivated);
                }
                Err(e) => {
                    self.logger
                        .error(&format!("Battery lock activation failed: {}", e));
                    self.notifier.notify(NotifyEvent::StrategyError {
                        message: format!("Battery lock activation failed: {}", e),
                    });
                }
            }
        } else if !next.requires_battery_lock() && locked && previous.requires_battery_lock() {
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
    }

    /// Whether the battery-protection clamp currently applies
    fn battery_clamp_active(&self, live: &LiveData) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if live.battery_power < BATTERY_DRAIN_THRESHOLD_W {
            let since = inner.battery_drain_since.get_or_insert_with(Instant::now);
            since.elapsed().as_secs() >= BATTERY_DRAIN_CLAMP_SECONDS
        } else {
            inner.battery_drain_since = None;
            false
        }
    }

    fn remember_plug(&self, plug: u8) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.last_plug = Some(plug);
        }
    }

    fn last_plug(&self) -> Option<u8> {
        self.inner.lock().ok().and_then(|i| i.last_plug)
    }
}
