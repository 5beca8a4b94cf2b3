//! Night-charging scheduler
//!
//! A minute-aligned wall-clock check opens and closes the nightly window.
//! ControlState flags are committed before any external call so an adjacent
//! tick cannot re-issue the sequence, and they roll back atomically when the
//! inverter call fails.

use crate::e3dc::CliGateway;
use crate::error::Result;
use crate::logging::{LogCategory, StructuredLogger, get_logger};
use crate::notify::{Notifier, NotifyEvent};
use crate::state::ControlState;
use crate::store::Store;
use crate::wallbox::status::TargetFn;
use crate::wallbox::transport::WallboxTransport;
use chrono::{Timelike, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Parse "HH:MM" into minutes since midnight
pub fn parse_hhmm(s: &str) -> u32 {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 2 {
        return 0;
    }
    let h = parts[0].parse::<u32>().unwrap_or(0) % 24;
    let m = parts[1].parse::<u32>().unwrap_or(0) % 60;
    h * 60 + m
}

/// Whether `minutes_now` lies inside `[start, end)`; windows with end before
/// start wrap across midnight
pub fn within_window(minutes_now: u32, start: u32, end: u32) -> bool {
    if start == end {
        return false;
    }
    if start < end {
        minutes_now >= start && minutes_now < end
    } else {
        minutes_now >= start || minutes_now < end
    }
}

pub struct NightChargingScheduler {
    store: Arc<dyn Store>,
    cli: Arc<CliGateway>,
    transport: Arc<WallboxTransport>,
    target: TargetFn,
    notifier: Arc<dyn Notifier>,
    /// Prevents overlapping entry/exit sequences across adjacent ticks
    operation_in_progress: AtomicBool,
    logger: StructuredLogger,
}

impl NightChargingScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        cli: Arc<CliGateway>,
        transport: Arc<WallboxTransport>,
        target: TargetFn,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cli,
            transport,
            target,
            notifier,
            operation_in_progress: AtomicBool::new(false),
            logger: get_logger(LogCategory::Scheduler),
        })
    }

    /// Minute-aligned tick loop
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.logger.info("Night-charging scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let seconds_into_minute = Utc::now().second() as u64;
            let until_next_minute = Duration::from_secs(60 - seconds_into_minute.min(59));
            tokio::select! {
                _ = sleep(until_next_minute) => {
                    self.tick().await;
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.logger.info("Night-charging scheduler stopped");
    }

    /// One wall-clock check
    pub async fn tick(&self) {
        if self
            .operation_in_progress
            .swap(true, Ordering::SeqCst)
        {
            self.logger.debug("Night-charging operation already running");
            return;
        }
        let result = self.tick_inner().await;
        self.operation_in_progress.store(false, Ordering::SeqCst);
        if let Err(e) = result {
            self.logger.error(&format!("Night-charging tick failed: {}", e));
        }
    }

    async fn tick_inner(&self) -> Result<()> {
        let settings = self.store.settings();
        let schedule = &settings.night_charging_schedule;
        let control = self.store.control_state();

        let tz: chrono_tz::Tz = settings.timezone.parse().unwrap_or(chrono_tz::UTC);
        let local = Utc::now().with_timezone(&tz);
        let minutes_now = local.hour() * 60 + local.minute();
        let inside = schedule.enabled
            && within_window(
                minutes_now,
                parse_hhmm(&schedule.start_time),
                parse_hhmm(&schedule.end_time),
            );

        if inside && !control.night_charging {
            self.enter(&settings).await
        } else if control.night_charging && !inside {
            self.exit(control).await
        } else {
            Ok(())
        }
    }

    /// Open the window: commit the flags, one combined inverter call, then
    /// start the wallbox
    async fn enter(&self, settings: &crate::config::Settings) -> Result<()> {
        let grid_charge =
            settings.e3dc.grid_charge_during_night_charging && settings.e3dc.enabled;
        let previous = self.store.control_state();

        // Flags first, so the next tick sees the window as handled
        self.store.update_control_state(&move |c| {
            c.night_charging = true;
            c.battery_lock = true;
            c.grid_charging = grid_charge;
        })?;
        self.logger.info(&format!(
            "Entering night-charging window (grid charge: {})",
            grid_charge
        ));

        if settings.e3dc.enabled
            && let Err(e) = self.cli.enable_night_charging(grid_charge).await
        {
            // Roll every flag back in one write
            self.store
                .update_control_state(&move |c| *c = previous)?;
            self.logger
                .error(&format!("Night-charging entry failed, rolled back: {}", e));
            return Err(e);
        }

        let target = (self.target)()?;
        self.transport.send_command(target, "ena 1").await?;

        self.notifier
            .notify(NotifyEvent::NightChargingStarted { grid_charge });
        self.notifier.notify(NotifyEvent::BatteryLockActivated);
        Ok(())
    }

    /// Close the window: mirror image of the entry
    async fn exit(&self, previous: ControlState) -> Result<()> {
        let settings = self.store.settings();
        let grid_charge = previous.grid_charging;

        self.store.update_control_state(&|c| {
            c.night_charging = false;
            c.battery_lock = false;
            c.grid_charging = false;
        })?;
        self.logger.info("Leaving night-charging window");

        let target = (self.target)()?;
        if let Err(e) = self.transport.send_command(target, "ena 0").await {
            self.store
                .update_control_state(&move |c| *c = previous)?;
            self.logger
                .error(&format!("Night-charging exit failed, rolled back: {}", e));
            return Err(e);
        }

        if settings.e3dc.enabled
            && let Err(e) = self.cli.disable_night_charging(grid_charge).await
        {
            self.store
                .update_control_state(&move |c| *c = previous)?;
            self.logger
                .error(&format!("Night-charging exit failed, rolled back: {}", e));
            return Err(e);
        }

        self.notifier.notify(NotifyEvent::NightChargingStopped);
        self.notifier.notify(NotifyEvent::BatteryLockReleased);
        Ok(())
    }
}
