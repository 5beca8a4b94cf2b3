//! Adaptive Modbus poller for the home power plant
//!
//! Reads the live-data register block on a settings-driven interval, decodes
//! it into a snapshot and publishes through the hub. Failures advance a
//! backoff level table; an idle throttle slows polling while nothing is
//! happening. The CLI gateway can pause the poller around grid-charge
//! commands, which the inverter refuses to process while a Modbus client is
//! attached.

use super::{LiveData, REG_PV_POWER, UNIT_ID, decode_live_data};
use crate::error::{HeliaError, Result};
use crate::logging::{LogCategory, StructuredLogger, get_logger};
use crate::notify::{Notifier, NotifyEvent};
use crate::store::Store;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::{sleep, timeout};
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;

/// Failure backoff levels (s)
pub const BACKOFF_LEVELS: [u64; 5] = [10, 30, 60, 300, 600];

/// Minimum effective interval while idle (s)
pub const IDLE_INTERVAL_SECONDS: u64 = 30;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared pause/wake state between the poller task and the CLI gateway
pub struct PollerControl {
    paused: AtomicBool,
    connected: AtomicBool,
    wake: Notify,
}

impl PollerControl {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Ask the poller to release its Modbus connection and wait until it has
    pub async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        // Bounded wait; the poller disconnects on its next wakeup
        for _ in 0..50 {
            if !self.connected.load(Ordering::SeqCst) {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Resume polling after a pause
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Wake the poller out of its interval sleep so a fresh cycle runs now
    pub fn nudge(&self) {
        self.wake.notify_one();
    }
}

impl Default for PollerControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of the wallbox power injected into each snapshot
pub type WallboxPowerFn = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Hook run once per cycle so the wallbox cache refreshes alongside the
/// inverter data; the flag marks whether the site is idle
pub type CycleHook = Arc<dyn Fn(bool) + Send + Sync>;

/// Background poller
pub struct E3dcPoller {
    store: Arc<dyn Store>,
    hub: Arc<super::LiveDataHub>,
    notifier: Arc<dyn Notifier>,
    control: Arc<PollerControl>,
    wallbox_power: WallboxPowerFn,
    cycle_hook: Option<CycleHook>,
    logger: StructuredLogger,
    client: Option<tokio_modbus::client::Context>,
    failure_level: u32,
}

impl E3dcPoller {
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<super::LiveDataHub>,
        notifier: Arc<dyn Notifier>,
        control: Arc<PollerControl>,
        wallbox_power: WallboxPowerFn,
        cycle_hook: Option<CycleHook>,
    ) -> Self {
        Self {
            store,
            hub,
            notifier,
            control,
            wallbox_power,
            cycle_hook,
            logger: get_logger(LogCategory::E3dc),
            client: None,
            failure_level: 0,
        }
    }

    /// Resolve the Modbus endpoint from the settings
    fn endpoint(&self) -> Result<std::net::SocketAddr> {
        let settings = self.store.settings();
        let address = if settings.demo_active() {
            settings.e3dc.demo_host.clone()
        } else {
            if settings.e3dc.ip.is_empty() {
                return Err(HeliaError::not_configured("Inverter IP not set"));
            }
            format!("{}:502", settings.e3dc.ip)
        };
        address
            .parse()
            .map_err(|e| HeliaError::modbus(format!("Invalid socket address {}: {}", address, e)))
    }

    async fn connect(&mut self) -> Result<()> {
        let addr = self.endpoint()?;
        self.logger
            .debug(&format!("Connecting to inverter at {}", addr));
        match timeout(CONNECT_TIMEOUT, tcp::connect_slave(addr, Slave(UNIT_ID))).await {
            Ok(Ok(client)) => {
                self.client = Some(client);
                self.control.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(e)) => Err(HeliaError::modbus(format!(
                "Failed to connect to inverter: {}",
                e
            ))),
            Err(_) => Err(HeliaError::modbus("Inverter connection timeout")),
        }
    }

    fn disconnect(&mut self) {
        if self.client.take().is_some() {
            self.logger.debug("Closed inverter connection");
        }
        self.control.connected.store(false, Ordering::SeqCst);
    }

    /// One register read; a failure closes the connection so the next cycle
    /// reconnects from scratch
    async fn read_block(&mut self) -> Result<Vec<u16>> {
        if self.client.is_none() {
            self.connect().await?;
        }
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| HeliaError::modbus("Not connected to inverter"))?;
        let request = client.read_holding_registers(REG_PV_POWER, 16);
        match timeout(READ_TIMEOUT, request).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(e))) => {
                self.disconnect();
                Err(HeliaError::modbus(format!("Register read failed: {}", e)))
            }
            Ok(Err(e)) => {
                self.disconnect();
                Err(HeliaError::modbus(format!("Register read failed: {}", e)))
            }
            Err(_) => {
                self.disconnect();
                Err(HeliaError::modbus("Register read timeout"))
            }
        }
    }

    /// Execute one poll cycle; returns the published snapshot
    pub async fn poll_once(&mut self) -> Result<LiveData> {
        let regs = self.read_block().await?;
        let wallbox_power = (self.wallbox_power)();
        let live = decode_live_data(&regs, wallbox_power, chrono::Utc::now())?;
        self.hub.publish(live);
        self.logger.trace(&format!(
            "pv={:.0}W batt={:.0}W house={:.0}W grid={:.0}W soc={}%",
            live.pv_power, live.battery_power, live.house_power, live.grid_power, live.battery_soc
        ));
        Ok(live)
    }

    fn record_success(&mut self) {
        if self.failure_level > 0 {
            self.logger.info("Inverter connection restored");
            self.notifier.notify(NotifyEvent::E3dcConnectionRestored);
        }
        self.failure_level = 0;
    }

    fn record_failure(&mut self, err: &HeliaError) {
        if self.failure_level == 0 {
            self.logger
                .warn(&format!("Inverter polling failed: {}", err));
            self.notifier.notify(NotifyEvent::E3dcConnectionLost);
        } else {
            self.logger
                .debug(&format!("Inverter polling still failing: {}", err));
        }
        self.failure_level = (self.failure_level + 1).min(BACKOFF_LEVELS.len() as u32);
    }

    /// Interval until the next cycle, honoring backoff and the idle throttle
    fn next_interval(&self) -> Duration {
        let settings = self.store.settings();
        let base = settings.e3dc.polling_interval_seconds as u64;
        if self.failure_level > 0 {
            let index = (self.failure_level as usize - 1).min(BACKOFF_LEVELS.len() - 1);
            return Duration::from_secs(BACKOFF_LEVELS[index]);
        }
        if self.is_idle() {
            return Duration::from_secs(base.max(IDLE_INTERVAL_SECONDS));
        }
        Duration::from_secs(base)
    }

    /// Idle: no PV production and no strategy selected
    fn is_idle(&self) -> bool {
        let pv_zero = self
            .hub
            .latest()
            .map(|d| d.pv_power == 0.0)
            .unwrap_or(false);
        let strategy_off = self.store.settings().charging_strategy.active_strategy
            == crate::state::ChargingStrategy::Off;
        pv_zero && strategy_off
    }

    /// Poll until shutdown flips
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.logger.info("Inverter poller started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.control.is_paused() {
                self.disconnect();
                tokio::select! {
                    _ = self.control.wake.notified() => {}
                    res = shutdown.changed() => { if res.is_err() { break; } }
                }
                continue;
            }

            if !self.store.settings().e3dc.enabled {
                // Integration disabled: check back occasionally
                tokio::select! {
                    _ = sleep(Duration::from_secs(IDLE_INTERVAL_SECONDS)) => {}
                    res = shutdown.changed() => { if res.is_err() { break; } }
                }
                continue;
            }

            match self.poll_once().await {
                Ok(_) => self.record_success(),
                Err(e) => self.record_failure(&e),
            }

            if let Some(hook) = &self.cycle_hook {
                hook(self.is_idle());
            }

            let interval = self.next_interval();
            tokio::select! {
                _ = sleep(interval) => {}
                _ = self.control.wake.notified() => {}
                res = shutdown.changed() => { if res.is_err() { break; } }
            }
        }
        self.disconnect();
        self.logger.info("Inverter poller stopped");
    }
}
