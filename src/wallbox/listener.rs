//! Spontaneous-broadcast listener
//!
//! Subscribes to the UDP channel bus and reacts to the four telegram fields
//! the wallbox pushes on its own: `Plug`, `State`, `E pres` and `Input`.
//! The X1 input drives strategy activation; whatever happens inside the
//! controller, the computed target strategy is persisted afterwards so the
//! contact and the stored strategy never diverge.

use super::status::StatusService;
use super::udp::{ChannelMessage, UdpChannel};
use super::{PLUG_CAR_LOCKED, field_f64, field_u8};
use crate::e3dc::poller::PollerControl;
use crate::logging::{LogCategory, StructuredLogger, get_logger};
use crate::notify::{Notifier, NotifyEvent};
use crate::sse::StatusBroadcaster;
use crate::state::{ChargingStrategy, PlugTracking};
use crate::store::Store;
use crate::strategy::StrategyController;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Last in-memory observations, separate from the persisted tracking
#[derive(Default)]
struct Observed {
    plug: Option<u8>,
    state: Option<u8>,
    e_pres: Option<f64>,
    input: Option<u8>,
}

pub struct BroadcastListener {
    channel: Arc<UdpChannel>,
    store: Arc<dyn Store>,
    controller: Arc<StrategyController>,
    status: Arc<StatusService>,
    sse: Arc<StatusBroadcaster>,
    notifier: Arc<dyn Notifier>,
    poller_control: Arc<PollerControl>,
    observed: Mutex<Observed>,
    logger: StructuredLogger,
}

impl BroadcastListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: Arc<UdpChannel>,
        store: Arc<dyn Store>,
        controller: Arc<StrategyController>,
        status: Arc<StatusService>,
        sse: Arc<StatusBroadcaster>,
        notifier: Arc<dyn Notifier>,
        poller_control: Arc<PollerControl>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            store,
            controller,
            status,
            sse,
            notifier,
            poller_control,
            observed: Mutex::new(Observed::default()),
            logger: get_logger(LogCategory::Wallbox),
        })
    }

    /// Consume bus messages until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut bus = self.channel.subscribe();
        self.logger.info("Broadcast listener started");
        loop {
            tokio::select! {
                message = bus.recv() => {
                    match message {
                        Ok(ChannelMessage::Datagram(datagram)) => {
                            if let Some(json) = &datagram.json {
                                self.handle_broadcast(json).await;
                            }
                        }
                        Ok(ChannelMessage::Stopped) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            self.logger.warn(&format!("Dropped {} broadcasts", n));
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.logger.info("Broadcast listener stopped");
    }

    /// Handle one JSON telegram; the four fields react independently
    pub async fn handle_broadcast(&self, json: &serde_json::Value) {
        if let Some(plug) = field_u8(json, "Plug") {
            self.handle_plug(plug).await;
        }
        if let Some(state) = field_u8(json, "State") {
            self.handle_state(state);
        }
        if let Some(raw) = field_f64(json, "E pres") {
            self.handle_session_energy(raw);
        }
        if let Some(input) = field_u8(json, "Input") {
            self.handle_input(input).await;
        }
    }

    async fn handle_plug(&self, plug: u8) {
        let previous = {
            let Ok(mut observed) = self.observed.lock() else {
                return;
            };
            // First observation compares against the persisted tracking
            let previous = observed
                .plug
                .unwrap_or_else(|| self.store.plug_tracking().last_plug_status);
            observed.plug = Some(plug);
            previous
        };
        if plug == previous {
            return;
        }

        self.logger
            .info(&format!("Plug status changed {} -> {}", previous, plug));
        let _ = self.store.set_plug_tracking(PlugTracking {
            last_plug_status: plug,
            last_plug_change: Some(chrono::Utc::now()),
        });

        if plug == PLUG_CAR_LOCKED {
            self.notifier.notify(NotifyEvent::PlugConnected);
        } else if previous == PLUG_CAR_LOCKED {
            self.notifier.notify(NotifyEvent::PlugDisconnected);
        }

        // Fresh poll right away: reset both idle throttles
        self.status.reset_idle_throttle();
        self.poller_control.nudge();
        let status = Arc::clone(&self.status);
        let _ = tokio::spawn(async move {
            status.refresh_throttled(false).await;
        });
    }

    fn handle_state(&self, state: u8) {
        let first = {
            let Ok(mut observed) = self.observed.lock() else {
                return;
            };
            let first = observed.state.is_none();
            let changed = observed.state != Some(state);
            observed.state = Some(state);
            if !changed {
                return;
            }
            first
        };
        if first {
            return;
        }

        // Immediate partial with the new state, full fetch follows
        self.sse.send_partial(serde_json::json!({ "state": state }));
        self.status.reset_idle_throttle();
        self.poller_control.nudge();
        let status = Arc::clone(&self.status);
        let _ = tokio::spawn(async move {
            status.refresh_throttled(false).await;
        });
    }

    fn handle_session_energy(&self, raw: f64) {
        let changed = {
            let Ok(mut observed) = self.observed.lock() else {
                return;
            };
            let changed = observed.e_pres != Some(raw);
            observed.e_pres = Some(raw);
            changed
        };
        if changed {
            // The device reports 0.1 Wh ticks
            self.sse
                .send_partial(serde_json::json!({ "ePres": raw / 10.0 }));
        }
    }

    async fn handle_input(&self, input: u8) {
        let previous = {
            let Ok(mut observed) = self.observed.lock() else {
                return;
            };
            let previous = observed.input;
            observed.input = Some(input);
            previous
        };
        let Some(previous) = previous else {
            // Baseline observation after startup produces no action
            self.logger
                .debug(&format!("Input X1 baseline observed: {}", input));
            return;
        };
        if previous == input {
            return;
        }
        self.logger
            .info(&format!("Input X1 transition {} -> {}", previous, input));

        let mut target: Option<ChargingStrategy> = None;
        if previous == 0 && input == 1 {
            let strategy = self.store.settings().charging_strategy.input_x1_strategy;
            target = Some(strategy);
            if let Err(e) = self.controller.handle_input_activation(strategy).await {
                self.logger
                    .error(&format!("X1 activation of {} failed: {}", strategy.as_str(), e));
                if strategy == ChargingStrategy::MaxWithoutBattery {
                    // Fast path rolled back; the strategy must not be persisted
                    target = None;
                }
            }
        } else if previous == 1 && input == 0 {
            target = Some(ChargingStrategy::Off);
            if let Err(e) = self.controller.handle_input_deactivation().await {
                self.logger.error(&format!("X1 deactivation failed: {}", e));
            }
        }

        self.status.reset_idle_throttle();
        self.poller_control.nudge();

        // Regardless of controller errors, Input and the persisted strategy
        // must not diverge
        if let Some(strategy) = target {
            let _ = self
                .store
                .update_charging_context(&move |ctx| ctx.strategy = strategy);
            let _ = self
                .store
                .update_settings(&move |s| s.charging_strategy.active_strategy = strategy);
        }
    }
}
