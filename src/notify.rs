//! Fire-and-forget event notifications
//!
//! Subsystems report noteworthy events through the `Notifier` seam; delivery
//! (smartphone push, home automation, ...) is an external concern. Failures
//! never propagate to the caller.

use crate::logging::{JournalLevel, LogCategory};

/// Events emitted by the control subsystems
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyEvent {
    PlugConnected,
    PlugDisconnected,
    ChargingStarted {
        strategy: crate::state::ChargingStrategy,
        ampere: f64,
        phases: u8,
    },
    ChargingStopped {
        reason: String,
    },
    CurrentAdjusted {
        from_ampere: f64,
        to_ampere: f64,
    },
    BatteryLockActivated,
    BatteryLockReleased,
    NightChargingStarted {
        grid_charge: bool,
    },
    NightChargingStopped,
    E3dcConnectionLost,
    E3dcConnectionRestored,
    StrategyError {
        message: String,
    },
}

impl NotifyEvent {
    /// Short human-readable form used by the journal notifier
    pub fn describe(&self) -> String {
        match self {
            NotifyEvent::PlugConnected => "Vehicle connected".to_string(),
            NotifyEvent::PlugDisconnected => "Vehicle disconnected".to_string(),
            NotifyEvent::ChargingStarted {
                strategy,
                ampere,
                phases,
            } => format!(
                "Charging started ({}, {:.0} A, {}P)",
                strategy.as_str(),
                ampere,
                phases
            ),
            NotifyEvent::ChargingStopped { reason } => {
                format!("Charging stopped: {}", reason)
            }
            NotifyEvent::CurrentAdjusted {
                from_ampere,
                to_ampere,
            } => format!(
                "Charging current adjusted {:.0} A -> {:.0} A",
                from_ampere, to_ampere
            ),
            NotifyEvent::BatteryLockActivated => "Battery discharge lock activated".to_string(),
            NotifyEvent::BatteryLockReleased => "Battery discharge lock released".to_string(),
            NotifyEvent::NightChargingStarted { grid_charge } => {
                if *grid_charge {
                    "Night charging started with grid charging".to_string()
                } else {
                    "Night charging started".to_string()
                }
            }
            NotifyEvent::NightChargingStopped => "Night charging stopped".to_string(),
            NotifyEvent::E3dcConnectionLost => "Home power plant connection lost".to_string(),
            NotifyEvent::E3dcConnectionRestored => {
                "Home power plant connection restored".to_string()
            }
            NotifyEvent::StrategyError { message } => format!("Strategy error: {}", message),
        }
    }
}

/// Fire-and-forget event hook
pub trait Notifier: Send + Sync {
    fn notify(&self, event: NotifyEvent);
}

/// Default notifier: records events in the journal
pub struct JournalNotifier;

impl Notifier for JournalNotifier {
    fn notify(&self, event: NotifyEvent) {
        let level = match &event {
            NotifyEvent::StrategyError { .. } | NotifyEvent::E3dcConnectionLost => {
                JournalLevel::Warning
            }
            _ => JournalLevel::Info,
        };
        crate::logging::journal::record(level, LogCategory::Notification, &event.describe(), None);
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records events for assertions
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub events: Mutex<Vec<NotifyEvent>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, event: NotifyEvent) {
            if let Ok(mut events) = self.events.lock() {
                events.push(event);
            }
        }
    }

    impl RecordingNotifier {
        pub fn snapshot(&self) -> Vec<NotifyEvent> {
            self.events
                .lock()
                .map(|e| e.clone())
                .unwrap_or_default()
        }
    }
}
