//! Persistent runtime state shared by the control subsystems
//!
//! `ControlState`, `ChargingContext` and `PlugTracking` outlive the process
//! through the store; `ChargingContext` is reconciled against wallbox ground
//! truth on the first strategy tick after a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Nominal phase voltage (V)
pub const PHASE_VOLTAGE: f64 = 230.0;

/// Smallest current the wallbox accepts (A)
pub const MIN_CURRENT: f64 = 6.0;

/// Current ceiling when charging single-phase (A)
pub const MAX_CURRENT_1P: f64 = 32.0;

/// Current ceiling when charging three-phase (A)
pub const MAX_CURRENT_3P: f64 = 16.0;

/// Power reserved for the house battery while it is below the SOC threshold (W)
pub const MAX_BATTERY_CHARGING_POWER: f64 = 3000.0;

/// SOC at which the battery reservation switches to the taper regime (%)
pub const BATTERY_SOC_RESERVATION_THRESHOLD: u8 = 95;

/// Current ceiling for a phase count
pub fn max_current_for(phases: u8) -> f64 {
    if phases >= 3 { MAX_CURRENT_3P } else { MAX_CURRENT_1P }
}

/// User-selectable charging strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChargingStrategy {
    #[default]
    Off,
    SurplusBatteryPrio,
    SurplusVehiclePrio,
    MaxWithBattery,
    MaxWithoutBattery,
}

impl ChargingStrategy {
    /// Strategies that compute a PV surplus
    pub fn is_surplus(&self) -> bool {
        matches!(
            self,
            ChargingStrategy::SurplusBatteryPrio | ChargingStrategy::SurplusVehiclePrio
        )
    }

    /// Strategies that charge at full current
    pub fn is_max(&self) -> bool {
        matches!(
            self,
            ChargingStrategy::MaxWithBattery | ChargingStrategy::MaxWithoutBattery
        )
    }

    /// Whether the strategy forbids the house battery from discharging
    pub fn requires_battery_lock(&self) -> bool {
        matches!(
            self,
            ChargingStrategy::SurplusBatteryPrio | ChargingStrategy::MaxWithoutBattery
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChargingStrategy::Off => "off",
            ChargingStrategy::SurplusBatteryPrio => "surplus_battery_prio",
            ChargingStrategy::SurplusVehiclePrio => "surplus_vehicle_prio",
            ChargingStrategy::MaxWithBattery => "max_with_battery",
            ChargingStrategy::MaxWithoutBattery => "max_without_battery",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ChargingStrategy::Off),
            "surplus_battery_prio" => Some(ChargingStrategy::SurplusBatteryPrio),
            "surplus_vehicle_prio" => Some(ChargingStrategy::SurplusVehiclePrio),
            "max_with_battery" => Some(ChargingStrategy::MaxWithBattery),
            "max_without_battery" => Some(ChargingStrategy::MaxWithoutBattery),
            _ => None,
        }
    }
}

/// Persistent runtime toggles
///
/// Only the strategy controller and the night scheduler may set
/// `night_charging`, `battery_lock` and `grid_charging`; the web surface
/// toggles `pv_surplus` and `battery_lock` but never `night_charging`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlState {
    pub pv_surplus: bool,
    pub night_charging: bool,
    pub battery_lock: bool,
    pub grid_charging: bool,
}

/// The strategy controller's working set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChargingContext {
    /// Strategy currently being executed (may lag the settings during a transition)
    pub strategy: ChargingStrategy,

    /// Whether a charging session is considered active
    pub is_active: bool,

    /// Current last sent to the wallbox (A); 0 while inactive
    pub current_ampere: f64,

    /// Most recently computed target (A); 0 while inactive
    pub target_ampere: f64,

    /// Phase count of the running session (1 or 3)
    pub current_phases: u8,

    /// Last computed surplus (W)
    pub calculated_surplus: f64,

    /// Number of `curr` adjustments within the session
    pub adjustment_count: u32,

    /// When the last `curr` command went out
    pub last_adjustment: Option<DateTime<Utc>>,

    /// When the session was started
    pub last_started_at: Option<DateTime<Utc>>,

    /// Set while surplus sits below the stop threshold during a session
    pub below_threshold_since: Option<DateTime<Utc>>,

    /// Set while surplus sits above the start threshold before a session
    pub start_delay_tracker_since: Option<DateTime<Utc>>,

    /// Countdown mirror for the UI (s)
    pub remaining_start_delay: u32,

    /// Countdown mirror for the UI (s)
    pub remaining_stop_delay: u32,
}

impl Default for ChargingContext {
    fn default() -> Self {
        Self {
            strategy: ChargingStrategy::Off,
            is_active: false,
            current_ampere: 0.0,
            target_ampere: 0.0,
            current_phases: 1,
            calculated_surplus: 0.0,
            adjustment_count: 0,
            last_adjustment: None,
            last_started_at: None,
            below_threshold_since: None,
            start_delay_tracker_since: None,
            remaining_start_delay: 0,
            remaining_stop_delay: 0,
        }
    }
}

impl ChargingContext {
    /// Mark the session active, keeping the current/target/phase fields consistent
    pub fn mark_active(&mut self, ampere: f64, phases: u8, now: DateTime<Utc>) {
        self.is_active = true;
        self.current_ampere = ampere.clamp(MIN_CURRENT, max_current_for(phases));
        self.target_ampere = self.current_ampere;
        self.current_phases = if phases >= 3 { 3 } else { 1 };
        self.last_started_at = Some(now);
        self.start_delay_tracker_since = None;
        self.remaining_start_delay = 0;
        self.adjustment_count = 0;
    }

    /// Mark the session inactive, zeroing the ampere fields
    pub fn mark_inactive(&mut self) {
        self.is_active = false;
        self.current_ampere = 0.0;
        self.target_ampere = 0.0;
        self.below_threshold_since = None;
        self.remaining_stop_delay = 0;
    }

    /// Check the documented invariants; used by tests and reconciliation
    pub fn invariants_hold(&self) -> bool {
        if self.is_active {
            if self.current_ampere < MIN_CURRENT
                || self.current_ampere > max_current_for(self.current_phases)
            {
                return false;
            }
        } else if self.current_ampere != 0.0 || self.target_ampere != 0.0 {
            return false;
        }
        if self.below_threshold_since.is_some() && !self.is_active {
            return false;
        }
        if self.start_delay_tracker_since.is_some() && self.is_active {
            return false;
        }
        true
    }
}

/// Last observed plug status and when it changed
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlugTracking {
    pub last_plug_status: u8,
    pub last_plug_change: Option<DateTime<Utc>>,
}
