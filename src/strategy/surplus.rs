//! Surplus and target-current computation
//!
//! Pure functions over one inverter snapshot. The inverter reports house
//! power including the wallbox, so the wallbox share is subtracted before
//! any strategy math.

use crate::e3dc::LiveData;
use crate::state::{
    BATTERY_SOC_RESERVATION_THRESHOLD, ChargingStrategy, MAX_BATTERY_CHARGING_POWER, MIN_CURRENT,
    PHASE_VOLTAGE, max_current_for,
};

/// Safety margin applied to the battery-priority surplus
const BATTERY_PRIO_MARGIN: f64 = 0.90;

/// Battery discharge (W) beyond which the protection clamp arms
pub const BATTERY_DRAIN_THRESHOLD_W: f64 = -500.0;

/// How long the discharge must persist before the clamp applies (s)
pub const BATTERY_DRAIN_CLAMP_SECONDS: u64 = 120;

/// Amperes removed by the battery-protection clamp
pub const BATTERY_DRAIN_CLAMP_A: f64 = 2.0;

/// Watts of PV power available to the wallbox under the given strategy
pub fn calculate_surplus(strategy: ChargingStrategy, live: &LiveData) -> f64 {
    let house_no_wb = live.house_power - live.wallbox_power;
    match strategy {
        ChargingStrategy::Off => 0.0,
        ChargingStrategy::SurplusBatteryPrio => {
            let total_surplus = live.pv_power - house_no_wb;
            let reservation = if live.battery_soc < BATTERY_SOC_RESERVATION_THRESHOLD {
                total_surplus.min(MAX_BATTERY_CHARGING_POWER)
            } else {
                // Near full the battery only draws its taper power
                live.battery_power.max(0.0)
            };
            ((total_surplus - reservation) * BATTERY_PRIO_MARGIN).max(0.0)
        }
        ChargingStrategy::SurplusVehiclePrio => {
            // Only the discharging component of the battery counts as available
            (live.pv_power - house_no_wb + live.battery_power.min(0.0)).max(0.0)
        }
        ChargingStrategy::MaxWithBattery => {
            (live.pv_power + live.battery_power.min(0.0).abs() - house_no_wb).max(0.0)
        }
        ChargingStrategy::MaxWithoutBattery => (live.pv_power - house_no_wb).max(0.0),
    }
}

/// Phase count a new session would start with
pub fn phases_for_start(strategy: ChargingStrategy, physical_phase_switch: u8) -> u8 {
    if strategy.is_max() {
        if physical_phase_switch == 3 { 3 } else { 1 }
    } else {
        // Surplus strategies always start single-phase: the 6 A minimum is
        // 1380 W on one phase versus 4140 W on three
        1
    }
}

/// Target current in amperes, or `None` when the surplus cannot carry the
/// minimum charging power
pub fn calculate_target_current(
    strategy: ChargingStrategy,
    surplus: f64,
    phases: u8,
    battery_clamp_active: bool,
) -> Option<f64> {
    let phases = if phases >= 3 { 3u8 } else { 1u8 };
    if strategy.is_max() {
        return Some(max_current_for(phases));
    }
    if !strategy.is_surplus() {
        return None;
    }

    let min_power = MIN_CURRENT * PHASE_VOLTAGE * phases as f64;
    if surplus < min_power {
        return None;
    }
    let mut amps = (surplus / (PHASE_VOLTAGE * phases as f64)).round();
    amps = amps.clamp(MIN_CURRENT, max_current_for(phases));
    if strategy == ChargingStrategy::SurplusVehiclePrio && battery_clamp_active {
        amps = (amps - BATTERY_DRAIN_CLAMP_A).max(MIN_CURRENT);
    }
    Some(amps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn live(pv: f64, house_no_wb: f64, soc: u8, battery: f64) -> LiveData {
        LiveData {
            pv_power: pv,
            battery_power: battery,
            battery_soc: soc,
            // house power includes the wallbox; tests express house-without-wallbox
            house_power: house_no_wb + 2300.0,
            wallbox_power: 2300.0,
            grid_power: 0.0,
            autarky: 0,
            self_consumption: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn battery_prio_reserves_full_charging_power_below_threshold() {
        let surplus = calculate_surplus(
            ChargingStrategy::SurplusBatteryPrio,
            &live(6000.0, 1000.0, 50, 2000.0),
        );
        assert_eq!(surplus, 1800.0);
    }

    #[test]
    fn battery_prio_reserves_taper_power_above_threshold() {
        let surplus = calculate_surplus(
            ChargingStrategy::SurplusBatteryPrio,
            &live(6000.0, 1000.0, 98, 800.0),
        );
        assert_eq!(surplus, 3780.0);
    }

    #[test]
    fn vehicle_prio_counts_only_battery_discharge() {
        // Battery charging must not look like free watts
        let charging = calculate_surplus(
            ChargingStrategy::SurplusVehiclePrio,
            &live(5000.0, 1000.0, 60, 1500.0),
        );
        assert_eq!(charging, 4000.0);

        let discharging = calculate_surplus(
            ChargingStrategy::SurplusVehiclePrio,
            &live(5000.0, 1000.0, 60, -1500.0),
        );
        assert_eq!(discharging, 2500.0);
    }

    #[test]
    fn max_strategies_floor_at_zero() {
        let with_battery = calculate_surplus(
            ChargingStrategy::MaxWithBattery,
            &live(1000.0, 2000.0, 40, -800.0),
        );
        assert_eq!(with_battery, 0.0); // 1000 + 800 - 2000 < 0

        let without = calculate_surplus(
            ChargingStrategy::MaxWithoutBattery,
            &live(3000.0, 1000.0, 40, 0.0),
        );
        assert_eq!(without, 2000.0);
    }

    #[test]
    fn off_has_no_surplus() {
        assert_eq!(
            calculate_surplus(ChargingStrategy::Off, &live(9000.0, 0.0, 50, 0.0)),
            0.0
        );
    }

    #[test]
    fn target_current_rounds_and_clamps() {
        // 2300 W on one phase -> 10 A
        assert_eq!(
            calculate_target_current(ChargingStrategy::SurplusBatteryPrio, 2300.0, 1, false),
            Some(10.0)
        );
        // 1725 W -> 7.5 -> 8 A
        assert_eq!(
            calculate_target_current(ChargingStrategy::SurplusBatteryPrio, 1725.0, 1, false),
            Some(8.0)
        );
        // 1400 W -> 6 A, still above the 1380 W minimum
        assert_eq!(
            calculate_target_current(ChargingStrategy::SurplusBatteryPrio, 1400.0, 1, false),
            Some(6.0)
        );
        // 1300 W cannot carry 6 A at 230 V
        assert_eq!(
            calculate_target_current(ChargingStrategy::SurplusBatteryPrio, 1300.0, 1, false),
            None
        );
        // Clamp to the 1P ceiling
        assert_eq!(
            calculate_target_current(ChargingStrategy::SurplusBatteryPrio, 9_000.0, 1, false),
            Some(32.0)
        );
    }

    #[test]
    fn max_strategies_charge_at_the_phase_ceiling() {
        assert_eq!(
            calculate_target_current(ChargingStrategy::MaxWithoutBattery, 0.0, 1, false),
            Some(32.0)
        );
        assert_eq!(
            calculate_target_current(ChargingStrategy::MaxWithBattery, 0.0, 3, false),
            Some(16.0)
        );
    }

    #[test]
    fn battery_clamp_reduces_vehicle_prio_only() {
        assert_eq!(
            calculate_target_current(ChargingStrategy::SurplusVehiclePrio, 2300.0, 1, true),
            Some(8.0)
        );
        // Never below the 6 A minimum
        assert_eq!(
            calculate_target_current(ChargingStrategy::SurplusVehiclePrio, 1400.0, 1, true),
            Some(6.0)
        );
        // Battery-priority ignores the clamp flag
        assert_eq!(
            calculate_target_current(ChargingStrategy::SurplusBatteryPrio, 2300.0, 1, true),
            Some(10.0)
        );
    }

    #[test]
    fn start_phases_follow_strategy() {
        assert_eq!(
            phases_for_start(ChargingStrategy::MaxWithoutBattery, 3),
            3
        );
        assert_eq!(phases_for_start(ChargingStrategy::MaxWithBattery, 1), 1);
        // Invalid configured value falls back to one phase
        assert_eq!(phases_for_start(ChargingStrategy::MaxWithoutBattery, 2), 1);
        assert_eq!(phases_for_start(ChargingStrategy::SurplusBatteryPrio, 3), 1);
    }
}
