//! Home power plant (E3/DC) integration
//!
//! Modbus/TCP register access, the adaptive background poller, the live-data
//! hub, and the vendor CLI gateway.

use crate::error::{HeliaError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod cli;
pub mod hub;
pub mod poller;

pub use cli::CliGateway;
pub use hub::LiveDataHub;
pub use poller::E3dcPoller;

/// Register block read each cycle, 0-based offsets
pub const REG_PV_POWER: u16 = 67;
pub const REG_BATTERY_POWER: u16 = 69;
pub const REG_HOUSE_POWER: u16 = 71;
pub const REG_GRID_POWER: u16 = 73;
pub const REG_AUTARKY: u16 = 81;
pub const REG_BATTERY_SOC: u16 = 82;

/// Modbus unit id of the inverter
pub const UNIT_ID: u8 = 1;

/// One inverter snapshot
///
/// Sign conventions: `battery_power` > 0 charges the battery, `grid_power` > 0
/// imports from the grid. `house_power` includes the wallbox.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveData {
    pub pv_power: f64,
    pub battery_power: f64,
    pub battery_soc: u8,
    pub house_power: f64,
    pub grid_power: f64,
    pub wallbox_power: f64,
    pub autarky: u8,
    pub self_consumption: u8,
    pub timestamp: DateTime<Utc>,
}

impl Default for LiveData {
    fn default() -> Self {
        Self {
            pv_power: 0.0,
            battery_power: 0.0,
            battery_soc: 0,
            house_power: 0.0,
            grid_power: 0.0,
            wallbox_power: 0.0,
            autarky: 0,
            self_consumption: 0,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// Decode a 32-bit signed value from two registers, least-significant word first
pub fn parse_int32(low: u16, high: u16) -> i32 {
    (((high as u32) << 16) | (low as u32)) as i32
}

/// Split register 81 into autarky (high byte) and self-consumption (low byte)
pub fn parse_autarky_pair(raw: u16) -> (u8, u8) {
    ((raw >> 8) as u8, (raw & 0xFF) as u8)
}

/// Decode the raw register block of one poll cycle into a snapshot
///
/// `regs` must cover offsets 67..=82 (16 registers starting at 67).
pub fn decode_live_data(regs: &[u16], wallbox_power: f64, now: DateTime<Utc>) -> Result<LiveData> {
    if regs.len() < 16 {
        return Err(HeliaError::modbus(format!(
            "Register block too short: {} of 16",
            regs.len()
        )));
    }
    let at = |offset: u16| regs[(offset - REG_PV_POWER) as usize];
    let int32_at = |offset: u16| parse_int32(at(offset), at(offset + 1)) as f64;

    let (autarky, self_consumption) = parse_autarky_pair(at(REG_AUTARKY));
    Ok(LiveData {
        pv_power: int32_at(REG_PV_POWER),
        battery_power: int32_at(REG_BATTERY_POWER),
        battery_soc: (at(REG_BATTERY_SOC) & 0xFF) as u8,
        house_power: int32_at(REG_HOUSE_POWER),
        grid_power: int32_at(REG_GRID_POWER),
        wallbox_power,
        autarky,
        self_consumption,
        timestamp: now,
    })
}
