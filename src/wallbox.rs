//! Wallbox domain types and telegram payload parsing
//!
//! The wallbox speaks a line-oriented UDP telegram protocol: ASCII commands,
//! replies either as JSON objects or bare `TCH-OK :done` / `TCH-ERR :<reason>`
//! acknowledgements, plus spontaneous JSON broadcasts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod listener;
pub mod mock;
pub mod status;
pub mod transport;
pub mod udp;

pub use status::StatusService;
pub use transport::WallboxTransport;
pub use udp::UdpChannel;

/// UDP port the wallbox listens on
pub const WALLBOX_PORT: u16 = 7090;

/// Per-phase current above which a phase counts as active (A)
pub const PHASE_ACTIVE_THRESHOLD_A: f64 = 0.1;

/// Plug status: car present and locked, ready to charge
pub const PLUG_CAR_LOCKED: u8 = 7;

/// Wallbox state code while delivering energy
pub const STATE_CHARGING: u8 = 3;

/// Snapshot assembled from `report 2` and `report 3`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WallboxStatus {
    /// Device state (0..5)
    pub state: u8,
    /// Plug status (0, 1, 3, 5, 7)
    pub plug: u8,
    /// X1 contact (0 or 1)
    pub input: u8,
    /// System enable flag
    pub enable_sys: u8,
    /// Configured current limit (A)
    pub max_curr: f64,
    /// Session energy (Wh)
    pub e_pres: f64,
    /// Lifetime energy (Wh)
    pub e_total: f64,
    /// Charging power (kW)
    pub power: f64,
    /// Active phase count derived from the per-phase currents (0..3)
    pub phases: u8,
    pub i1: f64,
    pub i2: f64,
    pub i3: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Count phases carrying more than the activity threshold
pub fn derive_phases(i1: f64, i2: f64, i3: f64) -> u8 {
    [i1, i2, i3]
        .iter()
        .filter(|&&i| i > PHASE_ACTIVE_THRESHOLD_A)
        .count() as u8
}

/// Parse a reply payload: JSON object first, then the `;`/newline/`=`
/// delimited key-value form. Numeric values become JSON numbers when they
/// parse as floats.
pub fn parse_reply(text: &str) -> serde_json::Value {
    let trimmed = text.trim();
    if trimmed.starts_with('{')
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed)
        && value.is_object()
    {
        return value;
    }

    let mut map = serde_json::Map::new();
    for segment in trimmed.split(['\n', ';']) {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        if let Some((key, value)) = segment.split_once('=') {
            let key = key.trim();
            let value = value.trim();
            let parsed = value
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::String(value.to_string()));
            map.insert(key.to_string(), parsed);
        }
    }
    serde_json::Value::Object(map)
}

/// Read a numeric field from a parsed payload
pub fn field_f64(payload: &serde_json::Value, key: &str) -> Option<f64> {
    match payload.get(key)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Read a numeric field truncated to u8
pub fn field_u8(payload: &serde_json::Value, key: &str) -> Option<u8> {
    field_f64(payload, key).map(|v| v as u8)
}

impl WallboxStatus {
    /// Merge a `report 2` payload (state, plug, input, limits)
    pub fn apply_report_2(&mut self, payload: &serde_json::Value) {
        if let Some(v) = field_u8(payload, "State") {
            self.state = v;
        }
        if let Some(v) = field_u8(payload, "Plug") {
            self.plug = v;
        }
        if let Some(v) = field_u8(payload, "Input") {
            self.input = v;
        }
        if let Some(v) = field_u8(payload, "Enable sys") {
            self.enable_sys = v;
        }
        // Device reports the limit in milliamperes
        if let Some(v) = field_f64(payload, "Max curr") {
            self.max_curr = v / 1000.0;
        }
        self.last_updated = Some(Utc::now());
    }

    /// Merge a `report 3` payload (currents, power, energy)
    pub fn apply_report_3(&mut self, payload: &serde_json::Value) {
        if let Some(v) = field_f64(payload, "I1") {
            self.i1 = v / 1000.0;
        }
        if let Some(v) = field_f64(payload, "I2") {
            self.i2 = v / 1000.0;
        }
        if let Some(v) = field_f64(payload, "I3") {
            self.i3 = v / 1000.0;
        }
        // P is reported in microwatts
        if let Some(v) = field_f64(payload, "P") {
            self.power = v / 1_000_000_000.0;
        }
        // Energy counters tick in 0.1 Wh
        if let Some(v) = field_f64(payload, "E pres") {
            self.e_pres = v / 10.0;
        }
        if let Some(v) = field_f64(payload, "E total") {
            self.e_total = v / 10.0;
        }
        self.phases = derive_phases(self.i1, self.i2, self.i3);
        self.last_updated = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_from_currents_not_voltages() {
        assert_eq!(derive_phases(0.0, 0.0, 0.0), 0);
        assert_eq!(derive_phases(6.2, 0.05, 0.0), 1);
        assert_eq!(derive_phases(10.0, 9.8, 10.1), 3);
        // Exactly at the threshold does not count
        assert_eq!(derive_phases(0.1, 0.0, 0.0), 0);
    }

    #[test]
    fn parse_reply_json_object() {
        let payload = parse_reply(r#"{"ID": "2", "State": 3, "Plug": 7}"#);
        assert_eq!(field_u8(&payload, "State"), Some(3));
        assert_eq!(field_u8(&payload, "Plug"), Some(7));
    }

    #[test]
    fn parse_reply_key_value_fallback() {
        let payload = parse_reply("State=3;Plug=7;Serial=WB1234");
        assert_eq!(field_u8(&payload, "State"), Some(3));
        assert_eq!(
            payload.get("Serial").and_then(|v| v.as_str()),
            Some("WB1234")
        );
    }

    #[test]
    fn parse_reply_malformed_json_falls_back() {
        let payload = parse_reply("{not json");
        assert!(payload.as_object().map(|o| o.is_empty()).unwrap_or(false));
    }

    #[test]
    fn report_2_scales_max_curr_to_amperes() {
        let mut status = WallboxStatus::default();
        status.apply_report_2(&parse_reply(
            r#"{"ID":"2","State":3,"Plug":7,"Input":1,"Enable sys":1,"Max curr":16000}"#,
        ));
        assert_eq!(status.state, 3);
        assert_eq!(status.plug, 7);
        assert_eq!(status.input, 1);
        assert_eq!(status.max_curr, 16.0);
        assert!(status.last_updated.is_some());
    }

    #[test]
    fn report_3_scales_units_and_derives_phases() {
        let mut status = WallboxStatus::default();
        status.apply_report_3(&parse_reply(
            r#"{"ID":"3","I1":10000,"I2":50,"I3":0,"P":2300000000,"E pres":22444,"E total":1234567}"#,
        ));
        assert_eq!(status.i1, 10.0);
        assert_eq!(status.phases, 1);
        assert_eq!(status.power, 2.3);
        assert_eq!(status.e_pres, 2244.4);
        assert_eq!(status.e_total, 123456.7);
    }
}
