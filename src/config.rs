//! Settings management for Helia
//!
//! This module handles loading, validation, and persistence of the settings
//! document from YAML files. Field names follow the camelCase wire format of
//! the web API.

use crate::error::{HeliaError, Result};
use crate::state::ChargingStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;

mod defaults;

/// Main settings structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Wallbox IP address (empty = not configured)
    pub wallbox_ip: String,

    /// Charging strategy tuning
    pub charging_strategy: ChargingStrategySettings,

    /// Home power plant integration
    pub e3dc: E3dcSettings,

    /// Nightly charging window
    pub night_charging_schedule: NightChargingSchedule,

    /// Time zone for the night window
    pub timezone: String,

    /// Run against the built-in mock wallbox and demo Modbus endpoint
    pub demo_mode: bool,

    /// Phase count reported by the mock wallbox
    pub mock_wallbox_phases: u8,

    /// Plug status reported by the mock wallbox
    pub mock_wallbox_plug_status: u8,

    /// Web server binding
    pub web: WebSettings,

    /// Logging configuration
    pub logging: LoggingSettings,

    /// FHEM value bridge
    pub fhem: FhemSettings,
}

/// Charging strategy tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChargingStrategySettings {
    /// Surplus must exceed this before a start is considered (W)
    pub min_start_power_watt: u32,

    /// Surplus below this arms the stop delay (W)
    pub stop_threshold_watt: u32,

    /// Surplus must hold above the start threshold this long (s)
    pub start_delay_seconds: u32,

    /// Surplus must hold below the stop threshold this long (s)
    pub stop_delay_seconds: u32,

    /// Smallest current delta worth sending to the wallbox (A)
    pub min_current_change_ampere: f64,

    /// Minimum spacing between `curr` commands (s)
    pub min_change_interval_seconds: u32,

    /// Physical phase wiring selected at the wallbox (1 or 3)
    pub physical_phase_switch: u8,

    /// Strategy selected by the user
    pub active_strategy: ChargingStrategy,

    /// Strategy activated by the X1 contact (never `off`)
    pub input_x1_strategy: ChargingStrategy,
}

/// Home power plant integration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct E3dcSettings {
    /// Whether the inverter integration is enabled
    pub enabled: bool,

    /// Inverter IP address (empty = not configured)
    pub ip: String,

    /// Path to the vendor CLI binary
    pub cli_command: String,

    /// CLI fragment that activates the discharge lock
    pub discharge_lock_on_command: String,

    /// CLI fragment that releases the discharge lock
    pub discharge_lock_off_command: String,

    /// CLI fragment that starts grid charging
    pub grid_charge_on_command: String,

    /// CLI fragment that stops grid charging
    pub grid_charge_off_command: String,

    /// Seconds the Modbus poller pauses around grid-charge CLI calls (0-30)
    pub modbus_pause_seconds: u32,

    /// Base Modbus polling interval (2-60 s)
    pub polling_interval_seconds: u32,

    /// Charge the house battery from the grid during the night window
    pub grid_charge_during_night_charging: bool,

    /// Alternate Modbus host:port used in demo mode
    pub demo_host: String,

    /// Mock CLI binary used in demo mode
    pub demo_command: String,
}

/// Nightly charging window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NightChargingSchedule {
    pub enabled: bool,

    /// Window opens at this local time ("HH:MM")
    pub start_time: String,

    /// Window closes at this local time ("HH:MM"); may wrap past midnight
    pub end_time: String,
}

/// Web server binding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSettings {
    pub host: String,
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Log level (TRACE, DEBUG, INFO, WARNING, ERROR)
    pub level: String,

    /// Path to log file or directory
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

/// FHEM telnet bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FhemSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

const VALID_PLUG_STATUS: [u8; 5] = [0, 1, 3, 5, 7];

fn validate_hhmm(field: &str, value: &str) -> Result<()> {
    let mut parts = value.split(':');
    let (Some(h), Some(m), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(HeliaError::invalid_input(field, "expected HH:MM"));
    };
    let hours: u32 = h
        .parse()
        .map_err(|_| HeliaError::invalid_input(field, "expected HH:MM"))?;
    let minutes: u32 = m
        .parse()
        .map_err(|_| HeliaError::invalid_input(field, "expected HH:MM"))?;
    if hours > 23 || minutes > 59 {
        return Err(HeliaError::invalid_input(field, "expected HH:MM"));
    }
    Ok(())
}

fn validate_range<T: PartialOrd + std::fmt::Display>(
    field: &str,
    value: T,
    min: T,
    max: T,
) -> Result<()> {
    if value < min || value > max {
        return Err(HeliaError::invalid_input(
            field.to_string(),
            format!("must be between {} and {}", min, max),
        ));
    }
    Ok(())
}

impl Settings {
    /// Load settings from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let settings: Settings = serde_yaml::from_str(&contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default locations
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("HELIA_CONFIG") {
            return Self::from_file(path);
        }

        let default_paths = ["helia.yaml", "/data/helia.yaml", "/etc/helia/config.yaml"];
        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        // Fall back to default settings
        Ok(Settings::default())
    }

    /// Save settings to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate all field ranges
    pub fn validate(&self) -> Result<()> {
        let cs = &self.charging_strategy;
        validate_range(
            "chargingStrategy.minStartPowerWatt",
            cs.min_start_power_watt,
            500,
            5000,
        )?;
        validate_range(
            "chargingStrategy.stopThresholdWatt",
            cs.stop_threshold_watt,
            300,
            3000,
        )?;
        validate_range(
            "chargingStrategy.startDelaySeconds",
            cs.start_delay_seconds,
            30,
            600,
        )?;
        validate_range(
            "chargingStrategy.stopDelaySeconds",
            cs.stop_delay_seconds,
            60,
            900,
        )?;
        validate_range(
            "chargingStrategy.minCurrentChangeAmpere",
            cs.min_current_change_ampere,
            0.1,
            5.0,
        )?;
        validate_range(
            "chargingStrategy.minChangeIntervalSeconds",
            cs.min_change_interval_seconds,
            10,
            300,
        )?;

        if cs.physical_phase_switch != 1 && cs.physical_phase_switch != 3 {
            return Err(HeliaError::invalid_input(
                "chargingStrategy.physicalPhaseSwitch",
                "must be 1 or 3",
            ));
        }
        if cs.input_x1_strategy == ChargingStrategy::Off {
            return Err(HeliaError::invalid_input(
                "chargingStrategy.inputX1Strategy",
                "must not be off",
            ));
        }

        validate_range(
            "e3dc.modbusPauseSeconds",
            self.e3dc.modbus_pause_seconds,
            0,
            30,
        )?;
        validate_range(
            "e3dc.pollingIntervalSeconds",
            self.e3dc.polling_interval_seconds,
            2,
            60,
        )?;

        validate_hhmm(
            "nightChargingSchedule.startTime",
            &self.night_charging_schedule.start_time,
        )?;
        validate_hhmm(
            "nightChargingSchedule.endTime",
            &self.night_charging_schedule.end_time,
        )?;

        if self.mock_wallbox_phases != 1 && self.mock_wallbox_phases != 3 {
            return Err(HeliaError::invalid_input(
                "mockWallboxPhases",
                "must be 1 or 3",
            ));
        }
        if !VALID_PLUG_STATUS.contains(&self.mock_wallbox_plug_status) {
            return Err(HeliaError::invalid_input(
                "mockWallboxPlugStatus",
                "must be one of 0, 1, 3, 5, 7",
            ));
        }

        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(HeliaError::invalid_input(
                "timezone",
                "unknown IANA time zone",
            ));
        }

        if self.web.port == 0 {
            return Err(HeliaError::invalid_input(
                "web.port",
                "must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Whether the process runs against mock devices
    pub fn demo_active(&self) -> bool {
        if self.demo_mode {
            return true;
        }
        std::env::var("DEMO_AUTOSTART")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}
