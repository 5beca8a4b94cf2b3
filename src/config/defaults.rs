use super::*;

impl Default for Settings {
    fn default() -> Self {
        Self {
            wallbox_ip: String::new(),
            charging_strategy: ChargingStrategySettings::default(),
            e3dc: E3dcSettings::default(),
            night_charging_schedule: NightChargingSchedule::default(),
            timezone: "Europe/Berlin".to_string(),
            demo_mode: false,
            mock_wallbox_phases: 1,
            mock_wallbox_plug_status: 7,
            web: WebSettings::default(),
            logging: LoggingSettings::default(),
            fhem: FhemSettings::default(),
        }
    }
}

impl Default for ChargingStrategySettings {
    fn default() -> Self {
        Self {
            min_start_power_watt: 1400,
            stop_threshold_watt: 800,
            start_delay_seconds: 120,
            stop_delay_seconds: 300,
            min_current_change_ampere: 1.0,
            min_change_interval_seconds: 30,
            physical_phase_switch: 3,
            active_strategy: ChargingStrategy::Off,
            input_x1_strategy: ChargingStrategy::MaxWithoutBattery,
        }
    }
}

impl Default for E3dcSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ip: String::new(),
            cli_command: "e3dc-cli".to_string(),
            discharge_lock_on_command: "-d 1".to_string(),
            discharge_lock_off_command: "-d 0".to_string(),
            grid_charge_on_command: "-e 3000".to_string(),
            grid_charge_off_command: "-e 0".to_string(),
            modbus_pause_seconds: 10,
            polling_interval_seconds: 10,
            grid_charge_during_night_charging: false,
            demo_host: "127.0.0.1:5502".to_string(),
            demo_command: "./e3dc-mock".to_string(),
        }
    }
}

impl Default for NightChargingSchedule {
    fn default() -> Self {
        Self {
            enabled: false,
            start_time: "00:00".to_string(),
            end_time: "05:00".to_string(),
        }
    }
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "/tmp/helia.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for FhemSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 7072,
        }
    }
}
