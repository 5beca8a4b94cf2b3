//! External CLI gateway for the home power plant
//!
//! The vendor tool is the only way to switch the discharge lock and grid
//! charging. Invocations are validated against a strict flag allow-list,
//! rate limited, and bracketed by a Modbus pause when grid charging is
//! activated (the inverter refuses the command while a Modbus client is
//! attached).

use super::poller::PollerControl;
use crate::error::{HeliaError, Result};
use crate::logging::{LogCategory, StructuredLogger, get_logger};
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

/// Minimum spacing between CLI invocations
pub const RATE_LIMIT: Duration = Duration::from_secs(5);

/// Validate a command string against the flag allow-list and return the
/// argument vector to pass to the tool
pub fn validate_command(command: &str) -> Result<Vec<String>> {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(HeliaError::invalid_input("command", "empty command"));
    }

    let mut args: Vec<String> = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        let flag = tokens[i];
        i += 1;
        match flag {
            // No argument
            "-a" | "-q" => args.push(flag.to_string()),
            // Required integer
            "-c" | "-d" | "-e" | "-m" | "-E" => {
                let value = take_value(&tokens, &mut i, flag)?;
                value.parse::<i64>().map_err(|_| {
                    HeliaError::invalid_input(flag.to_string(), format!("'{}' is not a number", value))
                })?;
                args.push(flag.to_string());
                args.push(value.to_string());
            }
            // Required name, optional integer
            "-s" => {
                let name = take_value(&tokens, &mut i, flag)?;
                args.push(flag.to_string());
                args.push(name.to_string());
                if i < tokens.len() && tokens[i].parse::<i64>().is_ok() {
                    args.push(tokens[i].to_string());
                    i += 1;
                }
            }
            // Required name
            "-r" => {
                let name = take_value(&tokens, &mut i, flag)?;
                args.push(flag.to_string());
                args.push(name.to_string());
            }
            // Optional integer
            "-l" => {
                args.push(flag.to_string());
                if i < tokens.len() && tokens[i].parse::<i64>().is_ok() {
                    args.push(tokens[i].to_string());
                    i += 1;
                }
            }
            // Fixed period keyword
            "-H" => {
                let period = take_value(&tokens, &mut i, flag)?;
                if !matches!(period, "day" | "week" | "month" | "year") {
                    return Err(HeliaError::invalid_input(
                        "-H".to_string(),
                        format!("'{}' is not one of day|week|month|year", period),
                    ));
                }
                args.push(flag.to_string());
                args.push(period.to_string());
            }
            // ISO date
            "-D" => {
                let date = take_value(&tokens, &mut i, flag)?;
                chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| {
                    HeliaError::invalid_input(
                        "-D".to_string(),
                        format!("'{}' is not a YYYY-MM-DD date", date),
                    )
                })?;
                args.push(flag.to_string());
                args.push(date.to_string());
            }
            other => {
                return Err(HeliaError::invalid_input(
                    "command".to_string(),
                    format!("flag '{}' is not allowed", other),
                ));
            }
        }
    }
    Ok(args)
}

fn take_value<'a>(tokens: &[&'a str], i: &mut usize, flag: &str) -> Result<&'a str> {
    if *i >= tokens.len() || tokens[*i].starts_with('-') {
        return Err(HeliaError::invalid_input(
            flag.to_string(),
            "missing argument".to_string(),
        ));
    }
    let value = tokens[*i];
    *i += 1;
    Ok(value)
}

/// Whether the argument vector activates emergency-power grid charging,
/// which requires the Modbus pause
pub fn needs_modbus_pause(args: &[String]) -> bool {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-e"
            && let Some(value) = iter.next()
            && value.parse::<i64>().map(|n| n > 0).unwrap_or(false)
        {
            return true;
        }
    }
    false
}

/// Strip credential-looking tokens from captured output before journaling
pub fn redact_secrets(output: &str) -> String {
    let mut redacted: Vec<String> = Vec::new();
    let mut mask_next = false;
    for token in output.split_whitespace() {
        if mask_next {
            redacted.push("***".to_string());
            mask_next = false;
            continue;
        }
        let lower = token.to_lowercase();
        if lower == "--token" || lower == "--password" || lower == "bearer" {
            redacted.push(token.to_string());
            mask_next = true;
        } else if let Some(eq) = token.find('=') {
            let key = token[..eq].to_lowercase();
            if key.contains("password") || key.contains("token") || key.contains("secret") {
                redacted.push(format!("{}=***", &token[..eq]));
            } else {
                redacted.push(token.to_string());
            }
        } else {
            redacted.push(token.to_string());
        }
    }
    redacted.join(" ")
}

/// Gateway spawning the vendor tool
pub struct CliGateway {
    store: Arc<dyn Store>,
    control: Arc<PollerControl>,
    last_invocation: Mutex<Option<Instant>>,
    logger: StructuredLogger,
}

impl CliGateway {
    pub fn new(store: Arc<dyn Store>, control: Arc<PollerControl>) -> Self {
        Self {
            store,
            control,
            last_invocation: Mutex::new(None),
            logger: get_logger(LogCategory::Cli),
        }
    }

    /// Execute a validated command, pausing the Modbus poller around
    /// grid-charge activation
    pub async fn execute(&self, command: &str) -> Result<String> {
        self.execute_inner(command, true).await
    }

    /// Console variant for user-typed commands: same allow-list, no pause
    pub async fn execute_console(&self, command: &str) -> Result<String> {
        self.execute_inner(command, false).await
    }

    async fn execute_inner(&self, command: &str, allow_pause: bool) -> Result<String> {
        let settings = self.store.settings();
        if !settings.e3dc.enabled {
            return Err(HeliaError::not_configured("Inverter integration disabled"));
        }
        let args = validate_command(command)?;

        // One invocation at a time; a held lock means another caller is mid-flight
        let mut last = self
            .last_invocation
            .try_lock()
            .map_err(|_| HeliaError::rate_limited("CLI invocation already in progress"))?;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < RATE_LIMIT {
                sleep(RATE_LIMIT - elapsed).await;
            }
        }

        let pause = allow_pause && needs_modbus_pause(&args);
        let pause_duration = Duration::from_secs(settings.e3dc.modbus_pause_seconds as u64);
        if pause {
            self.logger.debug("Pausing Modbus poller for grid-charge command");
            self.control.pause().await;
            sleep(pause_duration).await;
        }

        let result = self.run_tool(&settings, &args).await;

        if pause {
            sleep(pause_duration).await;
            self.control.resume();
            self.logger.debug("Resumed Modbus poller");
        }

        *last = Some(Instant::now());
        result
    }

    async fn run_tool(&self, settings: &crate::config::Settings, args: &[String]) -> Result<String> {
        let binary = if settings.demo_active() {
            settings.e3dc.demo_command.clone()
        } else {
            settings.e3dc.cli_command.clone()
        };
        self.logger
            .info(&format!("Invoking inverter CLI: {} {}", binary, args.join(" ")));

        let output = tokio::process::Command::new(&binary)
            .args(args)
            .output()
            .await
            .map_err(|e| HeliaError::cli(format!("Failed to spawn {}: {}", binary, e)))?;

        let stdout = redact_secrets(&String::from_utf8_lossy(&output.stdout));
        if output.status.success() {
            self.logger.debug(&format!("CLI output: {}", stdout));
            Ok(stdout)
        } else {
            let stderr = redact_secrets(&String::from_utf8_lossy(&output.stderr));
            let message = format!(
                "CLI exited with {}: {}",
                output.status.code().unwrap_or(-1),
                if stderr.is_empty() { &stdout } else { &stderr }
            );
            self.logger.error(&message);
            Err(HeliaError::cli(message))
        }
    }

    /// Switch the battery discharge lock
    pub async fn set_battery_lock(&self, locked: bool) -> Result<()> {
        let settings = self.store.settings();
        let command = if locked {
            settings.e3dc.discharge_lock_on_command
        } else {
            settings.e3dc.discharge_lock_off_command
        };
        self.execute(&command).await.map(|_| ())
    }

    /// Enter the night window: discharge lock plus optional grid charge in a
    /// single invocation so only one rate-limit wait occurs
    pub async fn enable_night_charging(&self, grid_charge: bool) -> Result<()> {
        let settings = self.store.settings();
        let mut command = settings.e3dc.discharge_lock_on_command.clone();
        if grid_charge {
            command.push(' ');
            command.push_str(&settings.e3dc.grid_charge_on_command);
        }
        self.execute(&command).await.map(|_| ())
    }

    /// Leave the night window; mirror image of the entry call
    pub async fn disable_night_charging(&self, grid_charge: bool) -> Result<()> {
        let settings = self.store.settings();
        let mut command = settings.e3dc.discharge_lock_off_command.clone();
        if grid_charge {
            command.push(' ');
            command.push_str(&settings.e3dc.grid_charge_off_command);
        }
        self.execute(&command).await.map(|_| ())
    }
}
