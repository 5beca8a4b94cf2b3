//! Demo-mode wallbox
//!
//! Answers the telegram subset Helia uses (`report 1/2/3`, `ena`, `curr`)
//! from the mock settings, so the whole control loop can run without
//! hardware. Also handy as a fixture for transport integration tests.

use crate::error::{HeliaError, Result};
use crate::logging::{LogCategory, StructuredLogger, get_logger};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use tokio::net::UdpSocket;

/// Mutable mock device state
pub struct MockWallboxState {
    pub plug: AtomicU8,
    pub phases: AtomicU8,
    pub input: AtomicU8,
    pub enabled: AtomicBool,
    /// Last accepted `curr` setpoint (mA)
    pub max_curr_ma: AtomicU32,
    /// `ena 0` commands seen (used by idempotence tests)
    pub ena_off_count: AtomicU32,
}

impl MockWallboxState {
    pub fn new(plug: u8, phases: u8) -> Self {
        Self {
            plug: AtomicU8::new(plug),
            phases: AtomicU8::new(phases),
            input: AtomicU8::new(0),
            enabled: AtomicBool::new(false),
            max_curr_ma: AtomicU32::new(32_000),
            ena_off_count: AtomicU32::new(0),
        }
    }
}

/// UDP responder bound to loopback
pub struct MockWallbox {
    socket: Arc<UdpSocket>,
    pub state: Arc<MockWallboxState>,
    logger: StructuredLogger,
}

impl MockWallbox {
    /// Bind on an ephemeral loopback port
    pub async fn bind(plug: u8, phases: u8) -> Result<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| HeliaError::transport(format!("Failed to bind mock wallbox: {}", e)))?;
        Ok(Self {
            socket: Arc::new(socket),
            state: Arc::new(MockWallboxState::new(plug, phases)),
            logger: get_logger(LogCategory::Wallbox),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| HeliaError::transport(e.to_string()))
    }

    /// Spawn the responder loop
    pub fn start(&self) {
        let socket = Arc::clone(&self.socket);
        let state = Arc::clone(&self.state);
        self.logger.info("Mock wallbox started");
        let _ = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, remote)) = socket.recv_from(&mut buf).await {
                let command = String::from_utf8_lossy(&buf[..len]).trim().to_string();
                if let Some(reply) = respond(&state, &command) {
                    let _ = socket.send_to(reply.as_bytes(), remote).await;
                }
            }
        });
    }
}

/// Build the reply for one command, if any
fn respond(state: &MockWallboxState, command: &str) -> Option<String> {
    match command {
        "report 1" => Some(
            serde_json::json!({
                "ID": "1",
                "Product": "MOCK-WB-30",
                "Serial": "19000001",
                "Firmware": "P30 v 3.10.57",
            })
            .to_string(),
        ),
        "report 2" => {
            let enabled = state.enabled.load(Ordering::SeqCst);
            let plug = state.plug.load(Ordering::SeqCst);
            let state_code = if enabled && plug == 7 { 3 } else { 1 };
            let enable_sys = if enabled { 1 } else { 0 };
            Some(
                serde_json::json!({
                    "ID": "2",
                    "State": state_code,
                    "Plug": plug,
                    "Input": state.input.load(Ordering::SeqCst),
                    "Enable sys": enable_sys,
                    "Max curr": state.max_curr_ma.load(Ordering::SeqCst),
                })
                .to_string(),
            )
        }
        "report 3" => {
            let charging =
                state.enabled.load(Ordering::SeqCst) && state.plug.load(Ordering::SeqCst) == 7;
            let phases = state.phases.load(Ordering::SeqCst).max(1) as u64;
            let current_ma = if charging {
                state.max_curr_ma.load(Ordering::SeqCst) as u64
            } else {
                0
            };
            // P in microwatts at nominal phase voltage
            let power_uw = current_ma * 230 * phases * 1000;
            let ma = |phase: u64| if phase <= phases { current_ma } else { 0 };
            Some(
                serde_json::json!({
                    "ID": "3",
                    "U1": 230, "U2": 230, "U3": 230,
                    "I1": ma(1), "I2": ma(2), "I3": ma(3),
                    "P": power_uw,
                    "E pres": 22_440,
                    "E total": 10_245_720,
                })
                .to_string(),
            )
        }
        "ena 0" => {
            state.enabled.store(false, Ordering::SeqCst);
            state.ena_off_count.fetch_add(1, Ordering::SeqCst);
            Some("TCH-OK :done".to_string())
        }
        "ena 1" => {
            state.enabled.store(true, Ordering::SeqCst);
            Some("TCH-OK :done".to_string())
        }
        _ => {
            if let Some(value) = command.strip_prefix("curr ") {
                return match value.trim().parse::<u32>() {
                    Ok(ma) if (6000..=63000).contains(&ma) => {
                        state.max_curr_ma.store(ma, Ordering::SeqCst);
                        Some("TCH-OK :done".to_string())
                    }
                    _ => Some("TCH-ERR :invalid current".to_string()),
                };
            }
            None
        }
    }
}
