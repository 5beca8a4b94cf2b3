//! Request/response multiplexer over the UDP channel
//!
//! At most one command is in flight against the wallbox; other requesters
//! wait in a FIFO. Replies are validated against the pending command and
//! invalid ones are silently ignored while the request keeps waiting, which
//! is how spontaneous broadcasts are dropped without corrupting the
//! in-flight slot.

use super::udp::{ChannelMessage, UdpChannel, WallboxDatagram};
use super::{field_f64, parse_reply};
use crate::error::{HeliaError, Result};
use crate::logging::{LogCategory, StructuredLogger, get_logger};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, sleep};

/// Retry and pacing configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Attempts per command; only timeouts retry
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Backoff multiplier between retries
    pub backoff_factor: u32,
    /// Per-attempt reply deadline
    pub attempt_timeout: Duration,
    /// Gap between a reply and the next dispatched command
    pub pacing: Duration,
    /// Accept replies from loopback sources (demo mode)
    pub accept_loopback: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2,
            attempt_timeout: Duration::from_secs(6),
            pacing: Duration::from_millis(100),
            accept_loopback: false,
        }
    }
}

/// Check a reply against the command that is waiting for it
///
/// `report N` requires `ID == N` plus one report-specific marker field;
/// `ena`/`curr` require a TCH-OK acknowledgement; everything else accepts
/// any reply candidate.
pub fn validate_reply(command: &str, datagram: &WallboxDatagram) -> bool {
    if !datagram.is_reply_candidate() {
        return false;
    }
    if let Some(report) = command.strip_prefix("report ") {
        let Ok(number) = report.trim().parse::<u32>() else {
            return false;
        };
        let Some(json) = &datagram.json else {
            return false;
        };
        if field_f64(json, "ID") != Some(number as f64) {
            return false;
        }
        let markers: &[&str] = match number {
            1 => &["Product", "Serial", "Firmware"],
            2 => &["State", "Plug", "Max curr"],
            3 => &["U1", "I1", "P"],
            _ => return true,
        };
        return markers.iter().any(|m| json.get(*m).is_some());
    }
    if command.starts_with("ena") || command.starts_with("curr") {
        return datagram.raw.contains("TCH-OK");
    }
    true
}

struct Request {
    target: SocketAddr,
    command: String,
    reply_tx: oneshot::Sender<Result<serde_json::Value>>,
}

/// The single-inflight FIFO multiplexer
pub struct WallboxTransport {
    channel: Arc<UdpChannel>,
    queue_tx: mpsc::Sender<Request>,
    logger: StructuredLogger,
}

impl WallboxTransport {
    /// Create the transport and spawn its worker
    pub fn new(channel: Arc<UdpChannel>, config: TransportConfig) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel::<Request>(32);
        let transport = Arc::new(Self {
            channel: Arc::clone(&channel),
            queue_tx,
            logger: get_logger(LogCategory::Transport),
        });
        tokio::spawn(worker(channel, config, queue_rx));
        transport
    }

    /// Send a command and wait for its validated, parsed reply
    pub async fn send_command(
        &self,
        target: SocketAddr,
        command: &str,
    ) -> Result<serde_json::Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.queue_tx
            .send(Request {
                target,
                command: command.to_string(),
                reply_tx,
            })
            .await
            .map_err(|_| HeliaError::transport("Transport closed"))?;
        reply_rx
            .await
            .map_err(|_| HeliaError::transport("Transport closed"))?
    }

    /// Fire-and-forget send, bypassing the queue
    pub async fn send_command_no_response(&self, target: SocketAddr, command: &str) -> Result<()> {
        self.logger.debug(&format!("fire-and-forget: {}", command));
        self.channel.send_unicast(target, command).await
    }
}

async fn worker(
    channel: Arc<UdpChannel>,
    config: TransportConfig,
    mut queue_rx: mpsc::Receiver<Request>,
) {
    let logger = get_logger(LogCategory::Transport);
    let mut bus = channel.subscribe();
    let mut closed = false;

    while let Some(request) = queue_rx.recv().await {
        if closed {
            let _ = request
                .reply_tx
                .send(Err(HeliaError::transport("UDP channel stopped")));
            continue;
        }

        let result = run_request(&channel, &config, &mut bus, &request, &logger).await;
        let stopped = matches!(&result, Err(HeliaError::Transport { message }) if message.contains("stopped"));
        let paced = result.is_ok();
        let _ = request.reply_tx.send(result);
        if stopped {
            closed = true;
            continue;
        }
        if paced {
            // Pacing gap before the next queued command goes out
            sleep(config.pacing).await;
        }
    }
}

async fn run_request(
    channel: &UdpChannel,
    config: &TransportConfig,
    bus: &mut broadcast::Receiver<ChannelMessage>,
    request: &Request,
    logger: &StructuredLogger,
) -> Result<serde_json::Value> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        channel.send_unicast(request.target, &request.command).await?;

        match await_reply(config, bus, request).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_timeout() && attempt < config.max_attempts => {
                let delay = config.base_delay * config.backoff_factor.pow(attempt - 1);
                logger.warn(&format!(
                    "'{}' attempt {}/{} timed out, retrying in {:?}",
                    request.command, attempt, config.max_attempts, delay
                ));
                sleep(delay).await;
            }
            Err(e) => {
                logger.warn(&format!(
                    "'{}' failed after attempt {}: {}",
                    request.command, attempt, e
                ));
                return Err(e);
            }
        }
    }
}

async fn await_reply(
    config: &TransportConfig,
    bus: &mut broadcast::Receiver<ChannelMessage>,
    request: &Request,
) -> Result<serde_json::Value> {
    let deadline = Instant::now() + config.attempt_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HeliaError::timeout(format!(
                "No reply to '{}' within {:?}",
                request.command, config.attempt_timeout
            )));
        }
        let message = match tokio::time::timeout(remaining, bus.recv()).await {
            Ok(Ok(message)) => message,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                return Err(HeliaError::transport("UDP channel stopped"));
            }
            Err(_) => {
                return Err(HeliaError::timeout(format!(
                    "No reply to '{}' within {:?}",
                    request.command, config.attempt_timeout
                )));
            }
        };
        match message {
            ChannelMessage::Stopped => {
                return Err(HeliaError::transport("UDP channel stopped"));
            }
            ChannelMessage::Datagram(datagram) => {
                if !source_matches(config, request.target, datagram.remote) {
                    continue;
                }
                if !validate_reply(&request.command, &datagram) {
                    // Spontaneous broadcast or mismatched reply: keep waiting
                    continue;
                }
                return Ok(datagram
                    .json
                    .clone()
                    .unwrap_or_else(|| parse_reply(&datagram.raw)));
            }
        }
    }
}

fn source_matches(config: &TransportConfig, target: SocketAddr, remote: SocketAddr) -> bool {
    remote.ip() == target.ip() || (config.accept_loopback && remote.ip().is_loopback())
}
