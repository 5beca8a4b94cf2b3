//! UDP channel to the wallbox
//!
//! One socket owns all traffic. Every inbound datagram is decoded, trimmed
//! and classified exactly once, then fanned out on a broadcast bus; consumers
//! (transport, broadcast listener) filter by classification. Spontaneous
//! JSON telegrams lack an `ID` field and must never resolve a pending
//! request, so the classification travels with the message.

use crate::error::{HeliaError, Result};
use crate::logging::{LogCategory, StructuredLogger, get_logger};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

/// Bus capacity; classification keeps messages small
const BUS_CAPACITY: usize = 64;

/// One classified inbound datagram
#[derive(Debug, Clone)]
pub struct WallboxDatagram {
    /// Trimmed UTF-8 payload
    pub raw: String,
    /// Parsed JSON object, when the payload is one
    pub json: Option<serde_json::Value>,
    /// Sender address
    pub remote: SocketAddr,
}

impl WallboxDatagram {
    pub fn classify(raw: &str, remote: SocketAddr) -> Self {
        let raw = raw.trim().to_string();
        let json = if raw.starts_with('{') {
            serde_json::from_str::<serde_json::Value>(&raw)
                .ok()
                .filter(|v| v.is_object())
        } else {
            None
        };
        Self { raw, json, remote }
    }

    pub fn is_json(&self) -> bool {
        self.json.is_some()
    }

    pub fn has_id(&self) -> bool {
        self.json
            .as_ref()
            .map(|v| v.get("ID").is_some())
            .unwrap_or(false)
    }

    pub fn has_tch_token(&self) -> bool {
        self.raw.contains("TCH-OK") || self.raw.contains("TCH-ERR")
    }

    /// Unsolicited telegram (plug, state, input, session energy): JSON
    /// without `ID` and without an acknowledgement token
    pub fn is_spontaneous_broadcast(&self) -> bool {
        self.is_json() && !self.has_id() && !self.has_tch_token()
    }

    /// Whether the transport may match this datagram against the in-flight
    /// request; spontaneous broadcasts never qualify
    pub fn is_reply_candidate(&self) -> bool {
        !self.is_spontaneous_broadcast()
    }
}

/// Messages on the channel bus
#[derive(Debug, Clone)]
pub enum ChannelMessage {
    Datagram(Arc<WallboxDatagram>),
    /// Emitted once before the socket closes so consumers can detach
    Stopped,
}

/// The single UDP socket and its fan-out bus
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    bus: broadcast::Sender<ChannelMessage>,
    running: Arc<AtomicBool>,
    recv_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    logger: StructuredLogger,
}

/// Classify one payload and fan it out on the bus
fn dispatch_datagram(
    bus: &broadcast::Sender<ChannelMessage>,
    logger: &StructuredLogger,
    text: &str,
    remote: SocketAddr,
) {
    let datagram = WallboxDatagram::classify(text, remote);
    if datagram.raw.is_empty() {
        return;
    }
    logger.trace(&format!("rx {} <- {}", datagram.raw, remote));
    let _ = bus.send(ChannelMessage::Datagram(Arc::new(datagram)));
}

impl UdpChannel {
    /// Bind the channel socket with address reuse; `port` is 7090 in
    /// production, 0 in tests
    pub async fn bind(port: u16) -> Result<Self> {
        let raw = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .map_err(|e| HeliaError::transport(format!("Failed to create UDP socket: {}", e)))?;
        raw.set_reuse_address(true)
            .map_err(|e| HeliaError::transport(format!("Failed to set address reuse: {}", e)))?;
        let address: SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, port).into();
        raw.bind(&address.into())
            .map_err(|e| HeliaError::transport(format!("Failed to bind UDP port {}: {}", port, e)))?;
        raw.set_nonblocking(true)
            .map_err(|e| HeliaError::transport(format!("Failed to set non-blocking: {}", e)))?;
        let socket = UdpSocket::from_std(raw.into())
            .map_err(|e| HeliaError::transport(format!("Failed to register UDP socket: {}", e)))?;
        socket
            .set_broadcast(true)
            .map_err(|e| HeliaError::transport(format!("Failed to enable broadcast: {}", e)))?;
        let (bus, _rx) = broadcast::channel(BUS_CAPACITY);
        Ok(Self {
            socket: Arc::new(socket),
            bus,
            running: Arc::new(AtomicBool::new(false)),
            recv_task: std::sync::Mutex::new(None),
            logger: get_logger(LogCategory::Udp),
        })
    }

    /// Local socket address (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| HeliaError::transport(e.to_string()))
    }

    /// Subscribe to the message bus
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.bus.subscribe()
    }

    /// Start the receive loop; starting twice is a no-op
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            self.logger.debug("UDP channel already started");
            return;
        }
        let socket = Arc::clone(&self.socket);
        let bus = self.bus.clone();
        let running = Arc::clone(&self.running);
        let logger = self.logger.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, remote)) => {
                        let text = String::from_utf8_lossy(&buf[..len]);
                        dispatch_datagram(&bus, &logger, &text, remote);
                    }
                    Err(e) => {
                        if running.load(Ordering::SeqCst) {
                            logger.warn(&format!("UDP receive failed: {}", e));
                        }
                        break;
                    }
                }
            }
        });
        if let Ok(mut slot) = self.recv_task.lock() {
            *slot = Some(handle);
        }
        self.logger.info("UDP channel started");
    }

    /// Fire-and-forget unicast send; commands are newline-terminated
    pub async fn send_unicast(&self, target: SocketAddr, text: &str) -> Result<()> {
        let payload = format!("{}\n", text);
        self.logger.trace(&format!("tx {} -> {}", text, target));
        self.socket
            .send_to(payload.as_bytes(), target)
            .await
            .map_err(|e| HeliaError::transport(format!("UDP send failed: {}", e)))?;
        Ok(())
    }

    /// Broadcast to the local segment and re-emit locally; the kernel does
    /// not loop broadcasts back to the sender
    pub async fn send_broadcast(&self, port: u16, text: &str) -> Result<()> {
        let target: SocketAddr = (std::net::Ipv4Addr::BROADCAST, port).into();
        self.socket
            .send_to(text.as_bytes(), target)
            .await
            .map_err(|e| HeliaError::transport(format!("UDP broadcast failed: {}", e)))?;
        let local = self.local_addr()?;
        dispatch_datagram(&self.bus, &self.logger, text, local);
        Ok(())
    }

    /// Emit the stop notification and shut the receive loop down
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.bus.send(ChannelMessage::Stopped);
        if let Ok(mut slot) = self.recv_task.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
        self.logger.info("UDP channel stopped");
    }
}
