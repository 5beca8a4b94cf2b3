//! Wallbox status service
//!
//! Issues `report 2` and `report 3` through the transport, merges the replies
//! into a `WallboxStatus`, caches the last snapshot and pushes full updates
//! via SSE. While the site is idle the refresh rate is capped; plug and input
//! changes reset the throttle so a fresh poll happens immediately.

use super::WallboxStatus;
use super::transport::WallboxTransport;
use crate::error::Result;
use crate::logging::{LogCategory, StructuredLogger, get_logger};
use crate::sse::StatusBroadcaster;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Minimum spacing of refreshes while idle
pub const IDLE_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Resolves the wallbox address (settings or demo mock)
pub type TargetFn = Arc<dyn Fn() -> Result<SocketAddr> + Send + Sync>;

pub struct StatusService {
    transport: Arc<WallboxTransport>,
    target: TargetFn,
    sse: Arc<StatusBroadcaster>,
    cached: RwLock<Option<WallboxStatus>>,
    last_refresh: Mutex<Option<Instant>>,
    logger: StructuredLogger,
}

impl StatusService {
    pub fn new(
        transport: Arc<WallboxTransport>,
        target: TargetFn,
        sse: Arc<StatusBroadcaster>,
    ) -> Self {
        Self {
            transport,
            target,
            sse,
            cached: RwLock::new(None),
            last_refresh: Mutex::new(None),
            logger: get_logger(LogCategory::Wallbox),
        }
    }

    /// Last snapshot without touching the device
    pub fn cached(&self) -> Option<WallboxStatus> {
        self.cached.read().ok().and_then(|c| *c)
    }

    /// Wallbox power (W) for injection into the inverter snapshot
    pub fn wallbox_power_watts(&self) -> f64 {
        self.cached().map(|s| s.power * 1000.0).unwrap_or(0.0)
    }

    /// Fetch a fresh snapshot and push it via SSE
    pub async fn refresh(&self) -> Result<WallboxStatus> {
        let target = (self.target)()?;
        let report_2 = self.transport.send_command(target, "report 2").await?;
        let report_3 = self.transport.send_command(target, "report 3").await?;

        let mut status = self.cached().unwrap_or_default();
        status.apply_report_2(&report_2);
        status.apply_report_3(&report_3);

        if let Ok(mut cached) = self.cached.write() {
            *cached = Some(status);
        }
        if let Ok(mut last) = self.last_refresh.lock() {
            *last = Some(Instant::now());
        }
        self.sse.send_full(status);
        Ok(status)
    }

    /// Refresh unless the idle throttle suppresses it
    pub async fn refresh_throttled(&self, idle: bool) {
        if idle {
            let recent = self
                .last_refresh
                .lock()
                .ok()
                .and_then(|last| *last)
                .map(|at| at.elapsed() < IDLE_REFRESH_INTERVAL)
                .unwrap_or(false);
            if recent {
                return;
            }
        }
        if let Err(e) = self.refresh().await {
            self.logger
                .debug(&format!("Throttled status refresh failed: {}", e));
        }
    }

    /// Forget the throttle timestamp so the next refresh runs immediately
    pub fn reset_idle_throttle(&self) {
        if let Ok(mut last) = self.last_refresh.lock() {
            *last = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallbox::udp::UdpChannel;

    async fn demo_service() -> (StatusService, crate::wallbox::mock::MockWallbox) {
        let mock = crate::wallbox::mock::MockWallbox::bind(7, 1).await.unwrap();
        mock.start();
        let target = mock.local_addr().unwrap();

        let channel = Arc::new(UdpChannel::bind(0).await.unwrap());
        channel.start();
        let transport = WallboxTransport::new(
            channel,
            crate::wallbox::transport::TransportConfig {
                accept_loopback: true,
                ..Default::default()
            },
        );
        let service = StatusService::new(
            transport,
            Arc::new(move || Ok(target)),
            Arc::new(StatusBroadcaster::new()),
        );
        (service, mock)
    }

    #[tokio::test]
    async fn refresh_merges_both_reports() {
        let (service, mock) = demo_service().await;
        mock.state
            .enabled
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let status = service.refresh().await.unwrap();
        assert_eq!(status.plug, 7);
        assert_eq!(status.state, 3);
        assert!(status.power > 0.0);
        assert_eq!(status.phases, 1);
        assert_eq!(service.cached().unwrap().plug, 7);
        assert!(service.wallbox_power_watts() > 0.0);
    }

    #[tokio::test]
    async fn idle_throttle_suppresses_back_to_back_refreshes() {
        let (service, _mock) = demo_service().await;

        service.refresh_throttled(true).await;
        let first = service.cached();
        assert!(first.is_some());

        // Second throttled call is suppressed; the cache timestamp is unchanged
        let before = service.cached().unwrap().last_updated;
        service.refresh_throttled(true).await;
        assert_eq!(service.cached().unwrap().last_updated, before);

        // Resetting the throttle lets the refresh through again
        service.reset_idle_throttle();
        service.refresh_throttled(true).await;
        assert!(service.cached().unwrap().last_updated >= before);
    }
}
