//! FHEM telnet bridge
//!
//! Replicates the inverter snapshot into a FHEM home-automation server as
//! five `setreading` lines over plain TCP. Failures degrade silently with a
//! log line; nothing here ever reaches a caller.

use crate::e3dc::LiveData;
use crate::logging::{LogCategory, StructuredLogger, get_logger};
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Render the five readings, one per line, with a trailing newline
pub fn build_payload(live: &LiveData) -> String {
    format!(
        "setreading S10 pv_power {}\n\
         setreading S10 battery_power {}\n\
         setreading S10 house_power {}\n\
         setreading S10 grid_power {}\n\
         setreading S10 soc {}\n",
        live.pv_power as i64,
        live.battery_power as i64,
        live.house_power as i64,
        live.grid_power as i64,
        live.battery_soc
    )
}

pub struct FhemSync {
    store: Arc<dyn Store>,
    /// Held while a sync is on the wire so shutdown can await it
    in_flight: tokio::sync::Mutex<()>,
    logger: StructuredLogger,
}

impl FhemSync {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            in_flight: tokio::sync::Mutex::new(()),
            logger: get_logger(LogCategory::Fhem),
        })
    }

    /// Push one snapshot; never raises
    pub async fn sync(&self, live: &LiveData) {
        let settings = self.store.settings();
        if !settings.fhem.enabled {
            return;
        }
        let _guard = self.in_flight.lock().await;
        let address = format!("{}:{}", settings.fhem.host, settings.fhem.port);
        let payload = build_payload(live);

        let result: std::io::Result<()> = async {
            let mut stream =
                tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address.as_str()))
                    .await??;
            stream.write_all(payload.as_bytes()).await?;
            stream.flush().await?;
            stream.shutdown().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => self
                .logger
                .trace(&format!("Pushed {} bytes to FHEM", payload.len())),
            Err(e) => self
                .logger
                .debug(&format!("FHEM sync to {} failed: {}", address, e)),
        }
    }

    /// Forward every hub snapshot until shutdown; the in-flight sync is
    /// awaited before the task exits
    pub async fn run(
        self: Arc<Self>,
        hub: Arc<crate::e3dc::LiveDataHub>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut rx = hub.subscribe();
        loop {
            tokio::select! {
                res = rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                    let live = *rx.borrow_and_update();
                    if let Some(live) = live {
                        self.sync(&live).await;
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        // Let a concurrent sync finish before the task ends
        let _guard = self.in_flight.lock().await;
    }
}
