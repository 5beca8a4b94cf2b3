//! Shared fixture: a fully wired controller stack against the mock wallbox.
#![allow(dead_code)]

use helia::config::Settings;
use helia::e3dc::poller::PollerControl;
use helia::e3dc::{CliGateway, LiveData, LiveDataHub};
use helia::notify::{Notifier, NotifyEvent};
use helia::sse::StatusBroadcaster;
use helia::store::{MemoryStore, Store};
use helia::strategy::StrategyController;
use helia::wallbox::listener::BroadcastListener;
use helia::wallbox::mock::MockWallbox;
use helia::wallbox::status::{StatusService, TargetFn};
use helia::wallbox::transport::{TransportConfig, WallboxTransport};
use helia::wallbox::UdpChannel;
use std::sync::{Arc, Mutex};

/// Records notifications for assertions
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotifyEvent>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: NotifyEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl RecordingNotifier {
    pub fn snapshot(&self) -> Vec<NotifyEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

pub struct Rig {
    pub store: Arc<dyn Store>,
    pub controller: Arc<StrategyController>,
    pub status: Arc<StatusService>,
    pub transport: Arc<WallboxTransport>,
    pub target: TargetFn,
    pub hub: Arc<LiveDataHub>,
    pub cli: Arc<CliGateway>,
    pub sse: Arc<StatusBroadcaster>,
    pub listener: Arc<BroadcastListener>,
    pub poller_control: Arc<PollerControl>,
    pub notifier: Arc<RecordingNotifier>,
    pub mock: MockWallbox,
    pub channel: Arc<UdpChannel>,
}

/// Build the stack against a freshly bound mock wallbox
pub async fn rig_with(settings: Settings) -> Rig {
    let mock = MockWallbox::bind(
        settings.mock_wallbox_plug_status,
        settings.mock_wallbox_phases,
    )
    .await
    .unwrap();
    mock.start();
    let mock_addr = mock.local_addr().unwrap();

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new(settings));
    let channel = Arc::new(UdpChannel::bind(0).await.unwrap());
    channel.start();
    let transport = WallboxTransport::new(
        Arc::clone(&channel),
        TransportConfig {
            accept_loopback: true,
            ..TransportConfig::default()
        },
    );
    let target: TargetFn = Arc::new(move || Ok(mock_addr));
    let sse = Arc::new(StatusBroadcaster::new());
    let status = Arc::new(StatusService::new(
        Arc::clone(&transport),
        Arc::clone(&target),
        Arc::clone(&sse),
    ));
    let hub = Arc::new(LiveDataHub::new());
    let poller_control = Arc::new(PollerControl::new());
    let cli = Arc::new(CliGateway::new(
        Arc::clone(&store),
        Arc::clone(&poller_control),
    ));
    let notifier = Arc::new(RecordingNotifier::default());
    let notifier_dyn: Arc<dyn Notifier> = Arc::clone(&notifier) as Arc<dyn Notifier>;

    let controller = StrategyController::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        Arc::clone(&status),
        Arc::clone(&cli),
        Arc::clone(&hub),
        Arc::clone(&notifier_dyn),
        Arc::clone(&sse),
        Arc::clone(&target),
    );
    let listener = BroadcastListener::new(
        Arc::clone(&channel),
        Arc::clone(&store),
        Arc::clone(&controller),
        Arc::clone(&status),
        Arc::clone(&sse),
        Arc::clone(&notifier_dyn),
        Arc::clone(&poller_control),
    );

    Rig {
        store,
        controller,
        status,
        transport,
        target,
        hub,
        cli,
        sse,
        listener,
        poller_control,
        notifier,
        mock,
        channel,
    }
}

pub async fn rig() -> Rig {
    rig_with(Settings::default()).await
}

/// Inverter snapshot with house power given without the wallbox share
pub fn live(pv: f64, house_no_wb: f64, soc: u8, battery: f64) -> LiveData {
    LiveData {
        pv_power: pv,
        battery_power: battery,
        battery_soc: soc,
        house_power: house_no_wb,
        wallbox_power: 0.0,
        grid_power: 0.0,
        autarky: 0,
        self_consumption: 0,
        timestamp: chrono::Utc::now(),
    }
}
