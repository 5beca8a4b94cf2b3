use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};

use helia::config::Settings;
use helia::e3dc::poller::{CycleHook, PollerControl, WallboxPowerFn};
use helia::e3dc::{CliGateway, E3dcPoller, LiveDataHub};
use helia::error::HeliaError;
use helia::fhem::FhemSync;
use helia::notify::{JournalNotifier, Notifier};
use helia::scheduler::NightChargingScheduler;
use helia::sse::StatusBroadcaster;
use helia::store::{JsonFileStore, Store};
use helia::strategy::StrategyController;
use helia::wallbox::listener::BroadcastListener;
use helia::wallbox::mock::MockWallbox;
use helia::wallbox::status::{StatusService, TargetFn};
use helia::wallbox::transport::{TransportConfig, WallboxTransport};
use helia::wallbox::{UdpChannel, WALLBOX_PORT};
use helia::web::{AppState, build_router};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()
        .map_err(|e| anyhow::anyhow!("Failed to load settings: {}", e))?;
    helia::logging::init_logging(&settings.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Helia charging controller {} starting up", env!("APP_VERSION"));

    let data_dir = std::env::var("HELIA_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let store: Arc<dyn Store> = Arc::new(
        JsonFileStore::open(&data_dir, settings)
            .map_err(|e| anyhow::anyhow!("Failed to open store at {}: {}", data_dir, e))?,
    );
    let demo = store.settings().demo_active();
    if demo {
        info!("Demo mode active: running against the mock wallbox");
    }

    // The single UDP socket; in demo mode an ephemeral port avoids clashing
    // with a real wallbox on the LAN
    let channel = Arc::new(
        UdpChannel::bind(if demo { 0 } else { WALLBOX_PORT })
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind UDP channel: {}", e))?,
    );
    channel.start();

    let target: TargetFn = if demo {
        let mock_settings = store.settings();
        let mock = MockWallbox::bind(
            mock_settings.mock_wallbox_plug_status,
            mock_settings.mock_wallbox_phases,
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start mock wallbox: {}", e))?;
        let addr = mock
            .local_addr()
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        mock.start();
        Arc::new(move || Ok(addr))
    } else {
        let store = Arc::clone(&store);
        Arc::new(move || {
            let ip = store.settings().wallbox_ip;
            if ip.is_empty() {
                return Err(HeliaError::not_configured("Wallbox IP not set"));
            }
            format!("{}:{}", ip, WALLBOX_PORT)
                .parse()
                .map_err(|e| HeliaError::config(format!("Invalid wallbox address: {}", e)))
        })
    };

    let transport = WallboxTransport::new(
        Arc::clone(&channel),
        TransportConfig {
            accept_loopback: demo,
            ..TransportConfig::default()
        },
    );
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
    let notifier: Arc<dyn Notifier> = Arc::new(JournalNotifier);

    let controller = StrategyController::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        Arc::clone(&status),
        Arc::clone(&cli),
        Arc::clone(&hub),
        Arc::clone(&notifier),
        Arc::clone(&sse),
        Arc::clone(&target),
    );
    let listener = BroadcastListener::new(
        Arc::clone(&channel),
        Arc::clone(&store),
        Arc::clone(&controller),
        Arc::clone(&status),
        Arc::clone(&sse),
        Arc::clone(&notifier),
        Arc::clone(&poller_control),
    );
    let scheduler = NightChargingScheduler::new(
        Arc::clone(&store),
        Arc::clone(&cli),
        Arc::clone(&transport),
        Arc::clone(&target),
        Arc::clone(&notifier),
    );
    let fhem = FhemSync::new(Arc::clone(&store));

    let wallbox_power: WallboxPowerFn = {
        let status = Arc::clone(&status);
        Arc::new(move || status.wallbox_power_watts())
    };
    let cycle_hook: CycleHook = {
        let status = Arc::clone(&status);
        Arc::new(move |idle| {
            let status = Arc::clone(&status);
            let _ = tokio::spawn(async move {
                status.refresh_throttled(idle).await;
            });
        })
    };
    let poller = E3dcPoller::new(
        Arc::clone(&store),
        Arc::clone(&hub),
        Arc::clone(&notifier),
        Arc::clone(&poller_control),
        wallbox_power,
        Some(cycle_hook),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = vec![
        tokio::spawn(poller.run(shutdown_rx.clone())),
        tokio::spawn(Arc::clone(&controller).run(shutdown_rx.clone())),
        tokio::spawn(Arc::clone(&listener).run(shutdown_rx.clone())),
        tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx.clone())),
        tokio::spawn(Arc::clone(&fhem).run(Arc::clone(&hub), shutdown_rx.clone())),
    ];

    let app_state = AppState {
        store: Arc::clone(&store),
        controller: Arc::clone(&controller),
        status: Arc::clone(&status),
        transport: Arc::clone(&transport),
        target: Arc::clone(&target),
        hub: Arc::clone(&hub),
        cli: Arc::clone(&cli),
        sse: Arc::clone(&sse),
        started_at: std::time::Instant::now(),
    };
    let router = build_router(app_state);

    let web_settings = store.settings().web;
    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(web_settings.port);
    let bind_addr = format!("{}:{}", web_settings.host, port);
    let http_listener = tokio::net::TcpListener::bind(bind_addr.as_str())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e))?;
    info!("Web API listening on {}", bind_addr);

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, router).await {
            error!("Web server failed: {}", e);
        }
    });

    shutdown_signal().await;
    info!("Shutdown requested");

    // Tell SSE clients first, then stop the workers; the strategy controller
    // finishes its in-flight evaluation before its task ends
    sse.send_shutdown();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    // Stop notification lets the transport reject queued requests
    channel.stop();
    server.abort();

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
