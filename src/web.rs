//! Axum-based HTTP/SSE API
//!
//! The request/response contracts the controller core exposes to the UI.
//! Authentication is an external middleware concern and not wired here.

use crate::e3dc::{CliGateway, LiveDataHub};
use crate::error::HeliaError;
use crate::logging::journal;
use crate::sse::StatusBroadcaster;
use crate::state::{ChargingStrategy, ControlState};
use crate::store::Store;
use crate::strategy::StrategyController;
use crate::wallbox::status::{StatusService, TargetFn};
use crate::wallbox::transport::WallboxTransport;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Ack window for direct current changes
const CURRENT_ACK_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub controller: Arc<StrategyController>,
    pub status: Arc<StatusService>,
    pub transport: Arc<WallboxTransport>,
    pub target: TargetFn,
    pub hub: Arc<LiveDataHub>,
    pub cli: Arc<CliGateway>,
    pub sse: Arc<StatusBroadcaster>,
    pub started_at: std::time::Instant,
}

#[derive(Deserialize)]
pub struct StartBody {
    pub strategy: Option<String>,
}

#[derive(Deserialize)]
pub struct CurrentBody {
    pub current: f64,
}

#[derive(Deserialize)]
pub struct StrategyBody {
    pub strategy: String,
}

#[derive(Deserialize)]
pub struct CommandBody {
    pub command: String,
}

#[derive(Deserialize)]
pub struct ControlsBody {
    #[serde(rename = "pvSurplus")]
    pub pv_surplus: Option<bool>,
    #[serde(rename = "batteryLock")]
    pub battery_lock: Option<bool>,
    #[serde(rename = "gridCharging")]
    pub grid_charging: Option<bool>,
    /// Present only to reject it: the scheduler owns this flag
    #[serde(rename = "nightCharging")]
    pub night_charging: Option<bool>,
}

#[derive(Deserialize)]
pub struct LogSettingsBody {
    pub level: String,
}

fn error_response(e: &HeliaError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        HeliaError::InvalidInput { .. }
        | HeliaError::NotConfigured { .. }
        | HeliaError::Parse { .. } => StatusCode::BAD_REQUEST,
        HeliaError::Conflict { .. } => StatusCode::CONFLICT,
        HeliaError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        // Internal details go to the journal, not the client
        "internal error".to_string()
    } else {
        e.to_string()
    };
    (status, Json(serde_json::json!({ "error": message })))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("APP_VERSION"),
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

async fn wallbox_status(State(state): State<AppState>) -> impl IntoResponse {
    if let Err(e) = (state.target)() {
        return error_response(&e).into_response();
    }
    match state.status.refresh().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn wallbox_stream(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.sse.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(event) => Some(Ok::<Event, std::convert::Infallible>(
            Event::default().event(event.event_name()).data(event.payload()),
        )),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn wallbox_start(
    State(state): State<AppState>,
    Json(body): Json<StartBody>,
) -> impl IntoResponse {
    let strategy = match &body.strategy {
        Some(name) => match ChargingStrategy::parse(name) {
            Some(ChargingStrategy::Off) | None => {
                let e = HeliaError::invalid_input("strategy", "unknown strategy");
                return error_response(&e).into_response();
            }
            Some(strategy) => strategy,
        },
        None => {
            let active = state.store.settings().charging_strategy.active_strategy;
            if active == ChargingStrategy::Off {
                let e = HeliaError::invalid_input("strategy", "no strategy selected");
                return error_response(&e).into_response();
            }
            active
        }
    };

    // Reply immediately; the transition continues in the background
    let controller = Arc::clone(&state.controller);
    let _ = tokio::spawn(async move {
        let _ = controller.set_strategy(strategy).await;
    });
    Json(serde_json::json!({ "success": true })).into_response()
}

async fn wallbox_stop(State(state): State<AppState>) -> impl IntoResponse {
    let controller = Arc::clone(&state.controller);
    let _ = tokio::spawn(async move {
        let _ = controller.stop().await;
    });
    Json(serde_json::json!({ "success": true }))
}

async fn wallbox_current(
    State(state): State<AppState>,
    Json(body): Json<CurrentBody>,
) -> impl IntoResponse {
    if !(6.0..=32.0).contains(&body.current) {
        let e = HeliaError::invalid_input("current", "must be between 6 and 32");
        return error_response(&e).into_response();
    }
    let target = match (state.target)() {
        Ok(target) => target,
        Err(e) => return error_response(&e).into_response(),
    };

    let command = format!("curr {}", (body.current * 1000.0) as u32);
    let ack = tokio::time::timeout(
        CURRENT_ACK_TIMEOUT,
        state.transport.send_command(target, &command),
    )
    .await;
    match ack {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return error_response(&e).into_response(),
        Err(_) => {
            let e = HeliaError::timeout("Wallbox did not acknowledge the current change");
            return error_response(&e).into_response();
        }
    }

    // Verify the limit actually landed before reporting success
    match state.status.refresh().await {
        Ok(status) if (status.max_curr - body.current).abs() < 0.5 => {
            Json(serde_json::json!({ "success": true })).into_response()
        }
        Ok(status) => {
            let e = HeliaError::web(format!(
                "Wallbox reports {} A instead of {} A",
                status.max_curr, body.current
            ));
            error_response(&e).into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.settings())
}

async fn post_settings(
    State(state): State<AppState>,
    Json(settings): Json<crate::config::Settings>,
) -> impl IntoResponse {
    if let Err(e) = settings.validate() {
        return error_response(&e).into_response();
    }
    match state.store.set_settings(settings) {
        Ok(()) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn get_controls(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.control_state())
}

async fn post_controls(
    State(state): State<AppState>,
    Json(body): Json<ControlsBody>,
) -> impl IntoResponse {
    if body.night_charging.is_some() {
        let e = HeliaError::invalid_input("nightCharging", "owned by the scheduler");
        return error_response(&e).into_response();
    }

    // A battery-lock toggle goes to the inverter first
    if let Some(lock) = body.battery_lock {
        let current = state.store.control_state().battery_lock;
        if lock != current
            && let Err(e) = state.cli.set_battery_lock(lock).await
        {
            return error_response(&e).into_response();
        }
    }

    let result = state.store.update_control_state(&move |c: &mut ControlState| {
        if let Some(v) = body.pv_surplus {
            c.pv_surplus = v;
        }
        if let Some(v) = body.battery_lock {
            c.battery_lock = v;
        }
        if let Some(v) = body.grid_charging {
            c.grid_charging = v;
        }
    });
    match result {
        Ok(control) => Json(control).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn post_strategy(
    State(state): State<AppState>,
    Json(body): Json<StrategyBody>,
) -> impl IntoResponse {
    let Some(strategy) = ChargingStrategy::parse(&body.strategy) else {
        let e = HeliaError::invalid_input("strategy", "unknown strategy");
        return error_response(&e).into_response();
    };
    match state.controller.set_strategy(strategy).await {
        Ok(()) => Json(serde_json::json!({
            "success": true,
            "strategy": strategy.as_str(),
        }))
        .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn get_context(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.charging_context())
}

async fn get_live_data(State(state): State<AppState>) -> impl IntoResponse {
    let settings = state.store.settings();
    if settings.e3dc.ip.is_empty() && !settings.demo_active() {
        let e = HeliaError::not_configured("Inverter IP not set");
        return error_response(&e).into_response();
    }
    match state.hub.latest() {
        Some(live) => Json(live).into_response(),
        // The cache is still filling
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "no inverter data yet" })),
        )
            .into_response(),
    }
}

async fn execute_command(
    State(state): State<AppState>,
    Json(body): Json<CommandBody>,
) -> impl IntoResponse {
    match state.cli.execute_console(&body.command).await {
        Ok(output) => Json(serde_json::json!({ "output": output })).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn get_logs() -> impl IntoResponse {
    Json(journal::snapshot())
}

async fn delete_logs() -> impl IntoResponse {
    journal::clear();
    Json(serde_json::json!({ "success": true }))
}

async fn get_log_settings() -> impl IntoResponse {
    Json(serde_json::json!({ "level": journal::min_level() }))
}

async fn post_log_settings(Json(body): Json<LogSettingsBody>) -> impl IntoResponse {
    match crate::logging::JournalLevel::parse(&body.level) {
        Some(level) => {
            journal::set_min_level(level);
            Json(serde_json::json!({ "level": level })).into_response()
        }
        None => {
            let e = HeliaError::invalid_input("level", "unknown level");
            error_response(&e).into_response()
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/wallbox/status", get(wallbox_status))
        .route("/api/wallbox/stream", get(wallbox_stream))
        .route("/api/wallbox/start", post(wallbox_start))
        .route("/api/wallbox/stop", post(wallbox_stop))
        .route("/api/wallbox/current", post(wallbox_current))
        .route("/api/settings", get(get_settings).post(post_settings))
        .route("/api/controls", get(get_controls).post(post_controls))
        .route("/api/charging/strategy", post(post_strategy))
        .route("/api/charging/context", get(get_context))
        .route("/api/e3dc/live-data", get(get_live_data))
        .route("/api/e3dc/execute-command", post(execute_command))
        .route("/api/logs", get(get_logs).delete(delete_logs))
        .route(
            "/api/logs/settings",
            get(get_log_settings).post(post_log_settings),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
