//! # Helia - PV surplus charging controller
//!
//! Helia drives a KEBA-style wallbox and an E3/DC home power plant so that
//! an electric vehicle is charged according to a user-selected strategy:
//! pure PV surplus (battery or vehicle priority), maximum power with or
//! without the house battery, a nightly time window, or off.
//!
//! ## Architecture
//!
//! The application follows a modular architecture with clear separation of
//! concerns:
//!
//! - `config`: settings management and validation
//! - `logging`: structured logging, tracing and the web journal
//! - `state`: persistent runtime state and the strategy enum
//! - `store`: settings/state persistence behind a trait seam
//! - `notify`: fire-and-forget event notifications
//! - `wallbox`: UDP channel, transport multiplexer, broadcast listener,
//!   status service and the demo-mode mock
//! - `e3dc`: Modbus poller, live-data hub and the vendor CLI gateway
//! - `strategy`: the charging-strategy state machine
//! - `scheduler`: the night-charging window
//! - `fhem`: home-automation value bridge
//! - `sse`: live status fan-out
//! - `web`: HTTP/SSE API

pub mod config;
pub mod e3dc;
pub mod error;
pub mod fhem;
pub mod logging;
pub mod notify;
pub mod scheduler;
pub mod sse;
pub mod state;
pub mod store;
pub mod strategy;
pub mod wallbox;
pub mod web;

// Re-export commonly used types
pub use config::Settings;
pub use error::{HeliaError, Result};
pub use state::ChargingStrategy;
pub use strategy::StrategyController;
