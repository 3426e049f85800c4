//! ---
//! sbus_section: "01-core-functionality"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Shared primitives and utilities for the bus node."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
//! Core shared primitives for the S-BUS workspace.
//! This crate exposes configuration loading, logging initialisation, and
//! wall-clock helpers consumed across the workspace.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, CoapConfig, HandlerConfig, LoggingConfig, MarketConfig, MqttConfig, NodeConfig,
    ReconnectConfig, TransportKind,
};
pub use logging::{init_tracing, LogFormat};
pub use time::epoch_millis;
