//! ---
//! sbus_section: "01-core-functionality"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Shared primitives and utilities for the bus node."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
use chrono::Utc;

/// Milliseconds since the Unix epoch, the unit used for envelope timestamps.
pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}
