//! Canonical request/response types for each wire dialect one-api speaks,
//! plus the auto-detector that recognizes a body posted to the wrong
//! endpoint (spec §4.3).

pub mod chat;
pub mod detect;
pub mod messages;
pub mod responses;
mod unknown_fields;

pub use detect::{Dialect, Reroute, detect as detect_dialect, reroute_for};
