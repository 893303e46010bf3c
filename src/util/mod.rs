//! Utility types and functions shared across the bridge.
//!
//! - [`b64`] - Base64 encoding/decoding utilities
//! - [`sig_down`] - Graceful shutdown signal handling
//! - [`telemetry`] - OpenTelemetry tracing setup

pub mod b64;
pub mod sig_down;
pub mod telemetry;

pub use sig_down::*;
pub use telemetry::*;
