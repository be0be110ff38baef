//! Data types for trainer entities.
//!
//! This module contains the core data structures used throughout the library:
//! - Peripheral identity and connection state
//! - Telemetry samples

pub mod peripheral;
pub mod telemetry;

pub use peripheral::{ConnectionState, PeripheralHandle};
pub use telemetry::TelemetrySample;
