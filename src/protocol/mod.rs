//! Protocol definitions for FTMS trainer communication.
//!
//! This module contains the pure wire-format layer:
//! - GATT service/characteristic identifiers and roles
//! - Indoor Bike Data telemetry decoding
//! - Heart Rate Measurement decoding
//! - Control point command encoding and response parsing
//!
//! Everything here is stateless and deterministic: the same bytes always
//! decode to the same values, and malformed input is dropped quietly rather
//! than surfaced as an error.

pub mod bike_data;
pub mod control;
pub mod gatt;
pub mod heart_rate;

pub use bike_data::BikeData;
pub use control::{ControlCommand, ControlOpcode, ControlResponse, ControlResult};
pub use gatt::CharacteristicRole;
