//! # trainerlink
//!
//! An async client library for FTMS smart trainers over Bluetooth LE.
//!
//! trainerlink handles the full session lifecycle against a fitness machine:
//! scanning, connection, service discovery, telemetry decoding (power,
//! cadence, heart rate) and ERG-mode power control with a configurable
//! wattage ceiling clamped onto every target before it reaches the wire.
//!
//! ## Quick Start
//!
//! ```no_run
//! use trainerlink::{ConnectionState, Event, Trainer};
//!
//! #[tokio::main]
//! async fn main() -> trainerlink::Result<()> {
//!     let trainer = Trainer::ble().await?;
//!     let mut events = trainer.subscribe();
//!
//!     trainer.start_scan().await?;
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             Event::PeripheralDiscovered(peripheral) => {
//!                 trainer.connect(&peripheral).await?;
//!             }
//!             Event::StateChanged(ConnectionState::Ready) => {
//!                 trainer.request_control().await?;
//!             }
//!             Event::ControlGranted => {
//!                 // Clamped to the wattage ceiling (150W by default).
//!                 trainer.set_target_power(120).await?;
//!             }
//!             Event::Telemetry(sample) => {
//!                 println!("{:?}W @ {:?}rpm", sample.power, sample.cadence);
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`engine`] - Connection state machine; a single task owns the transport
//!   and serializes every state mutation
//! - [`transport`] - Transport abstraction and the btleplug BLE backend
//! - [`protocol`] - Pure wire-format codecs: GATT identifiers, Indoor Bike
//!   Data, Heart Rate Measurement, and the control point
//! - [`safety`] - Wattage ceiling enforcement for outbound power targets
//! - [`event`] - Broadcast event stream for consumers
//! - [`types`] - Peripheral identity, lifecycle states, telemetry samples

pub mod engine;
pub mod error;
pub mod event;
pub mod protocol;
pub mod safety;
pub mod transport;
pub mod types;

pub use engine::Trainer;
pub use error::{Error, Result};
pub use event::{Event, Subscription};
pub use protocol::{BikeData, ControlCommand, ControlOpcode, ControlResponse, ControlResult};
pub use safety::{DEFAULT_CEILING_WATTS, SafetyPolicy};
pub use transport::{BleTransport, Transport, TransportEvent};
pub use types::{ConnectionState, PeripheralHandle, TelemetrySample};
