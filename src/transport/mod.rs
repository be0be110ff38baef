//! Transport layer for trainer communication.
//!
//! The engine never talks to a Bluetooth stack directly. It drives a
//! [`Transport`] and consumes the [`TransportEvent`] queue the transport
//! feeds; every callback the underlying stack raises becomes a typed message
//! processed by the single engine task, so shared state is only ever mutated
//! in one place.

pub mod ble;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use crate::error::Result;
use crate::protocol::CharacteristicRole;
use crate::types::PeripheralHandle;

/// Events emitted by a transport into the engine's single-consumer queue.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peripheral advertising an interesting service was seen. The
    /// transport may report the same peripheral repeatedly; deduplication is
    /// the engine's job.
    PeripheralDiscovered(PeripheralHandle),
    /// The connection attempt succeeded.
    Connected,
    /// The connection attempt failed.
    ConnectFailed {
        /// Human-readable failure reason.
        reason: String,
    },
    /// The link was torn down, by request or by the peripheral.
    Disconnected {
        /// Reason, if the teardown was not requested.
        reason: Option<String>,
    },
    /// Discovery resolved a characteristic with a role the engine consumes.
    CharacteristicResolved {
        /// Role of the resolved characteristic.
        role: CharacteristicRole,
    },
    /// A notification or indication arrived on a subscribed characteristic.
    Notification {
        /// Role the characteristic was resolved as.
        role: CharacteristicRole,
        /// Raw payload bytes.
        data: Bytes,
    },
}

/// Trait for transport implementations.
///
/// Methods initiate work; completion and unsolicited activity arrive as
/// [`TransportEvent`]s on the queue handed to the transport at construction.
pub trait Transport: Send + Sync {
    /// Starts scanning for peripherals of interest.
    fn start_scan(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Stops an in-progress scan.
    fn stop_scan(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Initiates a connection to the given peripheral. The outcome arrives
    /// as [`TransportEvent::Connected`] or [`TransportEvent::ConnectFailed`].
    fn connect(
        &mut self,
        peripheral: &PeripheralHandle,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Starts service and characteristic discovery on the connected
    /// peripheral; resolved roles arrive as
    /// [`TransportEvent::CharacteristicResolved`].
    fn discover(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Enables notifications on the characteristic resolved for `role`.
    fn subscribe(
        &mut self,
        role: CharacteristicRole,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Writes a command frame to the control point characteristic.
    fn write_control(
        &mut self,
        payload: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Tears down the peripheral link. Completion arrives as
    /// [`TransportEvent::Disconnected`].
    fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Returns true if a peripheral link currently exists.
    fn is_connected(&self) -> bool;
}

pub use ble::BleTransport;
