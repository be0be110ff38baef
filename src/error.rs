//! Error types for the trainerlink library.

use thiserror::Error;

/// The main error type for trainerlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Bluetooth stack error.
    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter is available on this system.
    #[error("no bluetooth adapter found")]
    AdapterNotFound,

    /// The requested peripheral is not known to the adapter.
    #[error("peripheral not found: {id}")]
    PeripheralNotFound { id: String },

    /// No peripheral connection is established.
    #[error("not connected")]
    NotConnected,

    /// A required characteristic has not been resolved yet.
    #[error("characteristic not resolved: {role}")]
    CharacteristicNotResolved { role: &'static str },

    /// The engine task has shut down and no longer accepts commands.
    #[error("engine closed")]
    EngineClosed,
}

/// Result type alias for trainerlink operations.
pub type Result<T> = std::result::Result<T, Error>;
