//! Peripheral identity and connection lifecycle state.

use std::fmt;

/// A peripheral discovered during scanning.
///
/// The identity is an opaque string assigned by the BLE stack; it is stable
/// for the lifetime of the adapter session and is what [`crate::Trainer::connect`]
/// takes to pick a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralHandle {
    /// Opaque device identity from the BLE stack.
    pub id: String,
    /// Advertised local name, if the peripheral broadcast one.
    pub name: Option<String>,
}

impl PeripheralHandle {
    /// Creates a handle from an identity and optional advertised name.
    #[must_use]
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    /// Returns the advertised name, or a placeholder for anonymous devices.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown Device")
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name(), self.id)
    }
}

/// Connection lifecycle state of the engine.
///
/// Transitions are strictly sequential and owned by the engine task; consumers
/// observe them via [`crate::Event::StateChanged`] or by polling
/// [`crate::Trainer::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection and no scan in progress.
    #[default]
    Idle,
    /// Scanning for peripherals advertising the fitness machine service.
    Scanning,
    /// Connection attempt in progress.
    Connecting,
    /// Link established, service discovery not yet started.
    Connected,
    /// Discovering services and characteristics.
    Discovering,
    /// Required characteristics resolved and subscribed; telemetry flowing
    /// and control point writes permitted.
    Ready,
    /// Teardown in progress.
    Disconnecting,
}

impl ConnectionState {
    /// Returns true if a peripheral link exists in this state.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Discovering | Self::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Disconnected"),
            Self::Scanning => write!(f, "Scanning..."),
            Self::Connecting => write!(f, "Connecting..."),
            Self::Connected => write!(f, "Connected"),
            Self::Discovering => write!(f, "Discovering services..."),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting..."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_fallback() {
        let anon = PeripheralHandle::new("hci0/dev_AA_BB", None);
        assert_eq!(anon.display_name(), "Unknown Device");

        let named = PeripheralHandle::new("hci0/dev_CC_DD", Some("KICKR 1234".into()));
        assert_eq!(named.display_name(), "KICKR 1234");
    }

    #[test]
    fn test_connection_state_phases() {
        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
        assert_eq!(ConnectionState::Scanning.to_string(), "Scanning...");
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(ConnectionState::Ready.is_connected());
    }
}
