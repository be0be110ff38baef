//! Fitness Machine Control Point (0x2AD9) codec.
//!
//! Outbound commands are a 1-byte opcode optionally followed by parameters.
//! The machine answers each write with an indication: `0x80`, the request
//! opcode, and a result code. The protocol carries no sequence numbers, so
//! responses correlate to requests by opcode equality alone.

use bytes::{BufMut, Bytes, BytesMut};

/// Leading byte of every control point response indication.
pub const RESPONSE_OPCODE: u8 = 0x80;

/// Control point command opcodes sent to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlOpcode {
    /// Request control of the fitness machine.
    RequestControl = 0x00,
    /// Set target power in watts (ERG mode).
    SetTargetPower = 0x05,
}

impl From<ControlOpcode> for u8 {
    fn from(op: ControlOpcode) -> Self {
        op as Self
    }
}

/// Result codes carried in control point response indications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlResult {
    /// Request accepted.
    Success = 0x01,
    /// The machine does not support the request opcode.
    OpcodeNotSupported = 0x02,
    /// Parameter out of the machine's supported range.
    InvalidParameter = 0x03,
    /// Request understood but could not be executed.
    OperationFailed = 0x04,
    /// Control was not requested or was revoked.
    ControlNotPermitted = 0x05,
}

impl ControlResult {
    /// Attempts to parse a known result code.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Success),
            0x02 => Some(Self::OpcodeNotSupported),
            0x03 => Some(Self::InvalidParameter),
            0x04 => Some(Self::OperationFailed),
            0x05 => Some(Self::ControlNotPermitted),
            _ => None,
        }
    }
}

/// An outbound control point command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Ask the machine for control authority. No parameters.
    RequestControl,
    /// Set the target power in watts. The value here is what goes on the
    /// wire; safety clamping happens before a command is built.
    SetTargetPower(i16),
}

impl ControlCommand {
    /// Returns the opcode for this command.
    #[must_use]
    pub const fn opcode(self) -> ControlOpcode {
        match self {
            Self::RequestControl => ControlOpcode::RequestControl,
            Self::SetTargetPower(_) => ControlOpcode::SetTargetPower,
        }
    }

    /// Encodes the command into its wire representation.
    #[must_use]
    pub fn encode(self) -> Bytes {
        match self {
            Self::RequestControl => Bytes::from_static(&[ControlOpcode::RequestControl as u8]),
            Self::SetTargetPower(watts) => {
                let mut buf = BytesMut::with_capacity(3);
                buf.put_u8(ControlOpcode::SetTargetPower as u8);
                buf.put_i16_le(watts);
                buf.freeze()
            }
        }
    }
}

/// A parsed control point response indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlResponse {
    /// Opcode of the request this response answers.
    pub request_opcode: u8,
    /// Raw result code; unknown values are preserved.
    pub result_code: u8,
}

impl ControlResponse {
    /// Returns the known result, if the code is one the protocol defines.
    #[must_use]
    pub const fn result(&self) -> Option<ControlResult> {
        ControlResult::from_byte(self.result_code)
    }

    /// Returns true if the machine accepted the request.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result_code == ControlResult::Success as u8
    }

    /// Returns true if this is a successful response to the given opcode.
    #[must_use]
    pub fn grants(&self, opcode: ControlOpcode) -> bool {
        self.request_opcode == u8::from(opcode) && self.is_success()
    }
}

/// Parses a control point response indication.
///
/// Returns `None` for payloads shorter than 3 bytes or not led by the
/// response opcode; such notifications are dropped silently upstream.
#[must_use]
pub fn parse_response(data: &[u8]) -> Option<ControlResponse> {
    let bytes = data.get(..3)?;
    if bytes[0] != RESPONSE_OPCODE {
        tracing::trace!("unexpected control point opcode 0x{:02x}", bytes[0]);
        return None;
    }
    Some(ControlResponse {
        request_opcode: bytes[1],
        result_code: bytes[2],
    })
}
