//! Heart Rate Measurement (0x2A37) notification decoding.

/// Decodes a heart rate measurement payload into beats per minute.
///
/// Byte 0 is a flags byte; bit 0 selects whether the measurement is a 1-byte
/// or 2-byte little-endian unsigned value starting at offset 1. Payloads too
/// short for the selected format yield `None` and the update is dropped.
#[must_use]
pub fn decode(data: &[u8]) -> Option<u32> {
    if data.len() < 2 {
        tracing::trace!("heart rate payload too short: {} bytes", data.len());
        return None;
    }

    let flags = data[0];
    let wide_format = flags & 0x01 != 0;

    if wide_format {
        let bytes = data.get(1..3)?;
        Some(u32::from(u16::from_le_bytes([bytes[0], bytes[1]])))
    } else {
        Some(u32::from(data[1]))
    }
}
