//! Indoor Bike Data (0x2AD2) notification decoding.
//!
//! The characteristic starts with a 2-byte little-endian flags field, then a
//! run of fixed-width fields in a fixed wire order, each present only if its
//! flag bit is set. Fields the engine does not surface still occupy their
//! bytes and must be walked over.
//!
//! Decoding is pure and best-effort: malformed or truncated payloads never
//! produce an error, they just yield a smaller (possibly empty) update. Over
//! a noisy radio link this makes corrupt data indistinguishable from absent
//! data, which is the intended policy.

/// Decoded fields from one Indoor Bike Data notification.
///
/// Only fields that were flagged present *and* fully contained in the payload
/// are `Some`. Merge into the last-known values with
/// [`crate::TelemetrySample::apply_bike_data`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BikeData {
    /// Instantaneous cadence in rpm (wire value is in 0.5 rpm units).
    pub cadence_rpm: Option<u32>,
    /// Instantaneous power in watts, sign preserved.
    pub power_watts: Option<i32>,
}

/// Presence flags from the first two bytes.
#[derive(Debug, Clone, Copy)]
struct BikeDataFlags {
    /// Instantaneous speed present (bit 1), 2 bytes, 0.01 km/h.
    speed: bool,
    /// Instantaneous cadence present (bit 2), 2 bytes, 0.5 rpm.
    cadence: bool,
    /// Average cadence present (bit 3), 2 bytes.
    avg_cadence: bool,
    /// Total distance present (bit 4), 3 bytes.
    total_distance: bool,
    /// Resistance level present (bit 5), 2 bytes.
    resistance: bool,
    /// Instantaneous power present (bit 6), 2 bytes, signed watts.
    power: bool,
}

impl BikeDataFlags {
    const fn from_bits(flags: u16) -> Self {
        Self {
            speed: flags & 0x0002 != 0,
            cadence: flags & 0x0004 != 0,
            avg_cadence: flags & 0x0008 != 0,
            total_distance: flags & 0x0010 != 0,
            resistance: flags & 0x0020 != 0,
            power: flags & 0x0040 != 0,
        }
    }
}

/// Bounds-tracking reader over a field region.
///
/// Skips advance the offset unconditionally (a skipped field occupies its
/// bytes whether or not the payload actually contains them); value reads
/// yield `None` when the payload ends early, so every field after a
/// truncation point decodes as absent.
struct FieldCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FieldCursor<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn skip(&mut self, width: usize) {
        self.offset += width;
    }

    fn u16_le(&mut self) -> Option<u16> {
        let bytes = self.data.get(self.offset..self.offset + 2)?;
        self.offset += 2;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn i16_le(&mut self) -> Option<i16> {
        let bytes = self.data.get(self.offset..self.offset + 2)?;
        self.offset += 2;
        Some(i16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

/// Decodes an Indoor Bike Data notification payload.
///
/// Returns an empty update if the payload is shorter than the flags field.
#[must_use]
pub fn decode(data: &[u8]) -> BikeData {
    let mut out = BikeData::default();

    let Some(flag_bytes) = data.get(..2) else {
        tracing::trace!("bike data payload too short for flags: {} bytes", data.len());
        return out;
    };
    let flags = BikeDataFlags::from_bits(u16::from_le_bytes([flag_bytes[0], flag_bytes[1]]));

    let mut cursor = FieldCursor::new(&data[2..]);

    if flags.speed {
        cursor.skip(2);
    }
    if flags.cadence {
        if let Some(raw) = cursor.u16_le() {
            // Wire unit is 0.5 rpm.
            out.cadence_rpm = Some(u32::from(raw) / 2);
        }
    }
    if flags.avg_cadence {
        cursor.skip(2);
    }
    if flags.total_distance {
        cursor.skip(3);
    }
    if flags.resistance {
        cursor.skip(2);
    }
    if flags.power {
        if let Some(raw) = cursor.i16_le() {
            out.power_watts = Some(i32::from(raw));
        }
    }

    out
}
