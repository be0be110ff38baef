//! Wattage ceiling enforcement for outbound power targets.

/// Default ceiling in watts, a conservative limit suitable for recovery use.
pub const DEFAULT_CEILING_WATTS: u32 = 150;

/// Safety policy applied to every Set Target Power request.
///
/// The engine owns one instance and reads it on every power command; updates
/// arrive through the engine's serialized command queue, so the ceiling is
/// never read while a write is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyPolicy {
    ceiling_watts: u32,
}

impl SafetyPolicy {
    /// Creates a policy with the given ceiling.
    #[must_use]
    pub const fn new(ceiling_watts: u32) -> Self {
        Self { ceiling_watts }
    }

    /// Returns the current ceiling in watts.
    #[must_use]
    pub const fn ceiling_watts(&self) -> u32 {
        self.ceiling_watts
    }

    /// Replaces the ceiling.
    pub fn set_ceiling_watts(&mut self, ceiling_watts: u32) {
        self.ceiling_watts = ceiling_watts;
    }

    /// Clamps a requested wattage against the ceiling.
    ///
    /// The returned value is what gets encoded and transmitted. There is no
    /// floor: negative requests pass through unchanged, so callers must not
    /// rely on the policy for negative protection.
    #[must_use]
    pub fn clamp(&self, requested_watts: i16) -> i16 {
        let ceiling = i16::try_from(self.ceiling_watts).unwrap_or(i16::MAX);
        requested_watts.min(ceiling)
    }
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CEILING_WATTS)
    }
}
