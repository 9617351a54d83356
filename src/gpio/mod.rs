//! Capability contract for the GPIO/interrupt subsystem.
//!
//! The ranger never talks to pins directly; everything goes through
//! [`GpioSubsystem`]. [`sim`] provides a simulated backend that runs
//! anywhere, `espidf` binds the contract to the ESP-IDF pin drivers.

use std::sync::Arc;

#[cfg(target_os = "espidf")]
pub mod espidf;
pub mod sim;

/// GPIO pin identifier (the chip's GPIO number).
pub type PinId = u32;

/// Monotonic subsystem timestamp in microseconds, wrapping modulo 2^32.
pub type Ticks = u32;

/// Digital level of a pin. For edge events this doubles as the edge
/// direction: `High` is a rising edge, `Low` a falling edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
}

/// The single global entry point handed to
/// [`GpioSubsystem::subscribe_edges`], invoked with `(pin, level, ticks)`
/// for every edge on a subscribed pin.
pub type EdgeCallback = Arc<dyn Fn(PinId, Level, Ticks) + Send + Sync>;

/// Elapsed ticks from `a` to `b`.
///
/// The tick counter wraps modulo 2^32; wrapping subtraction stays exact
/// when the counter overflows between the two timestamps, which plain
/// subtraction does not.
pub fn tick_diff(a: Ticks, b: Ticks) -> Ticks {
    b.wrapping_sub(a)
}

/// Handle for an active edge subscription.
pub trait EdgeSubscription {
    type Error;

    /// Stop edge delivery for this subscription.
    fn cancel(&mut self) -> Result<(), Self::Error>;
}

/// What the ranger needs from a GPIO subsystem: pin mode configuration,
/// digital writes, timed pulse generation and edge-triggered callbacks
/// carrying the subsystem's wrapping tick timestamps.
pub trait GpioSubsystem: Sized + Send {
    type Error: std::error::Error + Send + 'static;
    type Subscription: EdgeSubscription<Error = Self::Error> + Send;

    /// Acquire a handle to the subsystem.
    fn acquire() -> Result<Self, Self::Error>;

    fn set_mode(&mut self, pin: PinId, mode: PinMode) -> Result<(), Self::Error>;

    fn write(&mut self, pin: PinId, level: Level) -> Result<(), Self::Error>;

    /// Emit a single timed pulse: drive `pin` to `level` for `width_us`
    /// microseconds, then back.
    fn pulse(&mut self, pin: PinId, width_us: u32, level: Level) -> Result<(), Self::Error>;

    /// Deliver every edge of `pin`, in both directions, to `callback` until
    /// the returned subscription is cancelled. Callbacks may arrive from a
    /// background thread concurrently with the owning thread.
    fn subscribe_edges(
        &mut self,
        pin: PinId,
        callback: EdgeCallback,
    ) -> Result<Self::Subscription, Self::Error>;

    /// Release the handle. Later calls on this handle fail.
    fn release(&mut self) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_diff_plain_pair() {
        assert_eq!(tick_diff(1_000, 3_500), 2_500);
    }

    #[test]
    fn tick_diff_same_instant() {
        assert_eq!(tick_diff(42, 42), 0);
    }

    #[test]
    fn tick_diff_across_wraparound() {
        // 499 ticks up to the counter maximum, one to wrap to zero, 500 more.
        assert_eq!(tick_diff(u32::MAX - 499, 500), 1_000);
    }

    #[test]
    fn tick_diff_at_wraparound_boundary() {
        assert_eq!(tick_diff(u32::MAX, 0), 1);
    }
}
