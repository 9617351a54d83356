//! Simulated GPIO backend.
//!
//! The whole subsystem state sits behind a shared, clonable handle, so a
//! test or a host-side demo can keep a clone, fire edge events into the
//! subscribed callback and inspect what the driver did to the pins.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{EdgeCallback, EdgeSubscription, GpioSubsystem, Level, PinId, PinMode, Ticks};

#[derive(Debug, thiserror::Error)]
pub enum SimGpioError {
    #[error("gpio{0} is not configured as an output")]
    NotAnOutput(PinId),
    #[error("gpio{0} is not configured as an input")]
    NotAnInput(PinId),
    #[error("subsystem handle already released")]
    Released,
}

#[derive(Default)]
struct SimState {
    modes: HashMap<PinId, PinMode>,
    levels: HashMap<PinId, Level>,
    pulses: Vec<(PinId, u32, Level)>,
    callbacks: HashMap<PinId, EdgeCallback>,
    released: bool,
}

impl SimState {
    fn guard_released(&self) -> Result<(), SimGpioError> {
        if self.released {
            Err(SimGpioError::Released)
        } else {
            Ok(())
        }
    }
}

/// Clonable handle onto a simulated GPIO subsystem. All clones share the
/// same pins, so one clone can drive the sensor while another plays the
/// role of the hardware.
#[derive(Clone, Default)]
pub struct SimGpio {
    state: Arc<Mutex<SimState>>,
}

impl SimGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one edge event to whatever callback is subscribed on `pin`.
    /// Events on unsubscribed pins vanish, as they would on real hardware.
    pub fn fire_edge(&self, pin: PinId, level: Level, ticks: Ticks) {
        let callback = self.state.lock().callbacks.get(&pin).cloned();
        if let Some(callback) = callback {
            callback(pin, level, ticks);
        }
    }

    pub fn mode(&self, pin: PinId) -> Option<PinMode> {
        self.state.lock().modes.get(&pin).copied()
    }

    pub fn level(&self, pin: PinId) -> Option<Level> {
        self.state.lock().levels.get(&pin).copied()
    }

    /// Every pulse emitted so far, as `(pin, width_us, level)`.
    pub fn pulses(&self) -> Vec<(PinId, u32, Level)> {
        self.state.lock().pulses.clone()
    }

    pub fn is_subscribed(&self, pin: PinId) -> bool {
        self.state.lock().callbacks.contains_key(&pin)
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }
}

impl GpioSubsystem for SimGpio {
    type Error = SimGpioError;
    type Subscription = SimSubscription;

    fn acquire() -> Result<Self, Self::Error> {
        Ok(Self::new())
    }

    fn set_mode(&mut self, pin: PinId, mode: PinMode) -> Result<(), Self::Error> {
        let mut state = self.state.lock();
        state.guard_released()?;
        state.modes.insert(pin, mode);
        Ok(())
    }

    fn write(&mut self, pin: PinId, level: Level) -> Result<(), Self::Error> {
        let mut state = self.state.lock();
        state.guard_released()?;
        match state.modes.get(&pin) {
            Some(PinMode::Output) => {
                state.levels.insert(pin, level);
                Ok(())
            }
            _ => Err(SimGpioError::NotAnOutput(pin)),
        }
    }

    fn pulse(&mut self, pin: PinId, width_us: u32, level: Level) -> Result<(), Self::Error> {
        let mut state = self.state.lock();
        state.guard_released()?;
        match state.modes.get(&pin) {
            Some(PinMode::Output) => {
                state.pulses.push((pin, width_us, level));
                Ok(())
            }
            _ => Err(SimGpioError::NotAnOutput(pin)),
        }
    }

    fn subscribe_edges(
        &mut self,
        pin: PinId,
        callback: EdgeCallback,
    ) -> Result<Self::Subscription, Self::Error> {
        let mut state = self.state.lock();
        state.guard_released()?;
        match state.modes.get(&pin) {
            Some(PinMode::Input) => {
                state.callbacks.insert(pin, callback);
                Ok(SimSubscription {
                    state: Arc::clone(&self.state),
                    pin,
                })
            }
            _ => Err(SimGpioError::NotAnInput(pin)),
        }
    }

    fn release(&mut self) -> Result<(), Self::Error> {
        let mut state = self.state.lock();
        state.guard_released()?;
        state.released = true;
        state.callbacks.clear();
        Ok(())
    }
}

pub struct SimSubscription {
    state: Arc<Mutex<SimState>>,
    pin: PinId,
}

impl EdgeSubscription for SimSubscription {
    type Error = SimGpioError;

    fn cancel(&mut self) -> Result<(), Self::Error> {
        self.state.lock().callbacks.remove(&self.pin);
        Ok(())
    }
}
