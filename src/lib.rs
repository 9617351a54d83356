//! Interrupt-timed **HC-SR04** ultrasonic ranger.
//!
//! A ranging cycle triggers the sensor, captures both edges of the
//! returned echo pulse through the GPIO subsystem's edge interrupts and
//! converts the pulse width into a distance. The subsystem itself is a
//! capability ([`GpioSubsystem`]): the crate ships a simulated backend
//! ([`SimGpio`]) that runs anywhere and an ESP-IDF backend for the real
//! pins, while the [`EdgeDispatcher`] fans the subsystem's single global
//! edge callback out to the sensor instances.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use esp_ranger::{EdgeDispatcher, HcSr04, SimGpio};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Arc::new(EdgeDispatcher::new());
//! let mut ranger: HcSr04<SimGpio> = HcSr04::new(23, 24, dispatcher)?;
//! println!("range: {}m", ranger.measure_range()?);
//! ranger.cleanup()?;
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod gpio;
pub mod sensor;

pub use dispatch::{EdgeDispatcher, EdgeHandler};
#[cfg(target_os = "espidf")]
pub use gpio::espidf::EspGpio;
pub use gpio::sim::{SimGpio, SimGpioError};
pub use gpio::{EdgeCallback, EdgeSubscription, GpioSubsystem, Level, PinId, PinMode, Ticks};
pub use sensor::hc_sr04::{HcSr04, HcSr04Error, RangeStatus};
pub use sensor::{MessageAble, Sensor};
