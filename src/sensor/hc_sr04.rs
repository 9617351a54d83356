//! Interrupt-timed driver for the **HC-SR04** ultrasonic ranger.
//!
//! The sensor reports distance as the width of a digital echo pulse: a
//! short trigger pulse starts a ranging cycle, then the echo pin goes high
//! for as long as the ultrasonic round trip took. The GPIO subsystem
//! timestamps both edges of that pulse and routes them here through the
//! [`EdgeDispatcher`]; the measuring thread polls the captured width and
//! converts it to metres.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::info;
use parking_lot::Mutex;

use crate::dispatch::EdgeDispatcher;
use crate::gpio::{tick_diff, EdgeSubscription, GpioSubsystem, Level, PinId, PinMode, Ticks};
use crate::sensor::Sensor;

/// Default speed of sound in metres per second.
pub const SPEED_OF_SOUND: f32 = 343.0;

/// Maximum rated measuring range of the HC-SR04 in metres.
pub const MAXIMUM_RANGE: f32 = 4.0;

/// Round-trip echo time at the maximum rated range, in seconds.
const MAXIMUM_ECHO_TIME: f32 = 2.0 * MAXIMUM_RANGE / SPEED_OF_SOUND;

/// How long a ranging cycle waits for an echo before giving up, in
/// seconds. Fixed at compile time from the default speed of sound;
/// reconfiguring the speed of sound does not widen this window.
const MAXIMUM_RANGE_TIME: f32 = MAXIMUM_ECHO_TIME * 1.1;

/// Width of the trigger pulse that starts a ranging cycle, in microseconds.
const TRIGGER_PULSE_WIDTH_US: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum HcSr04Error<E>
where
    E: std::error::Error + 'static,
{
    /// The GPIO subsystem could not be acquired at construction.
    #[error("gpio subsystem unavailable")]
    SubsystemUnavailable(#[source] E),
    /// An individual subsystem operation failed; `op` names it.
    #[error("gpio {op} failed")]
    Subsystem { op: &'static str, source: E },
    /// The subsystem handle was already released by [`HcSr04::cleanup`].
    #[error("gpio subsystem handle already released")]
    SubsystemReleased,
}

type RangeResult<T, E> = Result<T, HcSr04Error<E>>;

fn subsystem_err<E: std::error::Error + 'static>(op: &'static str) -> impl FnOnce(E) -> HcSr04Error<E> {
    move |source| HcSr04Error::Subsystem { op, source }
}

/// Echo pulse capture shared between the edge handler and the measuring
/// thread. `initial_ticks == 0` doubles as the idle state: no pulse in
/// flight.
#[derive(Default)]
struct PulseTimer {
    initial_ticks: Ticks,
    elapsed_ticks: Ticks,
}

impl PulseTimer {
    fn record_edge(&mut self, level: Level, ticks: Ticks) {
        match level {
            // Rising edge starts the pulse. A repeat rising edge (echo
            // noise, stray reflection) restarts the measurement from the
            // new timestamp and discards the partial one.
            Level::High => self.initial_ticks = ticks,
            // Falling edge closes the pulse, unless none is in flight: a
            // spurious or duplicate falling edge is ignored.
            Level::Low => {
                if self.initial_ticks > 0 {
                    self.elapsed_ticks = tick_diff(self.initial_ticks, ticks);
                    self.initial_ticks = 0;
                }
            }
        }
    }
}

/// **HC-SR04** ultrasonic ranger on any [`GpioSubsystem`] backend.
///
/// One instance owns its subsystem handle, its trigger/echo pin pair and
/// one entry in the shared [`EdgeDispatcher`]. Register at most one
/// instance per echo pin; registering another replaces the first one's
/// routing.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use esp_ranger::{EdgeDispatcher, HcSr04, SimGpio};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let dispatcher = Arc::new(EdgeDispatcher::new());
/// let mut ranger: HcSr04<SimGpio> = HcSr04::new(23, 24, dispatcher)?;
/// // With nothing wired to the echo pin the cycle times out at 0.0m.
/// let range = ranger.measure_range()?;
/// assert_eq!(range, 0.0);
/// ranger.cleanup()?;
/// # Ok(())
/// # }
/// ```
pub struct HcSr04<G: GpioSubsystem> {
    gpio: Option<G>,
    trigger_pin: PinId,
    echo_pin: PinId,
    speed_of_sound: f32,
    poll_interval: Duration,
    timer: Arc<Mutex<PulseTimer>>,
    dispatcher: Arc<EdgeDispatcher>,
    subscription: Option<G::Subscription>,
}

impl<G: GpioSubsystem> HcSr04<G> {
    /// Acquire the GPIO subsystem and set up the sensor on the given
    /// trigger/echo pin pair.
    pub fn new(
        trigger_pin: PinId,
        echo_pin: PinId,
        dispatcher: Arc<EdgeDispatcher>,
    ) -> RangeResult<Self, G::Error> {
        let gpio = G::acquire().map_err(HcSr04Error::SubsystemUnavailable)?;
        Self::with_subsystem(gpio, trigger_pin, echo_pin, dispatcher)
    }

    /// Set up the sensor on an already-acquired subsystem handle.
    pub fn with_subsystem(
        mut gpio: G,
        trigger_pin: PinId,
        echo_pin: PinId,
        dispatcher: Arc<EdgeDispatcher>,
    ) -> RangeResult<Self, G::Error> {
        gpio.set_mode(trigger_pin, PinMode::Output)
            .map_err(subsystem_err("set_mode"))?;
        gpio.set_mode(echo_pin, PinMode::Input)
            .map_err(subsystem_err("set_mode"))?;
        gpio.write(trigger_pin, Level::Low)
            .map_err(subsystem_err("write"))?;

        // Let the sensor settle before the first ranging cycle.
        thread::sleep(Duration::from_secs_f32(MAXIMUM_ECHO_TIME));

        let timer = Arc::new(Mutex::new(PulseTimer::default()));
        let handler_timer = Arc::clone(&timer);
        dispatcher.register(
            echo_pin,
            Arc::new(move |level, ticks| handler_timer.lock().record_edge(level, ticks)),
        );

        let subscription = match gpio.subscribe_edges(echo_pin, dispatcher.edge_entry()) {
            Ok(subscription) => subscription,
            Err(source) => {
                dispatcher.unregister(echo_pin);
                return Err(HcSr04Error::Subsystem {
                    op: "subscribe_edges",
                    source,
                });
            }
        };

        info!("HC-SR04 ready (trigger gpio{trigger_pin}, echo gpio{echo_pin})");

        Ok(Self {
            gpio: Some(gpio),
            trigger_pin,
            echo_pin,
            speed_of_sound: SPEED_OF_SOUND,
            poll_interval: Duration::from_secs_f32(MAXIMUM_RANGE_TIME / 10.0),
            timer,
            dispatcher,
            subscription: Some(subscription),
        })
    }

    /// Set the speed of sound in metres per second used to convert pulse
    /// width into distance. The value is not validated; callers are
    /// responsible for physically sensible numbers. The echo timeout
    /// window stays derived from the default speed of sound.
    pub fn set_speed_of_sound(&mut self, speed: f32) {
        self.speed_of_sound = speed;
    }

    /// Currently configured speed of sound in metres per second.
    pub fn speed_of_sound(&self) -> f32 {
        self.speed_of_sound
    }

    /// Granularity of the echo poll loop in
    /// [`measure_pulse_width`](Self::measure_pulse_width). Defaults to a
    /// tenth of the ranging window.
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    /// Take a single range measurement and return the received echo pulse
    /// width in microseconds. `Ok(0)` means no echo arrived within the
    /// ranging window, a normal outcome for an out-of-range object, not an
    /// error. Use [`measure_range`](Self::measure_range) for metres.
    ///
    /// Blocks the calling thread for up to the ranging window. The
    /// captured width is not cleared between cycles, so a width left by an
    /// earlier cycle is returned as-is; take one measurement at a time per
    /// sensor.
    pub fn measure_pulse_width(&mut self) -> RangeResult<Ticks, G::Error> {
        info!("measuring echo pulse width ...");
        let gpio = self.gpio.as_mut().ok_or(HcSr04Error::SubsystemReleased)?;
        gpio.pulse(self.trigger_pin, TRIGGER_PULSE_WIDTH_US, Level::High)
            .map_err(subsystem_err("pulse"))?;

        // The echo edges land in `timer` from the subsystem's callback
        // context; all this thread can do is poll for the result.
        let deadline = Instant::now() + Duration::from_secs_f32(MAXIMUM_RANGE_TIME);
        while self.timer.lock().elapsed_ticks == 0 && Instant::now() < deadline {
            thread::sleep(self.poll_interval);
        }

        Ok(self.timer.lock().elapsed_ticks)
    }

    /// Take a single range measurement and return the distance in metres.
    ///
    /// The normal valid range is 0 to 4m. A timeout reads as exactly 0.0
    /// and an out-of-spec echo pulse may read beyond the rated maximum;
    /// callers decide how to interpret either.
    pub fn measure_range(&mut self) -> RangeResult<f32, G::Error> {
        let width = self.measure_pulse_width()?;
        // Ticks are microseconds; half the round trip is the distance.
        Ok(self.speed_of_sound * width as f32 / 2e6)
    }

    /// Release the edge subscription, the pins and the subsystem handle.
    ///
    /// Best-effort: every step runs even if an earlier one fails, and the
    /// first error encountered is returned. Safe to call more than once;
    /// later calls are no-ops.
    pub fn cleanup(&mut self) -> RangeResult<(), G::Error> {
        let mut first_error = None;

        if let Some(mut subscription) = self.subscription.take() {
            if let Err(source) = subscription.cancel() {
                first_error.get_or_insert(HcSr04Error::Subsystem {
                    op: "cancel",
                    source,
                });
            }
        }

        // Revert the trigger pin to an input so the released pin is not
        // left driven.
        if let Some(gpio) = self.gpio.as_mut() {
            if let Err(source) = gpio.set_mode(self.trigger_pin, PinMode::Input) {
                first_error.get_or_insert(HcSr04Error::Subsystem {
                    op: "set_mode",
                    source,
                });
            }
        }

        self.dispatcher.unregister(self.echo_pin);

        if let Some(mut gpio) = self.gpio.take() {
            if let Err(source) = gpio.release() {
                first_error.get_or_insert(HcSr04Error::Subsystem {
                    op: "release",
                    source,
                });
            }
            info!(
                "HC-SR04 released (trigger gpio{}, echo gpio{})",
                self.trigger_pin, self.echo_pin
            );
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl<G: GpioSubsystem> Drop for HcSr04<G> {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

/// Coarse classification of a range reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeStatus {
    NoEcho,
    Near,
    Mid,
    Far,
}

impl std::fmt::Display for RangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RangeStatus::NoEcho => write!(f, "No echo ‼️"),
            RangeStatus::Near => write!(f, "Near"),
            RangeStatus::Mid => write!(f, "Mid"),
            RangeStatus::Far => write!(f, "Far"),
        }
    }
}

impl<G: GpioSubsystem> Sensor for HcSr04<G> {
    type Error = HcSr04Error<G::Error>;
    type Status = RangeStatus;

    fn get_measurment(&mut self) -> Result<f32, Self::Error> {
        self.measure_range()
    }

    fn get_status(&mut self) -> Result<Self::Status, Self::Error> {
        let range = self.get_measurment()?;
        match range {
            r if r == 0.0 => Ok(RangeStatus::NoEcho),
            r if r < 0.5 => Ok(RangeStatus::Near),
            r if r < 2.0 => Ok(RangeStatus::Mid),
            _ => Ok(RangeStatus::Far),
        }
    }

    fn get_unit(&self) -> &str {
        "m"
    }

    fn get_name(&self) -> &str {
        "range"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::sim::{SimGpio, SimGpioError};
    use crate::sensor::MessageAble;

    const TRIGGER: PinId = 23;
    const ECHO: PinId = 24;

    fn sim_ranger() -> (SimGpio, Arc<EdgeDispatcher>, HcSr04<SimGpio>) {
        let gpio = SimGpio::new();
        let dispatcher = Arc::new(EdgeDispatcher::new());
        let ranger =
            HcSr04::with_subsystem(gpio.clone(), TRIGGER, ECHO, Arc::clone(&dispatcher)).unwrap();
        (gpio, dispatcher, ranger)
    }

    /// Fire a rising/falling edge pair on the echo pin from a background
    /// thread, shortly after the measuring thread starts polling.
    fn inject_echo(gpio: &SimGpio, rising: Ticks, falling: Ticks) -> thread::JoinHandle<()> {
        let injector = gpio.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            injector.fire_edge(ECHO, Level::High, rising);
            injector.fire_edge(ECHO, Level::Low, falling);
        })
    }

    #[test]
    fn configures_pins_on_construction() {
        let (gpio, dispatcher, _ranger) = sim_ranger();
        assert_eq!(gpio.mode(TRIGGER), Some(PinMode::Output));
        assert_eq!(gpio.mode(ECHO), Some(PinMode::Input));
        assert_eq!(gpio.level(TRIGGER), Some(Level::Low));
        assert!(gpio.is_subscribed(ECHO));
        assert!(dispatcher.is_registered(ECHO));
    }

    #[test]
    fn pulse_width_from_an_edge_pair() {
        let (gpio, _dispatcher, mut ranger) = sim_ranger();
        let echo = inject_echo(&gpio, 10_000, 11_000);

        let width = ranger.measure_pulse_width().unwrap();
        echo.join().unwrap();

        assert_eq!(width, 1_000);
        // Exactly one 10us high trigger pulse went out.
        assert_eq!(gpio.pulses(), vec![(TRIGGER, 10, Level::High)]);
    }

    #[test]
    fn pulse_width_across_tick_wraparound() {
        let (gpio, _dispatcher, mut ranger) = sim_ranger();
        let echo = inject_echo(&gpio, u32::MAX - 499, 500);

        let width = ranger.measure_pulse_width().unwrap();
        echo.join().unwrap();

        assert_eq!(width, 1_000);
    }

    #[test]
    fn range_conversion_at_default_speed() {
        let (gpio, _dispatcher, mut ranger) = sim_ranger();
        let echo = inject_echo(&gpio, 50_000, 51_000);

        let range = ranger.measure_range().unwrap();
        echo.join().unwrap();

        // 343 * 1000 / 2e6
        assert!((range - 0.1715).abs() < 1e-6);
    }

    #[test]
    fn speed_of_sound_is_configurable_and_used() {
        let (gpio, _dispatcher, mut ranger) = sim_ranger();
        assert_eq!(ranger.speed_of_sound(), SPEED_OF_SOUND);

        ranger.set_speed_of_sound(340.0);
        assert_eq!(ranger.speed_of_sound(), 340.0);

        let echo = inject_echo(&gpio, 1_000, 2_000);
        let range = ranger.measure_range().unwrap();
        echo.join().unwrap();
        assert!((range - 0.17).abs() < 1e-6);
    }

    #[test]
    fn timeout_returns_zero_within_the_window() {
        let (_gpio, _dispatcher, mut ranger) = sim_ranger();
        let window = Duration::from_secs_f32(MAXIMUM_RANGE_TIME);

        let start = Instant::now();
        let width = ranger.measure_pulse_width().unwrap();
        let waited = start.elapsed();

        assert_eq!(width, 0);
        assert!(waited >= window);
        // Bounded by the window plus one poll increment and some slack.
        assert!(waited < window * 3);
    }

    #[test]
    fn timeout_range_is_exactly_zero() {
        let (_gpio, _dispatcher, mut ranger) = sim_ranger();
        assert_eq!(ranger.measure_range().unwrap(), 0.0);
    }

    #[test]
    fn captured_width_persists_across_cycles() {
        let (gpio, _dispatcher, mut ranger) = sim_ranger();
        let echo = inject_echo(&gpio, 10_000, 11_000);
        assert_eq!(ranger.measure_pulse_width().unwrap(), 1_000);
        echo.join().unwrap();

        // With no new echo the previous width is observed immediately;
        // callers serialize cycles and interpret accordingly.
        let start = Instant::now();
        assert_eq!(ranger.measure_pulse_width().unwrap(), 1_000);
        assert!(start.elapsed() < Duration::from_secs_f32(MAXIMUM_RANGE_TIME));
    }

    #[test]
    fn edge_pair_is_recorded_once() {
        let mut timer = PulseTimer::default();
        timer.record_edge(Level::High, 100);
        timer.record_edge(Level::Low, 350);
        assert_eq!(timer.elapsed_ticks, 250);
        assert_eq!(timer.initial_ticks, 0);

        // A duplicate falling edge with no pulse in flight changes nothing.
        timer.record_edge(Level::Low, 900);
        assert_eq!(timer.elapsed_ticks, 250);
        assert_eq!(timer.initial_ticks, 0);
    }

    #[test]
    fn spurious_falling_edge_is_ignored() {
        let mut timer = PulseTimer::default();
        timer.record_edge(Level::Low, 500);
        assert_eq!(timer.initial_ticks, 0);
        assert_eq!(timer.elapsed_ticks, 0);
    }

    #[test]
    fn repeated_rising_edge_restarts_the_pulse() {
        let mut timer = PulseTimer::default();
        timer.record_edge(Level::High, 1_000);
        timer.record_edge(Level::High, 4_000);
        timer.record_edge(Level::Low, 4_600);
        assert_eq!(timer.elapsed_ticks, 600);
    }

    #[test]
    fn cleanup_releases_everything() {
        let (gpio, dispatcher, mut ranger) = sim_ranger();
        ranger.cleanup().unwrap();

        assert!(!dispatcher.is_registered(ECHO));
        assert!(!gpio.is_subscribed(ECHO));
        assert_eq!(gpio.mode(TRIGGER), Some(PinMode::Input));
        assert!(gpio.is_released());

        // Edge events for the pin are now unhandled, and harmless.
        gpio.fire_edge(ECHO, Level::High, 1);
        dispatcher.dispatch(ECHO, Level::Low, 2);

        // A second cleanup is a no-op.
        ranger.cleanup().unwrap();
    }

    #[test]
    fn measure_after_cleanup_fails() {
        let (_gpio, _dispatcher, mut ranger) = sim_ranger();
        ranger.cleanup().unwrap();
        assert!(matches!(
            ranger.measure_pulse_width(),
            Err(HcSr04Error::SubsystemReleased)
        ));
    }

    #[test]
    fn immediate_cleanup_permits_recreation_on_the_same_pins() {
        let dispatcher = Arc::new(EdgeDispatcher::new());
        let mut ranger: HcSr04<SimGpio> =
            HcSr04::new(TRIGGER, ECHO, Arc::clone(&dispatcher)).unwrap();
        ranger.cleanup().unwrap();
        assert!(!dispatcher.is_registered(ECHO));

        let again: HcSr04<SimGpio> = HcSr04::new(TRIGGER, ECHO, Arc::clone(&dispatcher)).unwrap();
        assert!(dispatcher.is_registered(ECHO));
        drop(again);
        assert!(!dispatcher.is_registered(ECHO));
    }

    #[test]
    fn construction_fails_on_a_dead_subsystem() {
        let mut gpio = SimGpio::new();
        gpio.release().unwrap();
        let dispatcher = Arc::new(EdgeDispatcher::new());

        let result = HcSr04::with_subsystem(gpio, TRIGGER, ECHO, Arc::clone(&dispatcher));
        assert!(matches!(
            result,
            Err(HcSr04Error::Subsystem {
                op: "set_mode",
                source: SimGpioError::Released,
            })
        ));
        assert!(!dispatcher.is_registered(ECHO));
    }

    #[test]
    fn reports_like_any_other_sensor() {
        let (gpio, _dispatcher, mut ranger) = sim_ranger();
        let echo = inject_echo(&gpio, 10_000, 11_000);

        // to_json reads status then value; the second cycle reuses the
        // captured width.
        let payload = ranger.to_json();
        echo.join().unwrap();

        assert_eq!(payload["type"], "range");
        assert_eq!(payload["unit"], "m");
        assert_eq!(payload["status"], "Near");
        let value = payload["value"].as_f64().unwrap();
        assert!((value - 0.1715).abs() < 1e-4);
    }
}
