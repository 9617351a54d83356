//! Fan-out of the subsystem's single global edge callback.
//!
//! The GPIO subsystem drives exactly one global entry point for edge
//! events. This registry forwards each event to the handler owned by the
//! sensor instance monitoring that pin, which is what lets several
//! independent sensors coexist on one subsystem.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::gpio::{EdgeCallback, Level, PinId, Ticks};

/// Per-instance handler, invoked with the edge direction and the
/// subsystem's tick timestamp.
pub type EdgeHandler = Arc<dyn Fn(Level, Ticks) + Send + Sync>;

#[derive(Default)]
pub struct EdgeDispatcher {
    handlers: Mutex<HashMap<PinId, EdgeHandler>>,
}

impl EdgeDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or overwrite) the handler monitoring `pin`.
    pub fn register(&self, pin: PinId, handler: EdgeHandler) {
        self.handlers.lock().insert(pin, handler);
    }

    /// Remove the handler for `pin`; a no-op when none is registered.
    pub fn unregister(&self, pin: PinId) {
        self.handlers.lock().remove(&pin);
    }

    pub fn is_registered(&self, pin: PinId) -> bool {
        self.handlers.lock().contains_key(&pin)
    }

    /// Route one edge event to the handler monitoring `pin`.
    ///
    /// An event for a pin nobody monitors is reported and dropped; the
    /// dispatcher stays available for every other pin.
    pub fn dispatch(&self, pin: PinId, level: Level, ticks: Ticks) {
        // Clone the handler out so the registry lock is not held across it.
        let handler = self.handlers.lock().get(&pin).cloned();
        match handler {
            Some(handler) => handler(level, ticks),
            None => warn!("unhandled edge event (pin {pin}, {level:?}, {ticks})"),
        }
    }

    /// The global entry point to hand to
    /// [`GpioSubsystem::subscribe_edges`](crate::gpio::GpioSubsystem::subscribe_edges).
    pub fn edge_entry(self: &Arc<Self>) -> EdgeCallback {
        let dispatcher = Arc::clone(self);
        Arc::new(move |pin, level, ticks| dispatcher.dispatch(pin, level, ticks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_handler(hits: &Arc<AtomicU32>) -> EdgeHandler {
        let hits = Arc::clone(hits);
        Arc::new(move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn routes_to_the_registered_handler() {
        let dispatcher = EdgeDispatcher::new();
        let hits = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&hits);
        dispatcher.register(
            24,
            Arc::new(move |level, ticks| {
                assert_eq!((level, ticks), (Level::High, 1_234));
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        dispatcher.dispatch(24, Level::High, 1_234);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_pin_is_reported_not_fatal() {
        let dispatcher = EdgeDispatcher::new();
        // Must come back without panicking; the event is logged and dropped.
        dispatcher.dispatch(7, Level::Low, 42);
    }

    #[test]
    fn events_stop_after_unregister() {
        let dispatcher = EdgeDispatcher::new();
        let hits = Arc::new(AtomicU32::new(0));
        dispatcher.register(24, counting_handler(&hits));
        dispatcher.dispatch(24, Level::High, 1);

        dispatcher.unregister(24);
        assert!(!dispatcher.is_registered(24));
        dispatcher.dispatch(24, Level::Low, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Removing an absent entry is a no-op, not an error.
        dispatcher.unregister(24);
    }

    #[test]
    fn register_overwrites_the_previous_handler() {
        let dispatcher = EdgeDispatcher::new();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        dispatcher.register(24, counting_handler(&first));
        dispatcher.register(24, counting_handler(&second));

        dispatcher.dispatch(24, Level::High, 1);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn edge_entry_forwards_into_the_registry() {
        let dispatcher = Arc::new(EdgeDispatcher::new());
        let hits = Arc::new(AtomicU32::new(0));
        dispatcher.register(24, counting_handler(&hits));

        let entry = dispatcher.edge_entry();
        entry(24, Level::High, 9);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
