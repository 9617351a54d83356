//! ESP-IDF backend for the GPIO capability.
//!
//! Edge interrupts use the raw IDF ISR service: the ISR stamps the event
//! with `esp_timer_get_time()` truncated into the wrapping u32 tick domain
//! and pushes it onto a FreeRTOS queue, and a forwarder thread drains the
//! queue into the subscribed callback. Handler code therefore never runs
//! in interrupt context.

use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::size_of;
use std::sync::Arc;
use std::thread::JoinHandle;

use esp_idf_hal::delay::Ets;
use esp_idf_hal::gpio::{AnyIOPin, Input, Output, PinDriver};
use esp_idf_sys::{
    esp, esp_timer_get_time, gpio_get_level, gpio_install_isr_service,
    gpio_int_type_t_GPIO_INTR_ANYEDGE, gpio_intr_disable, gpio_intr_enable, gpio_isr_handler_add,
    gpio_isr_handler_remove, gpio_set_intr_type, vQueueDelete, xQueueGenericCreate,
    xQueueGenericSend, xQueueGenericSendFromISR, xQueueReceive, BaseType_t, EspError,
    QueueHandle_t, TickType_t, ESP_ERR_INVALID_ARG, ESP_ERR_INVALID_STATE, ESP_ERR_NO_MEM,
};
use log::warn;
use parking_lot::Mutex;

use super::{EdgeCallback, EdgeSubscription, GpioSubsystem, Level, PinId, PinMode, Ticks};

/// Queue depth for in-flight edge events. A full queue drops the edge and
/// the measuring side treats the cycle as a timeout.
const EDGE_QUEUE_DEPTH: u32 = 16;

/// Sentinel pin id that tells the forwarder thread to exit.
const SHUTDOWN_PIN: PinId = PinId::MAX;

/// Edge record shipped from the ISR to the forwarder thread.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct RawEdge {
    pin: PinId,
    ticks: Ticks,
    level: u8,
}

/// Per-subscription context handed to the ISR as its argument.
struct IsrSlot {
    pin: PinId,
    queue: QueueHandle_t,
}

// ESP_ERR_NO_MEM is nonzero, so the conversion always yields an error.
fn no_mem() -> EspError {
    EspError::from(ESP_ERR_NO_MEM).expect("nonzero esp_err_t")
}

unsafe extern "C" fn edge_isr(slot: *mut c_void) {
    let slot = &*(slot as *const IsrSlot);
    let raw = RawEdge {
        pin: slot.pin,
        ticks: esp_timer_get_time() as Ticks,
        level: gpio_get_level(slot.pin as i32) as u8,
    };
    let mut task_woken: BaseType_t = 0;
    xQueueGenericSendFromISR(
        slot.queue,
        &raw as *const RawEdge as *const c_void,
        &mut task_woken,
        0,
    );
}

fn forward_edges(queue: usize, routes: Arc<Mutex<HashMap<PinId, EdgeCallback>>>) {
    let queue = queue as QueueHandle_t;
    loop {
        let mut raw = RawEdge::default();
        let received =
            unsafe { xQueueReceive(queue, &mut raw as *mut RawEdge as *mut c_void, TickType_t::MAX) };
        if received != 1 {
            continue;
        }
        if raw.pin == SHUTDOWN_PIN {
            break;
        }
        let callback = routes.lock().get(&raw.pin).cloned();
        match callback {
            Some(callback) => {
                let level = if raw.level == 0 { Level::Low } else { Level::High };
                callback(raw.pin, level, raw.ticks);
            }
            None => warn!("edge event for unsubscribed gpio{}", raw.pin),
        }
    }
}

enum EspPin {
    Input(PinDriver<'static, AnyIOPin, Input>),
    Output(PinDriver<'static, AnyIOPin, Output>),
}

/// GPIO capability over the ESP-IDF pin drivers.
pub struct EspGpio {
    pins: HashMap<PinId, EspPin>,
    routes: Arc<Mutex<HashMap<PinId, EdgeCallback>>>,
    queue: QueueHandle_t,
    forwarder: Option<JoinHandle<()>>,
}

// Safety: the queue handle may be used from any thread by FreeRTOS
// contract; everything else is owned data.
unsafe impl Send for EspGpio {}

impl GpioSubsystem for EspGpio {
    type Error = EspError;
    type Subscription = EspSubscription;

    fn acquire() -> Result<Self, Self::Error> {
        // Another driver may have installed the ISR service already.
        match esp!(unsafe { gpio_install_isr_service(0) }) {
            Ok(()) => {}
            Err(error) if error.code() == ESP_ERR_INVALID_STATE => {}
            Err(error) => return Err(error),
        }

        let queue = unsafe { xQueueGenericCreate(EDGE_QUEUE_DEPTH, size_of::<RawEdge>() as u32, 0) };
        if queue.is_null() {
            return Err(no_mem());
        }

        let routes: Arc<Mutex<HashMap<PinId, EdgeCallback>>> = Arc::new(Mutex::new(HashMap::new()));
        let thread_routes = Arc::clone(&routes);
        let thread_queue = queue as usize;
        let forwarder = match std::thread::Builder::new()
            .name("gpio-edge".into())
            .spawn(move || forward_edges(thread_queue, thread_routes))
        {
            Ok(handle) => handle,
            Err(_) => {
                unsafe { vQueueDelete(queue) };
                return Err(no_mem());
            }
        };

        Ok(Self {
            pins: HashMap::new(),
            routes,
            queue,
            forwarder: Some(forwarder),
        })
    }

    fn set_mode(&mut self, pin: PinId, mode: PinMode) -> Result<(), Self::Error> {
        // Drop any previous driver first so the pin can be re-claimed.
        self.pins.remove(&pin);
        // Safety: exclusive claim of the pin is this handle's contract.
        let any = unsafe { AnyIOPin::new(pin as i32) };
        let driver = match mode {
            PinMode::Input => EspPin::Input(PinDriver::input(any)?),
            PinMode::Output => EspPin::Output(PinDriver::output(any)?),
        };
        self.pins.insert(pin, driver);
        Ok(())
    }

    fn write(&mut self, pin: PinId, level: Level) -> Result<(), Self::Error> {
        match self.pins.get_mut(&pin) {
            Some(EspPin::Output(driver)) => match level {
                Level::High => driver.set_high(),
                Level::Low => driver.set_low(),
            },
            _ => esp!(ESP_ERR_INVALID_ARG),
        }
    }

    fn pulse(&mut self, pin: PinId, width_us: u32, level: Level) -> Result<(), Self::Error> {
        let resting = match level {
            Level::High => Level::Low,
            Level::Low => Level::High,
        };
        self.write(pin, level)?;
        Ets::delay_us(width_us);
        self.write(pin, resting)
    }

    fn subscribe_edges(
        &mut self,
        pin: PinId,
        callback: EdgeCallback,
    ) -> Result<Self::Subscription, Self::Error> {
        if !matches!(self.pins.get(&pin), Some(EspPin::Input(_))) {
            esp!(ESP_ERR_INVALID_ARG)?;
        }
        self.routes.lock().insert(pin, callback);

        let slot = Box::into_raw(Box::new(IsrSlot {
            pin,
            queue: self.queue,
        }));
        let armed = (|| {
            esp!(unsafe { gpio_set_intr_type(pin as i32, gpio_int_type_t_GPIO_INTR_ANYEDGE) })?;
            esp!(unsafe { gpio_isr_handler_add(pin as i32, Some(edge_isr), slot as *mut c_void) })?;
            esp!(unsafe { gpio_intr_enable(pin as i32) })
        })();
        if let Err(error) = armed {
            self.routes.lock().remove(&pin);
            unsafe {
                gpio_isr_handler_remove(pin as i32);
                drop(Box::from_raw(slot));
            }
            return Err(error);
        }

        Ok(EspSubscription {
            pin,
            slot,
            routes: Arc::clone(&self.routes),
        })
    }

    fn release(&mut self) -> Result<(), Self::Error> {
        // Wake the forwarder with the shutdown sentinel, then tear the
        // queue down once it has exited.
        if let Some(forwarder) = self.forwarder.take() {
            let raw = RawEdge {
                pin: SHUTDOWN_PIN,
                ticks: 0,
                level: 0,
            };
            unsafe {
                xQueueGenericSend(
                    self.queue,
                    &raw as *const RawEdge as *const c_void,
                    TickType_t::MAX,
                    0,
                );
            }
            let _ = forwarder.join();
        }
        if !self.queue.is_null() {
            unsafe { vQueueDelete(self.queue) };
            self.queue = core::ptr::null_mut();
        }
        self.routes.lock().clear();
        self.pins.clear();
        Ok(())
    }
}

pub struct EspSubscription {
    pin: PinId,
    slot: *mut IsrSlot,
    routes: Arc<Mutex<HashMap<PinId, EdgeCallback>>>,
}

// Safety: the slot pointer is only dereferenced by the ISR, and only
// reclaimed here after the handler has been removed.
unsafe impl Send for EspSubscription {}

impl EdgeSubscription for EspSubscription {
    type Error = EspError;

    fn cancel(&mut self) -> Result<(), Self::Error> {
        if self.slot.is_null() {
            return Ok(());
        }
        self.routes.lock().remove(&self.pin);
        let result = (|| {
            esp!(unsafe { gpio_intr_disable(self.pin as i32) })?;
            esp!(unsafe { gpio_isr_handler_remove(self.pin as i32) })
        })();
        // The handler is detached either way; reclaim the ISR context.
        unsafe { drop(Box::from_raw(self.slot)) };
        self.slot = core::ptr::null_mut();
        result
    }
}
