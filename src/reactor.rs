// src/reactor.rs
// Cooperative scheduler for the probing foreground.
//
// The foreground is single-threaded: strategies and probe polling
// loops run to completion, yielding at well-defined points via
// `yield_idle`. Each yield advances one scheduler tick: registered
// tick handlers fire first (the acceleration tick and the straight
// probe detector, which on hardware run in interrupt context at the
// tick rate), then idle handlers (serial pumping, simulation advance
// in tests). A process-wide halt flag is sampled by callers at every
// yield; tick handlers themselves never check it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

pub type TickHandler = Box<dyn FnMut() + Send>;

pub struct Reactor {
    ticks_per_second: f32,
    ticks: AtomicU64,
    halted: AtomicBool,
    tick_handlers: Mutex<Vec<TickHandler>>,
    idle_handlers: Mutex<Vec<TickHandler>>,
}

impl Reactor {
    pub fn new(ticks_per_second: f32) -> Self {
        Reactor {
            ticks_per_second,
            ticks: AtomicU64::new(0),
            halted: AtomicBool::new(false),
            tick_handlers: Mutex::new(Vec::new()),
            idle_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn ticks_per_second(&self) -> f32 {
        self.ticks_per_second
    }

    /// Register a handler fired once per tick, before idle handlers.
    /// Handlers must not yield back into the reactor and must not
    /// block; they run in what is interrupt context on hardware.
    pub fn register_tick_handler(&self, handler: TickHandler) {
        self.tick_handlers.lock().push(handler);
    }

    pub fn register_idle_handler(&self, handler: TickHandler) {
        self.idle_handlers.lock().push(handler);
    }

    /// Advance one tick: run tick handlers, then idle handlers.
    /// Callers must not hold any lock a handler may take.
    pub fn yield_idle(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        for handler in self.tick_handlers.lock().iter_mut() {
            handler();
        }
        for handler in self.idle_handlers.lock().iter_mut() {
            handler();
        }
    }

    /// Monotonic time in seconds, derived from the tick counter.
    pub fn monotonic(&self) -> f64 {
        self.ticks.load(Ordering::Relaxed) as f64 / self.ticks_per_second as f64
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }

    /// Asynchronous kill: probe loops observe this at their next yield
    /// and abandon the cycle without touching geometry.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Relaxed);
    }

    pub fn clear_halt(&self) {
        self.halted.store(false, Ordering::Relaxed);
    }
}
