// Indicator LEDs and the button/LED hardware layer

pub mod gpio;

pub use gpio::{SysfsButton, SysfsLed, SysfsPin};

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const BLINK_ON: Duration = Duration::from_millis(500);
const BLINK_OFF: Duration = Duration::from_millis(500);
const STOP_PULSE: Duration = Duration::from_millis(1000);
const SHUTDOWN_PULSE: Duration = Duration::from_millis(2000);

/// What an LED should be doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedMode {
    Off,
    On,
    Blink { on: Duration, off: Duration },
    /// On once for the duration, then off
    Pulse(Duration),
}

impl LedMode {
    /// Output level `elapsed` after the mode was set
    pub fn level_at(&self, elapsed: Duration) -> bool {
        match *self {
            LedMode::Off => false,
            LedMode::On => true,
            LedMode::Blink { on, off } => {
                let period = (on + off).as_millis().max(1);
                elapsed.as_millis() % period < on.as_millis()
            }
            LedMode::Pulse(d) => elapsed < d,
        }
    }
}

pub trait Led: Send + Sync {
    fn set(&self, mode: LedMode);
    fn mode(&self) -> LedMode;
}

/// Used when `use_led = false`
#[derive(Debug, Default)]
pub struct NullLed;

impl Led for NullLed {
    fn set(&self, _mode: LedMode) {}

    fn mode(&self) -> LedMode {
        LedMode::Off
    }
}

/// Keeps every mode it was given; for bench runs and tests
#[derive(Debug, Default, Clone)]
pub struct MemoryLed {
    history: Arc<Mutex<Vec<LedMode>>>,
}

impl MemoryLed {
    pub fn history(&self) -> Vec<LedMode> {
        self.history.lock().clone()
    }
}

impl Led for MemoryLed {
    fn set(&self, mode: LedMode) {
        let mut history = self.history.lock();
        if history.last() != Some(&mode) {
            history.push(mode);
        }
    }

    fn mode(&self) -> LedMode {
        self.history.lock().last().copied().unwrap_or(LedMode::Off)
    }
}

/// The three front-panel LEDs and what each state looks like
pub struct Indicators {
    power: Arc<dyn Led>,
    wifi: Arc<dyn Led>,
    rec: Arc<dyn Led>,
}

impl Indicators {
    pub fn new(power: Arc<dyn Led>, wifi: Arc<dyn Led>, rec: Arc<dyn Led>) -> Self {
        Self { power, wifi, rec }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NullLed), Arc::new(NullLed), Arc::new(NullLed))
    }

    pub fn running(&self) {
        self.power.set(LedMode::On);
    }

    /// Blink while recording, one pulse when recording stops
    pub fn recording(&self, active: bool) {
        if active {
            self.rec.set(LedMode::Blink {
                on: BLINK_ON,
                off: BLINK_OFF,
            });
        } else if matches!(self.rec.mode(), LedMode::Blink { .. }) {
            self.rec.set(LedMode::Pulse(STOP_PULSE));
        }
    }

    pub fn wifi(&self, on: bool) {
        self.wifi.set(if on { LedMode::On } else { LedMode::Off });
    }

    pub fn shutting_down(&self) {
        self.power.set(LedMode::Pulse(SHUTDOWN_PULSE));
    }

    /// Fatal error: everything dark
    pub fn all_off(&self) {
        self.power.set(LedMode::Off);
        self.wifi.set(LedMode::Off);
        self.rec.set(LedMode::Off);
    }
}
