// Recording schedule, intent derivation and the wall clock

use chrono::{NaiveDateTime, Timelike};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Immutable recording configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    /// Window start, local hour 0-23 (inclusive)
    pub start_hour: u32,
    /// Window end, local hour 0-23 (exclusive)
    pub end_hour: u32,
    pub interval_minutes: u32,
    /// 0 = unbounded
    pub max_intervals: u32,
    pub preview_period: Duration,
    pub min_free_bytes: u64,
    pub wifi_off_delay: Duration,
}

impl Schedule {
    /// Is `hour` inside the half-open window `[start_hour, end_hour)`?
    ///
    /// `start == end` never records. `start > end` wraps past midnight.
    pub fn in_window(&self, hour: u32) -> bool {
        let (start, end) = (self.start_hour, self.end_hour);
        if start == end {
            false
        } else if start < end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    /// Minute value is a multiple of the segment length
    pub fn is_split_minute(&self, now: NaiveDateTime) -> bool {
        self.interval_minutes > 0 && now.minute() % self.interval_minutes == 0
    }
}

/// What the supervisor should be doing this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingIntent {
    Record,
    Idle,
    Shutdown,
}

/// Run state that feeds the intent decision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntentInputs {
    pub shutdown_latched: bool,
    pub hour_override: bool,
    pub low_battery_latched: bool,
    /// `max_intervals` segments have been completed this run
    pub interval_limit_reached: bool,
}

/// Derive the intent for one tick.
///
/// Shutdown wins over everything; otherwise record when the hour override is
/// held or the clock is inside the window, unless low battery is latched or
/// the per-run segment cap has been reached.
pub fn decide(schedule: &Schedule, now: NaiveDateTime, inputs: IntentInputs) -> RecordingIntent {
    if inputs.shutdown_latched {
        return RecordingIntent::Shutdown;
    }
    let wanted = inputs.hour_override || schedule.in_window(now.hour());
    if wanted && !inputs.low_battery_latched && !inputs.interval_limit_reached {
        RecordingIntent::Record
    } else {
        RecordingIntent::Idle
    }
}

/// Source of wall-clock time and blocking delays
pub trait Clock: Send {
    /// Local wall-clock time
    fn now(&self) -> NaiveDateTime;

    fn sleep(&self, duration: Duration);
}

/// Local time from the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock that only moves when told to; `sleep` advances it instantly
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<NaiveDateTime>>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}
