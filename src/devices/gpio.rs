// sysfs GPIO: LED animation and button polling threads

use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{Led, LedMode};
use crate::input::{Button, InputHandle};

const LED_FRAME: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// One exported line under the sysfs GPIO root
#[derive(Debug, Clone)]
pub struct SysfsPin {
    number: u32,
    value_path: PathBuf,
}

impl SysfsPin {
    /// Export the line if needed and set its direction
    pub fn open(root: &Path, number: u32, direction: Direction) -> io::Result<Self> {
        let dir = root.join(format!("gpio{}", number));
        if !dir.exists() {
            fs::write(root.join("export"), number.to_string())?;
            // udev fixes permissions asynchronously after export
            std::thread::sleep(Duration::from_millis(100));
        }
        let direction = match direction {
            Direction::In => "in",
            Direction::Out => "out",
        };
        if let Err(e) = fs::write(dir.join("direction"), direction) {
            log::warn!("Could not set gpio{} direction: {}", number, e);
        }
        Ok(Self {
            number,
            value_path: dir.join("value"),
        })
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn read(&self) -> io::Result<bool> {
        let value = fs::read_to_string(&self.value_path)?;
        Ok(value.trim() == "1")
    }

    pub fn write(&self, high: bool) -> io::Result<()> {
        fs::write(&self.value_path, if high { "1" } else { "0" })
    }
}

// ============================================================================
// LED
// ============================================================================

struct LedShared {
    mode: LedMode,
    since: Instant,
}

/// Tracks the level last written to an output pin. A write error is
/// reported once per failing run, not once per frame.
#[derive(Debug, Default)]
struct LevelWriter {
    written: Option<bool>,
    failing: bool,
}

impl LevelWriter {
    /// Write `level` if it differs from the last successful write. Returns
    /// the error only for the first failure after a success.
    fn apply(&mut self, pin: &SysfsPin, level: bool) -> io::Result<()> {
        if self.written == Some(level) {
            return Ok(());
        }
        match pin.write(level) {
            Ok(()) => {
                if self.failing {
                    log::info!("gpio{} writable again", pin.number());
                }
                self.written = Some(level);
                self.failing = false;
                Ok(())
            }
            Err(e) => {
                self.written = None;
                if self.failing {
                    return Ok(());
                }
                self.failing = true;
                Err(e)
            }
        }
    }
}

/// LED on a GPIO line, animated by its own thread
pub struct SysfsLed {
    shared: Arc<Mutex<LedShared>>,
    stop_flag: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SysfsLed {
    pub fn spawn(pin: SysfsPin) -> io::Result<Self> {
        let shared = Arc::new(Mutex::new(LedShared {
            mode: LedMode::Off,
            since: Instant::now(),
        }));
        let stop_flag = Arc::new(AtomicBool::new(false));

        let thread_shared = shared.clone();
        let thread_stop = stop_flag.clone();
        let handle = std::thread::Builder::new()
            .name(format!("trafficcam-led{}", pin.number()))
            .spawn(move || {
                let mut writer = LevelWriter::default();
                while !thread_stop.load(Ordering::SeqCst) {
                    let level = {
                        let s = thread_shared.lock();
                        s.mode.level_at(s.since.elapsed())
                    };
                    if let Err(e) = writer.apply(&pin, level) {
                        log::warn!("gpio{} write failed: {}", pin.number(), e);
                    }
                    std::thread::sleep(LED_FRAME);
                }
                let _ = pin.write(false);
            })?;

        Ok(Self {
            shared,
            stop_flag,
            handle: Mutex::new(Some(handle)),
        })
    }
}

impl Led for SysfsLed {
    fn set(&self, mode: LedMode) {
        let mut s = self.shared.lock();
        // Re-setting the same mode must not restart a blink or pulse
        if s.mode != mode {
            s.mode = mode;
            s.since = Instant::now();
        }
    }

    fn mode(&self) -> LedMode {
        self.shared.lock().mode
    }
}

impl Drop for SysfsLed {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Button
// ============================================================================

/// Polls a GPIO input and forwards level changes to the input multiplexer
pub struct SysfsButton {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SysfsButton {
    pub fn spawn(
        pin: SysfsPin,
        button: Button,
        active_low: bool,
        poll: Duration,
        input: InputHandle,
    ) -> io::Result<Self> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_stop = stop_flag.clone();

        let handle = std::thread::Builder::new()
            .name(format!("trafficcam-{}", button.name()))
            .spawn(move || {
                let pressed = |high: bool| high != active_low;
                let mut last = false;
                let mut read_failed = false;

                while !thread_stop.load(Ordering::SeqCst) {
                    match pin.read() {
                        Ok(high) => {
                            read_failed = false;
                            let now_pressed = pressed(high);
                            if now_pressed != last {
                                last = now_pressed;
                                input.button_changed(button, now_pressed);
                            }
                        }
                        Err(e) => {
                            if !read_failed {
                                log::warn!("{} button read failed: {}", button.name(), e);
                                read_failed = true;
                            }
                        }
                    }
                    std::thread::sleep(poll);
                }
            })?;

        Ok(Self {
            stop_flag,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SysfsButton {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{InputMultiplexer, InputTiming, Intent, Latches};

    /// Fake sysfs tree with an already-exported line
    fn fake_pin(root: &Path, number: u32, value: &str) -> PathBuf {
        let dir = root.join(format!("gpio{}", number));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("value"), value).unwrap();
        dir.join("value")
    }

    /// Replace the value file in one step so the poller never reads it empty
    fn set_level(value: &Path, level: &str) {
        let tmp = value.with_extension("tmp");
        fs::write(&tmp, level).unwrap();
        fs::rename(&tmp, value).unwrap();
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + Duration::from_secs(2);
        while Instant::now() < end {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn led_thread_drives_value_file() {
        let root = tempfile::tempdir().unwrap();
        let value = fake_pin(root.path(), 13, "0");
        let pin = SysfsPin::open(root.path(), 13, Direction::Out).unwrap();
        let led = SysfsLed::spawn(pin).unwrap();

        led.set(LedMode::On);
        assert!(wait_for(|| fs::read_to_string(&value).unwrap() == "1"));
        led.set(LedMode::Off);
        assert!(wait_for(|| fs::read_to_string(&value).unwrap() == "0"));
    }

    #[test]
    fn led_write_failure_is_reported_once_per_run() {
        let root = tempfile::tempdir().unwrap();
        let value = fake_pin(root.path(), 19, "0");
        let pin = SysfsPin::open(root.path(), 19, Direction::Out).unwrap();
        fs::remove_dir_all(value.parent().unwrap()).unwrap();

        let mut writer = LevelWriter::default();
        assert!(writer.apply(&pin, true).is_err());
        for _ in 0..10 {
            assert!(writer.apply(&pin, true).is_ok());
        }
        assert!(writer.failing);
        assert_eq!(writer.written, None);

        fake_pin(root.path(), 19, "0");
        writer.apply(&pin, true).unwrap();
        assert!(!writer.failing);
        assert_eq!(writer.written, Some(true));
        assert_eq!(fs::read_to_string(&value).unwrap(), "1");

        // A new failing run is reported again
        fs::remove_dir_all(value.parent().unwrap()).unwrap();
        assert!(writer.apply(&pin, false).is_err());
        assert!(writer.apply(&pin, false).is_ok());
    }

    #[test]
    fn active_low_button_reports_press_and_release() {
        let root = tempfile::tempdir().unwrap();
        let value = fake_pin(root.path(), 17, "1");
        let pin = SysfsPin::open(root.path(), 17, Direction::In).unwrap();

        let timing = InputTiming {
            debounce: Duration::from_millis(10),
            hold: Duration::from_secs(1),
            power_hold: Duration::from_secs(1),
            low_battery_hold: Duration::from_secs(2),
            cancel_window: Duration::from_secs(5),
            wifi_off_delay: Duration::from_secs(60),
        };
        let (mut mux, input, intents) =
            InputMultiplexer::spawn(timing, false, Arc::new(Latches::default())).unwrap();
        let mut button =
            SysfsButton::spawn(pin, Button::Hour, true, Duration::from_millis(5), input).unwrap();

        set_level(&value, "0");
        assert_eq!(
            intents.wait(Duration::from_secs(2)),
            Some(Intent::HourOverride(true))
        );
        std::thread::sleep(Duration::from_millis(50));
        set_level(&value, "1");
        assert_eq!(
            intents.wait(Duration::from_secs(2)),
            Some(Intent::HourOverride(false))
        );

        button.stop();
        mux.stop();
    }
}
