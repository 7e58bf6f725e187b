// Configuration management for the recorder
//
// A single TOML file is read once at startup; there is no runtime reload.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::CameraSettings;
use crate::input::InputTiming;
use crate::schedule::Schedule;

/// Default location of the configuration file on the device
pub const DEFAULT_CONFIG_PATH: &str = "/etc/trafficcam/config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding segments, the per-run log and the copy-info manifest
    #[serde(default = "default_video_dir")]
    pub video_dir: PathBuf,

    /// Fixed path of the preview still, overwritten on every capture
    #[serde(default = "default_preview_path")]
    pub preview_path: PathBuf,

    /// JSON status file read by the status page
    #[serde(default = "default_status_path")]
    pub status_path: PathBuf,

    /// Filename prefix for segments and logs; the hostname when unset
    #[serde(default)]
    pub prefix: Option<String>,

    /// First hour of the recording window (inclusive, local time)
    #[serde(default = "default_start_hour")]
    pub start_hour: u32,

    /// End of the recording window (exclusive, local time)
    #[serde(default = "default_end_hour")]
    pub end_hour: u32,

    /// Segment length in minutes
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,

    /// Cap on completed segments per run (0 = unbounded)
    #[serde(default)]
    pub max_intervals: u32,

    /// Preview capture period while recording
    #[serde(default = "default_preview_period_s")]
    pub preview_period_s: u64,

    /// Disk eviction watermark; free space must stay strictly above this
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,

    /// Treat the video directory as a quota of this many bytes instead of
    /// asking the filesystem for free space
    #[serde(default)]
    pub video_quota_bytes: Option<u64>,

    /// How long the disk may stay full before the recorder gives up
    #[serde(default = "default_disk_full_grace_s")]
    pub disk_full_grace_s: u64,

    /// Delay before Wi-Fi goes off after the button is released
    #[serde(default = "default_wifi_off_delay_s")]
    pub wifi_off_delay_s: u64,

    #[serde(default = "default_true")]
    pub use_buttons: bool,

    #[serde(default = "default_true")]
    pub use_led: bool,

    /// Log shutdown and Wi-Fi commands instead of running them
    #[serde(default)]
    pub debug_mode: bool,

    /// Burn the prefix and wall-clock time into the video
    #[serde(default = "default_true")]
    pub annotate: bool,

    /// What a latched low-battery signal does to the run
    #[serde(default)]
    pub low_battery_action: LowBatteryAction,

    #[serde(default)]
    pub buttons: ButtonSettings,

    #[serde(default)]
    pub camera: CameraSettings,

    #[serde(default)]
    pub gpio: GpioSettings,

    #[serde(default)]
    pub platform: PlatformSettings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LowBatteryAction {
    /// Close the segment and power the device off
    Shutdown,
    /// Stop recording but keep the device up
    Idle,
}

impl Default for LowBatteryAction {
    fn default() -> Self {
        Self::Shutdown
    }
}

/// Button timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ButtonSettings {
    pub debounce_ms: u64,
    /// Hold time before the Wi-Fi button counts as held
    pub hold_s: f64,
    /// Hold time before a power-button release arms shutdown
    pub power_hold_s: f64,
    pub low_battery_hold_s: f64,
    pub shutdown_cancel_window_s: f64,
}

impl Default for ButtonSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            hold_s: 1.0,
            power_hold_s: 1.0,
            low_battery_hold_s: 2.0,
            shutdown_cancel_window_s: 5.0,
        }
    }
}

/// GPIO line assignments (BCM numbering)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GpioSettings {
    /// sysfs GPIO root, normally /sys/class/gpio
    pub root: PathBuf,
    pub power_button: u32,
    pub hour_button: u32,
    pub wifi_button: u32,
    pub low_battery: u32,
    pub power_led: u32,
    pub wifi_led: u32,
    pub rec_led: u32,
    /// Buttons pull the line low when pressed
    pub active_low: bool,
    pub poll_ms: u64,
}

impl Default for GpioSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/sys/class/gpio"),
            power_button: 3,
            hour_button: 17,
            wifi_button: 27,
            low_battery: 22,
            power_led: 5,
            wifi_led: 6,
            rec_led: 13,
            active_low: true,
            poll_ms: 20,
        }
    }
}

/// Commands run for operating-system side effects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlatformSettings {
    pub wifi_on_command: Vec<String>,
    pub wifi_off_command: Vec<String>,
    pub shutdown_command: Vec<String>,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        let cmd = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect();
        Self {
            wifi_on_command: cmd(&["sudo", "systemctl", "start", "hostapd"]),
            wifi_off_command: cmd(&["sudo", "systemctl", "stop", "hostapd"]),
            shutdown_command: cmd(&["sudo", "shutdown", "-h", "now"]),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            video_dir: default_video_dir(),
            preview_path: default_preview_path(),
            status_path: default_status_path(),
            prefix: None,
            start_hour: default_start_hour(),
            end_hour: default_end_hour(),
            interval_minutes: default_interval_minutes(),
            max_intervals: 0,
            preview_period_s: default_preview_period_s(),
            min_free_bytes: default_min_free_bytes(),
            video_quota_bytes: None,
            disk_full_grace_s: default_disk_full_grace_s(),
            wifi_off_delay_s: default_wifi_off_delay_s(),
            use_buttons: true,
            use_led: true,
            debug_mode: false,
            annotate: true,
            low_battery_action: LowBatteryAction::default(),
            buttons: ButtonSettings::default(),
            camera: CameraSettings::default(),
            gpio: GpioSettings::default(),
            platform: PlatformSettings::default(),
        }
    }
}

impl Config {
    /// Load config from disk, falling back to defaults when the file is missing.
    ///
    /// A file that exists but does not parse is an error: recording a day of
    /// traffic with default settings because of a typo is worse than not starting.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the recording loop cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_hour > 23 || self.end_hour > 23 {
            return Err(ConfigError::Invalid(format!(
                "start_hour and end_hour must be 0-23 (got {} and {})",
                self.start_hour, self.end_hour
            )));
        }
        if self.interval_minutes == 0 || self.interval_minutes > 60 {
            return Err(ConfigError::Invalid(format!(
                "interval_minutes must be 1-60 (got {})",
                self.interval_minutes
            )));
        }
        if 60 % self.interval_minutes != 0 {
            log::warn!(
                "interval_minutes = {} does not divide 60; the last segment of each hour will be short",
                self.interval_minutes
            );
        }
        if self.preview_period_s == 0 {
            return Err(ConfigError::Invalid("preview_period_s must be positive".to_string()));
        }
        let cam = &self.camera;
        if cam.width == 0 || cam.height == 0 || cam.fps == 0 || cam.bitrate == 0 {
            return Err(ConfigError::Invalid(
                "camera width, height, fps and bitrate must be positive".to_string(),
            ));
        }
        if !matches!(cam.rotation, 0 | 90 | 180 | 270) {
            return Err(ConfigError::Invalid(format!(
                "camera rotation must be 0, 90, 180 or 270 (got {})",
                cam.rotation
            )));
        }
        let b = &self.buttons;
        for (name, secs) in [
            ("hold_s", b.hold_s),
            ("power_hold_s", b.power_hold_s),
            ("low_battery_hold_s", b.low_battery_hold_s),
            ("shutdown_cancel_window_s", b.shutdown_cancel_window_s),
        ] {
            if !secs.is_finite() || !(0.0..=3600.0).contains(&secs) {
                return Err(ConfigError::Invalid(format!(
                    "buttons.{} must be between 0 and 3600 seconds (got {})",
                    name, secs
                )));
            }
        }
        if self.buttons.debounce_ms < 500 {
            log::warn!(
                "buttons.debounce_ms = {} is below the 500 ms minimum, using 500",
                self.buttons.debounce_ms
            );
        }
        Ok(())
    }

    /// Immutable recording schedule derived from this config
    pub fn schedule(&self) -> Schedule {
        Schedule {
            start_hour: self.start_hour,
            end_hour: self.end_hour,
            interval_minutes: self.interval_minutes,
            max_intervals: self.max_intervals,
            preview_period: Duration::from_secs(self.preview_period_s),
            min_free_bytes: self.min_free_bytes,
            wifi_off_delay: Duration::from_secs(self.wifi_off_delay_s),
        }
    }

    /// Timing for the input multiplexer
    pub fn input_timing(&self) -> InputTiming {
        let b = &self.buttons;
        InputTiming {
            debounce: Duration::from_millis(b.debounce_ms.max(500)),
            hold: Duration::from_secs_f64(b.hold_s.max(0.0)),
            power_hold: Duration::from_secs_f64(b.power_hold_s.max(0.0)),
            low_battery_hold: Duration::from_secs_f64(b.low_battery_hold_s.max(2.0)),
            cancel_window: Duration::from_secs_f64(b.shutdown_cancel_window_s.max(0.0)),
            wifi_off_delay: Duration::from_secs(self.wifi_off_delay_s),
        }
    }

    pub fn disk_full_grace(&self) -> Duration {
        Duration::from_secs(self.disk_full_grace_s)
    }

    /// Filename prefix: configured value, else the device hostname
    pub fn resolved_prefix(&self) -> String {
        self.prefix
            .clone()
            .filter(|p| !p.trim().is_empty())
            .or_else(sysinfo::System::host_name)
            .map(|p| sanitize_prefix(&p))
            .unwrap_or_else(|| "trafficcam".to_string())
    }
}

/// Keep prefixes safe for use in filenames
pub fn sanitize_prefix(name: &str) -> String {
    name.trim()
        .replace(' ', "_")
        .replace('/', "_")
        .replace('\\', "_")
        .replace(':', "_")
}

/// Get the default directory for recordings
fn default_video_dir() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("trafficcam")
}

fn default_preview_path() -> PathBuf {
    PathBuf::from("/var/www/html/preview.jpg")
}

fn default_status_path() -> PathBuf {
    PathBuf::from("/var/www/html/status.json")
}

fn default_start_hour() -> u32 {
    7
}

fn default_end_hour() -> u32 {
    19
}

fn default_interval_minutes() -> u32 {
    15
}

fn default_preview_period_s() -> u64 {
    5
}

/// 1 GiB
fn default_min_free_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_disk_full_grace_s() -> u64 {
    300
}

fn default_wifi_off_delay_s() -> u64 {
    300
}

/// Default true value (for serde)
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.start_hour, 7);
        assert_eq!(config.end_hour, 19);
        assert_eq!(config.interval_minutes, 15);
        assert_eq!(config.max_intervals, 0);
        assert!(config.use_buttons);
        assert_eq!(config.low_battery_action, LowBatteryAction::Shutdown);
        assert_eq!(config.gpio.poll_ms, 20);
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let config = Config::from_toml(
            r#"
            start_hour = 8
            end_hour = 10
            max_intervals = 3
            debug_mode = true
            low_battery_action = "idle"

            [camera]
            driver = "simulated"
            bitrate = 4000000

            [buttons]
            shutdown_cancel_window_s = 2.0
            "#,
        )
        .unwrap();

        assert_eq!(config.start_hour, 8);
        assert_eq!(config.max_intervals, 3);
        assert!(config.debug_mode);
        assert_eq!(config.low_battery_action, LowBatteryAction::Idle);
        assert_eq!(config.camera.bitrate, 4_000_000);
        assert_eq!(config.camera.width, 1640);
        assert_eq!(config.buttons.shutdown_cancel_window_s, 2.0);
        assert_eq!(config.buttons.debounce_ms, 500);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(matches!(
            Config::from_toml("start_hour = 24"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("interval_minutes = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("preview_period_s = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("[camera]\nrotation = 45"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("[buttons]\npower_hold_s = inf"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("start_hour = \"eight\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_uses_defaults_and_present_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.start_hour, Config::default().start_hour);

        std::fs::write(&path, "start_hour = 6\nprefix = \"cam-north\"\n").unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.start_hour, 6);
        assert_eq!(loaded.resolved_prefix(), "cam-north");
    }

    #[test]
    fn input_timing_enforces_minimums() {
        let config = Config::from_toml("[buttons]\ndebounce_ms = 100\nlow_battery_hold_s = 0.5").unwrap();
        let timing = config.input_timing();
        assert_eq!(timing.debounce, Duration::from_millis(500));
        assert_eq!(timing.low_battery_hold, Duration::from_secs(2));
    }

    #[test]
    fn button_timings_live_in_the_buttons_table() {
        let config = Config::from_toml(
            r#"
            power_hold_s = 9.0

            [buttons]
            debounce_ms = 600
            hold_s = 1.5
            power_hold_s = 3.0
            low_battery_hold_s = 4.0
            shutdown_cancel_window_s = 7.0
            "#,
        )
        .unwrap();
        let timing = config.input_timing();
        assert_eq!(timing.debounce, Duration::from_millis(600));
        assert_eq!(timing.hold, Duration::from_millis(1500));
        assert_eq!(timing.power_hold, Duration::from_secs(3));
        assert_eq!(timing.low_battery_hold, Duration::from_secs(4));
        assert_eq!(timing.cancel_window, Duration::from_secs(7));
    }

    #[test]
    fn prefix_is_sanitized() {
        assert_eq!(sanitize_prefix(" cam 1/a "), "cam_1_a");
    }
}
