// Trafficcam - unattended traffic-camera recorder
// Main library entry point

pub mod camera;
pub mod config;
pub mod devices;
pub mod input;
pub mod logging;
pub mod platform;
pub mod recording;
pub mod schedule;
pub mod signals;
pub mod status;
pub mod supervisor;

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, DEFAULT_CONFIG_PATH};
use devices::{gpio::Direction, Indicators, Led, NullLed, SysfsButton, SysfsLed, SysfsPin};
use input::{Button, InputHandle, InputMultiplexer, Latches};
use recording::reaper::QuotaProbe;
use recording::{DiskReaper, PreviewTicker, SegmentManager, SpaceProbe, SysinfoProbe};
use schedule::SystemClock;
use status::JsonStatusFile;
use supervisor::{ShutdownReason, Supervisor, SupervisorError, SupervisorOptions};

pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;

/// Command-line options
#[derive(Debug, Clone)]
pub struct CliOptions {
    pub config_path: PathBuf,
    /// Validate, print the effective config and exit
    pub check_config: bool,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            check_config: false,
        }
    }
}

/// Load the config, run the recorder until shutdown, return the exit code
pub fn run(cli: CliOptions) -> i32 {
    let config = match Config::load(&cli.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("trafficcam: {}: {}", cli.config_path.display(), e);
            return EXIT_CONFIG;
        }
    };

    if cli.check_config {
        return match toml::to_string_pretty(&config) {
            Ok(text) => {
                println!("{}", text);
                EXIT_CLEAN
            }
            Err(e) => {
                eprintln!("trafficcam: cannot print config: {}", e);
                EXIT_CONFIG
            }
        };
    }

    let prefix = config.resolved_prefix();
    logging::init(&config.video_dir, &prefix);
    // Again, now that warnings reach the log file
    if let Err(e) = config.validate() {
        log::error!("{}", e);
        return EXIT_CONFIG;
    }
    if !cli.config_path.exists() {
        log::warn!("Config file {} not found, using defaults", cli.config_path.display());
    }
    log::info!(
        "Trafficcam {} starting as '{}', videos in {}",
        env!("CARGO_PKG_VERSION"),
        prefix,
        config.video_dir.display()
    );

    match start(&config, prefix) {
        Ok(reason) => {
            log::info!("Clean shutdown ({:?})", reason);
            EXIT_CLEAN
        }
        Err(e) => {
            // The supervisor writes its own final line
            if e.downcast_ref::<SupervisorError>().is_none() {
                log::error!(target: supervisor::EXCEPTION_TARGET, "{:#}", e);
            }
            EXIT_FATAL
        }
    }
}

/// Build every component from the config and run the supervisor
fn start(config: &Config, prefix: String) -> anyhow::Result<ShutdownReason> {
    std::fs::create_dir_all(&config.video_dir)
        .with_context(|| format!("cannot create {}", config.video_dir.display()))?;

    let schedule = config.schedule();
    let latches = Arc::new(Latches::default());
    let (mut multiplexer, input, intents) =
        InputMultiplexer::spawn(config.input_timing(), false, latches.clone())
            .context("failed to start input multiplexer")?;

    signals::spawn_signal_listener(input.clone()).context("failed to start signal listener")?;

    let mut buttons = if config.use_buttons {
        spawn_buttons(config, &input)
    } else {
        log::info!("Buttons disabled");
        Vec::new()
    };
    let indicators = if config.use_led {
        open_indicators(config)
    } else {
        Indicators::disabled()
    };

    let camera = camera::open(&config.camera).context("failed to open camera")?;

    let probe: Box<dyn SpaceProbe> = match config.video_quota_bytes {
        Some(quota_bytes) => Box::new(QuotaProbe { quota_bytes }),
        None => Box::new(SysinfoProbe),
    };
    let reaper = DiskReaper::new(config.video_dir.clone(), config.min_free_bytes, probe);
    let segments = SegmentManager::new(
        &schedule,
        prefix.clone(),
        config.camera.recording_params(),
        reaper,
    );
    let preview = PreviewTicker::new(
        config.preview_path.clone(),
        schedule.preview_period,
        config.camera.still_params(),
    );

    let mut options = SupervisorOptions::new(schedule, prefix);
    options.annotate = config.annotate;
    options.low_battery_action = config.low_battery_action;
    options.disk_full_grace = config.disk_full_grace();
    options.imaging = config.camera.imaging.clone();

    let mut supervisor = Supervisor::new(
        options,
        Box::new(SystemClock),
        camera,
        segments,
        preview,
        intents,
        latches,
        Box::new(platform::SystemPlatform::new(
            config.platform.clone(),
            config.debug_mode,
        )),
        indicators,
        Box::new(JsonStatusFile::new(config.status_path.clone())),
    );

    let result = supervisor.run();

    for button in &mut buttons {
        button.stop();
    }
    multiplexer.stop();
    if result.is_ok() && config.use_led {
        // Let the shutdown pulse play out before the LED threads stop
        std::thread::sleep(Duration::from_secs(2));
    }
    drop(supervisor);

    Ok(result?)
}

fn spawn_buttons(config: &Config, input: &InputHandle) -> Vec<SysfsButton> {
    let gpio = &config.gpio;
    let poll = Duration::from_millis(gpio.poll_ms.max(1));
    let lines = [
        (Button::Power, gpio.power_button),
        (Button::Hour, gpio.hour_button),
        (Button::Wifi, gpio.wifi_button),
        (Button::LowBattery, gpio.low_battery),
    ];

    let mut buttons = Vec::new();
    for (button, line) in lines {
        let spawned = SysfsPin::open(&gpio.root, line, Direction::In).and_then(|pin| {
            SysfsButton::spawn(pin, button, gpio.active_low, poll, input.clone())
        });
        match spawned {
            Ok(b) => buttons.push(b),
            Err(e) => log::error!("{} button on gpio{} unavailable: {}", button.name(), line, e),
        }
    }
    buttons
}

fn open_indicators(config: &Config) -> Indicators {
    let gpio = &config.gpio;
    let open = |name: &str, line: u32| -> Arc<dyn Led> {
        match SysfsPin::open(&gpio.root, line, Direction::Out).and_then(SysfsLed::spawn) {
            Ok(led) => Arc::new(led),
            Err(e) => {
                log::error!("{} LED on gpio{} unavailable: {}", name, line, e);
                Arc::new(NullLed)
            }
        }
    };
    Indicators::new(
        open("power", gpio.power_led),
        open("wifi", gpio.wifi_led),
        open("rec", gpio.rec_led),
    )
}
