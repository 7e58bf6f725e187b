// Operating-system side effects: Wi-Fi access point and power-off

use anyhow::{bail, Context};
use std::process::Command;

use crate::config::PlatformSettings;

pub trait Platform: Send {
    fn wifi_on(&mut self) -> anyhow::Result<()>;
    fn wifi_off(&mut self) -> anyhow::Result<()>;
    fn shutdown(&mut self) -> anyhow::Result<()>;
}

/// Runs the configured commands; in debug mode it only logs them
pub struct SystemPlatform {
    settings: PlatformSettings,
    debug_mode: bool,
}

impl SystemPlatform {
    pub fn new(settings: PlatformSettings, debug_mode: bool) -> Self {
        Self {
            settings,
            debug_mode,
        }
    }

    fn run(&self, what: &str, argv: &[String]) -> anyhow::Result<()> {
        let Some((program, args)) = argv.split_first() else {
            log::warn!("No {} command configured", what);
            return Ok(());
        };
        if self.debug_mode {
            log::info!("[debug] would run {}: {}", what, argv.join(" "));
            return Ok(());
        }

        log::info!("Running {}: {}", what, argv.join(" "));
        let status = Command::new(program)
            .args(args)
            .status()
            .with_context(|| format!("failed to run {}", program))?;
        if !status.success() {
            bail!("{} command exited with {}", what, status);
        }
        Ok(())
    }
}

impl Platform for SystemPlatform {
    fn wifi_on(&mut self) -> anyhow::Result<()> {
        self.run("wifi on", &self.settings.wifi_on_command)
    }

    fn wifi_off(&mut self) -> anyhow::Result<()> {
        self.run("wifi off", &self.settings.wifi_off_command)
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        self.run("shutdown", &self.settings.shutdown_command)
    }
}

/// Counts calls instead of touching the system
#[derive(Debug, Default, Clone)]
pub struct RecordingPlatform {
    calls: std::sync::Arc<parking_lot::Mutex<Vec<&'static str>>>,
}

impl RecordingPlatform {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }
}

impl Platform for RecordingPlatform {
    fn wifi_on(&mut self) -> anyhow::Result<()> {
        self.calls.lock().push("wifi_on");
        Ok(())
    }

    fn wifi_off(&mut self) -> anyhow::Result<()> {
        self.calls.lock().push("wifi_off");
        Ok(())
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        self.calls.lock().push("shutdown");
        Ok(())
    }
}
