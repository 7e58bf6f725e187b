// Periodic preview stills taken from the video port while recording

use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::{CameraDriver, Result, StillParams};

pub struct PreviewTicker {
    path: PathBuf,
    period: Duration,
    params: StillParams,
    last_attempt: Option<NaiveDateTime>,
    last_capture: Option<NaiveDateTime>,
}

impl PreviewTicker {
    pub fn new(path: PathBuf, period: Duration, params: StillParams) -> Self {
        Self {
            path,
            period,
            params,
            last_attempt: None,
            last_capture: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Time of the last successful capture
    pub fn last_capture(&self) -> Option<NaiveDateTime> {
        self.last_capture
    }

    fn is_due(&self, now: NaiveDateTime) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(last);
                // Clock stepped backwards: start a fresh period
                elapsed < chrono::Duration::zero()
                    || elapsed.to_std().map_or(false, |e| e >= self.period)
            }
        }
    }

    /// Capture a still if recording and a full period has passed since the
    /// last attempt. Returns whether a new preview was written.
    ///
    /// The frame goes to a hidden sibling first and is renamed over the
    /// preview path, so readers never see a half-written JPEG.
    pub fn maybe_capture(
        &mut self,
        camera: &mut dyn CameraDriver,
        now: NaiveDateTime,
    ) -> Result<bool> {
        if !camera.is_recording() || !self.is_due(now) {
            return Ok(false);
        }
        // A failing capture waits for the next period rather than retrying every tick
        self.last_attempt = Some(now);

        let tmp = self.temp_path();
        camera.capture(&tmp, &self.params)?;
        std::fs::rename(&tmp, &self.path)?;
        self.last_capture = Some(now);
        log::debug!("Preview updated: {}", self.path.display());
        Ok(true)
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "preview.jpg".to_string());
        self.path.with_file_name(format!(".{}.tmp", name))
    }
}
