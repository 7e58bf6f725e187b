// Camera abstraction consumed by the recording loop
//
// The supervisor owns exactly one `CameraDriver` for the lifetime of a run.
// Drivers serialize all calls themselves; the core never calls a driver from
// more than one thread.

pub mod sim;
#[cfg(feature = "gst-camera")]
pub mod gst;

pub use sim::{SimCall, SimControl, SimOp, SimulatedCamera};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Error type for camera driver operations
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// Driver reported a failure that may clear up if the call is reissued
    #[error("Transient camera error: {0}")]
    Transient(String),

    #[error("Camera is closed")]
    Closed,

    #[error("Camera is not recording")]
    NotRecording,

    #[error("Camera is already recording to {0}")]
    AlreadyRecording(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Driver not available: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CameraError>;

/// The sensor handle contract.
///
/// Any call may fail with a transient driver error. `close()` followed by
/// `reinitialize()` must yield a usable handle with the same parameters.
pub trait CameraDriver: Send {
    fn is_recording(&self) -> bool;

    /// Begin writing H.264 to `path`
    fn start_recording(&mut self, path: &Path, params: &RecordingParams) -> Result<()>;

    /// Surface encoder errors; blocks for at most `timeout`
    fn wait_recording(&mut self, timeout: Duration) -> Result<()>;

    /// Close the current file and continue recording into `path` without stopping capture
    fn split_recording(&mut self, path: &Path) -> Result<()>;

    /// Capture a single still; `params.use_video_port` keeps recording uninterrupted
    fn capture(&mut self, path: &Path, params: &StillParams) -> Result<()>;

    fn stop_recording(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn reinitialize(&mut self) -> Result<()>;

    fn set_annotation(&mut self, text: &str) -> Result<()>;

    fn apply_imaging(&mut self, modes: &ImagingModes) -> Result<()>;
}

/// Which driver backs the camera handle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Writes placeholder files; for bench testing without a sensor
    Simulated,
    /// libcamera source through a GStreamer pipeline (feature `gst-camera`)
    Gstreamer,
}

impl Default for DriverKind {
    fn default() -> Self {
        Self::Gstreamer
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum H264Profile {
    Baseline,
    Main,
    High,
}

impl Default for H264Profile {
    fn default() -> Self {
        Self::High
    }
}

impl H264Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            H264Profile::Baseline => "baseline",
            H264Profile::Main => "main",
            H264Profile::High => "high",
        }
    }
}

/// Sensor imaging modes, re-applied after every reinitialize
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ImagingModes {
    pub exposure_mode: String,
    pub awb_mode: String,
    pub drc_strength: String,
    pub meter_mode: String,
}

impl Default for ImagingModes {
    fn default() -> Self {
        Self {
            exposure_mode: "auto".to_string(),
            awb_mode: "auto".to_string(),
            drc_strength: "off".to_string(),
            meter_mode: "average".to_string(),
        }
    }
}

/// Camera section of the configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraSettings {
    pub driver: DriverKind,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    pub h264_profile: H264Profile,
    /// Level string as understood by the encoder, e.g. "4" or "4.2"
    pub h264_level: String,
    /// Quantizer-style quality (1 = best, 40 = worst, 0 = encoder default)
    pub h264_quality: u32,
    /// Rotation in degrees (0, 90, 180, 270)
    pub rotation: u32,
    pub preview_width: u32,
    pub preview_height: u32,
    #[serde(flatten)]
    pub imaging: ImagingModes,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            driver: DriverKind::default(),
            width: 1640,
            height: 1232,
            fps: 25,
            bitrate: 10_000_000,
            h264_profile: H264Profile::default(),
            h264_level: "4".to_string(),
            h264_quality: 25,
            rotation: 0,
            preview_width: 640,
            preview_height: 480,
            imaging: ImagingModes::default(),
        }
    }
}

impl CameraSettings {
    /// Parameters passed to every `start_recording` call
    pub fn recording_params(&self) -> RecordingParams {
        RecordingParams {
            format: VideoFormat::H264,
            width: self.width,
            height: self.height,
            bitrate: self.bitrate,
            profile: self.h264_profile,
            level: self.h264_level.clone(),
            quality: self.h264_quality,
        }
    }

    /// Parameters for preview stills
    pub fn still_params(&self) -> StillParams {
        StillParams {
            format: StillFormat::Jpeg,
            width: self.preview_width,
            height: self.preview_height,
            use_video_port: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFormat {
    H264,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StillFormat {
    Jpeg,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingParams {
    pub format: VideoFormat,
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
    pub profile: H264Profile,
    pub level: String,
    pub quality: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StillParams {
    pub format: StillFormat,
    pub width: u32,
    pub height: u32,
    pub use_video_port: bool,
}

/// Open the configured driver and apply imaging modes
pub fn open(settings: &CameraSettings) -> Result<Box<dyn CameraDriver>> {
    let mut camera: Box<dyn CameraDriver> = match settings.driver {
        DriverKind::Simulated => {
            log::warn!("Using simulated camera driver, no real video will be recorded");
            Box::new(SimulatedCamera::new())
        }
        DriverKind::Gstreamer => open_gstreamer(settings)?,
    };
    camera.apply_imaging(&settings.imaging)?;
    Ok(camera)
}

#[cfg(feature = "gst-camera")]
fn open_gstreamer(settings: &CameraSettings) -> Result<Box<dyn CameraDriver>> {
    Ok(Box::new(gst::GstCamera::new(settings.clone())?))
}

#[cfg(not(feature = "gst-camera"))]
fn open_gstreamer(_settings: &CameraSettings) -> Result<Box<dyn CameraDriver>> {
    Err(CameraError::Unavailable(
        "built without the gst-camera feature; set camera.driver = \"simulated\" or rebuild".to_string(),
    ))
}
