// Simulated camera driver
//
// Writes placeholder H.264 and JPEG bytes so the rest of the recorder can run
// on a bench without a sensor. A cloneable `SimControl` handle lets callers
// inject transient failures per operation and inspect the call log.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::{CameraDriver, CameraError, ImagingModes, RecordingParams, Result, StillParams};

/// Annex-B SPS start code, enough for `file` to recognise the output as H.264
const H264_HEADER: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x67, 0x64, 0x00, 0x28];
/// Bytes appended per `wait_recording` call to stand in for encoded frames
const H264_CHUNK: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00];
const JPEG_STUB: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9];

/// Driver operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Start,
    Wait,
    Split,
    Capture,
    Stop,
    Close,
    Reinitialize,
    Annotate,
    Imaging,
}

/// One entry in the call log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Start(PathBuf),
    Wait,
    Split(PathBuf),
    Capture(PathBuf),
    Stop,
    Close,
    Reinitialize,
    Annotate(String),
    Imaging(ImagingModes),
    /// The call was rejected by an injected failure
    Failed(SimOp),
}

struct SimState {
    open: bool,
    writer: Option<(PathBuf, File)>,
    annotation: String,
    imaging: Option<ImagingModes>,
    pending_failures: HashMap<SimOp, u32>,
    calls: Vec<SimCall>,
}

impl SimState {
    /// Consume one injected failure for `op`, logging the call either way
    fn check(&mut self, op: SimOp) -> Result<()> {
        if let Some(remaining) = self.pending_failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                self.calls.push(SimCall::Failed(op));
                return Err(CameraError::Transient(format!("injected {:?} failure", op)));
            }
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(CameraError::Closed)
        }
    }
}

/// Camera driver that records placeholder files
pub struct SimulatedCamera {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedCamera {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                open: true,
                writer: None,
                annotation: String::new(),
                imaging: None,
                pending_failures: HashMap::new(),
                calls: Vec::new(),
            })),
        }
    }

    /// Handle for failure injection and inspection; stays valid after the
    /// camera is moved into the supervisor
    pub fn control(&self) -> SimControl {
        SimControl {
            state: self.state.clone(),
        }
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraDriver for SimulatedCamera {
    fn is_recording(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    fn start_recording(&mut self, path: &Path, _params: &RecordingParams) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.check(SimOp::Start)?;
        if let Some((current, _)) = &state.writer {
            return Err(CameraError::AlreadyRecording(current.display().to_string()));
        }
        let mut file = File::create(path)?;
        file.write_all(H264_HEADER)?;
        state.writer = Some((path.to_path_buf(), file));
        state.calls.push(SimCall::Start(path.to_path_buf()));
        Ok(())
    }

    fn wait_recording(&mut self, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.check(SimOp::Wait)?;
        match state.writer.as_mut() {
            Some((_, file)) => file.write_all(H264_CHUNK)?,
            None => return Err(CameraError::NotRecording),
        }
        state.calls.push(SimCall::Wait);
        Ok(())
    }

    fn split_recording(&mut self, path: &Path) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.check(SimOp::Split)?;
        if state.writer.is_none() {
            return Err(CameraError::NotRecording);
        }
        let mut file = File::create(path)?;
        file.write_all(H264_HEADER)?;
        // Dropping the previous handle closes the finished segment
        state.writer = Some((path.to_path_buf(), file));
        state.calls.push(SimCall::Split(path.to_path_buf()));
        Ok(())
    }

    fn capture(&mut self, path: &Path, _params: &StillParams) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.check(SimOp::Capture)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(JPEG_STUB)?;
        state.calls.push(SimCall::Capture(path.to_path_buf()));
        Ok(())
    }

    fn stop_recording(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.check(SimOp::Stop)?;
        if let Some((_, mut file)) = state.writer.take() {
            file.flush()?;
        }
        state.calls.push(SimCall::Stop);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.check(SimOp::Close)?;
        state.writer = None;
        state.open = false;
        state.calls.push(SimCall::Close);
        Ok(())
    }

    fn reinitialize(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.check(SimOp::Reinitialize)?;
        state.writer = None;
        state.open = true;
        state.calls.push(SimCall::Reinitialize);
        Ok(())
    }

    fn set_annotation(&mut self, text: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.check(SimOp::Annotate)?;
        state.annotation = text.to_string();
        state.calls.push(SimCall::Annotate(text.to_string()));
        Ok(())
    }

    fn apply_imaging(&mut self, modes: &ImagingModes) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.check(SimOp::Imaging)?;
        state.imaging = Some(modes.clone());
        state.calls.push(SimCall::Imaging(modes.clone()));
        Ok(())
    }
}

/// Shared handle onto a `SimulatedCamera`
#[derive(Clone)]
pub struct SimControl {
    state: Arc<Mutex<SimState>>,
}

impl SimControl {
    /// Make the next `count` calls of `op` fail with a transient error
    pub fn fail_next(&self, op: SimOp, count: u32) {
        *self.state.lock().pending_failures.entry(op).or_insert(0) += count;
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&SimCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(*c)).count()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.state.lock().writer.as_ref().map(|(p, _)| p.clone())
    }

    pub fn annotation(&self) -> String {
        self.state.lock().annotation.clone()
    }

    pub fn imaging(&self) -> Option<ImagingModes> {
        self.state.lock().imaging.clone()
    }
}
