// Recording supervisor: the single-threaded tick loop that owns the camera
//
// Each tick drains operator intents, derives the recording intent from the
// schedule and run state, and drives the segment manager and preview ticker.
// Camera failures are retried with backoff, then answered with a camera
// reinitialize; only repeated reinitialize failure, a disk that stays full
// past its grace period, or a broken invariant ends the run with an error.

use chrono::NaiveDateTime;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::camera::{CameraDriver, CameraError, ImagingModes};
use crate::config::LowBatteryAction;
use crate::devices::Indicators;
use crate::input::{Intent, IntentReceiver, Latches, ShutdownRequest, WifiRequest};
use crate::platform::Platform;
use crate::recording::{
    PreviewTicker, ReaperError, RecordingStatus, SegmentError, SegmentManager, SplitOutcome,
};
use crate::schedule::{decide, Clock, IntentInputs, RecordingIntent, Schedule};
use crate::status::{format_duration, StatusSink, StatusSnapshot};

/// Log target whose records are labelled EXCEPTION
pub const EXCEPTION_TARGET: &str = "exception";

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("camera could not be recovered: {0}")]
    FatalHardware(String),
    #[error("disk full for {secs} s: {source}")]
    DiskFull {
        secs: u64,
        #[source]
        source: ReaperError,
    },
    #[error("invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Power button, confirmed after the cancellation window
    Operator,
    LowBattery,
    /// Signal or keyboard interrupt
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Yield for at most this long (or until the next intent) and tick again
    Continue(Duration),
    Exit(ShutdownReason),
}

/// Camera retry and recovery limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per operation, including the first
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Pause between close and reinitialize
    pub reinit_pause: Duration,
    /// Consecutive reinitializes before the fault is fatal
    pub max_reinitializes: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(2),
            reinit_pause: Duration::from_secs(2),
            max_reinitializes: 2,
        }
    }
}

pub struct SupervisorOptions {
    pub schedule: Schedule,
    pub prefix: String,
    /// Burn `<prefix> <date time>` into the video
    pub annotate: bool,
    pub low_battery_action: LowBatteryAction,
    pub disk_full_grace: Duration,
    pub imaging: ImagingModes,
    pub retry: RetryPolicy,
    pub recording_tick: Duration,
    pub idle_tick: Duration,
    /// Access point state at startup
    pub wifi_on: bool,
}

impl SupervisorOptions {
    pub fn new(schedule: Schedule, prefix: String) -> Self {
        Self {
            schedule,
            prefix,
            annotate: true,
            low_battery_action: LowBatteryAction::Shutdown,
            disk_full_grace: Duration::from_secs(300),
            imaging: ImagingModes::default(),
            retry: RetryPolicy::default(),
            recording_tick: Duration::from_millis(500),
            idle_tick: Duration::from_secs(1),
            wifi_on: false,
        }
    }
}

/// Mutable run state. Lives for one run; nothing here is persisted.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub status: RecordingStatus,
    pub hour_override: bool,
    pub low_battery_latched: bool,
    pub shutdown_reason: Option<ShutdownReason>,
    /// Power off the OS once the camera is released
    pub os_shutdown_requested: bool,
    pub wifi_on: bool,
    pub shutdown_deadline: Option<Instant>,
    pub disk_full_since: Option<NaiveDateTime>,
    pub consecutive_reinits: u32,
    pub recording_since: Option<NaiveDateTime>,
    pub free_bytes: Option<u64>,
    pub last_intent: Option<RecordingIntent>,
}

impl RunState {
    pub fn shutdown_latched(&self) -> bool {
        self.shutdown_reason.is_some()
    }
}

/// Why a retried operation gave up
enum Failure {
    NoSpace(ReaperError),
    Camera(CameraError),
    Invariant(String),
}

pub struct Supervisor {
    options: SupervisorOptions,
    clock: Box<dyn Clock>,
    camera: Box<dyn CameraDriver>,
    segments: SegmentManager,
    preview: PreviewTicker,
    intents: IntentReceiver,
    latches: Arc<Latches>,
    platform: Box<dyn Platform>,
    indicators: Indicators,
    status: Box<dyn StatusSink>,
    state: RunState,
    pending: VecDeque<Intent>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: SupervisorOptions,
        clock: Box<dyn Clock>,
        camera: Box<dyn CameraDriver>,
        segments: SegmentManager,
        preview: PreviewTicker,
        intents: IntentReceiver,
        latches: Arc<Latches>,
        platform: Box<dyn Platform>,
        indicators: Indicators,
        status: Box<dyn StatusSink>,
    ) -> Self {
        let state = RunState {
            wifi_on: options.wifi_on,
            ..RunState::default()
        };
        Self {
            options,
            clock,
            camera,
            segments,
            preview,
            intents,
            latches,
            platform,
            indicators,
            status,
            state,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn segments(&self) -> &SegmentManager {
        &self.segments
    }

    /// Block until shutdown or a fatal error
    pub fn run(&mut self) -> Result<ShutdownReason> {
        log::info!(
            "Supervisor started: window {:02}:00-{:02}:00, {} min segments, max {} intervals",
            self.options.schedule.start_hour,
            self.options.schedule.end_hour,
            self.options.schedule.interval_minutes,
            self.options.schedule.max_intervals
        );
        self.indicators.running();
        self.indicators.wifi(self.state.wifi_on);

        loop {
            let now = self.clock.now();
            match self.tick(now) {
                Ok(TickOutcome::Continue(yield_for)) => {
                    // Interruptible yield: any intent ends it early
                    if let Some(intent) = self.intents.wait(yield_for) {
                        self.pending.push_back(intent);
                    }
                }
                Ok(TickOutcome::Exit(reason)) => {
                    log::info!("Supervisor stopped ({:?})", reason);
                    return Ok(reason);
                }
                Err(e) => {
                    self.fail(&e);
                    return Err(e);
                }
            }
        }
    }

    /// One logical tick at wall-clock `now`
    pub fn tick(&mut self, now: NaiveDateTime) -> Result<TickOutcome> {
        self.take_intents();

        let intent = decide(
            &self.options.schedule,
            now,
            IntentInputs {
                shutdown_latched: self.state.shutdown_latched(),
                hour_override: self.state.hour_override,
                low_battery_latched: self.state.low_battery_latched,
                interval_limit_reached: self.segments.limit_reached(),
            },
        );
        if self.state.last_intent != Some(intent) {
            log::info!("Recording intent: {:?}", intent);
            self.state.last_intent = Some(intent);
        }

        let outcome = match intent {
            RecordingIntent::Record => self.record_tick(now)?,
            RecordingIntent::Idle => self.idle_tick(now)?,
            RecordingIntent::Shutdown => {
                let reason = self.shutdown(now);
                return Ok(TickOutcome::Exit(reason));
            }
        };

        self.publish_status(now);
        Ok(outcome)
    }

    // ========================================================================
    // Intents
    // ========================================================================

    fn take_intents(&mut self) {
        let mut intents: Vec<Intent> = self.pending.drain(..).collect();
        intents.extend(self.intents.drain());
        for intent in intents {
            self.handle_intent(intent);
        }

        // Flags set outside the queue (signal handler, or an intent still in flight)
        if self.latches.shutdown() && !self.state.shutdown_latched() {
            self.latch_shutdown(ShutdownReason::External);
        }
        if self.latches.low_battery() && !self.state.low_battery_latched {
            self.on_low_battery();
        }
    }

    fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::HourOverride(on) => {
                log::info!("Hour override {}", if on { "on" } else { "off" });
                self.state.hour_override = on;
            }
            Intent::Wifi(WifiRequest::On) => {
                if let Err(e) = self.platform.wifi_on() {
                    log::error!("Wi-Fi on failed: {:#}", e);
                }
                self.state.wifi_on = true;
                self.indicators.wifi(true);
            }
            Intent::Wifi(WifiRequest::OffAfterDelay { deadline }) => {
                log::info!(
                    "Wi-Fi off in {} s",
                    deadline.saturating_duration_since(Instant::now()).as_secs()
                );
            }
            Intent::Wifi(WifiRequest::OffCancelled) => log::info!("Wi-Fi off cancelled"),
            Intent::Wifi(WifiRequest::Off) => {
                if let Err(e) = self.platform.wifi_off() {
                    log::error!("Wi-Fi off failed: {:#}", e);
                }
                self.state.wifi_on = false;
                self.indicators.wifi(false);
            }
            Intent::Shutdown(ShutdownRequest::Armed { deadline }) => {
                log::warn!(
                    "Shutdown in {} s unless the power button is pressed again",
                    deadline.saturating_duration_since(Instant::now()).as_secs()
                );
                self.state.shutdown_deadline = Some(deadline);
            }
            Intent::Shutdown(ShutdownRequest::Cancelled) => {
                log::info!("Shutdown cancelled");
                self.state.shutdown_deadline = None;
            }
            Intent::Shutdown(ShutdownRequest::Confirmed) => {
                self.state.shutdown_deadline = None;
                if self.latch_shutdown(ShutdownReason::Operator) {
                    self.state.os_shutdown_requested = true;
                }
            }
            Intent::Shutdown(ShutdownRequest::External) => {
                self.latch_shutdown(ShutdownReason::External);
            }
            Intent::LowBatteryLatched => {
                if !self.state.low_battery_latched {
                    self.on_low_battery();
                }
            }
        }
    }

    /// Returns true if this call set the latch
    fn latch_shutdown(&mut self, reason: ShutdownReason) -> bool {
        if self.state.shutdown_reason.is_some() {
            return false;
        }
        log::warn!("Shutdown latched ({:?})", reason);
        self.state.shutdown_reason = Some(reason);
        self.latches.latch_shutdown();
        true
    }

    fn on_low_battery(&mut self) {
        self.state.low_battery_latched = true;
        self.latches.latch_low_battery();
        match self.options.low_battery_action {
            LowBatteryAction::Shutdown => {
                log::warn!("Low battery: shutting down");
                if self.latch_shutdown(ShutdownReason::LowBattery) {
                    self.state.os_shutdown_requested = true;
                }
            }
            LowBatteryAction::Idle => log::warn!("Low battery: recording stopped"),
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn record_tick(&mut self, now: NaiveDateTime) -> Result<TickOutcome> {
        if !self.segments.is_active() {
            return self.start_segment(now);
        }

        // Health probe: surfaces encoder errors the driver has queued
        if let Err(failure) = self.retry("wait_recording", |_, cam| {
            cam.wait_recording(Duration::ZERO).map_err(SegmentError::from)
        }) {
            return self.handle_failure(now, failure);
        }

        if self.options.annotate {
            let text = format!("{} {}", self.options.prefix, now.format("%Y-%m-%d %H:%M:%S"));
            if let Err(e) = self.camera.set_annotation(&text) {
                log::warn!("Failed to set annotation: {}", e);
            }
        }

        match self.retry("split_recording", |segments, cam| segments.maybe_split(cam, now)) {
            Ok(SplitOutcome::Split { .. }) => {
                self.state.free_bytes = self.segments.reaper().free_bytes().ok();
            }
            Ok(SplitOutcome::Armed) => log::debug!("Interval armed at {}", now.format("%H:%M:%S")),
            Ok(SplitOutcome::Unchanged) => {}
            Err(failure) => return self.handle_failure(now, failure),
        }

        // After any split in this tick
        if let Err(e) = self.preview.maybe_capture(self.camera.as_mut(), now) {
            log::warn!("Preview capture failed: {}", e);
        }

        Ok(TickOutcome::Continue(self.options.recording_tick))
    }

    fn start_segment(&mut self, now: NaiveDateTime) -> Result<TickOutcome> {
        if self.camera.is_recording() {
            log::warn!("Camera recording with no open segment, stopping it first");
            if let Err(e) = self.camera.stop_recording() {
                log::warn!("Stray recording stop failed: {}", e);
            }
        }

        match self.retry("start_recording", |segments, cam| segments.start(cam, now)) {
            Ok(_) => {
                if self.state.disk_full_since.take().is_some() {
                    log::info!("Disk space recovered, recording resumed");
                }
                self.state.status = RecordingStatus::Recording;
                self.state.recording_since = Some(now);
                self.state.free_bytes = self.segments.reaper().free_bytes().ok();
                self.indicators.recording(true);
                if self.options.annotate {
                    let text =
                        format!("{} {}", self.options.prefix, now.format("%Y-%m-%d %H:%M:%S"));
                    if let Err(e) = self.camera.set_annotation(&text) {
                        log::warn!("Failed to set annotation: {}", e);
                    }
                }
                Ok(TickOutcome::Continue(self.options.recording_tick))
            }
            Err(failure) => self.handle_failure(now, failure),
        }
    }

    fn idle_tick(&mut self, now: NaiveDateTime) -> Result<TickOutcome> {
        // Disk-full grace only counts while recording is wanted
        self.state.disk_full_since = None;

        if self.segments.is_active() {
            match self.retry("stop_recording", |segments, cam| segments.stop(cam, now)) {
                Ok(_) => self.mark_stopped(),
                Err(failure) => {
                    self.handle_failure(now, failure)?;
                }
            }
            self.state.free_bytes = self.segments.reaper().free_bytes().ok();
        }
        if self.state.status == RecordingStatus::Recording {
            self.state.status = RecordingStatus::Idle;
        }
        Ok(TickOutcome::Continue(self.options.idle_tick))
    }

    fn mark_stopped(&mut self) {
        self.state.status = RecordingStatus::Idle;
        self.state.recording_since = None;
        self.indicators.recording(false);
    }

    // ========================================================================
    // Errors
    // ========================================================================

    /// Run a camera-touching operation with bounded retry and backoff.
    /// Only camera errors are retried.
    fn retry<T>(
        &mut self,
        what: &str,
        mut op: impl FnMut(&mut SegmentManager, &mut dyn CameraDriver) -> std::result::Result<T, SegmentError>,
    ) -> std::result::Result<T, Failure> {
        let policy = self.options.retry;
        let mut backoff = policy.initial_backoff;
        let mut attempt = 1;

        loop {
            match op(&mut self.segments, self.camera.as_mut()) {
                Ok(value) => {
                    if self.state.consecutive_reinits > 0 {
                        log::info!("Camera healthy again after reinitialize");
                        self.state.consecutive_reinits = 0;
                    }
                    return Ok(value);
                }
                Err(SegmentError::Camera(e)) if attempt < policy.attempts => {
                    log::warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        what,
                        attempt,
                        policy.attempts,
                        e,
                        backoff
                    );
                    self.clock.sleep(backoff);
                    backoff = (backoff * 2).min(policy.max_backoff);
                    attempt += 1;
                }
                Err(SegmentError::Camera(e)) => {
                    log::error!("{} failed after {} attempts: {}", what, attempt, e);
                    return Err(Failure::Camera(e));
                }
                Err(SegmentError::NoSpace(e)) => return Err(Failure::NoSpace(e)),
                Err(SegmentError::AlreadyOpen(path)) => {
                    return Err(Failure::Invariant(format!(
                        "second segment requested while {} is open",
                        path.display()
                    )))
                }
            }
        }
    }

    fn handle_failure(&mut self, now: NaiveDateTime, failure: Failure) -> Result<TickOutcome> {
        match failure {
            Failure::Camera(e) => self.recover_camera(now, e)?,
            Failure::NoSpace(e) => self.on_disk_full(now, e)?,
            Failure::Invariant(msg) => return Err(SupervisorError::Invariant(msg)),
        }
        Ok(TickOutcome::Continue(self.options.idle_tick))
    }

    /// Close and reinitialize after retries ran out. The open segment is
    /// abandoned; the schedule picks recording back up on the next tick.
    fn recover_camera(&mut self, now: NaiveDateTime, cause: CameraError) -> Result<()> {
        let policy = self.options.retry;
        if self.state.consecutive_reinits >= policy.max_reinitializes {
            return Err(SupervisorError::FatalHardware(format!(
                "camera still failing after {} reinitializes: {}",
                self.state.consecutive_reinits, cause
            )));
        }
        log::warn!("Recovering camera after: {}", cause);

        self.state.status = RecordingStatus::Reinitializing;
        self.publish_status(now);
        if self.segments.abandon(now).is_some() {
            self.state.recording_since = None;
            self.indicators.recording(false);
        }
        if let Err(e) = self.camera.close() {
            log::warn!("Camera close failed: {}", e);
        }

        while self.state.consecutive_reinits < policy.max_reinitializes {
            self.state.consecutive_reinits += 1;
            self.clock.sleep(policy.reinit_pause);
            log::warn!(
                "Reinitializing camera ({}/{})",
                self.state.consecutive_reinits,
                policy.max_reinitializes
            );
            match self.camera.reinitialize() {
                Ok(()) => {
                    if let Err(e) = self.camera.apply_imaging(&self.options.imaging) {
                        log::warn!("Failed to re-apply imaging modes: {}", e);
                    }
                    self.state.status = RecordingStatus::Idle;
                    return Ok(());
                }
                Err(e) => log::error!("Camera reinitialize failed: {}", e),
            }
        }

        Err(SupervisorError::FatalHardware(format!(
            "camera could not be reinitialized after {} attempts (first fault: {})",
            self.state.consecutive_reinits, cause
        )))
    }

    /// Stop and stay idle; fatal once the disk has been full for the grace period
    fn on_disk_full(&mut self, now: NaiveDateTime, err: ReaperError) -> Result<()> {
        if self.segments.is_active() {
            match self.retry("stop_recording", |segments, cam| segments.stop(cam, now)) {
                Ok(_) => self.mark_stopped(),
                Err(Failure::Camera(e)) => self.recover_camera(now, e)?,
                Err(Failure::NoSpace(_)) => {}
                Err(Failure::Invariant(msg)) => return Err(SupervisorError::Invariant(msg)),
            }
        }
        self.state.status = RecordingStatus::Idle;

        let since = *self.state.disk_full_since.get_or_insert_with(|| {
            log::error!("Disk full, recording paused: {}", err);
            now
        });
        let elapsed = now
            .signed_duration_since(since)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if elapsed >= self.options.disk_full_grace {
            return Err(SupervisorError::DiskFull {
                secs: elapsed.as_secs(),
                source: err,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Exit paths
    // ========================================================================

    /// Close the open segment, release the camera, then power off if asked
    fn shutdown(&mut self, now: NaiveDateTime) -> ShutdownReason {
        let reason = self
            .state
            .shutdown_reason
            .unwrap_or(ShutdownReason::External);
        log::info!("Shutting down ({:?})", reason);
        self.state.status = RecordingStatus::ShuttingDown;
        self.indicators.shutting_down();

        if self.segments.is_active() {
            match self.retry("stop_recording", |segments, cam| segments.stop(cam, now)) {
                Ok(_) => self.indicators.recording(false),
                Err(_) => {
                    log::error!("Clean stop failed, abandoning segment");
                    self.segments.abandon(now);
                }
            }
        }
        self.state.recording_since = None;
        self.release_camera();
        self.publish_status(now);

        if std::mem::take(&mut self.state.os_shutdown_requested) {
            log::warn!("Powering off");
            if let Err(e) = self.platform.shutdown() {
                log::error!("OS shutdown failed: {:#}", e);
            }
        }
        reason
    }

    fn release_camera(&mut self) {
        if let Err(e) = self.camera.close() {
            log::warn!("Camera close failed: {}", e);
        }
    }

    /// Fatal error: final EXCEPTION line, LEDs dark, camera released best-effort
    fn fail(&mut self, err: &SupervisorError) {
        log::error!(target: EXCEPTION_TARGET, "Fatal: {}", err);
        self.indicators.all_off();
        let now = self.clock.now();
        if self.segments.is_active() {
            if let Err(e) = self.segments.stop(self.camera.as_mut(), now) {
                log::warn!("Final stop failed: {}", e);
                self.segments.abandon(now);
            }
        }
        self.release_camera();
        self.state.status = RecordingStatus::Idle;
        self.publish_status(now);
    }

    fn publish_status(&mut self, now: NaiveDateTime) {
        let recording_for = self.state.recording_since.map(|since| {
            let secs = now.signed_duration_since(since).num_seconds().max(0) as u64;
            format_duration(secs)
        });
        let snapshot = StatusSnapshot {
            state: self.state.status,
            segment: self.segments.current().and_then(|s| {
                s.path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            }),
            current_interval: self.segments.cursor().current_interval,
            max_intervals: self.options.schedule.max_intervals,
            wifi: self.state.wifi_on,
            hour_override: self.state.hour_override,
            low_battery: self.state.low_battery_latched,
            shutdown_in_s: self
                .state
                .shutdown_deadline
                .map(|d| d.saturating_duration_since(Instant::now()).as_secs()),
            last_preview: self.preview.last_capture(),
            free_bytes: self.state.free_bytes,
            recording_for,
            updated_at: now,
        };
        self.status.publish(&snapshot);
    }
}
