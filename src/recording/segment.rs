// Segment manager: owns the open segment, decides when to split, names files
// and counts completed intervals

use chrono::{NaiveDateTime, Timelike};
use std::path::{Path, PathBuf};

use super::manifest::{CopyInfoEntry, CopyInfoManifest};
use super::reaper::{DiskReaper, ReaperError, VIDEO_EXTENSION};
use crate::camera::{CameraDriver, CameraError, RecordingParams};
use crate::schedule::Schedule;

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("no space for a new segment: {0}")]
    NoSpace(#[from] ReaperError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("a segment is already open: {0}")]
    AlreadyOpen(PathBuf),
}

pub type Result<T> = std::result::Result<T, SegmentError>;

/// One H.264 file being written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub path: PathBuf,
    pub opened_at: NaiveDateTime,
    /// Monotonic within a run, starting at 1
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSegment {
    pub segment: Segment,
    pub closed_at: NaiveDateTime,
    pub bytes: u64,
}

/// Segment rotation state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalCursor {
    /// Segments completed by a split this run
    pub current_interval: u32,
    /// The clock has left the minute of the last start/split
    pub interval_armed: bool,
    /// Minute (seconds truncated) of the last start or split
    mark: Option<NaiveDateTime>,
    /// `current_interval` reached `max_intervals`
    pub limit_reached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitOutcome {
    /// Nothing to do this call
    Unchanged,
    /// The clock moved off the last split-minute; the next split-minute splits
    Armed,
    Split {
        closed: ClosedSegment,
        limit_reached: bool,
    },
}

fn minute_of(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

pub struct SegmentManager {
    video_dir: PathBuf,
    prefix: String,
    schedule: Schedule,
    params: RecordingParams,
    reaper: DiskReaper,
    manifest: CopyInfoManifest,
    open: Option<Segment>,
    cursor: IntervalCursor,
    next_sequence: u64,
}

impl SegmentManager {
    pub fn new(
        schedule: &Schedule,
        prefix: String,
        params: RecordingParams,
        reaper: DiskReaper,
    ) -> Self {
        let video_dir = reaper.video_dir().to_path_buf();
        Self {
            manifest: CopyInfoManifest::in_dir(&video_dir),
            video_dir,
            prefix,
            schedule: schedule.clone(),
            params,
            reaper,
            open: None,
            cursor: IntervalCursor::default(),
            next_sequence: 1,
        }
    }

    pub fn is_active(&self) -> bool {
        self.open.is_some()
    }

    pub fn current(&self) -> Option<&Segment> {
        self.open.as_ref()
    }

    pub fn cursor(&self) -> &IntervalCursor {
        &self.cursor
    }

    pub fn limit_reached(&self) -> bool {
        self.cursor.limit_reached
    }

    pub fn reaper(&self) -> &DiskReaper {
        &self.reaper
    }

    pub fn manifest(&self) -> &CopyInfoManifest {
        &self.manifest
    }

    /// Open a new segment. Frees disk space first; when that fails the camera
    /// is not touched.
    pub fn start(&mut self, camera: &mut dyn CameraDriver, now: NaiveDateTime) -> Result<Segment> {
        if let Some(open) = &self.open {
            return Err(SegmentError::AlreadyOpen(open.path.clone()));
        }
        self.reaper.ensure_space(None)?;

        let path = self.segment_path(now);
        camera.start_recording(&path, &self.params)?;

        let segment = Segment {
            path,
            opened_at: now,
            sequence: self.take_sequence(),
        };
        log::info!(
            "Started segment #{} {}",
            segment.sequence,
            segment.path.display()
        );
        self.cursor.interval_armed = false;
        self.cursor.mark = Some(minute_of(now));
        self.open = Some(segment.clone());
        Ok(segment)
    }

    /// Split the open segment when the clock is on an armed split-minute.
    ///
    /// A failed split leaves all state untouched, so retrying with the same
    /// `now` produces at most one split.
    pub fn maybe_split(
        &mut self,
        camera: &mut dyn CameraDriver,
        now: NaiveDateTime,
    ) -> Result<SplitOutcome> {
        let Some(current) = self.open.clone() else {
            return Ok(SplitOutcome::Unchanged);
        };

        let mut outcome = SplitOutcome::Unchanged;
        if !self.cursor.interval_armed && self.cursor.mark != Some(minute_of(now)) {
            self.cursor.interval_armed = true;
            outcome = SplitOutcome::Armed;
        }

        if !self.new_interval_condition(now) {
            return Ok(outcome);
        }

        self.reaper.ensure_space(Some(&current.path))?;
        let path = self.segment_path(now);
        camera.split_recording(&path)?;

        let next = Segment {
            path,
            opened_at: now,
            sequence: self.take_sequence(),
        };
        self.open = Some(next.clone());
        self.cursor.current_interval += 1;
        self.cursor.interval_armed = false;
        self.cursor.mark = Some(minute_of(now));
        let max_intervals = self.schedule.max_intervals;
        if max_intervals > 0 && self.cursor.current_interval >= max_intervals {
            self.cursor.limit_reached = true;
        }

        let closed = self.record_closed(current, now);
        log::info!(
            "Split: closed {} ({} bytes), interval {} complete, now writing {}",
            closed.segment.path.display(),
            closed.bytes,
            self.cursor.current_interval,
            next.path.display()
        );
        if self.cursor.limit_reached {
            log::info!(
                "Reached {} intervals, no more recording this run",
                self.schedule.max_intervals
            );
        }

        Ok(SplitOutcome::Split {
            closed,
            limit_reached: self.cursor.limit_reached,
        })
    }

    /// Close the open segment, if any. Calling it with nothing open is a no-op.
    pub fn stop(
        &mut self,
        camera: &mut dyn CameraDriver,
        now: NaiveDateTime,
    ) -> Result<Option<ClosedSegment>> {
        let Some(current) = self.open.clone() else {
            return Ok(None);
        };
        camera.stop_recording()?;
        self.open = None;

        let closed = self.record_closed(current, now);
        log::info!(
            "Stopped segment {} ({} bytes)",
            closed.segment.path.display(),
            closed.bytes
        );
        Ok(Some(closed))
    }

    /// Forget the open segment without talking to the camera, after a fault
    /// the camera did not survive. What was written so far stays on disk.
    pub fn abandon(&mut self, now: NaiveDateTime) -> Option<ClosedSegment> {
        let current = self.open.take()?;
        let closed = self.record_closed(current, now);
        log::warn!(
            "Abandoned segment {} after camera fault ({} bytes kept)",
            closed.segment.path.display(),
            closed.bytes
        );
        Some(closed)
    }

    /// `interval_armed ∧ is_split_minute ∧ (max == 0 ∨ current < max)`
    fn new_interval_condition(&self, now: NaiveDateTime) -> bool {
        let max_intervals = self.schedule.max_intervals;
        self.cursor.interval_armed
            && self.schedule.is_split_minute(now)
            && (max_intervals == 0 || self.cursor.current_interval < max_intervals)
    }

    fn take_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// `<prefix>_YYYY-MM-DD_HH-MM-SS.h264`, with a numeric suffix if that name
    /// is already taken
    fn segment_path(&self, now: NaiveDateTime) -> PathBuf {
        let stem = format!("{}_{}", self.prefix, now.format("%Y-%m-%d_%H-%M-%S"));
        let mut path = self.video_dir.join(format!("{}.{}", stem, VIDEO_EXTENSION));
        let mut n = 1;
        while path.exists() || self.open.as_ref().map_or(false, |s| s.path == path) {
            path = self
                .video_dir
                .join(format!("{}_{}.{}", stem, n, VIDEO_EXTENSION));
            n += 1;
        }
        path
    }

    fn record_closed(&self, segment: Segment, now: NaiveDateTime) -> ClosedSegment {
        let bytes = std::fs::metadata(&segment.path).map(|m| m.len()).unwrap_or(0);
        let closed = ClosedSegment {
            segment,
            closed_at: now,
            bytes,
        };

        let entry = CopyInfoEntry {
            file: file_name(&closed.segment.path),
            sequence: closed.segment.sequence,
            opened_at: closed.segment.opened_at,
            closed_at: closed.closed_at,
            bytes: closed.bytes,
        };
        if let Err(e) = self.manifest.append(&entry) {
            log::warn!("Failed to append to {}: {}", self.manifest.path().display(), e);
        }
        closed
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraSettings, SimCall, SimControl, SimOp, SimulatedCamera};
    use crate::recording::reaper::QuotaProbe;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn setup(
        dir: &Path,
        interval_minutes: u32,
        max_intervals: u32,
    ) -> (SegmentManager, SimulatedCamera, SimControl) {
        let schedule = Schedule {
            start_hour: 8,
            end_hour: 10,
            interval_minutes,
            max_intervals,
            preview_period: Duration::from_secs(5),
            min_free_bytes: 0,
            wifi_off_delay: Duration::from_secs(60),
        };
        let reaper = DiskReaper::new(
            dir.to_path_buf(),
            0,
            Box::new(QuotaProbe { quota_bytes: u64::MAX }),
        );
        let params = CameraSettings::default().recording_params();
        let manager = SegmentManager::new(&schedule, "cam".into(), params, reaper);
        let camera = SimulatedCamera::new();
        let control = camera.control();
        (manager, camera, control)
    }

    #[test]
    fn start_names_segment_and_disarms() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut cam, _) = setup(dir.path(), 15, 0);

        let seg = mgr.start(&mut cam, at(8, 0, 0)).unwrap();
        assert_eq!(seg.path, dir.path().join("cam_2024-05-14_08-00-00.h264"));
        assert_eq!(seg.sequence, 1);
        assert!(!mgr.cursor().interval_armed);
        assert!(matches!(
            mgr.start(&mut cam, at(8, 0, 1)),
            Err(SegmentError::AlreadyOpen(_))
        ));
    }

    #[test]
    fn one_split_per_split_minute() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut cam, control) = setup(dir.path(), 15, 0);
        mgr.start(&mut cam, at(8, 0, 0)).unwrap();

        // Still inside the start minute: nothing happens
        assert_eq!(mgr.maybe_split(&mut cam, at(8, 0, 30)).unwrap(), SplitOutcome::Unchanged);
        assert_eq!(mgr.maybe_split(&mut cam, at(8, 1, 0)).unwrap(), SplitOutcome::Armed);

        let mut splits = 0;
        for s in 0..60 {
            if let SplitOutcome::Split { .. } = mgr.maybe_split(&mut cam, at(8, 15, s)).unwrap() {
                splits += 1;
            }
        }
        assert_eq!(splits, 1);
        assert_eq!(mgr.cursor().current_interval, 1);
        assert_eq!(control.count(|c| matches!(c, SimCall::Split(_))), 1);
    }

    #[test]
    fn splits_land_only_on_schedule_split_minutes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut cam, _) = setup(dir.path(), 20, 0);
        mgr.start(&mut cam, at(8, 0, 0)).unwrap();

        let mut split_at = Vec::new();
        for m in 1..60 {
            let now = at(8, m, 0);
            if let SplitOutcome::Split { .. } = mgr.maybe_split(&mut cam, now).unwrap() {
                assert!(mgr.schedule.is_split_minute(now));
                split_at.push(m);
            }
        }
        assert_eq!(split_at, vec![20, 40]);
    }

    #[test]
    fn every_minute_rotation_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut cam, _) = setup(dir.path(), 1, 2);
        mgr.start(&mut cam, at(9, 0, 30)).unwrap();

        assert!(matches!(
            mgr.maybe_split(&mut cam, at(9, 1, 0)).unwrap(),
            SplitOutcome::Split { limit_reached: false, .. }
        ));
        assert!(matches!(
            mgr.maybe_split(&mut cam, at(9, 2, 0)).unwrap(),
            SplitOutcome::Split { limit_reached: true, .. }
        ));
        // Capped: later split-minutes only arm
        assert_eq!(mgr.maybe_split(&mut cam, at(9, 3, 0)).unwrap(), SplitOutcome::Armed);
        assert_eq!(mgr.cursor().current_interval, 2);
        assert!(mgr.limit_reached());
    }

    #[test]
    fn failed_split_leaves_state_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut cam, control) = setup(dir.path(), 15, 0);
        mgr.start(&mut cam, at(8, 0, 0)).unwrap();
        mgr.maybe_split(&mut cam, at(8, 5, 0)).unwrap();

        control.fail_next(SimOp::Split, 1);
        assert!(matches!(
            mgr.maybe_split(&mut cam, at(8, 15, 0)),
            Err(SegmentError::Camera(CameraError::Transient(_)))
        ));
        assert_eq!(mgr.cursor().current_interval, 0);
        assert!(mgr.cursor().interval_armed);

        assert!(matches!(
            mgr.maybe_split(&mut cam, at(8, 15, 0)).unwrap(),
            SplitOutcome::Split { .. }
        ));
        assert_eq!(
            mgr.current().unwrap().path,
            dir.path().join("cam_2024-05-14_08-15-00.h264")
        );
    }

    #[test]
    fn stop_is_idempotent_and_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut cam, control) = setup(dir.path(), 15, 0);
        mgr.start(&mut cam, at(8, 0, 0)).unwrap();

        let closed = mgr.stop(&mut cam, at(8, 3, 0)).unwrap().unwrap();
        assert_eq!(closed.segment.sequence, 1);
        assert!(mgr.stop(&mut cam, at(8, 3, 1)).unwrap().is_none());
        assert_eq!(control.count(|c| *c == SimCall::Stop), 1);

        let entries = mgr.manifest().read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file, "cam_2024-05-14_08-00-00.h264");
        assert_eq!(entries[0].closed_at, at(8, 3, 0));
    }

    #[test]
    fn restart_in_same_second_gets_unique_name() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut cam, _) = setup(dir.path(), 15, 0);
        let first = mgr.start(&mut cam, at(8, 0, 0)).unwrap();
        mgr.stop(&mut cam, at(8, 0, 0)).unwrap();
        let second = mgr.start(&mut cam, at(8, 0, 0)).unwrap();
        assert_ne!(first.path, second.path);
        assert_eq!(second.path, dir.path().join("cam_2024-05-14_08-00-00_1.h264"));
        assert_eq!(second.sequence, 2);
    }

    #[test]
    fn no_space_does_not_touch_camera() {
        let dir = tempfile::tempdir().unwrap();
        let schedule = Schedule {
            start_hour: 8,
            end_hour: 10,
            interval_minutes: 15,
            max_intervals: 0,
            preview_period: Duration::from_secs(5),
            min_free_bytes: 10,
            wifi_off_delay: Duration::from_secs(60),
        };
        let reaper = DiskReaper::new(
            dir.path().to_path_buf(),
            10,
            Box::new(QuotaProbe { quota_bytes: 10 }),
        );
        let mut mgr = SegmentManager::new(
            &schedule,
            "cam".into(),
            CameraSettings::default().recording_params(),
            reaper,
        );
        let mut cam = SimulatedCamera::new();
        let control = cam.control();

        assert!(matches!(
            mgr.start(&mut cam, at(8, 0, 0)),
            Err(SegmentError::NoSpace(ReaperError::NoMoreFilesToDelete { .. }))
        ));
        assert!(control.calls().is_empty());
        assert!(!mgr.is_active());
    }
}
