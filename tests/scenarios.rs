// End-to-end recording scenarios against the simulated camera and a manual clock

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime};
use crossbeam_channel::Sender;

use trafficcam_lib::camera::{CameraSettings, SimCall, SimControl, SimOp, SimulatedCamera};
use trafficcam_lib::devices::Indicators;
use trafficcam_lib::input::{
    intent_channel, Button, InputMultiplexer, InputState, InputTiming, Intent, Latches,
    ShutdownRequest,
};
use trafficcam_lib::platform::RecordingPlatform;
use trafficcam_lib::recording::reaper::QuotaProbe;
use trafficcam_lib::recording::{DiskReaper, PreviewTicker, SegmentManager};
use trafficcam_lib::schedule::{ManualClock, Schedule};
use trafficcam_lib::status::NullStatus;
use trafficcam_lib::supervisor::{ShutdownReason, Supervisor, SupervisorOptions, TickOutcome};

const MIB: u64 = 1 << 20;

fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 14)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

fn schedule(start_hour: u32, end_hour: u32, interval_minutes: u32, max_intervals: u32) -> Schedule {
    Schedule {
        start_hour,
        end_hour,
        interval_minutes,
        max_intervals,
        preview_period: Duration::from_secs(5),
        min_free_bytes: 0,
        wifi_off_delay: Duration::from_secs(60),
    }
}

struct Harness {
    sup: Supervisor,
    cam: SimControl,
    tx: Sender<Intent>,
    latches: Arc<Latches>,
    platform: RecordingPlatform,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new(schedule: Schedule, quota: u64, min_free: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::in_dir(dir, schedule, quota, min_free)
    }

    fn in_dir(dir: tempfile::TempDir, schedule: Schedule, quota: u64, min_free: u64) -> Self {
        let settings = CameraSettings::default();
        let reaper = DiskReaper::new(
            dir.path().to_path_buf(),
            min_free,
            Box::new(QuotaProbe { quota_bytes: quota }),
        );
        let segments = SegmentManager::new(
            &schedule,
            "cam".into(),
            settings.recording_params(),
            reaper,
        );
        let preview = PreviewTicker::new(
            dir.path().join("preview.jpg"),
            schedule.preview_period,
            settings.still_params(),
        );
        let camera = SimulatedCamera::new();
        let cam = camera.control();
        let (tx, intents) = intent_channel();
        let latches = Arc::new(Latches::default());
        let platform = RecordingPlatform::default();

        let sup = Supervisor::new(
            SupervisorOptions::new(schedule, "cam".into()),
            Box::new(ManualClock::new(at(7, 0, 0))),
            Box::new(camera),
            segments,
            preview,
            intents,
            latches.clone(),
            Box::new(platform.clone()),
            Indicators::disabled(),
            Box::new(NullStatus),
        );
        Self {
            sup,
            cam,
            tx,
            latches,
            platform,
            dir,
        }
    }

    fn tick(&mut self, now: NaiveDateTime) -> TickOutcome {
        self.sup.tick(now).unwrap()
    }

    fn starts(&self) -> usize {
        self.cam.count(|c| matches!(c, SimCall::Start(_)))
    }

    fn splits(&self) -> Vec<PathBuf> {
        self.cam
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                SimCall::Split(path) => Some(path),
                _ => None,
            })
            .collect()
    }

    fn video_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".h264"))
            .collect();
        names.sort();
        names
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().into_owned()
}

#[test]
fn nominal_record_window() {
    let mut h = Harness::new(schedule(8, 10, 15, 0), u64::MAX, 0);

    h.tick(at(7, 59, 59));
    assert_eq!(h.starts(), 0);

    h.tick(at(8, 0, 0));
    assert_eq!(h.starts(), 1);
    for t in [at(8, 0, 30), at(8, 7, 0), at(8, 14, 59)] {
        h.tick(t);
    }
    assert!(h.splits().is_empty());

    h.tick(at(8, 15, 0));
    h.tick(at(8, 15, 30));
    assert_eq!(h.splits().len(), 1);
    assert_eq!(h.sup.segments().cursor().current_interval, 1);

    h.tick(at(8, 29, 59));
    h.tick(at(8, 30, 0));
    let splits = h.splits();
    assert_eq!(
        splits.iter().map(|p| file_name(p)).collect::<Vec<_>>(),
        vec![
            "cam_2024-05-14_08-15-00.h264".to_string(),
            "cam_2024-05-14_08-30-00.h264".to_string()
        ]
    );

    h.tick(at(9, 59, 59));
    assert!(h.sup.segments().is_active());
    h.tick(at(10, 0, 0));
    assert!(!h.sup.segments().is_active());
    assert_eq!(h.cam.count(|c| *c == SimCall::Stop), 1);
    assert!(!h.cam.is_recording());

    // Three closed segments recorded for the copy tooling
    let entries = h.sup.segments().manifest().read_all().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].file, "cam_2024-05-14_08-00-00.h264");
    assert_eq!(entries[2].closed_at, at(10, 0, 0));
    assert_eq!(h.video_files().len(), 3);
}

#[test]
fn interval_cap_stops_after_max_intervals() {
    let mut h = Harness::new(schedule(8, 10, 1, 3), u64::MAX, 0);

    h.tick(at(9, 0, 30));
    h.tick(at(9, 0, 45));
    assert!(h.splits().is_empty());

    for (m, s) in [(1, 0), (1, 30), (2, 0), (2, 30), (3, 0)] {
        h.tick(at(9, m, s));
    }
    assert_eq!(h.splits().len(), 3);
    assert_eq!(h.sup.segments().cursor().current_interval, 3);
    assert!(h.sup.segments().limit_reached());

    // Cap reached: the next tick idles and the camera stops
    h.tick(at(9, 3, 1));
    assert!(!h.sup.segments().is_active());
    assert_eq!(h.cam.count(|c| *c == SimCall::Stop), 1);

    // Still inside the window, but no new recording this run
    h.tick(at(9, 4, 0));
    h.tick(at(9, 30, 0));
    assert_eq!(h.starts(), 1);
    assert_eq!(
        h.video_files(),
        vec![
            "cam_2024-05-14_09-00-30.h264".to_string(),
            "cam_2024-05-14_09-01-00.h264".to_string(),
            "cam_2024-05-14_09-02-00.h264".to_string(),
            "cam_2024-05-14_09-03-00.h264".to_string(),
        ]
    );
}

#[test]
fn disk_pressure_evicts_oldest_then_records() {
    let dir = tempfile::tempdir().unwrap();
    let oldest = dir.path().join("cam_2024-05-13_08-00-00.h264");
    File::create(&oldest).unwrap().set_len(500 * MIB).unwrap();

    // 1100 MiB budget, 500 MiB used: 600 MiB free against a 1 GiB watermark
    let mut h = Harness::in_dir(dir, schedule(8, 10, 15, 0), 1100 * MIB, 1024 * MIB);
    h.tick(at(8, 0, 0));

    assert!(!oldest.exists());
    assert!(h.sup.segments().is_active());
    assert_eq!(h.starts(), 1);
    assert!(h.sup.state().free_bytes.unwrap() > 1024 * MIB);
}

#[test]
fn power_press_inside_window_cancels_shutdown() {
    let timing = InputTiming {
        debounce: Duration::from_millis(50),
        hold: Duration::from_secs(1),
        power_hold: Duration::from_secs(1),
        low_battery_hold: Duration::from_secs(2),
        cancel_window: Duration::from_secs(5),
        wifi_off_delay: Duration::from_secs(60),
    };
    let mut input = InputState::new(timing);
    let mut h = Harness::new(schedule(8, 10, 15, 0), u64::MAX, 0);
    h.tick(at(8, 0, 0));

    let t0 = Instant::now();
    let tx = h.tx.clone();
    let send = |intents: Vec<Intent>| {
        for intent in intents {
            tx.send(intent).unwrap();
        }
    };
    send(input.on_edge(Button::Power, true, t0));
    let released = t0 + Duration::from_secs(2);
    send(input.on_edge(Button::Power, false, released));
    assert!(input.shutdown_deadline().is_some());

    h.tick(at(8, 0, 2));
    assert!(h.sup.state().shutdown_deadline.is_some());

    let pressed = released + Duration::from_secs(3);
    let out = input.on_edge(Button::Power, true, pressed);
    assert_eq!(out, vec![Intent::Shutdown(ShutdownRequest::Cancelled)]);
    send(out);
    send(input.on_edge(Button::Power, false, pressed + Duration::from_millis(200)));
    send(input.on_timer(released + Duration::from_secs(30)));

    assert!(matches!(h.tick(at(8, 0, 5)), TickOutcome::Continue(_)));
    assert!(matches!(h.tick(at(8, 0, 40)), TickOutcome::Continue(_)));
    assert!(h.sup.state().shutdown_deadline.is_none());
    assert!(!h.sup.state().shutdown_latched());
    assert!(h.sup.segments().is_active());
    assert!(h.platform.calls().is_empty());
}

#[test]
fn low_battery_mid_recording_exits_cleanly() {
    let mut h = Harness::new(schedule(8, 10, 15, 0), u64::MAX, 0);
    h.tick(at(8, 40, 0));
    h.tick(at(8, 41, 30));
    assert!(h.sup.segments().is_active());

    h.tx.send(Intent::LowBatteryLatched).unwrap();
    assert_eq!(
        h.tick(at(8, 42, 0)),
        TickOutcome::Exit(ShutdownReason::LowBattery)
    );
    assert!(!h.sup.segments().is_active());
    assert_eq!(h.cam.count(|c| *c == SimCall::Stop), 1);
    assert!(!h.cam.is_open());
    assert!(h.latches.low_battery());
    assert_eq!(h.platform.calls(), vec!["shutdown"]);
}

#[test]
fn transient_split_failure_splits_once() {
    let mut h = Harness::new(schedule(8, 10, 15, 0), u64::MAX, 0);
    h.tick(at(8, 0, 0));
    h.tick(at(8, 10, 0));

    h.cam.fail_next(SimOp::Split, 2);
    h.tick(at(8, 15, 0));
    assert_eq!(
        h.cam.count(|c| *c == SimCall::Failed(SimOp::Split)),
        2
    );

    // More ticks within the same minute must not split again
    h.tick(at(8, 15, 0));
    h.tick(at(8, 15, 30));
    h.tick(at(8, 15, 59));

    let splits = h.splits();
    assert_eq!(splits.len(), 1);
    assert_eq!(file_name(&splits[0]), "cam_2024-05-14_08-15-00.h264");
    assert_eq!(h.sup.segments().cursor().current_interval, 1);
    assert_eq!(h.sup.state().consecutive_reinits, 0);
    assert_eq!(h.cam.count(|c| *c == SimCall::Reinitialize), 0);
}

#[test]
fn stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let settings = CameraSettings::default();
    let reaper = DiskReaper::new(
        dir.path().to_path_buf(),
        0,
        Box::new(QuotaProbe {
            quota_bytes: u64::MAX,
        }),
    );
    let mut segments = SegmentManager::new(
        &schedule(8, 10, 15, 0),
        "cam".into(),
        settings.recording_params(),
        reaper,
    );
    let mut camera = SimulatedCamera::new();
    let cam = camera.control();

    assert!(segments.stop(&mut camera, at(8, 0, 0)).unwrap().is_none());
    segments.start(&mut camera, at(8, 0, 0)).unwrap();
    let closed = segments.stop(&mut camera, at(8, 5, 0)).unwrap();
    assert!(closed.is_some());
    assert!(segments.stop(&mut camera, at(8, 5, 1)).unwrap().is_none());
    assert_eq!(cam.count(|c| *c == SimCall::Stop), 1);
}

#[test]
fn equal_start_and_end_never_records() {
    let mut h = Harness::new(schedule(8, 8, 15, 0), u64::MAX, 0);
    for hour in [0, 7, 8, 9, 23] {
        h.tick(at(hour, 0, 0));
    }
    assert_eq!(h.starts(), 0);
    assert!(h.cam.calls().is_empty());
}

#[test]
fn external_shutdown_through_multiplexer() {
    let latches = Arc::new(Latches::default());
    let timing = InputTiming {
        debounce: Duration::from_millis(20),
        hold: Duration::from_millis(50),
        power_hold: Duration::from_millis(50),
        low_battery_hold: Duration::from_millis(50),
        cancel_window: Duration::from_millis(100),
        wifi_off_delay: Duration::from_millis(100),
    };
    let (mut multiplexer, input, intents) =
        InputMultiplexer::spawn(timing, false, latches.clone()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let schedule = schedule(8, 10, 15, 0);
    let settings = CameraSettings::default();
    let reaper = DiskReaper::new(
        dir.path().to_path_buf(),
        0,
        Box::new(QuotaProbe {
            quota_bytes: u64::MAX,
        }),
    );
    let segments = SegmentManager::new(
        &schedule,
        "cam".into(),
        settings.recording_params(),
        reaper,
    );
    let preview = PreviewTicker::new(
        dir.path().join("preview.jpg"),
        schedule.preview_period,
        settings.still_params(),
    );
    let camera = SimulatedCamera::new();
    let cam = camera.control();
    let platform = RecordingPlatform::default();
    let mut sup = Supervisor::new(
        SupervisorOptions::new(schedule, "cam".into()),
        Box::new(ManualClock::new(at(8, 0, 0))),
        Box::new(camera),
        segments,
        preview,
        intents,
        latches.clone(),
        Box::new(platform.clone()),
        Indicators::disabled(),
        Box::new(NullStatus),
    );

    sup.tick(at(8, 0, 0)).unwrap();
    assert!(sup.segments().is_active());

    input.request_external_shutdown();
    assert!(latches.shutdown());
    assert_eq!(
        sup.tick(at(8, 0, 1)).unwrap(),
        TickOutcome::Exit(ShutdownReason::External)
    );
    assert_eq!(cam.count(|c| *c == SimCall::Stop), 1);
    assert!(!cam.is_open());
    assert!(platform.calls().is_empty());

    multiplexer.stop();
}
