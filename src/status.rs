// Status snapshot published for the locally served status page

use chrono::NaiveDateTime;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::recording::RecordingStatus;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusSnapshot {
    pub state: RecordingStatus,
    /// File name of the open segment
    pub segment: Option<String>,
    pub current_interval: u32,
    pub max_intervals: u32,
    pub wifi: bool,
    pub hour_override: bool,
    pub low_battery: bool,
    /// Seconds until a pending power-off confirms
    pub shutdown_in_s: Option<u64>,
    pub last_preview: Option<NaiveDateTime>,
    pub free_bytes: Option<u64>,
    /// Time since the current recording started, `H:MM:SS`
    pub recording_for: Option<String>,
    pub updated_at: NaiveDateTime,
}

impl StatusSnapshot {
    /// Equal apart from the timestamp
    pub fn same_content(&self, other: &StatusSnapshot) -> bool {
        StatusSnapshot {
            updated_at: other.updated_at,
            ..self.clone()
        } == *other
    }
}

pub trait StatusSink: Send {
    fn publish(&mut self, snapshot: &StatusSnapshot);
}

/// Used when no status page is served
#[derive(Debug, Default)]
pub struct NullStatus;

impl StatusSink for NullStatus {
    fn publish(&mut self, _snapshot: &StatusSnapshot) {}
}

/// Writes the snapshot as JSON, replacing the file atomically, and only when
/// the content changed
pub struct JsonStatusFile {
    path: PathBuf,
    last: Option<StatusSnapshot>,
}

impl JsonStatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path, last: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, snapshot: &StatusSnapshot) -> anyhow::Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, snapshot)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_data()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl StatusSink for JsonStatusFile {
    fn publish(&mut self, snapshot: &StatusSnapshot) {
        if self
            .last
            .as_ref()
            .map_or(false, |last| last.same_content(snapshot))
        {
            return;
        }
        match self.write(snapshot) {
            Ok(()) => self.last = Some(snapshot.clone()),
            // Retried on the next change; the page just shows stale data meanwhile
            Err(e) => log::warn!("Failed to write status {}: {}", self.path.display(), e),
        }
    }
}

/// Format duration as `H:MM:SS`
pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    format!("{}:{:02}:{:02}", hours, mins, secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn snapshot(second: u32) -> StatusSnapshot {
        StatusSnapshot {
            state: RecordingStatus::Recording,
            segment: Some("cam_2024-05-14_08-00-00.h264".into()),
            current_interval: 0,
            max_intervals: 0,
            wifi: false,
            hour_override: false,
            low_battery: false,
            shutdown_in_s: None,
            last_preview: None,
            free_bytes: Some(1 << 30),
            recording_for: Some(format_duration(second as u64)),
            updated_at: NaiveDate::from_ymd_opt(2024, 5, 14)
                .unwrap()
                .and_hms_opt(8, 0, second)
                .unwrap(),
        }
    }

    #[test]
    fn duration_format() {
        assert_eq!(format_duration(0), "0:00:00");
        assert_eq!(format_duration(3725), "1:02:05");
    }

    #[test]
    fn writes_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let mut sink = JsonStatusFile::new(path.clone());

        sink.publish(&snapshot(1));
        let first = std::fs::read_to_string(&path).unwrap();
        assert!(first.contains("\"state\": \"recording\""));

        // Only the timestamp differs: no rewrite
        let mut same = snapshot(1);
        same.updated_at = snapshot(2).updated_at;
        sink.publish(&same);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);

        sink.publish(&snapshot(2));
        assert_ne!(std::fs::read_to_string(&path).unwrap(), first);
    }
}
