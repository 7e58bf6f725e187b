// Recording modules

pub mod manifest;
pub mod preview;
pub mod reaper;
pub mod segment;

pub use manifest::{CopyInfoEntry, CopyInfoManifest};
pub use preview::PreviewTicker;
pub use reaper::{DiskReaper, ReaperError, SpaceProbe, SysinfoProbe};
pub use segment::{ClosedSegment, IntervalCursor, Segment, SegmentError, SegmentManager, SplitOutcome};

use serde::{Deserialize, Serialize};

/// Current recording state, as shown on the status page
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    /// Not recording (outside the window, disk full, or capped)
    Idle,
    /// A segment is open
    Recording,
    /// Camera is being closed and reinitialized after a fault
    Reinitializing,
    /// Terminal: closing the last segment and releasing the camera
    ShuttingDown,
}

impl RecordingStatus {
    pub fn is_recording(&self) -> bool {
        *self == RecordingStatus::Recording
    }
}

impl Default for RecordingStatus {
    fn default() -> Self {
        Self::Idle
    }
}
