// Copy-info manifest: one JSON line per closed segment, read by the uploader

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE_NAME: &str = "copyinfo.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CopyInfoEntry {
    /// File name relative to the video directory
    pub file: String,
    pub sequence: u64,
    pub opened_at: NaiveDateTime,
    pub closed_at: NaiveDateTime,
    pub bytes: u64,
}

/// Append-only manifest in the video directory
#[derive(Debug, Clone)]
pub struct CopyInfoManifest {
    path: PathBuf,
}

impl CopyInfoManifest {
    pub fn in_dir(video_dir: &Path) -> Self {
        Self {
            path: video_dir.join(MANIFEST_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush it to disk. A torn last line is terminated
    /// first so the new entry starts on a line of its own.
    pub fn append(&self, entry: &CopyInfoEntry) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        let mut line = Vec::new();
        if file.metadata()?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                line.push(b'\n');
            }
        }
        serde_json::to_writer(&mut line, entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.flush()?;
        file.sync_data()
    }

    /// Read every entry; lines that fail to parse (e.g. a torn last line after
    /// power loss) are skipped
    pub fn read_all(&self) -> std::io::Result<Vec<CopyInfoEntry>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => log::warn!("Skipping bad manifest line in {}: {}", self.path.display(), e),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn entry(seq: u64) -> CopyInfoEntry {
        let t = NaiveDate::from_ymd_opt(2024, 5, 14)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        CopyInfoEntry {
            file: format!("cam_{}.h264", seq),
            sequence: seq,
            opened_at: t,
            closed_at: t + chrono::Duration::minutes(15),
            bytes: 1234,
        }
    }

    #[test]
    fn appends_survive_a_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = CopyInfoManifest::in_dir(dir.path());
        assert!(manifest.read_all().unwrap().is_empty());

        manifest.append(&entry(1)).unwrap();
        manifest.append(&entry(2)).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(manifest.path()).unwrap();
            f.write_all(b"{\"file\":\"cam_3.h2").unwrap();
        }

        let entries = manifest.read_all().unwrap();
        assert_eq!(entries, vec![entry(1), entry(2)]);
    }

    #[test]
    fn append_after_a_torn_line_starts_a_new_line() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = CopyInfoManifest::in_dir(dir.path());
        manifest.append(&entry(1)).unwrap();
        manifest.append(&entry(2)).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(manifest.path()).unwrap();
            f.write_all(b"{\"file\":\"cam_3.h2").unwrap();
        }

        manifest.append(&entry(4)).unwrap();
        manifest.append(&entry(5)).unwrap();

        let entries = manifest.read_all().unwrap();
        assert_eq!(entries, vec![entry(1), entry(2), entry(4), entry(5)]);

        let raw = std::fs::read_to_string(manifest.path()).unwrap();
        assert!(raw.ends_with('\n'));
        assert_eq!(raw.lines().count(), 5);
    }
}
