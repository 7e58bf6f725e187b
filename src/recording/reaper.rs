// Disk reaper: keeps the video directory above the free-space watermark by
// deleting the oldest closed segments

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sysinfo::Disks;

pub const VIDEO_EXTENSION: &str = "h264";

#[derive(Debug, thiserror::Error)]
pub enum ReaperError {
    #[error("no more files to delete: {free} bytes free, need more than {required}")]
    NoMoreFilesToDelete { free: u64, required: u64 },
    #[error("cannot determine free space for {path}: {source}")]
    Probe {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to delete {path}: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to list video directory: {0}")]
    List(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReaperError>;

/// Reports the free space available to a directory
pub trait SpaceProbe: Send {
    fn free_bytes(&self, dir: &Path) -> std::io::Result<u64>;
}

/// Free space of the filesystem holding the directory, via sysinfo
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProbe;

impl SpaceProbe for SysinfoProbe {
    fn free_bytes(&self, dir: &Path) -> std::io::Result<u64> {
        let dir = dir.canonicalize()?;
        // Fresh list each call: mounts can change while the recorder runs
        let disks = Disks::new_with_refreshed_list();

        // Most specific mount point wins
        let mut best: Option<(u64, usize)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if dir.starts_with(mount) {
                let len = mount.as_os_str().len();
                if best.map_or(true, |(_, best_len)| len > best_len) {
                    best = Some((disk.available_space(), len));
                }
            }
        }

        best.map(|(free, _)| free).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no mounted disk contains {}", dir.display()),
            )
        })
    }
}

/// Treats the directory as a fixed quota: free = quota minus the size of the
/// files currently in it
#[derive(Debug, Clone, Copy)]
pub struct QuotaProbe {
    pub quota_bytes: u64,
}

impl SpaceProbe for QuotaProbe {
    fn free_bytes(&self, dir: &Path) -> std::io::Result<u64> {
        let mut used = 0u64;
        for entry in fs::read_dir(dir)? {
            let meta = entry?.metadata()?;
            if meta.is_file() {
                used = used.saturating_add(meta.len());
            }
        }
        Ok(self.quota_bytes.saturating_sub(used))
    }
}

pub struct DiskReaper {
    video_dir: PathBuf,
    min_free_bytes: u64,
    probe: Box<dyn SpaceProbe>,
}

impl DiskReaper {
    pub fn new(video_dir: PathBuf, min_free_bytes: u64, probe: Box<dyn SpaceProbe>) -> Self {
        Self {
            video_dir,
            min_free_bytes,
            probe,
        }
    }

    pub fn video_dir(&self) -> &Path {
        &self.video_dir
    }

    pub fn min_free_bytes(&self) -> u64 {
        self.min_free_bytes
    }

    pub fn free_bytes(&self) -> Result<u64> {
        self.probe
            .free_bytes(&self.video_dir)
            .map_err(|source| ReaperError::Probe {
                path: self.video_dir.clone(),
                source,
            })
    }

    /// Delete oldest segments until free space is strictly above the
    /// watermark. `protect` (the open segment) is never deleted.
    ///
    /// Returns the free space once satisfied.
    pub fn ensure_space(&self, protect: Option<&Path>) -> Result<u64> {
        let mut free = self.free_bytes()?;
        if free > self.min_free_bytes {
            return Ok(free);
        }

        let candidates = self.eviction_order(protect)?;
        for path in candidates {
            log::warn!(
                "Low disk space ({} bytes free, need more than {}), deleting {}",
                free,
                self.min_free_bytes,
                path.display()
            );
            fs::remove_file(&path).map_err(|source| ReaperError::Delete {
                path: path.clone(),
                source,
            })?;

            free = self.free_bytes()?;
            if free > self.min_free_bytes {
                log::info!("Freed space, {} bytes now available", free);
                return Ok(free);
            }
        }

        Err(ReaperError::NoMoreFilesToDelete {
            free,
            required: self.min_free_bytes,
        })
    }

    /// Segments in deletion order: oldest creation time first, ties broken by
    /// path. Falls back to mtime on filesystems without birth time.
    pub fn eviction_order(&self, protect: Option<&Path>) -> Result<Vec<PathBuf>> {
        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();

        for entry in fs::read_dir(&self.video_dir).map_err(ReaperError::List)? {
            let entry = entry.map_err(ReaperError::List)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(VIDEO_EXTENSION) {
                continue;
            }
            if protect.map_or(false, |p| p == path) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let created = meta
                .created()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((created, path));
        }

        files.sort();
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn sparse(dir: &Path, name: &str, len: u64) -> PathBuf {
        let path = dir.join(name);
        fs::File::create(&path).unwrap().set_len(len).unwrap();
        path
    }

    #[test]
    fn deletes_oldest_until_above_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let a = sparse(dir.path(), "cam_2024-05-14_08-00-00.h264", 300 * MIB);
        std::thread::sleep(std::time::Duration::from_millis(20));
        let b = sparse(dir.path(), "cam_2024-05-14_08-15-00.h264", 300 * MIB);
        std::thread::sleep(std::time::Duration::from_millis(20));
        let c = sparse(dir.path(), "cam_2024-05-14_08-30-00.h264", 300 * MIB);

        // 1000 MiB quota, 900 used, need more than 400 free
        let reaper = DiskReaper::new(
            dir.path().to_path_buf(),
            400 * MIB,
            Box::new(QuotaProbe { quota_bytes: 1000 * MIB }),
        );
        let free = reaper.ensure_space(None).unwrap();
        assert_eq!(free, 700 * MIB);
        assert!(!a.exists());
        assert!(!b.exists());
        assert!(c.exists());
    }

    #[test]
    fn exactly_at_watermark_is_insufficient() {
        let dir = tempfile::tempdir().unwrap();
        let old = sparse(dir.path(), "old.h264", 100 * MIB);
        let reaper = DiskReaper::new(
            dir.path().to_path_buf(),
            400 * MIB,
            Box::new(QuotaProbe { quota_bytes: 500 * MIB }),
        );
        reaper.ensure_space(None).unwrap();
        assert!(!old.exists());
    }

    #[test]
    fn protects_open_segment_and_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let open = sparse(dir.path(), "open.h264", 100 * MIB);
        let log = sparse(dir.path(), "cam.log", 100 * MIB);
        let reaper = DiskReaper::new(
            dir.path().to_path_buf(),
            100 * MIB,
            Box::new(QuotaProbe { quota_bytes: 250 * MIB }),
        );

        let err = reaper.ensure_space(Some(&open)).unwrap_err();
        assert!(matches!(
            err,
            ReaperError::NoMoreFilesToDelete { free, required } if free == 50 * MIB && required == 100 * MIB
        ));
        assert!(open.exists());
        assert!(log.exists());
    }
}
