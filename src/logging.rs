// Logging setup: env_logger writing to stderr and a per-run log file

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use env_logger::{Builder, Target};
use log::{Level, LevelFilter, Record};

use crate::supervisor::EXCEPTION_TARGET;

/// Copies every formatted record to stderr and the log file, flushing both
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // stderr is best-effort; the file is the record that matters
        let _ = io::stderr().write_all(buf);
        self.file.write_all(buf)?;
        self.file.flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        self.file.flush()
    }
}

/// Severity label for a record
pub fn level_label(record: &Record) -> &'static str {
    if record.target() == EXCEPTION_TARGET {
        return "EXCEPTION";
    }
    match record.level() {
        Level::Error => "ERROR",
        Level::Warn => "WARNING",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// `<prefix>_YYYY-MM-DD_HH-MM-SS.log` in the video directory
pub fn log_file_path(video_dir: &Path, prefix: &str) -> PathBuf {
    video_dir.join(format!(
        "{}_{}.log",
        prefix,
        Local::now().format("%Y-%m-%d_%H-%M-%S")
    ))
}

fn builder() -> Builder {
    let mut builder = Builder::new();
    builder
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                level_label(record),
                record.target(),
                record.args()
            )
        });
    builder
}

/// Install the global logger. Falls back to stderr only if the log file
/// cannot be opened; returns the file path when there is one.
pub fn init(video_dir: &Path, prefix: &str) -> Option<PathBuf> {
    let path = log_file_path(video_dir, prefix);
    let file = std::fs::create_dir_all(video_dir).and_then(|_| {
        OpenOptions::new().create(true).append(true).open(&path)
    });

    let mut builder = builder();
    match file {
        Ok(file) => {
            builder.target(Target::Pipe(Box::new(TeeWriter { file })));
            if builder.try_init().is_err() {
                return None;
            }
            log::info!("Logging to {}", path.display());
            Some(path)
        }
        Err(e) => {
            let _ = builder.target(Target::Stderr).try_init();
            log::warn!("Cannot open log file {}: {}, logging to stderr only", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels() {
        let warn = Record::builder().level(Level::Warn).target("trafficcam").build();
        assert_eq!(level_label(&warn), "WARNING");
        let exception = Record::builder()
            .level(Level::Error)
            .target(EXCEPTION_TARGET)
            .build();
        assert_eq!(level_label(&exception), "EXCEPTION");
    }

    #[test]
    fn tee_appends_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam.log");
        let file = OpenOptions::new().create(true).append(true).open(&path).unwrap();
        let mut tee = TeeWriter { file };
        tee.write_all(b"one\n").unwrap();
        tee.write_all(b"two\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn log_name_pattern() {
        let path = log_file_path(Path::new("/videos"), "cam");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("cam_"));
        assert!(name.ends_with(".log"));
        assert_eq!(name.len(), "cam_2024-05-14_08-00-00.log".len());
    }
}
