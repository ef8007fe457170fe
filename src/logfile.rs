//! Size-capped log file for `--log-file`.
//!
//! When a write would push the file past its cap, it is renamed to `<name>.1`
//! (shifting older backups up to `<name>.<backups>`, dropping the oldest) and
//! a fresh file is started.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub(crate) const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
pub(crate) const LOG_BACKUPS: u32 = 5;

#[derive(Debug)]
pub(crate) struct RotatingFile {
    path: PathBuf,
    file: File,
    written: u64,
    max_bytes: u64,
    backups: u32,
}

impl RotatingFile {
    pub(crate) fn open(path: &Path, max_bytes: u64, backups: u32) -> io::Result<Self> {
        let file = open_append(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written,
            max_bytes,
            backups,
        })
    }

    fn backup_path(&self, n: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.backups == 0 {
            self.file.set_len(0)?;
            self.written = 0;
            return Ok(());
        }

        let oldest = self.backup_path(self.backups);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.backups).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                fs::rename(&from, self.backup_path(n + 1))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))?;

        self.file = open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn test_appends_below_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.log");
        fs::write(&path, "old\n").unwrap();

        let mut log = RotatingFile::open(&path, 100, 2).unwrap();
        log.write_all(b"new\n").unwrap();

        assert_eq!(read(&path), "old\nnew\n");
        assert!(!dir.path().join("backup.log.1").exists());
    }

    #[test]
    fn test_rotates_and_keeps_bounded_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.log");
        let mut log = RotatingFile::open(&path, 10, 2).unwrap();

        for line in ["aaaaaaaa\n", "bbbbbbbb\n", "cccccccc\n", "dddddddd\n"] {
            log.write_all(line.as_bytes()).unwrap();
        }

        assert_eq!(read(&path), "dddddddd\n");
        assert_eq!(read(&dir.path().join("backup.log.1")), "cccccccc\n");
        assert_eq!(read(&dir.path().join("backup.log.2")), "bbbbbbbb\n");
        assert!(!dir.path().join("backup.log.3").exists());
    }

    #[test]
    fn test_oversized_write_goes_to_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.log");
        let mut log = RotatingFile::open(&path, 4, 1).unwrap();

        log.write_all(b"0123456789").unwrap();

        assert_eq!(read(&path), "0123456789");
        assert!(!dir.path().join("backup.log.1").exists());
    }

    #[test]
    fn test_zero_backups_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.log");
        let mut log = RotatingFile::open(&path, 6, 0).unwrap();

        log.write_all(b"first\n").unwrap();
        log.write_all(b"second\n").unwrap();

        assert_eq!(read(&path), "second\n");
    }
}
