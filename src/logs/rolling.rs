use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// Size-rotated log file: `gordon.log` plus numbered backups
/// (`gordon.log.1` is the newest). Rotation shifts the chain, drops backups
/// beyond `max_backups`, and prunes backups older than `max_age` days.
#[derive(Clone)]
pub struct RollingWriter {
    inner: Arc<Mutex<RollingState>>,
}

struct RollingState {
    path: PathBuf,
    file: fs::File,
    written: u64,
    max_size: u64,
    max_backups: u32,
    max_age: Duration,
}

impl RollingWriter {
    pub fn open(
        path: PathBuf,
        max_size_mb: u64,
        max_backups: u32,
        max_age_days: u32,
    ) -> std::io::Result<RollingWriter> {
        let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(RollingWriter {
            inner: Arc::new(Mutex::new(RollingState {
                path,
                file,
                written,
                max_size: max_size_mb.max(1) * 1024 * 1024,
                max_backups,
                max_age: Duration::from_secs(u64::from(max_age_days) * 24 * 3600),
            })),
        })
    }
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.inner.lock().expect("log writer lock poisoned");
        if state.written > 0 && state.written + buf.len() as u64 > state.max_size {
            state.rotate()?;
        }
        let n = state.file.write(buf)?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner
            .lock()
            .expect("log writer lock poisoned")
            .file
            .flush()
    }
}

impl RollingState {
    fn backup_path(&self, index: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        // Shift the chain from the oldest end; the slot past max_backups
        // falls off.
        if self.max_backups > 0 {
            let _ = fs::remove_file(self.backup_path(self.max_backups));
            for index in (1..self.max_backups).rev() {
                let _ = fs::rename(self.backup_path(index), self.backup_path(index + 1));
            }
            fs::rename(&self.path, self.backup_path(1))?;
        } else {
            fs::remove_file(&self.path)?;
        }

        self.prune_old_backups();
        self.file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn prune_old_backups(&self) {
        if self.max_age.is_zero() {
            return;
        }
        let cutoff = SystemTime::now() - self.max_age;
        for index in 1..=self.max_backups {
            let path = self.backup_path(index);
            let expired = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(|modified| modified < cutoff)
                .unwrap_or(false);
            if expired {
                let _ = fs::remove_file(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(dir: &tempfile::TempDir, max_backups: u32) -> RollingWriter {
        RollingWriter::open(dir.path().join("gordon.log"), 1, max_backups, 28).unwrap()
    }

    #[test]
    fn appends_until_the_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer(&dir, 3);
        writer.write_all(b"hello\n").unwrap();
        writer.write_all(b"world\n").unwrap();
        writer.flush().unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("gordon.log")).unwrap(),
            "hello\nworld\n"
        );
        assert!(!dir.path().join("gordon.log.1").exists());
    }

    #[test]
    fn rotation_shifts_backups_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer(&dir, 2);
        // Force the limit down so one big write triggers rotation next time.
        writer.inner.lock().unwrap().max_size = 8;

        writer.write_all(b"first--\n").unwrap();
        writer.write_all(b"second-\n").unwrap();
        writer.write_all(b"third--\n").unwrap();
        writer.flush().unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("gordon.log")).unwrap(),
            "third--\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("gordon.log.1")).unwrap(),
            "second-\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("gordon.log.2")).unwrap(),
            "first--\n"
        );
        assert!(!dir.path().join("gordon.log.3").exists());
    }

    #[test]
    fn oldest_backup_falls_off_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer(&dir, 1);
        writer.inner.lock().unwrap().max_size = 4;

        writer.write_all(b"aaaa\n").unwrap();
        writer.write_all(b"bbbb\n").unwrap();
        writer.write_all(b"cccc\n").unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("gordon.log.1")).unwrap(),
            "bbbb\n"
        );
        assert!(!dir.path().join("gordon.log.2").exists());
    }
}
