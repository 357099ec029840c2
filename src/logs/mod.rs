pub mod demux;
pub mod rolling;

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::runtime::ContainerRuntime;

pub use demux::{LogLine, LogSource};
pub use rolling::RollingWriter;

const CHANNEL_CAPACITY: usize = 256;
const FOLLOW_POLL: Duration = Duration::from_millis(100);

/// Serves process logs (file tail or journal fallback) and container logs
/// (demuxed runtime stream). Consumers get bounded channels that close when
/// the source ends or the cancellation token fires.
pub struct LogService {
    log_file: Option<PathBuf>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl LogService {
    pub fn new(log_file: Option<PathBuf>, runtime: Arc<dyn ContainerRuntime>) -> LogService {
        LogService { log_file, runtime }
    }

    /// Lines from the process log. With a configured log file the last
    /// `tail` lines are replayed and, in follow mode, new lines stream as
    /// they are written. Without one, `journalctl -u gordon` is consulted.
    pub fn process_logs(
        &self,
        tail: usize,
        follow: bool,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        match self.log_file.clone() {
            Some(path) => {
                tokio::spawn(async move {
                    if let Err(e) = tail_file(path, tail, follow, tx, cancel).await {
                        tracing::debug!(error = %e, "log tail ended");
                    }
                });
            }
            None => {
                tokio::spawn(async move {
                    if let Err(e) = journal_logs(tail, follow, tx, cancel).await {
                        tracing::debug!(error = %e, "journal read ended");
                    }
                });
            }
        }
        rx
    }

    /// Demultiplexed log lines for one container.
    pub async fn container_logs(
        &self,
        container_id: &str,
        tail: Option<usize>,
        follow: bool,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<LogLine>> {
        let reader = self
            .runtime
            .container_logs(container_id, tail, follow)
            .await?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        demux::spawn_demux(reader, tx, cancel);
        Ok(rx)
    }

    /// Follows a container's logs into a file until cancelled. Used by the
    /// controller to keep `logs/containers/<domain>.log` current.
    pub fn capture_container_logs(
        &self,
        container_id: String,
        path: PathBuf,
        cancel: CancellationToken,
    ) {
        let runtime = Arc::clone(&self.runtime);
        tokio::spawn(async move {
            let reader = match runtime.container_logs(&container_id, Some(0), true).await {
                Ok(reader) => reader,
                Err(e) => {
                    tracing::debug!(container_id, error = %e, "log capture unavailable");
                    return;
                }
            };
            let mut file = match fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(container_id, error = %e, "cannot open container log file");
                    return;
                }
            };

            let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
            demux::spawn_demux(reader, tx, cancel);
            while let Some(line) = rx.recv().await {
                let record = format!("{} {}\n", line.source.as_str(), line.line);
                if file.write_all(record.as_bytes()).await.is_err() {
                    break;
                }
            }
            let _ = file.flush().await;
        });
    }
}

/// Replays the last `tail` lines of `path`, then polls for appended data
/// every 100ms while following.
async fn tail_file(
    path: PathBuf,
    tail: usize,
    follow: bool,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut file = fs::File::open(&path).await?;

    // Ring buffer over the whole file keeps only the requested tail.
    let mut last_lines: VecDeque<String> = VecDeque::with_capacity(tail);
    {
        let mut lines = BufReader::new(&mut file).lines();
        while let Some(line) = lines.next_line().await? {
            if tail > 0 && last_lines.len() == tail {
                last_lines.pop_front();
            }
            last_lines.push_back(line);
        }
    }
    for line in last_lines {
        if tx.send(line).await.is_err() {
            return Ok(());
        }
    }
    if !follow {
        return Ok(());
    }

    let mut offset = file.seek(SeekFrom::End(0)).await?;
    let mut partial = String::new();
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        // Reopen on every pass so truncation and rotation are picked up.
        let mut file = fs::File::open(&path).await?;
        let len = file.metadata().await?.len();
        if len < offset {
            offset = 0;
            partial.clear();
        }
        file.seek(SeekFrom::Start(offset)).await?;
        let n = file.read(&mut buf).await?;
        if n == 0 {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(FOLLOW_POLL) => continue,
            }
        }
        offset += n as u64;
        partial.push_str(&String::from_utf8_lossy(&buf[..n]));
        while let Some(pos) = partial.find('\n') {
            let line = partial[..pos].to_string();
            partial.drain(..=pos);
            if tx.send(line).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Shells out to `journalctl -u gordon`, probing whether the unit lives in
/// the user scope first.
async fn journal_logs(
    tail: usize,
    follow: bool,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> Result<()> {
    let user_scope = Command::new("journalctl")
        .args(["--user", "-u", "gordon", "-n", "1", "--no-pager", "-o", "cat"])
        .output()
        .await
        .map(|out| out.status.success())
        .unwrap_or(false);

    let mut command = Command::new("journalctl");
    if user_scope {
        command.arg("--user");
    }
    command.args(["-u", "gordon", "--no-pager", "-o", "cat", "-n", &tail.to_string()]);
    if follow {
        command.arg("-f");
    }

    let mut child = command
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| Error::Unavailable(format!("journalctl: {e}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::internal("journalctl stdout missing"))?;

    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        match line {
            Some(line) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            None => break,
        }
    }
    let _ = child.kill().await;
    Ok(())
}
