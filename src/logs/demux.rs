use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Which half of the multiplexed stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub source: LogSource,
    pub line: String,
}

/// Reads the daemon's multiplexed log framing: an 8-byte header
/// `[stream(1) pad(3) size(4 BE)]` followed by `size` payload bytes.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> FrameReader<R> {
        FrameReader { reader }
    }

    /// The next frame, or `None` at a clean end of stream. EOF inside a
    /// frame is an error.
    pub async fn next_frame(&mut self) -> Result<Option<(LogSource, Bytes)>> {
        let mut header = [0u8; 8];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::internal("log stream ended mid-header"));
            }
            filled += n;
        }

        let source = match header[0] {
            2 => LogSource::Stderr,
            _ => LogSource::Stdout,
        };
        let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let mut payload = vec![0u8; size];
        self.reader
            .read_exact(&mut payload)
            .await
            .map_err(|_| Error::internal("log stream ended mid-frame"))?;
        Ok(Some((source, Bytes::from(payload))))
    }
}

/// Turns a multiplexed stream into lines on a bounded channel. Frames are
/// buffered per source and split on `\n`; a trailing fragment is flushed at
/// end of stream. The task exits on cancellation, stream end, or a dropped
/// receiver.
pub fn spawn_demux(
    reader: Box<dyn AsyncRead + Send + Unpin>,
    tx: mpsc::Sender<LogLine>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut frames = FrameReader::new(reader);
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.next_frame() => frame,
            };
            match frame {
                Ok(Some((source, payload))) => {
                    let buf = match source {
                        LogSource::Stdout => &mut stdout_buf,
                        LogSource::Stderr => &mut stderr_buf,
                    };
                    buf.extend_from_slice(&payload);
                    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = buf.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                        if tx.send(LogLine { source, line }).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "log stream terminated");
                    break;
                }
            }
        }

        for (source, buf) in [(LogSource::Stdout, stdout_buf), (LogSource::Stderr, stderr_buf)] {
            if !buf.is_empty() {
                let line = String::from_utf8_lossy(&buf).into_owned();
                let _ = tx.send(LogLine { source, line }).await;
            }
        }
    })
}
