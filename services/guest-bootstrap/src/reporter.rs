//! Progress reporting back to the plan server.
//!
//! Reporting is a side channel: output lines and the final status are
//! queued without blocking and written by a background task. A broken
//! channel is logged once and never fails the plan.

use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vmbuild_plan::protocol::{encode_line, GuestMessage, OutputStream, StatusReport};

/// Destination for command output. Implementations must not block.
pub trait OutputSink: Send + Sync {
    /// Record one chunk of output (normally a full line, newline included)
    /// produced by plan entry `entry`.
    fn append(&self, entry: usize, stream: OutputStream, data: &[u8]);
}

// =============================================================================
// Host Reporter
// =============================================================================

/// Forwards output and status messages to the host over the plan stream.
pub struct HostReporter {
    tx: mpsc::UnboundedSender<GuestMessage>,
    writer: JoinHandle<()>,
}

impl HostReporter {
    /// Start the writer task on `writer`.
    pub fn spawn<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(writer, rx));
        Self { tx, writer }
    }

    /// Queue the final run status.
    pub fn report_status(&self, status: StatusReport) {
        let _ = self.tx.send(GuestMessage::Status(status));
    }

    /// Close the queue and wait up to `drain_timeout` for queued messages to
    /// be written.
    pub async fn finish(self, drain_timeout: Duration) {
        let Self { tx, writer } = self;
        drop(tx);

        match tokio::time::timeout(drain_timeout, writer).await {
            Ok(Ok(())) => debug!("reporter drained"),
            Ok(Err(e)) => warn!(error = %e, "reporter task failed"),
            Err(_) => warn!(
                timeout_ms = drain_timeout.as_millis() as u64,
                "reporter did not drain in time, dropping remaining output"
            ),
        }
    }
}

impl OutputSink for HostReporter {
    fn append(&self, entry: usize, stream: OutputStream, data: &[u8]) {
        let msg = GuestMessage::Output {
            entry,
            stream,
            line: String::from_utf8_lossy(data).into_owned(),
        };
        // Receiver only goes away after finish(); nothing to do if it has.
        let _ = self.tx.send(msg);
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<GuestMessage>)
where
    W: AsyncWrite + Send + Unpin,
{
    let mut broken = false;

    while let Some(msg) = rx.recv().await {
        if broken {
            continue;
        }
        if let Err(e) = write_message(&mut writer, &msg).await {
            warn!(error = %e, message = msg.name(), "failed to report to host, dropping further reports");
            broken = true;
        }
    }

    if !broken {
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "failed to close report stream");
        }
    }
}

async fn write_message<W>(writer: &mut W, msg: &GuestMessage) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = encode_line(msg).map_err(std::io::Error::other)?;
    writer.write_all(&line).await?;
    writer.flush().await
}

// =============================================================================
// In-memory Sink
// =============================================================================

/// One captured output chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub entry: usize,
    pub stream: OutputStream,
    pub line: String,
}

/// Buffers output in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<OutputLine>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything captured so far, in arrival order.
    pub fn lines(&self) -> Vec<OutputLine> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Captured stdout lines only.
    pub fn stdout(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.line)
            .collect()
    }
}

impl OutputSink for MemorySink {
    fn append(&self, entry: usize, stream: OutputStream, data: &[u8]) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(OutputLine {
                entry,
                stream,
                line: String::from_utf8_lossy(data).into_owned(),
            });
        }
    }
}
