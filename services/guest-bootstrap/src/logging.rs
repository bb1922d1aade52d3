//! Logging initialization for the bootstrap agent.
//!
//! JSON records go to a size-capped boot log the host can collect after the
//! run; a compact copy goes to stderr (the serial console).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Maximum boot log size (1 MiB).
pub const MAX_LOG_BYTES: usize = 1024 * 1024;

/// Boot log writer that stops writing at `max_bytes`.
struct BootLogWriter {
    file: File,
    bytes_written: usize,
    max_bytes: usize,
}

impl BootLogWriter {
    fn new(path: &Path, max_bytes: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file,
            bytes_written: 0,
            max_bytes,
        })
    }
}

impl Write for BootLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.bytes_written >= self.max_bytes {
            return Ok(buf.len());
        }

        let remaining = self.max_bytes - self.bytes_written;
        let to_write = buf.len().min(remaining);
        let written = self.file.write(&buf[..to_write])?;
        self.bytes_written += written;
        // Report the full buffer so the subscriber never retries.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

struct SharedWriter(Mutex<BootLogWriter>);

impl Write for &SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut writer) => writer.write(buf),
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.lock() {
            Ok(mut writer) => writer.flush(),
            Err(_) => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &'static SharedWriter {
    type Writer = &'static SharedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize logging to the boot log at `log_path` and stderr.
///
/// If the boot log cannot be opened, logging continues on stderr only and
/// the open error is returned so the caller can report it.
pub fn init(log_path: &Path) -> io::Result<()> {
    let writer = match BootLogWriter::new(log_path, MAX_LOG_BYTES) {
        Ok(writer) => writer,
        Err(e) => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_writer(io::stderr)
                        .with_filter(env_filter()),
                )
                .init();
            return Err(e);
        }
    };

    // The agent logs for its whole lifetime.
    let shared: &'static SharedWriter = Box::leak(Box::new(SharedWriter(Mutex::new(writer))));

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(shared)
        .with_filter(env_filter());

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(io::stderr)
        .with_filter(env_filter());

    tracing_subscriber::registry()
        .with(json_layer)
        .with(stderr_layer)
        .init();

    Ok(())
}
