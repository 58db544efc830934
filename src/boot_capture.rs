//! Early log capture.
//!
//! Logging is configured before sealing, but nothing it emits during boot
//! reaches stderr until the banner has been printed. The fmt layer writes
//! through [`BootCapture`], which buffers until [`BootCapture::release`].

use crate::errors::{GuardResult, SafeLock};
use crate::namespace::Guarded;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "DEPGATE_LOG";

/// The buffer every log line passes through. This is the sealed sink.
#[derive(Debug)]
pub struct CaptureSink {
    buffer: Mutex<Vec<u8>>,
    capturing: AtomicBool,
}

impl Guarded for CaptureSink {
    fn source(&self) -> &'static str {
        include_str!("boot_capture.rs")
    }
}

#[derive(Debug, Clone)]
pub struct BootCapture {
    sink: Arc<CaptureSink>,
}

impl BootCapture {
    /// With `capture` false every line passes straight through.
    pub fn new(capture: bool) -> Self {
        Self {
            sink: Arc::new(CaptureSink {
                buffer: Mutex::new(Vec::new()),
                capturing: AtomicBool::new(capture),
            }),
        }
    }

    pub fn sink(&self) -> Arc<CaptureSink> {
        Arc::clone(&self.sink)
    }

    pub fn is_capturing(&self) -> bool {
        self.sink.capturing.load(Ordering::Acquire)
    }

    pub fn buffered_len(&self) -> GuardResult<usize> {
        Ok(self.sink.buffer.safe_lock()?.len())
    }

    /// Stop capturing and flush the buffer to stderr. Returns the number of
    /// bytes flushed.
    pub fn release(&self) -> GuardResult<usize> {
        self.release_into(&mut io::stderr())
    }

    pub fn release_into(&self, out: &mut dyn Write) -> GuardResult<usize> {
        let pending = {
            let mut buffer = self.sink.buffer.safe_lock()?;
            self.sink.capturing.store(false, Ordering::Release);
            std::mem::take(&mut *buffer)
        };
        out.write_all(&pending)?;
        out.flush()?;
        Ok(pending.len())
    }
}

pub struct CaptureWriter {
    sink: Arc<CaptureSink>,
}

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        {
            let mut buffer = self
                .sink
                .buffer
                .lock()
                .map_err(|_| io::Error::other("capture buffer poisoned"))?;
            if self.sink.capturing.load(Ordering::Acquire) {
                buffer.extend_from_slice(buf);
                return Ok(buf.len());
            }
        }
        io::stderr().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

impl<'a> MakeWriter<'a> for BootCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter {
            sink: Arc::clone(&self.sink),
        }
    }
}

/// Install the global subscriber writing through `capture`. `DEPGATE_LOG`
/// wins over `level`; debug mode forces `debug`. Returns false when a
/// subscriber was already installed.
pub fn init_logging(level: &str, debug_mode: bool, capture: &BootCapture) -> bool {
    let fallback = if debug_mode { "debug" } else { level };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(capture.clone()),
        )
        .try_init()
        .is_ok()
}
