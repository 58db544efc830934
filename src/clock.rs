//! Monotonic process clock.

use chrono::{Local, Utc};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Rendering for [`Clock::timestamp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampFormat {
    /// Seconds since the clock's epoch, six decimals.
    #[default]
    Monotonic,
    IsoUtc,
    IsoLocal,
}

/// Monotonic time source anchored at a process-local epoch.
///
/// Unaffected by wall-clock adjustments; only [`TimestampFormat::IsoUtc`] and
/// [`TimestampFormat::IsoLocal`] read the wall clock.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    /// Clock sharing the process epoch, fixed the first time any caller asks.
    pub fn process() -> Self {
        Self {
            epoch: *PROCESS_EPOCH.get_or_init(Instant::now),
        }
    }

    /// Clock whose epoch is the moment of the call.
    pub fn starting_now() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Monotonic counter: elapsed time since the epoch.
    pub fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    pub fn since_start(&self) -> f64 {
        self.now().as_secs_f64()
    }

    pub fn timestamp(&self, format: TimestampFormat) -> String {
        match format {
            TimestampFormat::Monotonic => format!("{:.6}", self.since_start()),
            TimestampFormat::IsoUtc => Utc::now().to_rfc3339(),
            TimestampFormat::IsoLocal => Local::now().to_rfc3339(),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::process()
    }
}
