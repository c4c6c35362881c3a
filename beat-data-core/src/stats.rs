//! Cumulative I/O accounting for sources and sinks

use std::ops::AddAssign;
use std::time::{Duration, Instant};

/// Bytes moved and time spent moving them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStatistics {
    /// Number of bytes read or written
    pub bytes: u64,

    /// Time spent in I/O
    pub duration: Duration,
}

impl IoStatistics {
    /// Account for one operation
    pub fn record(&mut self, bytes: usize, elapsed: Duration) {
        self.bytes += bytes as u64;
        self.duration += elapsed;
    }

    /// Run `f`, adding its duration and the byte count it reports
    pub fn time<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<(T, usize), E>,
    {
        let start = Instant::now();
        let (value, bytes) = f()?;
        self.record(bytes, start.elapsed());
        Ok(value)
    }

    /// Time spent, in seconds
    pub fn seconds(&self) -> f64 {
        self.duration.as_secs_f64()
    }
}

impl AddAssign for IoStatistics {
    fn add_assign(&mut self, other: Self) {
        self.bytes += other.bytes;
        self.duration += other.duration;
    }
}

impl std::iter::Sum for IoStatistics {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |mut acc, s| {
            acc += s;
            acc
        })
    }
}
