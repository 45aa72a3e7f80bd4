use std::time::Instant;

use plenum_wire::{ByteReader, ByteWriter, Wire, WireErr};

/// Wall-clock load measurement in seconds.
///
/// Every stored load in the runtime is seconds. Milliseconds exist only as
/// the load-sampler's bin key, produced by [`TimeSec::as_bin_ms`]; there is
/// no other unit conversion anywhere.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct TimeSec(pub f64);

impl TimeSec {
    pub const ZERO: TimeSec = TimeSec(0.0);

    pub fn seconds(self) -> f64 {
        self.0
    }

    /// Milliseconds, for log-scale binning only.
    pub fn as_bin_ms(self) -> f64 {
        self.0 * 1000.0
    }
}

impl std::ops::Add for TimeSec {
    type Output = TimeSec;

    fn add(self, rhs: TimeSec) -> TimeSec {
        TimeSec(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for TimeSec {
    fn add_assign(&mut self, rhs: TimeSec) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for TimeSec {
    type Output = TimeSec;

    fn sub(self, rhs: TimeSec) -> TimeSec {
        TimeSec(self.0 - rhs.0)
    }
}

impl Wire for TimeSec {
    fn ser(&self, writer: &mut ByteWriter) {
        self.0.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(TimeSec(f64::de(reader)?))
    }
}

/// Monotonic stopwatch for bracketing handler execution.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> TimeSec {
        TimeSec(self.started.elapsed().as_secs_f64())
    }
}
