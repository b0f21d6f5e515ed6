use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// A monotonic time source that polling loops sleep on.
///
/// Drivers take this as a trait object so that hosted tests can substitute a clock whose
/// `sleep` advances a simulated device instead of real time.
pub trait Clock {
    /// Time elapsed since an arbitrary, fixed epoch.
    fn now(&self) -> Duration;
    /// Gives up the CPU for roughly `duration`.
    fn sleep(&self, duration: Duration);
}

/// The wall clock.
pub struct StdClock {
    epoch: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            // Sleeps are only evaluated on timer ticks, which is far coarser than most register
            // handshakes need, so a zero interval yields instead.
            thread::yield_now();
        } else {
            thread::sleep(duration);
        }
    }
}

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("timed out after {0:?}")]
pub struct TimedOut(pub Duration);

pub struct Timeout<'a> {
    clock: &'a dyn Clock,
    start: Duration,
    duration: Duration,
}

impl<'a> Timeout<'a> {
    #[inline]
    pub fn new(clock: &'a dyn Clock, duration: Duration) -> Self {
        Self {
            start: clock.now(),
            clock,
            duration,
        }
    }

    #[inline]
    pub fn from_micros(clock: &'a dyn Clock, micros: u64) -> Self {
        Self::new(clock, Duration::from_micros(micros))
    }

    #[inline]
    pub fn from_millis(clock: &'a dyn Clock, millis: u64) -> Self {
        Self::new(clock, Duration::from_millis(millis))
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_sub(self.start)
    }

    /// Sleeps for `interval` if the budget is not spent yet, otherwise fails.
    #[inline]
    pub fn run(&self, interval: Duration) -> Result<(), TimedOut> {
        if self.elapsed() < self.duration {
            self.clock.sleep(interval);
            Ok(())
        } else {
            Err(TimedOut(self.duration))
        }
    }
}

/// Calls `f` every `interval` until it yields a value, or fails once `timeout` has elapsed.
///
/// `f` always runs at least once, and it runs once more after the last sleep, so a condition
/// that becomes true right at the deadline is still observed.
pub fn poll_until<T, F>(
    clock: &dyn Clock,
    interval: Duration,
    timeout: Duration,
    mut f: F,
) -> Result<T, TimedOut>
where
    F: FnMut() -> Option<T>,
{
    let timeout = Timeout::new(clock, timeout);
    loop {
        if let Some(value) = f() {
            return Ok(value);
        }
        timeout.run(interval)?;
    }
}
