use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Source of the stack's notion of 'now', as an offset from an arbitrary epoch. Stacks never read
///  the wall clock directly, so tests can drive time explicitly.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// A clock that only moves when it is told to. Several stacks can share one instance (behind an
///  `Arc`) so they observe the same time.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}
impl ManualClock {
    pub fn new() -> ManualClock {
        Default::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }

    pub fn set(&self, now: Duration) {
        self.nanos.store(now.as_nanos() as u64, Ordering::Release);
    }
}
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}

/// Time since creation, based on tokio's clock (which can be paused and advanced in tests)
pub struct SystemClock {
    start: tokio::time::Instant,
}
impl SystemClock {
    pub fn new() -> SystemClock {
        SystemClock {
            start: tokio::time::Instant::now(),
        }
    }
}
impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Deadline for the next redo (or for giving up), relative to a [Clock]'s time
#[derive(Debug, Clone, Copy)]
pub struct RedoTimer {
    started: Duration,
    duration: Duration,
}
impl RedoTimer {
    pub fn new(now: Duration, duration: Duration) -> RedoTimer {
        RedoTimer {
            started: now,
            duration,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn expired(&self, now: Duration) -> bool {
        now >= self.started + self.duration
    }

    pub fn restart(&mut self, now: Duration, duration: Duration) {
        self.started = now;
        self.duration = duration;
    }
}
