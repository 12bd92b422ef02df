use std::sync::atomic::{AtomicU64, Ordering};

/// Liveness hook for an external hang watchdog. Called once per fully processed command so the
/// watchdog can tell a hung decoder from an idle one.
pub trait Watchdog: Send + Sync {
    fn check_armed(&self);
}

#[derive(Debug, Default)]
pub struct NullWatchdog;

impl Watchdog for NullWatchdog {
    fn check_armed(&self) {}
}

/// Counts liveness pings. A monitor thread compares successive readings.
#[derive(Debug, Default)]
pub struct CountingWatchdog {
    checks: AtomicU64,
}

impl CountingWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }
}

impl Watchdog for CountingWatchdog {
    fn check_armed(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);
    }
}
