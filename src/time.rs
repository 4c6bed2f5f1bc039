//! Time abstraction for testable timing operations.
//!
//! Production code uses [`RealClock`]; tests inject [`TestClock`] to drive
//! timeout reclassification and throttle sleeps deterministically.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Clock abstraction for timestamps and sleeping.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current system time.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the specified duration.
    ///
    /// Maps to `tokio::time::sleep` in production; test clocks may advance
    /// virtual time and return immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Returns the current time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::from(self.now_system())
    }
}

/// Real clock backed by system time and tokio's sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test clock with manually controlled time.
///
/// `sleep` advances the clock immediately and yields, so time-dependent
/// logic runs deterministically without wall-clock waits.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// System time as nanoseconds since `UNIX_EPOCH`.
    system_ns: Arc<AtomicU64>,
}

impl TestClock {
    /// Creates a test clock starting at the current time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn with_start_time(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            system_ns: Arc::new(AtomicU64::new(
                u64::try_from(since_epoch.as_nanos().min(u128::from(u64::MAX))).unwrap_or(0),
            )),
        }
    }

    /// Advances the clock by the specified duration.
    pub fn advance(&self, duration: Duration) {
        let duration_ns = u64::try_from(duration.as_nanos().min(u128::from(u64::MAX))).unwrap_or(0);
        self.system_ns.fetch_add(duration_ns, Ordering::AcqRel);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.system_ns.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
