//! Request pacing for the embedding service

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Time source for pacing and backoff, injectable so tests do not sleep
#[async_trait]
pub trait Clock: Send + Sync + Debug {
    /// Monotonic time since an arbitrary origin
    fn now(&self) -> Duration;

    async fn sleep(&self, duration: Duration);
}

/// Clock backed by the tokio timer
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that only moves when told to; `sleep` advances it instantly and
/// records the requested duration
#[derive(Debug, Default)]
pub struct ManualClock {
    now: StdMutex<Duration>,
    sleeps: StdMutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    /// Every sleep requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.lock().map(|n| *n).unwrap_or_default()
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        self.advance(duration);
    }
}

/// Serializes requests and keeps at least `interval` between the end of one
/// request and the start of the next.
///
/// Shared by every caller of one adapter, so concurrent syncs and retrievals
/// through the same adapter are paced together.
#[derive(Debug)]
pub struct IntervalGate {
    interval: Duration,
    clock: Arc<dyn Clock>,
    /// Clock time at which the last permit was released
    last_release: Mutex<Option<Duration>>,
}

impl IntervalGate {
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval,
            clock,
            last_release: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the gate; the request runs while the permit is held
    pub async fn acquire(&self) -> GatePermit<'_> {
        let guard = self.last_release.lock().await;
        if let Some(last) = *guard {
            let elapsed = self.clock.now().saturating_sub(last);
            if elapsed < self.interval {
                let wait = self.interval - elapsed;
                tracing::trace!("Rate limiter waiting {:?}", wait);
                self.clock.sleep(wait).await;
            }
        }
        GatePermit {
            guard,
            clock: self.clock.as_ref(),
        }
    }
}

/// Exclusive right to send one request; dropping it records the release time
pub struct GatePermit<'a> {
    guard: MutexGuard<'a, Option<Duration>>,
    clock: &'a dyn Clock,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        *self.guard = Some(self.clock.now());
    }
}
