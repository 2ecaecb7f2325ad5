//! Monotonic time abstraction for deterministic testing
//!
//! The breaker never sleeps on wall time. It reads `now()` to decide whether
//! the cooldown has elapsed and hands out [`RetryTimer`]s that fire when a
//! denied caller may try again. Production code uses [`SystemClock`]; tests
//! inject a [`MockClock`] and drive time explicitly with
//! [`advance`](MockClock::advance), which fires every pending timer whose
//! deadline has been reached.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

/// Trait for time operations to enable deterministic testing
///
/// Implementations must be cheap to call from the admission hot path:
/// `now()` is invoked on every `Open`-state admission check.
pub trait Clock: Send + Sync + 'static {
    /// Get the current instant (monotonic time)
    fn now(&self) -> Instant;

    /// Create a one-shot timer that fires after `after` has elapsed
    fn timer(&self, after: Duration) -> RetryTimer;
}

/// Real monotonic clock for production use
///
/// Timers are backed by `tokio::time::sleep` and therefore must be awaited
/// inside a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn timer(&self, after: Duration) -> RetryTimer {
        RetryTimer {
            deadline: Instant::now() + after,
            fire: TimerFire::Sleep(Box::pin(tokio::time::sleep(after))),
        }
    }
}

/// A one-shot timer returned to callers in place of running their function
///
/// Fires (resolves) when the breaker may next admit a call. Dropping the
/// timer cancels it; no background resource outlives the value.
pub struct RetryTimer {
    deadline: Instant,
    fire: TimerFire,
}

enum TimerFire {
    Sleep(Pin<Box<tokio::time::Sleep>>),
    Channel(oneshot::Receiver<()>),
    Ready,
}

impl RetryTimer {
    /// The instant at which this timer fires
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl fmt::Debug for RetryTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryTimer").field("deadline", &self.deadline).finish()
    }
}

impl Future for RetryTimer {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.fire {
            TimerFire::Sleep(sleep) => sleep.as_mut().poll(cx),
            // A dropped sender (clock released mid-wait) counts as fired so
            // that no caller hangs forever on an unadvanceable clock.
            TimerFire::Channel(rx) => Pin::new(rx).poll(cx).map(|_| ()),
            TimerFire::Ready => Poll::Ready(()),
        }
    }
}

/// Deterministic clock for tests
///
/// Time stands still until [`advance`](MockClock::advance) is called. Cloned
/// handles share the same time source, so a test can hold one handle while
/// the breaker owns another.
#[derive(Clone)]
pub struct MockClock {
    start: Instant,
    inner: Arc<Mutex<MockClockInner>>,
}

struct MockClockInner {
    elapsed: Duration,
    pending: Vec<PendingTimer>,
}

struct PendingTimer {
    due: Duration,
    tx: oneshot::Sender<()>,
}

impl MockClock {
    /// Create a new mock clock starting at the current instant
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            inner: Arc::new(Mutex::new(MockClockInner {
                elapsed: Duration::ZERO,
                pending: Vec::new(),
            })),
        }
    }

    /// Advance the clock, firing every timer whose deadline is reached
    pub fn advance(&self, duration: Duration) {
        let mut fired = Vec::new();
        if let Ok(mut inner) = self.inner.lock() {
            inner.elapsed += duration;
            let elapsed = inner.elapsed;
            let mut i = 0;
            while i < inner.pending.len() {
                if inner.pending[i].due <= elapsed {
                    fired.push(inner.pending.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for timer in fired {
            // The receiver may already be gone; firing is best effort.
            let _ = timer.tx.send(());
        }
    }

    /// Advance the clock by milliseconds (convenience method)
    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    /// Get the total time this clock has been advanced
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().map(|inner| inner.elapsed).unwrap_or(Duration::ZERO)
    }

    /// Number of timers registered and not yet fired
    pub fn pending_timers(&self) -> usize {
        self.inner.lock().map(|inner| inner.pending.len()).unwrap_or(0)
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockClock").field("elapsed", &self.elapsed()).finish()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    fn timer(&self, after: Duration) -> RetryTimer {
        let Ok(mut inner) = self.inner.lock() else {
            // A poisoned clock cannot be advanced; fire immediately rather
            // than strand the caller.
            return RetryTimer { deadline: self.start + after, fire: TimerFire::Ready };
        };
        let deadline = self.start + inner.elapsed + after;
        if after.is_zero() {
            return RetryTimer { deadline, fire: TimerFire::Ready };
        }
        let (tx, rx) = oneshot::channel();
        let due = inner.elapsed + after;
        inner.pending.push(PendingTimer { due, tx });
        RetryTimer { deadline, fire: TimerFire::Channel(rx) }
    }
}
