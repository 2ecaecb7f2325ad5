//! Lock-free circuit breaker core
//!
//! The breaker gates calls to a potentially unhealthy dependency through
//! three states: Closed (all calls admitted), Open (all calls refused with a
//! retry timer) and HalfOpen (a bounded number of probe admissions). All
//! mutable state lives in word-sized atomics plus one bounded semaphore;
//! there are no mutexes on the admission path. The Open to HalfOpen
//! transition is lazy: the first admission attempt past the cooldown
//! deadline performs a CAS, so no background task is needed for recovery.
//!
//! A breaker must be created inside a tokio runtime: construction spawns the
//! window janitor task, which periodically zeroes the failure window while
//! the circuit is Closed. [`CircuitBreaker::close`] stops the janitor and is
//! idempotent; dropping the breaker stops it as well.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, RetryTimer, SystemClock};
use crate::config::{CircuitBreakerConfig, ConfigResult};

/// Upper bound (exclusive) of the randomized backoff handed to callers that
/// lose the probe race in HalfOpen. Keeps denied callers from busy-looping
/// in lockstep.
const PROBE_BACKOFF_MS: u64 = 90;

//==============================================================================
// States
//==============================================================================

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; all calls admitted
    Closed,
    /// All calls refused; a retry timer is returned
    Open,
    /// Bounded admissions used to probe recovery
    HalfOpen,
}

impl CircuitState {
    const CLOSED: u64 = 0;
    const OPEN: u64 = 1;
    const HALF_OPEN: u64 = 2;

    fn as_raw(self) -> u64 {
        match self {
            CircuitState::Closed => Self::CLOSED,
            CircuitState::Open => Self::OPEN,
            CircuitState::HalfOpen => Self::HALF_OPEN,
        }
    }

    fn from_raw(raw: u64) -> Self {
        match raw {
            Self::CLOSED => CircuitState::Closed,
            Self::OPEN => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Outcome of a gated execution
///
/// Exactly one of the two arms applies: either the wrapped function ran
/// exactly once and its verbatim result is returned, or admission was
/// refused, the function did not run, and the caller receives a timer that
/// fires when it may retry.
#[derive(Debug)]
pub enum Execution<T, E> {
    /// The function was admitted and ran exactly once
    Completed(Result<T, E>),
    /// Admission was refused; wait on the timer before retrying
    Denied(RetryTimer),
}

impl<T, E> Execution<T, E> {
    /// True when admission was refused
    pub fn is_denied(&self) -> bool {
        matches!(self, Execution::Denied(_))
    }

    /// The function result, if the call was admitted
    pub fn completed(self) -> Option<Result<T, E>> {
        match self {
            Execution::Completed(result) => Some(result),
            Execution::Denied(_) => None,
        }
    }

    /// The retry timer, if admission was refused
    pub fn denied(self) -> Option<RetryTimer> {
        match self {
            Execution::Completed(_) => None,
            Execution::Denied(retry) => Some(retry),
        }
    }
}

/// Point-in-time view of the breaker counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
}

/// Result of the internal admission query
enum Admission {
    Admitted { probe: Option<OwnedSemaphorePermit> },
    Denied { retry: RetryTimer },
}

//==============================================================================
// Breaker
//==============================================================================

/// Shared core: everything the admission path and the janitor touch.
///
/// The hot atomics are cache-line padded so concurrent callers hammering
/// `state` do not false-share with the counters or the deadline.
struct Core<C: Clock> {
    config: CircuitBreakerConfig,
    state: CachePadded<AtomicU64>,
    failure_count: CachePadded<AtomicU64>,
    success_count: CachePadded<AtomicU64>,
    /// Nanoseconds since `origin` at which Open may become HalfOpen
    half_open_at: CachePadded<AtomicU64>,
    probe_sem: Arc<Semaphore>,
    clock: C,
    origin: Instant,
}

impl<C: Clock> Core<C> {
    fn now_nanos(&self) -> u64 {
        self.clock.now().saturating_duration_since(self.origin).as_nanos() as u64
    }

    fn state(&self) -> CircuitState {
        CircuitState::from_raw(self.state.load(Ordering::Acquire))
    }
}

/// A single logical gate in front of one external dependency
///
/// All methods take `&self`; share one breaker across tasks with `Arc`. The
/// admission decision, the state transitions and the probe budget are safe
/// under arbitrary concurrent callers.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    core: Arc<Core<C>>,
    janitor: CancellationToken,
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker with the given configuration and the system clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a breaker with the default configuration
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default()).expect("default config should be valid")
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with a custom clock (useful for testing)
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;

        let origin = clock.now();
        let core = Arc::new(Core {
            state: CachePadded::new(AtomicU64::new(CircuitState::Closed.as_raw())),
            failure_count: CachePadded::new(AtomicU64::new(0)),
            success_count: CachePadded::new(AtomicU64::new(0)),
            half_open_at: CachePadded::new(AtomicU64::new(0)),
            probe_sem: Arc::new(Semaphore::new(config.maximum_probes)),
            clock,
            origin,
            config,
        });

        let janitor = CancellationToken::new();
        spawn_janitor(Arc::downgrade(&core), janitor.clone());

        Ok(Self { core, janitor })
    }

    /// Execute `op` if the breaker admits the call
    ///
    /// On admission, `op` runs exactly once and its result is returned
    /// verbatim inside [`Execution::Completed`]; the outcome is counted
    /// toward the state machine. On refusal, `op` is not invoked and
    /// [`Execution::Denied`] carries a timer that fires when the caller may
    /// retry.
    ///
    /// The breaker does not cancel an in-flight `op`; dropping the returned
    /// future is the caller's cancellation mechanism, and the probe budget
    /// is released even then.
    #[instrument(skip(self, op), fields(state = %self.state()))]
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Execution<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let probe = match self.allow() {
            Admission::Admitted { probe } => probe,
            Admission::Denied { retry } => {
                debug!("admission refused, retry at {:?}", retry.deadline());
                return Execution::Denied(retry);
            }
        };

        let result = op().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }

        // Held until after the outcome is recorded so a competing caller
        // cannot grab the slot between a probe failure and the Open store.
        drop(probe);

        Execution::Completed(result)
    }

    /// Current state of the circuit
    pub fn state(&self) -> CircuitState {
        self.core.state()
    }

    /// Fast check that the circuit is not refusing all calls
    pub fn is_available(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Counter snapshot for observation; plain atomic loads
    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.core.state(),
            failure_count: self.core.failure_count.load(Ordering::Acquire),
            success_count: self.core.success_count.load(Ordering::Acquire),
        }
    }

    /// Stop the window janitor. Idempotent; in-flight calls are unaffected.
    pub fn close(&self) {
        self.janitor.cancel();
    }

    //--------------------------------------------------------------------------
    // Admission decision
    //--------------------------------------------------------------------------

    fn allow(&self) -> Admission {
        loop {
            match self.core.state() {
                CircuitState::Closed => return Admission::Admitted { probe: None },
                CircuitState::HalfOpen => return self.try_probe(),
                CircuitState::Open => {
                    let due = self.core.half_open_at.load(Ordering::Acquire);
                    let now = self.core.now_nanos();
                    if now < due {
                        return Admission::Denied {
                            retry: self.core.clock.timer(Duration::from_nanos(due - now)),
                        };
                    }
                    if self
                        .core
                        .state
                        .compare_exchange(
                            CircuitState::OPEN,
                            CircuitState::HALF_OPEN,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        debug!("cooldown elapsed, circuit half-open");
                        return self.try_probe();
                    }
                    // Another caller moved the state first; re-evaluate.
                }
            }
        }
    }

    fn try_probe(&self) -> Admission {
        match Arc::clone(&self.core.probe_sem).try_acquire_owned() {
            Ok(permit) => Admission::Admitted { probe: Some(permit) },
            Err(_) => {
                let backoff =
                    Duration::from_millis(rand::thread_rng().gen_range(0..PROBE_BACKOFF_MS));
                Admission::Denied { retry: self.core.clock.timer(backoff) }
            }
        }
    }

    //--------------------------------------------------------------------------
    // Outcome recording
    //--------------------------------------------------------------------------

    fn record_failure(&self) {
        let state = self.core.state();
        let failures = self.core.failure_count.fetch_add(1, Ordering::Relaxed) + 1;

        match state {
            CircuitState::Closed if failures >= self.core.config.failure_threshold => {
                warn!("circuit opened after {} failures", failures);
                self.transition(CircuitState::Open);
            }
            CircuitState::HalfOpen => {
                warn!("circuit reopened by a failed probe");
                self.transition(CircuitState::Open);
            }
            _ => {}
        }
    }

    fn record_success(&self) {
        let state = self.core.state();
        let successes = self.core.success_count.fetch_add(1, Ordering::Relaxed) + 1;

        if state == CircuitState::HalfOpen && successes >= self.core.config.success_to_close {
            info!("circuit closed after {} successful probes", successes);
            self.transition(CircuitState::Closed);
        }
    }

    /// Store the new state, zero both counters, and stamp the cooldown
    /// deadline when entering Open. The store is idempotent under races:
    /// several callers crossing the threshold may all transition to the same
    /// state, and post-reset counts from concurrent increments are small,
    /// acceptable and self-correcting within the window.
    fn transition(&self, next: CircuitState) {
        self.core.state.store(next.as_raw(), Ordering::Release);
        self.core.failure_count.store(0, Ordering::Release);
        self.core.success_count.store(0, Ordering::Release);
        if next == CircuitState::Open {
            let cooldown = self.core.config.cooldown.as_nanos() as u64;
            self.core.half_open_at.store(self.core.now_nanos() + cooldown, Ordering::Release);
        }
    }
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.core.config)
            .field("state", &self.state())
            .field("failure_count", &self.core.failure_count.load(Ordering::Acquire))
            .field("success_count", &self.core.success_count.load(Ordering::Acquire))
            .finish()
    }
}

impl<C: Clock> Drop for CircuitBreaker<C> {
    fn drop(&mut self) {
        self.janitor.cancel();
    }
}

//==============================================================================
// Window janitor
//==============================================================================

/// Periodically zero the in-window counters while the circuit is Closed.
///
/// The task holds only a weak reference to the core, so it cannot keep a
/// dropped breaker alive; it exits on cancellation or when the breaker is
/// gone.
fn spawn_janitor<C: Clock>(core: Weak<Core<C>>, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let timer = match core.upgrade() {
                Some(core) => core.clock.timer(core.config.window_size),
                None => return,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("window janitor stopped");
                    return;
                }
                _ = timer => {}
            }

            let Some(core) = core.upgrade() else { return };
            if core.state() == CircuitState::Closed {
                core.failure_count.store(0, Ordering::Release);
                core.success_count.store(0, Ordering::Release);
                debug!("window elapsed, counters reset");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::clock::MockClock;

    fn breaker_with(
        clock: &MockClock,
        build: impl FnOnce(crate::config::CircuitBreakerConfigBuilder) -> crate::config::CircuitBreakerConfigBuilder,
    ) -> CircuitBreaker<MockClock> {
        let config = build(CircuitBreakerConfig::builder()).build().expect("valid config");
        CircuitBreaker::with_clock(config, clock.clone()).expect("valid breaker")
    }

    /// Let spawned tasks (the janitor) run far enough to register timers.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn fail(breaker: &CircuitBreaker<MockClock>) {
        let outcome = breaker.execute(|| async { Err::<(), _>("boom") }).await;
        assert!(!outcome.is_denied(), "failure call should have been admitted");
    }

    async fn succeed(breaker: &CircuitBreaker<MockClock>) {
        let outcome = breaker.execute(|| async { Ok::<_, &str>(()) }).await;
        assert!(!outcome.is_denied(), "success call should have been admitted");
    }

    #[tokio::test]
    async fn starts_closed_and_admits() {
        let clock = MockClock::new();
        let breaker = breaker_with(&clock, |b| b);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.is_available());
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn stays_closed_below_threshold() {
        let clock = MockClock::new();
        let breaker = breaker_with(&clock, |b| b.failure_threshold(3));

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 2);
    }

    #[tokio::test]
    async fn opens_at_failure_threshold() {
        let clock = MockClock::new();
        let breaker = breaker_with(&clock, |b| b.failure_threshold(3));

        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_available());
    }

    #[tokio::test]
    async fn counters_zeroed_on_open() {
        let clock = MockClock::new();
        let breaker = breaker_with(&clock, |b| b.failure_threshold(2));

        fail(&breaker).await;
        fail(&breaker).await;
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
    }

    #[tokio::test]
    async fn open_refuses_without_running_op() {
        let clock = MockClock::new();
        let breaker = breaker_with(&clock, |b| b.failure_threshold(1));
        fail(&breaker).await;

        let calls = AtomicU32::new(0);
        let outcome = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;

        assert!(outcome.is_denied());
        assert_eq!(calls.load(Ordering::SeqCst), 0, "op must not run when refused");
    }

    #[tokio::test]
    async fn denied_timer_deadline_is_the_cooldown_remainder() {
        let clock = MockClock::new();
        let breaker =
            breaker_with(&clock, |b| b.failure_threshold(1).cooldown(Duration::from_secs(60)));
        fail(&breaker).await;

        clock.advance(Duration::from_secs(20));
        let retry = breaker
            .execute(|| async { Ok::<_, &str>(()) })
            .await
            .denied()
            .expect("circuit must refuse during cooldown");
        assert_eq!(retry.deadline().duration_since(clock.now()), Duration::from_secs(40));
    }

    #[tokio::test]
    async fn half_open_after_cooldown_then_closes() {
        let clock = MockClock::new();
        let breaker = breaker_with(&clock, |b| {
            b.failure_threshold(1).cooldown(Duration::from_secs(60)).success_to_close(2)
        });
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(61));

        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().success_count, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_and_restamps_deadline() {
        let clock = MockClock::new();
        let breaker =
            breaker_with(&clock, |b| b.failure_threshold(1).cooldown(Duration::from_secs(60)));
        fail(&breaker).await;
        clock.advance(Duration::from_secs(61));

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let retry = breaker
            .execute(|| async { Ok::<_, &str>(()) })
            .await
            .denied()
            .expect("fresh cooldown must refuse");
        assert_eq!(retry.deadline().duration_since(clock.now()), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn sequential_probes_reuse_the_budget() {
        let clock = MockClock::new();
        let breaker = breaker_with(&clock, |b| {
            b.failure_threshold(1).cooldown(Duration::from_secs(10)).success_to_close(5)
        });
        fail(&breaker).await;
        clock.advance(Duration::from_secs(11));

        // maximum_probes is 1; each probe releases its slot on completion.
        for n in 1..=4u64 {
            succeed(&breaker).await;
            assert_eq!(breaker.state(), CircuitState::HalfOpen, "after probe {}", n);
        }
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn exhausted_probe_budget_returns_short_backoff() {
        let clock = MockClock::new();
        let breaker =
            breaker_with(&clock, |b| b.failure_threshold(1).cooldown(Duration::from_secs(10)));
        fail(&breaker).await;
        clock.advance(Duration::from_secs(11));

        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let breaker = Arc::new(breaker);
        let held = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .execute(|| async {
                        let _ = gate_rx.await;
                        Ok::<_, &str>(())
                    })
                    .await
            })
        };

        // Wait until the probe is actually in flight.
        while breaker.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }

        let retry = breaker
            .execute(|| async { Ok::<_, &str>(()) })
            .await
            .denied()
            .expect("budget of one is already held");
        let backoff = retry.deadline().duration_since(clock.now());
        assert!(backoff < Duration::from_millis(PROBE_BACKOFF_MS), "backoff was {:?}", backoff);

        let _ = gate_tx.send(());
        held.await.expect("probe task").completed().expect("probe admitted").expect("probe ok");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let clock = MockClock::new();
        let breaker = breaker_with(&clock, |b| b);
        breaker.close();
        breaker.close();
        // The breaker still gates calls after the janitor is gone.
        succeed(&breaker).await;
    }

    #[tokio::test]
    async fn janitor_resets_closed_window() {
        let clock = MockClock::new();
        let breaker =
            breaker_with(&clock, |b| b.failure_threshold(3).window_size(Duration::from_secs(1)));
        settle().await;

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.snapshot().failure_count, 2);

        clock.advance(Duration::from_secs(2));
        let mut reset = false;
        for _ in 0..100 {
            if breaker.snapshot().failure_count == 0 {
                reset = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(reset, "janitor never zeroed the window");

        // The window restarted: one more failure must not trip the circuit.
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn janitor_leaves_open_state_alone() {
        let clock = MockClock::new();
        let breaker = breaker_with(&clock, |b| {
            b.failure_threshold(1)
                .window_size(Duration::from_secs(1))
                .cooldown(Duration::from_secs(600))
        });
        settle().await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(2));
        settle().await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn janitor_stops_after_close() {
        let clock = MockClock::new();
        let breaker =
            breaker_with(&clock, |b| b.failure_threshold(5).window_size(Duration::from_secs(1)));
        settle().await;

        fail(&breaker).await;
        breaker.close();

        // Give the cancelled janitor a chance to run if it were still alive.
        clock.advance(Duration::from_secs(5));
        settle().await;
        assert_eq!(breaker.snapshot().failure_count, 1, "closed janitor must not reset");
    }

    #[tokio::test]
    async fn success_in_closed_does_not_clear_failures() {
        let clock = MockClock::new();
        let breaker = breaker_with(&clock, |b| b.failure_threshold(3));

        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;
        assert_eq!(breaker.snapshot().failure_count, 2);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
