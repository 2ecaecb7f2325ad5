//! Lock-free circuit breaker for gating calls to unhealthy dependencies
//!
//! `fusegate` puts a three-state gate (Closed, Open, HalfOpen) in front of a
//! potentially failing dependency so that callers stop hammering it while it
//! is down and probe it with a bounded budget while it recovers. All hot-path
//! state is held in word-sized atomics and one bounded semaphore; admission
//! decisions never take a lock, and the Open to HalfOpen transition is a
//! CAS performed lazily by the first caller past the cooldown deadline.
//!
//! Refused calls are not errors: [`CircuitBreaker::execute`] returns
//! [`Execution::Denied`] carrying a [`RetryTimer`] that fires when the
//! breaker may next admit. The blocking wrappers fold that loop away and
//! also handle HTTP status classification and permissive RPC retry.
//!
//! # Gated execution
//!
//! ```rust
//! use std::time::Duration;
//!
//! use fusegate::{CircuitBreaker, CircuitBreakerConfig, Execution};
//!
//! # async fn example() -> Result<(), fusegate::ConfigError> {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(3)
//!     .cooldown(Duration::from_secs(30))
//!     .build()?;
//! let breaker = CircuitBreaker::new(config)?;
//!
//! match breaker.execute(|| async { Ok::<_, std::io::Error>(42) }).await {
//!     Execution::Completed(result) => println!("ran: {result:?}"),
//!     Execution::Denied(retry) => {
//!         retry.await; // fires when the breaker may admit again
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Blocking until admitted
//!
//! ```rust
//! use fusegate::CircuitBreaker;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::with_defaults();
//! let cancel = CancellationToken::new();
//!
//! let value = breaker
//!     .execute_blocking(&cancel, || async { Ok::<_, std::io::Error>("reply") })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! A breaker must be created inside a tokio runtime; construction spawns the
//! window janitor that periodically clears the failure window while the
//! circuit is Closed. The janitor stops on [`CircuitBreaker::close`] or when
//! the breaker is dropped.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod blocking;
pub mod breaker;
pub mod clock;
pub mod config;

pub use blocking::{BreakerError, HttpBreakerError};
pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitState, Execution};
pub use clock::{Clock, MockClock, RetryTimer, SystemClock};
pub use config::{CircuitBreakerConfig, CircuitBreakerConfigBuilder, ConfigError, ConfigResult};
