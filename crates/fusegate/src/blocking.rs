//! Blocking wrappers that fold the admission retry loop into the breaker
//!
//! [`CircuitBreaker::execute`] hands refused callers a timer and leaves the
//! looping to them. The wrappers in this module wait on that timer and try
//! again, until the call goes through, a non-retryable outcome is reached,
//! or the caller's [`CancellationToken`] fires. Cancellation is only
//! observed while waiting for admission; an in-flight call always completes.

use std::future::Future;

use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::breaker::{CircuitBreaker, Execution};
use crate::clock::{Clock, RetryTimer};

/// Error returned by the generic blocking wrappers
#[derive(Debug, Error)]
pub enum BreakerError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The caller's token fired while waiting for admission
    #[error("cancelled while waiting for admission")]
    Cancelled,

    /// The wrapped operation ran and failed; the verbatim error is the source
    #[error("operation failed")]
    Operation(#[source] E),
}

/// Error returned by [`CircuitBreaker::execute_http_blocking`]
#[derive(Debug, Error)]
pub enum HttpBreakerError {
    /// The request factory failed; nothing was sent
    #[error("unable to build request")]
    Request(#[source] reqwest::Error),

    /// Non-retryable status outside 200..400. The response is handed back
    /// with its body intact; the caller owns closing it.
    #[error("non-retryable HTTP status {status}")]
    Status { status: StatusCode, response: reqwest::Response },

    /// The caller's token fired while waiting for admission
    #[error("cancelled while waiting for admission")]
    Cancelled,
}

/// Retryable per-attempt failures, counted by the breaker
#[derive(Debug, Error)]
enum RetryableHttp {
    #[error("transport error")]
    Transport(#[source] reqwest::Error),
    #[error("retryable HTTP status {0}")]
    Status(StatusCode),
}

enum HttpOutcome {
    /// 200..400
    Success(reqwest::Response),
    /// Other 4xx: an application failure that must not trip the circuit
    AppError(reqwest::Response),
}

/// Statuses that count as dependency failures: request timeout, throttling
/// and every server error.
fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500..=599)
}

/// Wait for the retry timer, unless the caller cancels first.
///
/// Returns false on cancellation; the timer is dropped, which cancels it.
async fn wait_or_cancel(cancel: &CancellationToken, retry: RetryTimer) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = retry => true,
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Execute `op`, waiting out admission refusals
    ///
    /// Retries ONLY while the breaker refuses admission. Once `op` runs, its
    /// result is final: `Ok` is returned as-is and an error comes back as
    /// [`BreakerError::Operation`] without another attempt; whether to loop
    /// on operation errors is the caller's decision. The token bounds the
    /// wait; on cancellation the pending timer is dropped and
    /// [`BreakerError::Cancelled`] is returned.
    pub async fn execute_blocking<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        loop {
            match self.execute(&mut op).await {
                Execution::Completed(Ok(value)) => return Ok(value),
                Execution::Completed(Err(err)) => return Err(BreakerError::Operation(err)),
                Execution::Denied(retry) => {
                    if !wait_or_cancel(cancel, retry).await {
                        return Err(BreakerError::Cancelled);
                    }
                }
            }
        }
    }

    /// Execute an HTTP request with status classification and retry
    ///
    /// `request_factory` is invoked fresh on every attempt so request bodies
    /// are replayable. Each attempt is classified:
    ///
    /// - transport errors and statuses 408, 429 and 500..600 are counted as
    ///   breaker failures and retried (the body of a retryable response is
    ///   drained first);
    /// - 200..400 is a success and the response is returned with its body
    ///   open;
    /// - any other 4xx is an application failure: the breaker is NOT
    ///   tripped and [`HttpBreakerError::Status`] carries the response back
    ///   immediately.
    ///
    /// The caller owns the body of every returned response.
    #[instrument(skip_all)]
    pub async fn execute_http_blocking<F>(
        &self,
        cancel: &CancellationToken,
        client: &reqwest::Client,
        request_factory: F,
    ) -> Result<reqwest::Response, HttpBreakerError>
    where
        F: Fn() -> Result<reqwest::Request, reqwest::Error>,
    {
        loop {
            let request = request_factory().map_err(HttpBreakerError::Request)?;

            let attempt = self
                .execute(|| async {
                    let response = match client.execute(request).await {
                        Ok(response) => response,
                        Err(err) => return Err(RetryableHttp::Transport(err)),
                    };

                    let status = response.status();
                    if (200..400).contains(&status.as_u16()) {
                        return Ok(HttpOutcome::Success(response));
                    }
                    if is_retryable_status(status) {
                        // Drain so the connection can be reused by the retry.
                        let _ = response.bytes().await;
                        return Err(RetryableHttp::Status(status));
                    }
                    Ok(HttpOutcome::AppError(response))
                })
                .await;

            match attempt {
                Execution::Completed(Ok(HttpOutcome::Success(response))) => return Ok(response),
                Execution::Completed(Ok(HttpOutcome::AppError(response))) => {
                    return Err(HttpBreakerError::Status { status: response.status(), response });
                }
                Execution::Completed(Err(err)) => {
                    debug!(error = %err, "retryable attempt failed");
                }
                Execution::Denied(retry) => {
                    if !wait_or_cancel(cancel, retry).await {
                        return Err(HttpBreakerError::Cancelled);
                    }
                }
            }
        }
    }

    /// Execute an RPC-style call, retrying every error until it succeeds
    ///
    /// Generic over the response type returned by `op`. Every error is
    /// treated as retryable; error classification, if any, belongs inside
    /// `op`. The loop therefore ends only on success or cancellation, and
    /// the caller's token (or deadline) is the sole bound on how long a
    /// persistently failing call is retried.
    pub async fn execute_grpc_blocking<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        loop {
            if cancel.is_cancelled() {
                return Err(BreakerError::Cancelled);
            }

            match self.execute(&mut op).await {
                Execution::Completed(Ok(value)) => return Ok(value),
                Execution::Completed(Err(err)) => {
                    debug!(error = %err, "call failed, retrying");
                }
                Execution::Denied(retry) => {
                    if !wait_or_cancel(cancel, retry).await {
                        return Err(BreakerError::Cancelled);
                    }
                }
            }
        }
    }
}
