//! Bounded exponential-backoff retry.
//!
//! Only failures classified as transient ([`ErrorType::is_retryable`]) are
//! retried. Everything else surfaces on the first attempt.
//!
//! Backoff schedule for a policy `{initial, max, multiplier}`:
//! `initial, initial*m, initial*m², …` each capped at `max`.
//!
//! Every failed attempt is appended to the executor's error log, which is the
//! only record of how often an operation needed retrying.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use rowsync_core::{ErrorType, RetryConfig};

use crate::error::Classify;

/// Default number of log entries kept in memory.
pub const DEFAULT_LOG_CAPACITY: usize = 1_000;

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryLogEntry {
    pub at: DateTime<Utc>,
    pub context: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub error_type: ErrorType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_delay_ms: Option<u64>,
    pub max_retries_reached: bool,
}

/// Terminal failure of a retried operation.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub error: E,
    pub error_type: ErrorType,
    /// Total attempts made, including the first.
    pub attempts: u32,
}

impl<E> Exhausted<E> {
    /// Retries spent beyond the first attempt.
    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

#[derive(Debug)]
pub struct RetryExecutor {
    log: Mutex<VecDeque<RetryLogEntry>>,
    capacity: usize,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            log: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
        }
    }

    /// Run `operation` under `config`, returning its last error when the
    /// budget is spent or the failure is permanent.
    pub async fn with_retry<T, E, F, Fut>(
        &self,
        context: &str,
        config: &RetryConfig,
        operation: F,
    ) -> Result<T, E>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(context, config, operation)
            .await
            .map_err(|exhausted| exhausted.error)
    }

    /// Like [`with_retry`](Self::with_retry) but reports how many attempts
    /// were made and how the final error was classified.
    pub async fn run<T, E, F, Fut>(
        &self,
        context: &str,
        config: &RetryConfig,
        mut operation: F,
    ) -> Result<T, Exhausted<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut delay_ms = config.initial_delay_ms;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(context, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let error_type = err.error_type();
            let message = err.to_string();

            if !error_type.is_retryable() {
                tracing::warn!(
                    context,
                    attempt,
                    error_type = %error_type,
                    error = %message,
                    "permanent failure, not retrying"
                );
                self.append(context, attempt, error_type, message, None, false);
                return Err(Exhausted {
                    error: err,
                    error_type,
                    attempts: attempt,
                });
            }

            if attempt > config.max_retries {
                tracing::error!(
                    context,
                    attempt,
                    error_type = %error_type,
                    error = %message,
                    "retry budget exhausted"
                );
                self.append(context, attempt, error_type, message, None, true);
                return Err(Exhausted {
                    error: err,
                    error_type,
                    attempts: attempt,
                });
            }

            tracing::warn!(
                context,
                attempt,
                delay_ms,
                error_type = %error_type,
                error = %message,
                "transient failure, retrying"
            );
            self.append(context, attempt, error_type, message, Some(delay_ms), false);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = config.next_delay_ms(delay_ms);
        }
    }

    /// Snapshot of the error log, oldest first.
    pub fn error_log(&self) -> Vec<RetryLogEntry> {
        self.lock_log().iter().cloned().collect()
    }

    /// Entries recorded at or after `since`.
    pub fn errors_since(&self, since: DateTime<Utc>) -> Vec<RetryLogEntry> {
        self.lock_log()
            .iter()
            .filter(|entry| entry.at >= since)
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.lock_log().clear();
    }

    fn append(
        &self,
        context: &str,
        attempt: u32,
        error_type: ErrorType,
        message: String,
        next_retry_delay_ms: Option<u64>,
        max_retries_reached: bool,
    ) {
        let mut log = self.lock_log();
        if log.len() == self.capacity {
            log.pop_front();
        }
        log.push_back(RetryLogEntry {
            at: Utc::now(),
            context: context.to_string(),
            attempt,
            error_type,
            message,
            next_retry_delay_ms,
            max_retries_reached,
        });
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, VecDeque<RetryLogEntry>> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SourceError, StoreError, SyncError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    const POLICY: RetryConfig = RetryConfig {
        max_retries: 3,
        initial_delay_ms: 1_000,
        max_delay_ms: 5_000,
        backoff_multiplier: 2.0,
    };

    fn network_error() -> SyncError {
        SourceError::new("connection refused").into()
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn always_failing_transient_operation_runs_max_retries_plus_one() {
        let executor = RetryExecutor::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<(), SyncError> = executor
            .with_retry("fetch", &POLICY, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(network_error())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), POLICY.max_retries + 1);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn permanent_error_is_attempted_once() {
        let executor = RetryExecutor::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let exhausted = executor
            .run("apply", &POLICY, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), SyncError>(StoreError::with_code("401", "unauthorized").into())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exhausted.attempts, 1);
        assert_eq!(exhausted.error_type, ErrorType::Authentication);
        let log = executor.error_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].next_retry_delay_ms.is_none());
        assert!(!log[0].max_retries_reached);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn backoff_delays_grow_and_cap() {
        let executor = RetryExecutor::new();
        let started = Instant::now();

        let _: Result<(), SyncError> = executor
            .with_retry("fetch", &POLICY, || async { Err(network_error()) })
            .await;

        let delays: Vec<_> = executor
            .error_log()
            .iter()
            .map(|entry| entry.next_retry_delay_ms)
            .collect();
        assert_eq!(delays, vec![Some(1_000), Some(2_000), Some(4_000), None]);
        assert!(executor.error_log()[3].max_retries_reached);
        // 1s + 2s + 4s of virtual sleep.
        assert_eq!(started.elapsed(), Duration::from_millis(7_000));
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn recovers_after_transient_failures() {
        let executor = RetryExecutor::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let value = executor
            .with_retry("fetch", &POLICY, || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SyncError::from(SourceError::with_code("429", "slow down")))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(executor.error_log().len(), 2);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn zero_retry_budget_means_single_attempt() {
        let executor = RetryExecutor::new();
        let policy = RetryConfig {
            max_retries: 0,
            ..POLICY
        };
        let exhausted = executor
            .run("once", &policy, || async { Err::<(), _>(network_error()) })
            .await
            .unwrap_err();
        assert_eq!(exhausted.attempts, 1);
        assert_eq!(exhausted.retry_count(), 0);
        assert!(executor.error_log()[0].max_retries_reached);
    }

    #[test]
    fn log_is_bounded() {
        let executor = RetryExecutor::with_capacity(2);
        for attempt in 1..=3 {
            executor.append("x", attempt, ErrorType::Network, "boom".into(), None, false);
        }
        let log = executor.error_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].attempt, 2);
    }
}
