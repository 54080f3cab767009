// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Generic retry mechanism for network operations.
//!
//! Each call to [`RetryManager::execute_with_retry`] gets a fresh [`ExponentialBackoff`], so a
//! success implicitly resets the delay for the next operation. Cancellation is only observed
//! between attempts: an in-flight operation always runs to completion.

use std::{future::Future, marker::PhantomData, time::Duration};

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::ExponentialBackoff;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (total attempts = 1 initial + max_retries).
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff multiplier factor.
    pub backoff_factor: f64,
    /// Maximum jitter in milliseconds to add to delays.
    pub jitter_ms: u64,
    /// Optional timeout for individual operations in milliseconds.
    pub operation_timeout_ms: Option<u64>,
    /// Whether the first retry should happen immediately without delay.
    pub immediate_first: bool,
    /// Optional maximum total elapsed time for all attempts in milliseconds.
    /// Once exceeded, the last error is returned even if retries remain.
    pub max_elapsed_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
            jitter_ms: 100,
            operation_timeout_ms: Some(30_000),
            immediate_first: false,
            max_elapsed_ms: None,
        }
    }
}

impl RetryConfig {
    /// Retry policy for synchronize requests: 1s doubling to a 300s cap, retried until canceled.
    #[must_use]
    pub const fn unbounded(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries: u32::MAX,
            initial_delay_ms,
            max_delay_ms,
            backoff_factor: 2.0,
            jitter_ms: 0,
            operation_timeout_ms: None,
            immediate_first: false,
            max_elapsed_ms: None,
        }
    }

    /// Retry policy bounded only by a total time budget, retrying almost immediately.
    #[must_use]
    pub const fn deadline(max_elapsed_ms: u64) -> Self {
        Self {
            max_retries: u32::MAX,
            initial_delay_ms: 50,
            max_delay_ms: 1_000,
            backoff_factor: 2.0,
            jitter_ms: 0,
            operation_timeout_ms: None,
            immediate_first: true,
            max_elapsed_ms: Some(max_elapsed_ms),
        }
    }
}

/// Generic retry manager for network operations.
/// This is stateless and thread-safe: each operation gets its own backoff state.
#[derive(Debug)]
pub struct RetryManager<E> {
    config: RetryConfig,
    _phantom: PhantomData<E>,
}

impl<E> RetryManager<E>
where
    E: std::error::Error,
{
    /// Creates a new retry manager with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the backoff parameters are inconsistent.
    pub fn new(config: RetryConfig) -> anyhow::Result<Self> {
        ExponentialBackoff::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.backoff_factor,
            config.jitter_ms,
            config.immediate_first,
        )?;

        Ok(Self {
            config,
            _phantom: PhantomData,
        })
    }

    /// Returns the retry configuration.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Executes an operation with retry logic.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries or the time budget are exhausted, the first
    /// non-retryable error, or a timeout error if an attempt exceeds the operation timeout and
    /// timeouts are not retryable.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        operation_name: &str,
        operation: F,
        should_retry: impl Fn(&E) -> bool,
        create_timeout_error: impl Fn(String) -> E,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let never_canceled = CancellationToken::new();
        self.execute_with_retry_with_cancel(
            operation_name,
            operation,
            should_retry,
            &create_timeout_error,
            &create_timeout_error,
            &never_canceled,
        )
        .await
    }

    /// Executes an operation with retry logic, stopping as soon as `cancellation` fires
    /// between attempts or during a backoff sleep.
    ///
    /// # Errors
    ///
    /// As for [`Self::execute_with_retry`], plus the error built by `create_canceled_error`
    /// when canceled.
    pub async fn execute_with_retry_with_cancel<F, Fut, T>(
        &self,
        operation_name: &str,
        mut operation: F,
        should_retry: impl Fn(&E) -> bool,
        create_timeout_error: impl Fn(String) -> E,
        create_canceled_error: impl Fn(String) -> E,
        cancellation: &CancellationToken,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(self.config.initial_delay_ms),
            Duration::from_millis(self.config.max_delay_ms),
            self.config.backoff_factor,
            self.config.jitter_ms,
            self.config.immediate_first,
        )
        .map_err(|e| create_timeout_error(format!("Failed to create backoff: {e}")))?;

        let budget = self.config.max_elapsed_ms.map(Duration::from_millis);
        let start_time = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if cancellation.is_cancelled() {
                debug!("Operation '{operation_name}' canceled before attempt {}", attempt + 1);
                return Err(create_canceled_error(format!(
                    "Operation '{operation_name}' canceled"
                )));
            }

            let result = match self.config.operation_timeout_ms {
                Some(timeout_ms) => {
                    match tokio::time::timeout(Duration::from_millis(timeout_ms), operation()).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(create_timeout_error(format!(
                            "Operation '{operation_name}' timed out after {timeout_ms}ms"
                        ))),
                    }
                }
                None => operation().await,
            };

            let error = match result {
                Ok(success) => {
                    if attempt > 0 {
                        debug!(
                            "Operation '{operation_name}' succeeded after {} attempts",
                            attempt + 1
                        );
                    }
                    return Ok(success);
                }
                Err(error) => error,
            };

            if !should_retry(&error) {
                debug!("Operation '{operation_name}' failed with non-retryable error: {error}");
                return Err(error);
            }

            if attempt >= self.config.max_retries {
                warn!(
                    "Operation '{operation_name}' failed after {} attempts: {error}",
                    attempt + 1
                );
                return Err(error);
            }

            let mut delay = backoff.next_duration();
            if let Some(budget) = budget {
                let elapsed = start_time.elapsed();
                if elapsed >= budget {
                    warn!(
                        "Operation '{operation_name}' exceeded time budget of {budget:?} after {} attempts: {error}",
                        attempt + 1
                    );
                    return Err(error);
                }
                delay = delay.min(budget - elapsed);
            }

            debug!(
                "Operation '{operation_name}' failed (attempt {}), retrying in {delay:?}: {error}",
                attempt + 1
            );

            tokio::select! {
                () = cancellation.cancelled() => {
                    debug!("Operation '{operation_name}' canceled during backoff");
                    return Err(create_canceled_error(format!(
                        "Operation '{operation_name}' canceled"
                    )));
                }
                () = sleep(delay) => {}
            }
            attempt = attempt.saturating_add(1);
        }
    }
}
