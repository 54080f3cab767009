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

//! Exponential backoff with jitter, used to pace retries of synchronize requests,
//! subscription calls and latency probes.
//!
//! The delay grows by a configurable factor from an initial value up to a cap. A successful
//! operation resets it through [`ExponentialBackoff::reset`]. An "immediate first" flag lets the
//! very first retry run without delay.

use std::time::Duration;

use rand::RngExt;

/// An exponential backoff mechanism with optional jitter and immediate-first behavior.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    /// The initial backoff delay.
    delay_initial: Duration,
    /// The maximum delay to cap the backoff.
    delay_max: Duration,
    /// The current backoff delay.
    delay_current: Duration,
    /// The factor to multiply the delay on each iteration.
    factor: f64,
    /// The maximum random jitter to add (in milliseconds).
    jitter_ms: u64,
    /// Configured immediate-first behavior, restored on reset.
    immediate_first: bool,
    /// Whether the next call still returns a zero delay.
    immediate_pending: bool,
    /// Number of delays handed out since the last reset.
    attempts: u32,
}

impl ExponentialBackoff {
    /// Creates a new [`ExponentialBackoff`] instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial delay exceeds the maximum, or the factor is not a finite
    /// value of at least 1.0.
    pub fn new(
        delay_initial: Duration,
        delay_max: Duration,
        factor: f64,
        jitter_ms: u64,
        immediate_first: bool,
    ) -> anyhow::Result<Self> {
        if delay_initial > delay_max {
            anyhow::bail!(
                "Initial delay {delay_initial:?} exceeds maximum delay {delay_max:?}"
            );
        }
        if !factor.is_finite() || factor < 1.0 {
            anyhow::bail!("Backoff factor must be finite and >= 1.0, was {factor}");
        }

        Ok(Self {
            delay_initial,
            delay_max,
            delay_current: delay_initial,
            factor,
            jitter_ms,
            immediate_first,
            immediate_pending: immediate_first,
            attempts: 0,
        })
    }

    /// Returns the next backoff delay with jitter and advances the internal state.
    pub fn next_duration(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);

        if self.immediate_pending {
            self.immediate_pending = false;
            return Duration::ZERO;
        }

        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_ms)
        };
        let delay_with_jitter = self.delay_current + Duration::from_millis(jitter);

        let max_nanos = self.delay_max.as_nanos() as u64;
        let next_nanos = (self.delay_current.as_nanos() as f64 * self.factor) as u64;
        self.delay_current = Duration::from_nanos(next_nanos.min(max_nanos));

        delay_with_jitter
    }

    /// Resets the backoff to its initial state.
    pub const fn reset(&mut self) {
        self.delay_current = self.delay_initial;
        self.immediate_pending = self.immediate_first;
        self.attempts = 0;
    }

    /// Returns the current base delay without jitter.
    #[must_use]
    pub const fn current_delay(&self) -> Duration {
        self.delay_current
    }

    /// Returns the number of delays handed out since construction or the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the configured maximum delay.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        self.delay_max
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_doubling_is_capped_at_max() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(300),
            2.0,
            0,
            false,
        )
        .unwrap();

        let delays: Vec<u64> = (0..11).map(|_| backoff.next_duration().as_secs()).collect();

        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300, 300]);
        assert_eq!(backoff.attempts(), 11);
    }

    #[rstest]
    fn test_reset_returns_to_initial_delay() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(1600),
            2.0,
            0,
            false,
        )
        .unwrap();

        backoff.next_duration();
        backoff.next_duration();
        assert_eq!(backoff.current_delay(), Duration::from_millis(400));

        backoff.reset();

        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_duration(), Duration::from_millis(100));
    }

    #[rstest]
    fn test_jitter_within_bounds() {
        for _ in 0..10 {
            let mut backoff = ExponentialBackoff::new(
                Duration::from_millis(100),
                Duration::from_millis(1000),
                2.0,
                50,
                false,
            )
            .unwrap();
            let base = backoff.current_delay();
            let delay = backoff.next_duration();
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_millis(50));
        }
    }

    #[rstest]
    fn test_immediate_first_is_restored_by_reset() {
        let initial = Duration::from_millis(100);
        let mut backoff =
            ExponentialBackoff::new(initial, Duration::from_millis(1600), 2.0, 0, true).unwrap();

        assert_eq!(backoff.next_duration(), Duration::ZERO);
        assert_eq!(backoff.next_duration(), initial);

        backoff.reset();

        assert_eq!(backoff.next_duration(), Duration::ZERO);
        assert_eq!(backoff.next_duration(), initial);
    }

    #[rstest]
    #[case(Duration::from_secs(10), Duration::from_secs(1), 2.0)]
    #[case(Duration::from_secs(1), Duration::from_secs(10), 0.5)]
    #[case(Duration::from_secs(1), Duration::from_secs(10), f64::NAN)]
    fn test_invalid_parameters_rejected(
        #[case] initial: Duration,
        #[case] max: Duration,
        #[case] factor: f64,
    ) {
        assert!(ExponentialBackoff::new(initial, max, factor, 0, false).is_err());
    }
}
