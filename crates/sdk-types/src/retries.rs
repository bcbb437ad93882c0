// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry policies for operations the SDK retries locally, notably side
//! effect closures.

use std::cmp;
use std::num::NonZeroUsize;
use std::time::Duration;

use rand::Rng;

/// This enum represents the policy to execute retries.
///
/// Transform it into an iterator of pause durations with
/// [`IntoIterator::into_iter`]; a `None` from the iterator means the
/// attempts are exhausted.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    /// No retry strategy.
    None,
    /// Retry with a fixed delay strategy.
    FixedDelay {
        /// Interval between retries.
        interval: Duration,
        /// Number of maximum attempts before giving up. Infinite retries if unset.
        max_attempts: Option<NonZeroUsize>,
    },
    /// Retry with an exponential strategy. The next retry is computed as
    /// `min(last_retry_interval * factor, max_interval)`.
    Exponential {
        /// Initial interval for the first retry attempt.
        initial_interval: Duration,
        /// The factor to use to compute the next retry attempt.
        factor: f32,
        /// Number of maximum attempts before giving up. Infinite retries if unset.
        max_attempts: Option<NonZeroUsize>,
        /// Maximum interval between retries.
        max_interval: Option<Duration>,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::None
    }
}

impl RetryPolicy {
    pub fn fixed_delay(interval: Duration, max_attempts: Option<usize>) -> Self {
        Self::FixedDelay {
            interval,
            max_attempts: max_attempts.map(|m| NonZeroUsize::new(m).expect("non-zero")),
        }
    }

    pub fn exponential(
        initial_interval: Duration,
        factor: f32,
        max_attempts: Option<usize>,
        max_interval: Option<Duration>,
    ) -> Self {
        Self::Exponential {
            initial_interval,
            factor,
            max_attempts: max_attempts.map(|m| NonZeroUsize::new(m).expect("non-zero")),
            max_interval,
        }
    }

    pub fn max_attempts(&self) -> Option<NonZeroUsize> {
        match self {
            RetryPolicy::None => None,
            RetryPolicy::FixedDelay { max_attempts, .. }
            | RetryPolicy::Exponential { max_attempts, .. } => *max_attempts,
        }
    }
}

impl IntoIterator for RetryPolicy {
    type Item = Duration;
    type IntoIter = RetryIter;

    fn into_iter(self) -> Self::IntoIter {
        match self {
            RetryPolicy::None => RetryIter {
                next_interval: None,
                factor: 1.0,
                max_interval: Duration::MAX,
                attempts_left: None,
            },
            RetryPolicy::FixedDelay {
                interval,
                max_attempts,
            } => RetryIter {
                next_interval: Some(interval),
                factor: 1.0,
                max_interval: interval,
                attempts_left: max_attempts.map(NonZeroUsize::get),
            },
            RetryPolicy::Exponential {
                initial_interval,
                factor,
                max_attempts,
                max_interval,
            } => RetryIter {
                next_interval: Some(initial_interval),
                factor,
                max_interval: max_interval.unwrap_or(Duration::MAX),
                attempts_left: max_attempts.map(NonZeroUsize::get),
            },
        }
    }
}

/// Yields the pause before each retry attempt. The un-jittered interval of
/// the following attempt is precomputed on every step, so the iterator
/// state is always "what would the next pause be".
#[derive(Debug)]
pub struct RetryIter {
    next_interval: Option<Duration>,
    factor: f32,
    max_interval: Duration,
    /// `None` means unbounded attempts.
    attempts_left: Option<usize>,
}

impl Iterator for RetryIter {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        match self.attempts_left.as_mut() {
            Some(0) => return None,
            Some(left) => *left -= 1,
            None => {}
        }

        let interval = self.next_interval?;
        self.next_interval = Some(cmp::min(
            interval.mul_f32(self.factor),
            self.max_interval,
        ));
        Some(jittered(interval))
    }
}

/// How much of the base interval may be added as jitter.
const MAX_JITTER_FACTOR: f32 = 0.3;

/// Added to every pause so that even sub-millisecond intervals cannot
/// collapse onto the same instant for concurrent invocations.
const JITTER_FLOOR: Duration = Duration::from_millis(3);

/// Stretches a pause by a random factor in `[1.0, 1.0 + MAX_JITTER_FACTOR)`
/// plus a small floor. A jittered pause is never shorter than requested.
fn jittered(interval: Duration) -> Duration {
    let stretch = 1.0 + rand::thread_rng().gen::<f32>() * MAX_JITTER_FACTOR;
    interval.mul_f32(stretch) + JITTER_FLOOR
}
