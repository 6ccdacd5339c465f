// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry policies used wherever the system retries transient I/O: WAL
//! creation and writes, coordination-service mutations, assignment RPCs.

use std::cmp;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

const DEFAULT_JITTER_MULTIPLIER: f32 = 0.3;

// A minimum of +3ms keeps retries off common zero-ending values, which are a
// frequent cause of harmonics between processes retrying the same resource.
static MIN_JITTER: Duration = Duration::from_millis(3);

pub fn with_jitter(duration: Duration, max_multiplier: f32) -> Duration {
    let max_jitter = duration.mul_f32(max_multiplier);
    if max_jitter <= MIN_JITTER {
        duration + MIN_JITTER
    } else {
        duration + rand::thread_rng().gen_range(MIN_JITTER..max_jitter)
    }
}

/// The policy for retrying an operation: how long to pause between attempts
/// and when to give up.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum RetryPolicy {
    /// Fail on the first error.
    None,
    /// Retry with a fixed pause between attempts.
    FixedDelay {
        #[serde(with = "serde_with::As::<serde_with::DisplayFromStr>")]
        interval: humantime::Duration,
        /// Give up after this many attempts; retry forever if unset.
        max_attempts: Option<usize>,
    },
    /// Retry with exponentially growing pauses,
    /// `min(last * factor, max_interval)`.
    Exponential {
        #[serde(with = "serde_with::As::<serde_with::DisplayFromStr>")]
        initial_interval: humantime::Duration,
        factor: f32,
        max_attempts: Option<usize>,
        #[serde(with = "serde_with::As::<Option<serde_with::DisplayFromStr>>")]
        max_interval: Option<humantime::Duration>,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::None
    }
}

impl RetryPolicy {
    pub fn fixed_delay(interval: Duration, max_attempts: Option<usize>) -> Self {
        RetryPolicy::FixedDelay {
            interval: interval.into(),
            max_attempts,
        }
    }

    pub fn exponential(
        initial_interval: Duration,
        factor: f32,
        max_attempts: Option<usize>,
        max_interval: Option<Duration>,
    ) -> Self {
        RetryPolicy::Exponential {
            initial_interval: initial_interval.into(),
            factor,
            max_attempts,
            max_interval: max_interval.map(Into::into),
        }
    }

    pub fn iter(&self) -> RetryIter {
        RetryIter {
            policy: self.clone(),
            attempts: 0,
            last_pause: None,
        }
    }

    /// Run `operation` until it succeeds or the policy is exhausted.
    pub async fn retry<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.retry_if(&mut operation, |_| true).await
    }

    /// Run `operation` until it succeeds, the policy is exhausted, or an
    /// error fails `should_retry`.
    pub async fn retry_if<T, E, F, Fut, C>(
        &self,
        mut operation: F,
        mut should_retry: C,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnMut(&E) -> bool,
    {
        let mut pauses = self.iter();
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => match pauses.next() {
                    Some(pause) if should_retry(&err) => tokio::time::sleep(pause).await,
                    _ => return Err(err),
                },
            }
        }
    }
}

#[derive(Debug)]
pub struct RetryIter {
    policy: RetryPolicy,
    attempts: usize,
    last_pause: Option<Duration>,
}

impl Iterator for RetryIter {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.attempts += 1;
        match &self.policy {
            RetryPolicy::None => None,
            RetryPolicy::FixedDelay {
                interval,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|limit| self.attempts > limit) {
                    None
                } else {
                    Some(with_jitter((*interval).into(), DEFAULT_JITTER_MULTIPLIER))
                }
            }
            RetryPolicy::Exponential {
                initial_interval,
                factor,
                max_attempts,
                max_interval,
            } => {
                if max_attempts.is_some_and(|limit| self.attempts > limit) {
                    return None;
                }
                let pause = match self.last_pause {
                    Some(last) => cmp::min(
                        last.mul_f32(*factor),
                        max_interval.map(Into::into).unwrap_or(Duration::MAX),
                    ),
                    None => (*initial_interval).into(),
                };
                self.last_pause = Some(pause);
                Some(with_jitter(pause, DEFAULT_JITTER_MULTIPLIER))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn within_jitter(expected: Duration, actual: Duration) -> bool {
        actual >= expected + MIN_JITTER
            && actual <= expected + expected.mul_f32(DEFAULT_JITTER_MULTIPLIER)
    }

    #[test]
    fn none_yields_nothing() {
        assert_eq!(RetryPolicy::None.iter().count(), 0);
    }

    #[test]
    fn fixed_delay_is_bounded() {
        let pauses: Vec<_> = RetryPolicy::fixed_delay(Duration::from_millis(100), Some(10))
            .iter()
            .collect();
        assert_eq!(pauses.len(), 10);
        for pause in pauses {
            assert!(within_jitter(Duration::from_millis(100), pause));
        }
    }

    #[test]
    fn exponential_caps_at_max_interval() {
        let pauses: Vec<_> = RetryPolicy::exponential(
            Duration::from_millis(100),
            2.0,
            Some(5),
            Some(Duration::from_millis(250)),
        )
        .iter()
        .collect();
        assert_eq!(pauses.len(), 5);
        assert!(within_jitter(Duration::from_millis(100), pauses[0]));
        assert!(within_jitter(Duration::from_millis(200), pauses[1]));
        for pause in &pauses[2..] {
            assert!(within_jitter(Duration::from_millis(250), *pause));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_if_respects_condition() {
        let attempts = AtomicU64::new(0);
        let result = RetryPolicy::fixed_delay(Duration::from_millis(10), Some(100))
            .retry_if(
                || {
                    let n = attempts.fetch_add(1, Ordering::Relaxed);
                    future::ready(Err::<(), _>(n))
                },
                |err| *err < 3,
            )
            .await;
        assert_eq!(result, Err(3));
    }
}
