// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use rand::Rng;
use serde::{Deserialize, de};
use std::{fmt, time::Duration};
use thiserror::Error;

/// How tracker calls are retried while the tracker doesn't know about the target yet.
///
/// Read from `tracker.retries`, which is either a bare retry count (retried immediately) or a
/// table:
///
/// ```toml
/// [tracker]
/// retries = { backoff = "exponential", count = 8, delay = "1s", max-delay = "30s", jitter = true }
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    count: u32,
    delay: Duration,
    growth: DelayGrowth,
    jitter: bool,
}

/// How the wait between retries changes from one retry to the next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DelayGrowth {
    /// Every retry waits the same delay.
    Fixed,

    /// The delay doubles with each retry, up to `cap` if set.
    Doubling {
        /// The longest wait between two retries.
        cap: Option<Duration>,
    },
}

impl RetryPolicy {
    /// Retries up to `count` times without waiting.
    pub fn immediate(count: u32) -> Self {
        Self::fixed(count, Duration::ZERO)
    }

    /// Retries up to `count` times, waiting `delay` before each retry.
    pub fn fixed(count: u32, delay: Duration) -> Self {
        Self {
            count,
            delay,
            growth: DelayGrowth::Fixed,
            jitter: false,
        }
    }

    /// Retries up to `count` times, waiting `delay` before the first retry and doubling the wait
    /// each time after, never past `cap`.
    pub fn doubling(count: u32, delay: Duration, cap: Option<Duration>) -> Self {
        Self {
            count,
            delay,
            growth: DelayGrowth::Doubling { cap },
            jitter: false,
        }
    }

    /// Randomizes each wait to between half and all of its computed length.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// The maximum number of retries after the first attempt.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns how long to wait before retry number `retry`, counting from 1.
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let delay = match self.growth {
            DelayGrowth::Fixed => self.delay,
            DelayGrowth::Doubling { cap } => {
                let doublings = retry.saturating_sub(1).min(31);
                let grown = self.delay.saturating_mul(1 << doublings);
                cap.map_or(grown, |cap| grown.min(cap))
            }
        };

        if self.jitter {
            delay.mul_f64(rand::rng().random_range(0.5..=1.0))
        } else {
            delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate(0)
    }
}

/// A `tracker.retries` table that can't be turned into a policy.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
enum InvalidRetries {
    #[error("`jitter` needs a non-zero `delay` to randomize")]
    JitterWithoutDelay,

    #[error("`max-delay` only applies to `backoff = \"exponential\"`")]
    MaxDelayWithFixedBackoff,

    #[error("exponential backoff needs a non-zero `delay` to grow from")]
    ExponentialWithoutDelay,

    #[error("`max-delay` ({max_delay:?}) is shorter than the initial `delay` ({delay:?})")]
    MaxDelayBelowDelay { delay: Duration, max_delay: Duration },
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RetriesTable {
    count: u32,
    #[serde(default)]
    backoff: BackoffKind,
    #[serde(default, with = "humantime_serde")]
    delay: Duration,
    #[serde(default, with = "humantime_serde")]
    max_delay: Option<Duration>,
    #[serde(default)]
    jitter: bool,
}

impl RetriesTable {
    fn into_policy(self) -> Result<RetryPolicy, InvalidRetries> {
        let RetriesTable {
            count,
            backoff,
            delay,
            max_delay,
            jitter,
        } = self;

        if jitter && delay.is_zero() {
            return Err(InvalidRetries::JitterWithoutDelay);
        }
        let policy = match backoff {
            BackoffKind::Fixed => {
                if max_delay.is_some() {
                    return Err(InvalidRetries::MaxDelayWithFixedBackoff);
                }
                RetryPolicy::fixed(count, delay)
            }
            BackoffKind::Exponential => {
                if delay.is_zero() {
                    return Err(InvalidRetries::ExponentialWithoutDelay);
                }
                if let Some(max_delay) = max_delay.filter(|max_delay| *max_delay < delay) {
                    return Err(InvalidRetries::MaxDelayBelowDelay { delay, max_delay });
                }
                RetryPolicy::doubling(count, delay, max_delay)
            }
        };

        Ok(if jitter { policy.with_jitter() } else { policy })
    }
}

impl<'de> Deserialize<'de> for RetryPolicy {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(RetriesVisitor)
    }
}

struct RetriesVisitor;

impl RetriesVisitor {
    fn from_count<E: de::Error>(
        self,
        count: impl TryInto<u32>,
        unexpected: de::Unexpected<'_>,
    ) -> Result<RetryPolicy, E> {
        count.try_into().map(RetryPolicy::immediate).map_err(|_| {
            E::invalid_value(unexpected, &"a retry count between 0 and 4294967295")
        })
    }
}

impl<'de> de::Visitor<'de> for RetriesVisitor {
    type Value = RetryPolicy;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(
            "a retry count, or a table like { backoff = \"fixed\", count = 30, delay = \"10s\" }",
        )
    }

    // TOML integers arrive as i64.
    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        self.from_count(v, de::Unexpected::Signed(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        self.from_count(v, de::Unexpected::Unsigned(v))
    }

    fn visit_map<A: de::MapAccess<'de>>(self, map: A) -> Result<Self::Value, A::Error> {
        let table = RetriesTable::deserialize(de::value::MapAccessDeserializer::new(map))?;
        table.into_policy().map_err(de::Error::custom)
    }
}
