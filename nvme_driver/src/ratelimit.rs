// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Rate limited [`tracing`] events.
//!
//! The device can trigger some events arbitrarily often (stale completions,
//! malformed requests from a misbehaving caller). Rate limiting them keeps
//! the rest of the log readable.

use parking_lot::Mutex;
use std::time::Instant;

const PERIOD_MS: u32 = 5000;
const EVENTS_PER_PERIOD: u32 = 10;

pub(crate) struct RateLimiter {
    state: Mutex<RateLimiterState>,
}

struct RateLimiterState {
    start: Option<Instant>,
    events: u32,
    missed: u64,
}

pub(crate) struct RateLimited;

impl RateLimiter {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RateLimiterState {
                start: None,
                events: 0,
                missed: 0,
            }),
        }
    }

    /// Returns `Ok(missed_events)` if this event should be logged.
    ///
    /// `missed_events` is `Some(n)` if events were dropped since the last
    /// logged one, or if this is the last event before limiting starts.
    pub fn event(&self) -> Result<Option<u64>, RateLimited> {
        let mut state = self.state.try_lock().ok_or(RateLimited)?;
        let now = Instant::now();
        let start = state.start.get_or_insert(now);
        if now.duration_since(*start).as_millis() > PERIOD_MS as u128 {
            *start = now;
            state.events = 0;
        }
        if state.events >= EVENTS_PER_PERIOD {
            state.missed += 1;
            return Err(RateLimited);
        }
        state.events += 1;
        let missed = std::mem::take(&mut state.missed);
        Ok((missed != 0 || state.events == EVENTS_PER_PERIOD).then_some(missed))
    }
}

/// As [`tracing::warn!`], but rate limited per call site.
macro_rules! warn_ratelimited {
    ($($rest:tt)*) => {
        {
            static RATE_LIMITER: $crate::ratelimit::RateLimiter =
                $crate::ratelimit::RateLimiter::new();
            if let Ok(missed_events) = RATE_LIMITER.event() {
                tracing::warn!(dropped_ratelimited = missed_events, $($rest)*);
            }
        }
    };
}

/// As [`tracing::error!`], but rate limited per call site.
macro_rules! error_ratelimited {
    ($($rest:tt)*) => {
        {
            static RATE_LIMITER: $crate::ratelimit::RateLimiter =
                $crate::ratelimit::RateLimiter::new();
            if let Ok(missed_events) = RATE_LIMITER.event() {
                tracing::error!(dropped_ratelimited = missed_events, $($rest)*);
            }
        }
    };
}

pub(crate) use error_ratelimited;
pub(crate) use warn_ratelimited;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_per_period() {
        let limiter = RateLimiter::new();
        for i in 0..EVENTS_PER_PERIOD {
            let missed = limiter.event().ok().unwrap();
            assert_eq!(missed.is_some(), i == EVENTS_PER_PERIOD - 1);
        }
        assert!(limiter.event().is_err());
        assert!(limiter.event().is_err());
    }
}
