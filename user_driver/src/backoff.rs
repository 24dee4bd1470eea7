// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Async-friendly spin loop support.

use std::time::Duration;

const YIELD_ATTEMPTS: u64 = 250;
const SHORT_SLEEP_ATTEMPTS: u64 = 250;
const SHORT_SLEEP_DURATION: Duration = Duration::from_millis(1);
const LONG_SLEEP_DURATION: Duration = Duration::from_millis(15);

/// An object to yield execution of an async task while in a spin loop.
///
/// This is useful when waiting for some condition (such as a device register to
/// change states, or a polled completion queue to receive an entry) that can
/// only be polled and does not have an interrupt-based notification.
#[derive(Debug, Default)]
pub struct Backoff {
    n: u64,
}

impl Backoff {
    /// Returns a new backoff object, usable for the lifetime of one spin loop.
    pub fn new() -> Self {
        Self { n: 0 }
    }

    /// Yields execution.
    ///
    /// Initially just yields to any other pending tasks. Sleeps for longer the
    /// more times this is called.
    pub async fn back_off(&mut self) {
        if self.n < YIELD_ATTEMPTS {
            tokio::task::yield_now().await;
        } else {
            let delay = if self.n - YIELD_ATTEMPTS < SHORT_SLEEP_ATTEMPTS {
                SHORT_SLEEP_DURATION
            } else {
                LONG_SLEEP_DURATION
            };
            tokio::time::sleep(delay).await;
        }
        self.n += 1;
    }

    /// Restarts the sequence, for loops that made progress.
    pub fn reset(&mut self) {
        self.n = 0;
    }
}
