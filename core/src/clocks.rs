// GCPS
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Collection of clock implementations.

use async_trait::async_trait;
use std::time::Duration;
use time::OffsetDateTime;

/// Generic definition of a clock.
#[async_trait]
pub trait Clock {
    /// Returns the current UTC time.
    fn now_utc(&self) -> OffsetDateTime;

    /// Pauses execution of the current task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Returns the number of milliseconds since the Unix epoch for `when`.
pub fn unix_millis(when: OffsetDateTime) -> i64 {
    // Dates outside of the representable range of i64 milliseconds are hundreds of millions of
    // years away, so saturating is fine.
    i64::try_from(when.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Clock implementation that uses the system clock.
#[derive(Clone, Default)]
pub struct SystemClock {}

#[async_trait]
impl Clock for SystemClock {
    fn now_utc(&self) -> OffsetDateTime {
        let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();

        // Truncate the timestamp to millisecond resolution as this is the resolution carried by
        // message timestamps on the wire.  Keeping the clock at the same resolution avoids
        // surprises when comparing in-memory times with decoded ones.
        let nanos = nanos / 1_000_000 * 1_000_000;

        match OffsetDateTime::from_unix_timestamp_nanos(nanos) {
            Ok(now) => now,
            Err(_) => {
                unreachable!("nanos must be in range because they come from the current time")
            }
        }
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Test utilities.
#[cfg(any(test, feature = "testutils"))]
pub mod testutils {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// A clock that returns a preconfigured instant and that can be modified at will.
    ///
    /// Only supports millisecond-level precision.
    pub struct SettableClock {
        /// Current fake time in milliseconds.
        now_ms: AtomicU64,
    }

    impl SettableClock {
        /// Creates a new clock that returns `now` until reconfigured with `set`.
        pub fn new(now: OffsetDateTime) -> Self {
            Self { now_ms: AtomicU64::new(Self::to_millis(now)) }
        }

        /// Converts `now` to milliseconds, asserting that no precision is lost.
        fn to_millis(now: OffsetDateTime) -> u64 {
            let now_ns = now.unix_timestamp_nanos();
            assert!(now_ns % 1_000_000 == 0, "Sub-millisecond precision not supported");
            u64::try_from(now_ns / 1_000_000).unwrap()
        }

        /// Sets the new value of `now` that the clock returns.
        pub fn set(&self, now: OffsetDateTime) {
            self.now_ms.store(Self::to_millis(now), Ordering::SeqCst);
        }

        /// Advances the current time by `delta`.
        pub fn advance(&self, delta: Duration) {
            let delta_ns = delta.as_nanos();
            assert!(delta_ns % 1_000_000 == 0, "Sub-millisecond precision not supported");
            let delta_ms = u64::try_from(delta_ns / 1_000_000).unwrap();
            self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Clock for SettableClock {
        fn now_utc(&self) -> OffsetDateTime {
            let now_ms = self.now_ms.load(Ordering::SeqCst);
            OffsetDateTime::from_unix_timestamp_nanos(now_ms as i128 * 1_000_000).unwrap()
        }

        async fn sleep(&self, duration: Duration) {
            self.advance(duration);
            tokio::task::yield_now().await;
        }
    }

}
