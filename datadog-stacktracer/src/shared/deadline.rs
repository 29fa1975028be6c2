// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

/// Tracks a wall-clock budget for an operation that must return in bounded
/// time (foreign-thread capture, cluster gather).
pub struct Deadline {
    start_time: Instant,
    timeout: Duration,
}

impl Deadline {
    pub fn new(timeout: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            timeout,
        }
    }

    pub fn expired(&self) -> bool {
        self.start_time.elapsed() >= self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for Deadline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deadline")
            .field("elapsed", &self.elapsed())
            .field("timeout", &self.timeout)
            .field("expired", &self.expired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_new() {
        let deadline = Deadline::new(Duration::from_secs(5));
        assert_eq!(deadline.timeout(), Duration::from_secs(5));
        assert!(!deadline.expired());
    }

    #[test]
    fn test_deadline_expires() {
        let deadline = Deadline::new(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(50));
        assert!(deadline.expired());
        assert!(deadline.elapsed() >= Duration::from_millis(10));
    }
}
