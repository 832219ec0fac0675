// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Wall-clock seconds for job start/end times, and a stopwatch for pass
//! timing.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get the current time in seconds since the Unix epoch.
pub fn current_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Monotonic stopwatch.
pub struct Stopwatch {
    start: Instant,
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Stopwatch {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_us(&self) -> u64 {
        self.elapsed().as_micros() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_time_secs() {
        let secs = current_time_secs();
        // After 2020-01-01.
        assert!(secs > 1_577_836_800);
        assert!(current_time_secs() >= secs);
    }

    #[test]
    fn test_stopwatch() {
        let sw = Stopwatch::new();
        std::thread::sleep(Duration::from_millis(5));
        assert!(sw.elapsed_us() >= 5_000);
        assert!(sw.elapsed() >= Duration::from_millis(5));
    }
}
