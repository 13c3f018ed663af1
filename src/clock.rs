// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Mutex;
use std::time::SystemTime;

use chrono::DateTime;

/// Source of wall-clock time, in seconds since the Unix epoch with the
/// sub-second fraction preserved. Everything that needs "now" takes one of
/// these so that drift and timing logic can be driven deterministically.
pub trait Clock {
    fn now(&self) -> f64;
}

#[derive(Default, Debug)]
pub struct SystemClock {}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now().duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs_f64()).unwrap_or(0.0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    time: Mutex<f64>,
}

impl ManualClock {
    pub fn new(time: f64) -> Self {
        ManualClock{time: Mutex::new(time)}
    }

    pub fn set(&self, time: f64) {
        *self.time.lock().unwrap() = time;
    }

    pub fn advance(&self, seconds: f64) {
        *self.time.lock().unwrap() += seconds;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.time.lock().unwrap()
    }
}

// For log messages.
pub fn format_timestamp(time: f64) -> String {
    let secs = time.floor();
    let nanos = ((time - secs) * 1.0e9) as u32;
    match DateTime::from_timestamp(secs as i64, nanos) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string(),
        None => format!("{}s", time),
    }
}

// mod tests.
