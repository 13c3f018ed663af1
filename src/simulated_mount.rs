// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use canonical_error::{CanonicalError, unavailable_error};
use log::debug;

use crate::clock::Clock;
use crate::instruction::Direction;
use crate::mount_driver::MountDriver;

/// Observable and adjustable state of a SimulatedMount. Held behind a shared
/// mutex so a test (or a simulated camera) can look at where the mount
/// actually points.
#[derive(Debug, Default)]
pub struct SimulatedMountState {
    pub connected: bool,

    // Where the mount actually points, as of `time`.
    pub ra: f64,
    pub de: f64,
    pub time: f64,

    // Systematic error: a slew to (ra, de) ends up at (ra, de) + slew_error.
    pub slew_error: (f64, f64),

    // Tracking error, radians per second.
    pub drift: (f64, f64),

    // Radians per second of pulse.
    pub guide_rate: f64,

    // The hardware moves the opposite way in these axes.
    pub ra_mirrored: bool,
    pub de_mirrored: bool,

    // After a slew, this many position reads return unsettled values,
    // approaching the final position in steps of `settle_jitter`.
    pub settle_reads: usize,
    pub settle_jitter: f64,
    unsettled_remaining: usize,

    pub slew_count: usize,
    pub pulses: Vec<(Direction, Duration)>,
}

impl SimulatedMountState {
    fn advance(&mut self, now: f64) {
        let dt = now - self.time;
        if dt > 0.0 {
            self.ra += self.drift.0 * dt;
            self.de += self.drift.1 * dt;
        }
        self.time = now;
    }
}

/// A virtual equatorial mount. Slews and pulses take effect instantly.
pub struct SimulatedMount {
    state: Arc<Mutex<SimulatedMountState>>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl SimulatedMount {
    pub fn new(clock: Arc<dyn Clock + Send + Sync>, ra: f64, de: f64,
               guide_rate: f64) -> Self {
        let time = clock.now();
        SimulatedMount{
            state: Arc::new(Mutex::new(SimulatedMountState{
                ra, de, time, guide_rate, ..Default::default()})),
            clock,
        }
    }

    pub fn state(&self) -> Arc<Mutex<SimulatedMountState>> {
        self.state.clone()
    }

    fn check_connected(state: &SimulatedMountState) -> Result<(), CanonicalError> {
        if !state.connected {
            return Err(unavailable_error("Simulated mount is not connected"));
        }
        Ok(())
    }
}

impl MountDriver for SimulatedMount {
    fn connect(&mut self) -> Result<(), CanonicalError> {
        self.state.lock().unwrap().connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), CanonicalError> {
        self.state.lock().unwrap().connected = false;
        Ok(())
    }

    fn slew_to(&mut self, ra: f64, de: f64) -> Result<(), CanonicalError> {
        let now = self.clock.now();
        let mut locked_state = self.state.lock().unwrap();
        Self::check_connected(&locked_state)?;
        locked_state.advance(now);
        locked_state.ra = ra + locked_state.slew_error.0;
        locked_state.de = de + locked_state.slew_error.1;
        locked_state.unsettled_remaining = locked_state.settle_reads;
        locked_state.slew_count += 1;
        debug!("Simulated slew to {:.6}/{:.6}", locked_state.ra, locked_state.de);
        Ok(())
    }

    fn position(&mut self) -> Result<(f64, f64), CanonicalError> {
        let now = self.clock.now();
        let mut locked_state = self.state.lock().unwrap();
        Self::check_connected(&locked_state)?;
        locked_state.advance(now);
        let wobble = locked_state.settle_jitter *
            locked_state.unsettled_remaining as f64;
        if locked_state.unsettled_remaining > 0 {
            locked_state.unsettled_remaining -= 1;
        }
        Ok((locked_state.ra + wobble, locked_state.de + wobble))
    }

    fn pulse_guide(&mut self, direction: Direction, duration: Duration)
                   -> Result<(), CanonicalError> {
        let now = self.clock.now();
        let mut locked_state = self.state.lock().unwrap();
        Self::check_connected(&locked_state)?;
        locked_state.advance(now);
        let step = locked_state.guide_rate * duration.as_secs_f64();
        let ra_sign = if locked_state.ra_mirrored { -1.0 } else { 1.0 };
        let de_sign = if locked_state.de_mirrored { -1.0 } else { 1.0 };
        match direction {
            Direction::North => locked_state.de += de_sign * step,
            Direction::South => locked_state.de -= de_sign * step,
            Direction::East => locked_state.ra += ra_sign * step,
            Direction::West => locked_state.ra -= ra_sign * step,
        }
        locked_state.pulses.push((direction, duration));
        Ok(())
    }

    fn name(&self) -> &str { "SimulatedMount" }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use canonical_error::CanonicalErrorCode;
    use crate::clock::ManualClock;
    use super::*;

    #[test]
    fn test_requires_connection() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut mount = SimulatedMount::new(clock, 1.0, 0.5, 1.0e-4);
        let err = mount.position().unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::Unavailable);
        mount.connect().unwrap();
        assert_eq!(mount.position().unwrap(), (1.0, 0.5));
    }

    #[test]
    fn test_pulse_and_drift() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut mount = SimulatedMount::new(clock.clone(), 1.0, 0.5, 1.0e-4);
        mount.connect().unwrap();
        mount.pulse_guide(Direction::North, Duration::from_secs(2)).unwrap();
        let (_, de) = mount.position().unwrap();
        assert_abs_diff_eq!(de, 0.5002, epsilon = 1e-12);

        mount.state().lock().unwrap().ra_mirrored = true;
        mount.pulse_guide(Direction::East, Duration::from_secs(1)).unwrap();
        let (ra, _) = mount.position().unwrap();
        assert_abs_diff_eq!(ra, 0.9999, epsilon = 1e-12);

        mount.state().lock().unwrap().drift = (1.0e-5, 0.0);
        clock.advance(10.0);
        let (ra, _) = mount.position().unwrap();
        assert_abs_diff_eq!(ra, 1.0000, epsilon = 1e-12);
    }

}  // mod tests.
