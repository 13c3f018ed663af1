// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use canonical_error::CanonicalError;

use crate::instruction::Direction;

/// Capabilities every mount backend provides. Only the command queue worker
/// calls these, so implementations need not be internally synchronized.
/// All coordinates are radians: RA in 0..2pi, DE in -pi/2..pi/2.
///
/// Transport failures are reported as Unavailable; malformed replies from
/// the hardware as Internal.
pub trait MountDriver {
    fn connect(&mut self) -> Result<(), CanonicalError>;

    // Stops any motion and releases the connection.
    fn disconnect(&mut self) -> Result<(), CanonicalError>;

    // Returns once the slew has finished.
    fn slew_to(&mut self, ra: f64, de: f64) -> Result<(), CanonicalError>;

    // The raw position as reported by the hardware.
    fn position(&mut self) -> Result<(f64, f64), CanonicalError>;

    // Returns once the pulse has been executed.
    fn pulse_guide(&mut self, direction: Direction, duration: Duration)
                   -> Result<(), CanonicalError>;

    fn name(&self) -> &str;
}

/// Wraps an RA difference into -pi..pi.
pub fn ra_difference(ra1: f64, ra0: f64) -> f64 {
    let two_pi = 2.0 * std::f64::consts::PI;
    let mut diff = (ra1 - ra0) % two_pi;
    if diff > std::f64::consts::PI {
        diff -= two_pi;
    } else if diff < -std::f64::consts::PI {
        diff += two_pi;
    }
    diff
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;
    use super::*;

    #[test]
    fn test_ra_difference() {
        assert_abs_diff_eq!(ra_difference(0.3, 0.1), 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(ra_difference(0.1, 2.0 * PI - 0.1), 0.2,
                            epsilon = 1e-12);
        assert_abs_diff_eq!(ra_difference(2.0 * PI - 0.1, 0.1), -0.2,
                            epsilon = 1e-12);
    }

}  // mod tests.
