// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::f64::consts::PI;

use astro::coords::{asc_frm_ecl, dec_frm_ecl};
use astro::ecliptic::mn_oblq_IAU;
use astro::lunar::geocent_ecl_pos;
use log::debug;

use crate::astro_util::{julian_ephemeris_day_from_unix_seconds,
                        mean_sidereal_time_from_unix_seconds};
use crate::mount_driver::ra_difference;

// Kilometers.
const MOON_RADIUS: f64 = 1737.4;
const EARTH_EQUATORIAL_RADIUS: f64 = 6378.14;

/// Position of the tracked body. Coordinates in radians, rates in radians
/// per second, times in seconds since the Unix epoch.
pub trait Ephemeris {
    /// Recomputes the position for `time`.
    fn update(&mut self, time: f64);

    fn ra(&self) -> f64;
    fn de(&self) -> f64;

    /// Apparent angular radius of the body.
    fn radius(&self) -> f64;

    fn rate_ra(&self) -> f64;
    fn rate_de(&self) -> f64;
}

/// Estimates motion by finite difference between updates. Updates less than
/// MIN_SPAN apart leave the rate alone (the difference is mostly noise);
/// updates more than MAX_SPAN apart restart the estimate but keep the previous
/// rate until a usable pair arrives.
#[derive(Clone, Debug, Default)]
pub struct RateWindow {
    anchor: Option<(f64, f64, f64)>,  // time, ra, de
    rate: (f64, f64),
}

impl RateWindow {
    pub const MIN_SPAN: f64 = 1.0;
    pub const MAX_SPAN: f64 = 7200.0;

    pub fn observe(&mut self, time: f64, ra: f64, de: f64) {
        let Some((anchor_time, anchor_ra, anchor_de)) = self.anchor else {
            self.anchor = Some((time, ra, de));
            return;
        };
        let dt = time - anchor_time;
        if dt.abs() < Self::MIN_SPAN {
            return;
        }
        if dt.abs() <= Self::MAX_SPAN {
            self.rate = (ra_difference(ra, anchor_ra) / dt, (de - anchor_de) / dt);
        }
        self.anchor = Some((time, ra, de));
    }

    pub fn rate(&self) -> (f64, f64) {
        self.rate
    }
}

/// A target moving at constant rates from (ra, de) at `epoch`.
#[derive(Clone, Debug)]
pub struct FixedRateEphemeris {
    epoch: f64,
    start: (f64, f64),
    rates: (f64, f64),
    position: (f64, f64),
}

impl FixedRateEphemeris {
    pub fn new(ra: f64, de: f64, rate_ra: f64, rate_de: f64, epoch: f64) -> Self {
        FixedRateEphemeris{epoch, start: (ra, de), rates: (rate_ra, rate_de),
                           position: (ra, de)}
    }
}

impl Ephemeris for FixedRateEphemeris {
    fn update(&mut self, time: f64) {
        let elapsed = time - self.epoch;
        self.position = ((self.start.0 + self.rates.0 * elapsed).rem_euclid(2.0 * PI),
                         self.start.1 + self.rates.1 * elapsed);
    }

    fn ra(&self) -> f64 { self.position.0 }
    fn de(&self) -> f64 { self.position.1 }
    fn radius(&self) -> f64 { 0.0 }
    fn rate_ra(&self) -> f64 { self.rates.0 }
    fn rate_de(&self) -> f64 { self.rates.1 }
}

/// The Moon, from the `astro` crate's lunar theory. Geocentric unless an
/// observing site is given, in which case the (large) lunar parallax is
/// removed.
#[derive(Clone, Debug, Default)]
pub struct MoonEphemeris {
    // Latitude, longitude (positive east), radians.
    site: Option<(f64, f64)>,

    ra: f64,
    de: f64,
    distance: f64,  // km
    rates: RateWindow,
}

impl MoonEphemeris {
    pub fn new() -> Self {
        MoonEphemeris{..Default::default()}
    }

    pub fn with_site(latitude: f64, longitude: f64) -> Self {
        MoonEphemeris{site: Some((latitude, longitude)), ..Default::default()}
    }

    /// Earth-Moon distance in km, as of the last update.
    pub fn distance(&self) -> f64 {
        self.distance
    }

    // Returns (ra, de, distance).
    fn geocentric_position(time: f64) -> (f64, f64, f64) {
        let jde = julian_ephemeris_day_from_unix_seconds(time);
        let (ecl_point, distance) = geocent_ecl_pos(jde);
        let obliquity = mn_oblq_IAU(jde);
        let ra = asc_frm_ecl(ecl_point.long, ecl_point.lat, obliquity);
        let de = dec_frm_ecl(ecl_point.long, ecl_point.lat, obliquity);
        (ra.rem_euclid(2.0 * PI), de, distance)
    }

    // Shifts a geocentric position to the one seen from the site, treating
    // the Earth as a sphere.
    fn topocentric(ra: f64, de: f64, distance: f64, latitude: f64,
                   longitude: f64, time: f64) -> (f64, f64) {
        let sin_parallax = EARTH_EQUATORIAL_RADIUS / distance;
        let hour_angle =
            mean_sidereal_time_from_unix_seconds(time) + longitude - ra;
        let rho_cos = latitude.cos() * sin_parallax;
        let rho_sin = latitude.sin() * sin_parallax;
        let denominator = de.cos() - rho_cos * hour_angle.cos();
        let delta_ra = (-rho_cos * hour_angle.sin()).atan2(denominator);
        let topo_de = ((de.sin() - rho_sin) * delta_ra.cos()).atan2(denominator);
        ((ra + delta_ra).rem_euclid(2.0 * PI), topo_de)
    }
}

impl Ephemeris for MoonEphemeris {
    fn update(&mut self, time: f64) {
        let (mut ra, mut de, distance) = Self::geocentric_position(time);
        if let Some((latitude, longitude)) = self.site {
            (ra, de) = Self::topocentric(ra, de, distance, latitude, longitude, time);
        }
        self.ra = ra;
        self.de = de;
        self.distance = distance;
        self.rates.observe(time, ra, de);
        debug!("Moon at {:.6}/{:.6}, {:.0} km", ra, de, distance);
    }

    fn ra(&self) -> f64 { self.ra }
    fn de(&self) -> f64 { self.de }

    fn radius(&self) -> f64 {
        if self.distance <= MOON_RADIUS {
            return 0.0;
        }
        (MOON_RADIUS / self.distance).asin()
    }

    fn rate_ra(&self) -> f64 { self.rates.rate().0 }
    fn rate_de(&self) -> f64 { self.rates.rate().1 }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use crate::astro_util::TT_MINUS_UTC;
    use super::*;

    // 1992 April 12, 0h TT.
    fn meeus_example_time() -> f64 {
        (2448724.5 - 2440587.5) * 86400.0 - TT_MINUS_UTC
    }

    #[test]
    fn test_rate_window() {
        let mut window = RateWindow::default();
        window.observe(0.0, 1.0, 0.2);
        assert_eq!(window.rate(), (0.0, 0.0));

        // Too close in time.
        window.observe(0.5, 1.1, 0.3);
        assert_eq!(window.rate(), (0.0, 0.0));

        window.observe(10.0, 1.0001, 0.19999);
        assert_abs_diff_eq!(window.rate().0, 1.0e-5, epsilon = 1e-12);
        assert_abs_diff_eq!(window.rate().1, -1.0e-6, epsilon = 1e-12);

        // Too far apart: rate retained, estimate restarted.
        window.observe(10000.0, 2.0, 0.5);
        assert_abs_diff_eq!(window.rate().0, 1.0e-5, epsilon = 1e-12);
        window.observe(10010.0, 2.0002, 0.5);
        assert_abs_diff_eq!(window.rate().0, 2.0e-5, epsilon = 1e-12);
        assert_abs_diff_eq!(window.rate().1, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rate_window_across_ra_wrap() {
        let mut window = RateWindow::default();
        window.observe(0.0, 2.0 * PI - 1.0e-4, 0.0);
        window.observe(10.0, 1.0e-4, 0.0);
        assert_abs_diff_eq!(window.rate().0, 2.0e-5, epsilon = 1e-12);
    }

    #[test]
    fn test_moon_geocentric() {
        let mut moon = MoonEphemeris::new();
        moon.update(meeus_example_time());
        assert_abs_diff_eq!(moon.ra().to_degrees(), 134.688470, epsilon = 0.01);
        assert_abs_diff_eq!(moon.de().to_degrees(), 13.768368, epsilon = 0.01);
        assert_abs_diff_eq!(moon.distance(), 368409.7, epsilon = 10.0);
        assert_abs_diff_eq!(moon.radius(), (1737.4_f64 / 368409.7).asin(),
                            epsilon = 1e-6);
    }

    #[test]
    fn test_moon_rate() {
        let mut moon = MoonEphemeris::new();
        let t = meeus_example_time();
        moon.update(t);
        moon.update(t + 60.0);
        // Roughly 13 degrees per day eastward.
        let rate_ra = moon.rate_ra().to_degrees() * 86400.0;
        assert!(rate_ra > 10.0 && rate_ra < 17.0, "{}", rate_ra);
        assert!(moon.rate_de().abs() < moon.rate_ra().abs());
    }

    #[test]
    fn test_topocentric_parallax() {
        let t = meeus_example_time();
        let mut geocentric = MoonEphemeris::new();
        geocentric.update(t);
        let mut topocentric = MoonEphemeris::with_site(
            48_f64.to_radians(), 11_f64.to_radians());
        topocentric.update(t);
        let shift = crate::astro_util::angular_separation(
            geocentric.ra(), geocentric.de(), topocentric.ra(), topocentric.de());
        // Lunar horizontal parallax is about one degree; the shift never
        // exceeds it.
        let horizontal_parallax = (6378.14 / geocentric.distance()).asin();
        assert!(shift <= horizontal_parallax * 1.001);
        assert!(shift > 0.0);
    }

}  // mod tests.
