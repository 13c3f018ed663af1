use astro::angle::{limit_to_two_PI};
use astro::coords::{alt_frm_eq, az_frm_eq};
use astro::time::{CalType, Date, julian_day, mn_sidr};

use chrono::{Datelike, DateTime, Timelike};
use std::f64::consts::{PI};

// Seconds. Terrestrial Time minus UTC (32.184s plus leap seconds since 2017).
pub const TT_MINUS_UTC: f64 = 69.184;

/// Julian Day (UT) from seconds since the Unix epoch.
pub fn julian_day_from_unix_seconds(unix_seconds: f64) -> f64 {
    unix_seconds / 86400.0 + 2440587.5
}

/// Julian Ephemeris Day (TT) from seconds since the Unix epoch.
pub fn julian_ephemeris_day_from_unix_seconds(unix_seconds: f64) -> f64 {
    julian_day_from_unix_seconds(unix_seconds + TT_MINUS_UTC)
}

/// Returns the separation, in radians, between the given celestial coordinates
/// (in radians).
pub fn angular_separation(p0_ra: f64, p0_dec: f64,
                          p1_ra: f64, p1_dec: f64) -> f64 {
    let cos_sep = p0_dec.sin() * p1_dec.sin() +
        p0_dec.cos() * p1_dec.cos() * (p0_ra - p1_ra).cos();
    cos_sep.clamp(-1.0, 1.0).acos()
}

/// Returns (alt, az)
/// alt: elevation in radians
/// az: radians, clockwise from north
/// `long` is positive east.
pub fn alt_az_from_equatorial(ra: f64, dec: f64, lat: f64, long: f64,
                              unix_seconds: f64) -> (f64, f64) {
    // Note that astro::coords::hr_angl_frm_observer_long() has a bug. Fortunately
    // the correct relation is trivial.
    let hour_angle = mean_sidereal_time_from_unix_seconds(unix_seconds) + long - ra;

    let meeus_az = az_frm_eq(hour_angle, dec, lat);
    let civil_az = limit_to_two_PI(meeus_az + PI);

    (alt_frm_eq(hour_angle, dec, lat), civil_az)
}

/// Greenwich mean sidereal time, radians.
pub fn mean_sidereal_time_from_unix_seconds(unix_seconds: f64) -> f64 {
    let whole_seconds = unix_seconds.floor();
    let dt_utc = DateTime::from_timestamp(whole_seconds as i64, 0)
        .unwrap_or_default();
    let date = Date{year: dt_utc.date_naive().year() as i16,
                    month: dt_utc.date_naive().month() as u8,
                    decimal_day: dt_utc.date_naive().day() as f64,
                    cal_type: CalType::Gregorian};
    let jd = julian_day(&date);

    let utc_hours = (dt_utc.time().num_seconds_from_midnight() as f64 +
                     unix_seconds - whole_seconds) / 3600.0;
    let gmst_hours = mn_sidr(jd).to_degrees() / 15.0 + utc_hours * 1.00273790935;
    limit_to_two_PI((gmst_hours * 15.0).to_radians())
}

// mod tests.
