// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::f64::consts::PI;
use std::sync::Arc;

use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error, out_of_range_error};
use log::{info, warn};

use crate::clock::{Clock, format_timestamp};
use crate::ephemeris::Ephemeris;
use crate::frame_rotation::{ShiftOrientation, rotate_shift};
use crate::image_registration::{ImageRegistration, ImageSource, ShiftMeasurement};
use crate::mount::Mount;
use crate::mount_driver::ra_difference;
use crate::settings::AlignmentSettings;
use crate::value_stats::ValueStatsAccumulator;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlignmentStatus {
    Unaligned,
    // At least one alignment point.
    Aligned,
    // Two or more points, but no drift in effect.
    DriftEligible,
    // Corrections are extrapolated with the drift rate.
    DriftActive,
}

/// Mount position minus predicted landmark position, as measured at `time`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlignmentPoint {
    pub time: f64,
    pub ra_correction: f64,
    pub de_correction: f64,
}

/// Outcome of the probe slews made when initializing automatic alignment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProbeCalibration {
    // -1.0 if the image axis is mirrored, else 1.0.
    pub flip_x: f64,
    pub flip_y: f64,

    // Empirical focal length per image axis (same unit as the nominal one).
    pub focal_length_x: f64,
    pub focal_length_y: f64,

    // Largest relative discrepancy between measured and expected shift.
    pub relative_error: f64,
}

/// Infers image axis mirroring and effective focal length from three shift
/// measurements: `baseline` at the unshifted position and `x_probe`,
/// `y_probe` after moving the field by `expected` radians along each image
/// axis. Fails with OutOfRange if either axis is off by more than
/// `threshold` (relative).
pub fn evaluate_probe_measurements(expected: f64,
                                   baseline: (f64, f64),
                                   x_probe: (f64, f64),
                                   y_probe: (f64, f64),
                                   focal_length: f64,
                                   threshold: f64)
                                   -> Result<ProbeCalibration, CanonicalError> {
    if expected <= 0.0 {
        return Err(invalid_argument_error(
            format!("Expected probe shift must be positive; got {}",
                    expected).as_str()));
    }
    let measured_x = x_probe.0 - baseline.0;
    let measured_y = y_probe.1 - baseline.1;
    let error_x = (measured_x.abs() / expected - 1.0).abs();
    let error_y = (measured_y.abs() / expected - 1.0).abs();
    let relative_error = error_x.max(error_y);
    if relative_error > threshold {
        return Err(out_of_range_error(
            format!("Probe shifts {:.2e}/{:.2e} differ from expected {:.2e} by \
                     {:.0}%/{:.0}%, more than {:.0}%",
                    measured_x, measured_y, expected, error_x * 100.0,
                    error_y * 100.0, threshold * 100.0).as_str()));
    }
    Ok(ProbeCalibration{
        flip_x: if measured_x < 0.0 { -1.0 } else { 1.0 },
        flip_y: if measured_y < 0.0 { -1.0 } else { 1.0 },
        focal_length_x: focal_length * measured_x.abs() / expected,
        focal_length_y: focal_length * measured_y.abs() / expected,
        relative_error,
    })
}

/// Shortens the automatic alignment interval after a poor alignment and
/// lengthens it after a good one, within the configured bounds.
pub fn adapt_auto_align_interval(interval: f64, relative_error: f64,
                                 settings: &AlignmentSettings) -> f64 {
    if relative_error > settings.max_alignment_error {
        (interval / 1.5).max(settings.min_auto_align_interval)
    } else if relative_error < settings.max_alignment_error / 3.0 {
        (interval * 1.5).min(settings.max_auto_align_interval)
    } else {
        interval
    }
}

struct AutoAlign {
    image_source: Box<dyn ImageSource + Send>,
    orientation: ShiftOrientation,
    calibration: ProbeCalibration,
}

/// Keeps the mapping between ephemeris coordinates and mount coordinates.
/// Each alignment records how far the mount's idea of the landmark position
/// is from the ephemeris'; with enough history the change of that offset
/// over time (drift) is extrapolated as well.
pub struct AlignmentEngine {
    settings: AlignmentSettings,
    focal_length: f64,
    mount: Arc<Mount>,
    ephemeris: Box<dyn Ephemeris + Send>,
    clock: Arc<dyn Clock + Send + Sync>,
    registration: ImageRegistration,

    // Present once initialize_auto_align() succeeded.
    auto_align: Option<AutoAlign>,

    landmark_offset: Option<(f64, f64)>,

    history: Vec<AlignmentPoint>,
    static_correction: (f64, f64),
    drift: Option<(f64, f64)>,
    drift_disabled: bool,
    // Overrides the (first, last) history pair used for drift.
    drift_indices: Option<(usize, usize)>,

    auto_align_interval: f64,
    alignment_errors: ValueStatsAccumulator,
}

impl AlignmentEngine {
    pub fn new(settings: AlignmentSettings,
               focal_length: f64,
               mount: Arc<Mount>,
               ephemeris: Box<dyn Ephemeris + Send>,
               clock: Arc<dyn Clock + Send + Sync>,
               registration: ImageRegistration) -> Result<Self, CanonicalError> {
        settings.validate()?;
        let auto_align_interval = settings.min_auto_align_interval;
        Ok(AlignmentEngine{
            settings, focal_length, mount, ephemeris, clock, registration,
            auto_align: None,
            landmark_offset: None,
            history: Vec::new(),
            static_correction: (0.0, 0.0),
            drift: None,
            drift_disabled: false,
            drift_indices: None,
            auto_align_interval,
            alignment_errors: ValueStatsAccumulator::new(20),
        })
    }

    pub fn status(&self) -> AlignmentStatus {
        if self.history.is_empty() {
            AlignmentStatus::Unaligned
        } else if self.drift_in_effect().is_some() {
            AlignmentStatus::DriftActive
        } else if self.history.len() >= 2 {
            AlignmentStatus::DriftEligible
        } else {
            AlignmentStatus::Aligned
        }
    }

    pub fn alignment_history(&self) -> &[AlignmentPoint] {
        &self.history
    }

    pub fn drift(&self) -> Option<(f64, f64)> {
        self.drift
    }

    /// Seconds until the next automatic alignment is due.
    pub fn auto_align_interval(&self) -> f64 {
        self.auto_align_interval
    }

    pub fn alignment_errors(&self) -> &ValueStatsAccumulator {
        &self.alignment_errors
    }

    pub fn probe_calibration(&self) -> Option<ProbeCalibration> {
        self.auto_align.as_ref().map(|a| a.calibration)
    }

    /// As of the most recent update.
    pub fn ephemeris(&self) -> &dyn Ephemeris {
        self.ephemeris.as_ref()
    }

    /// Position of the landmark relative to the body's center.
    pub fn set_landmark_offset(&mut self, ra: f64, de: f64) {
        info!("Landmark offset {:.2e}/{:.2e}", ra, de);
        self.landmark_offset = Some((ra, de));
    }

    pub fn landmark_offset(&self) -> Option<(f64, f64)> {
        self.landmark_offset
    }

    fn drift_in_effect(&self) -> Option<(f64, f64)> {
        if self.drift_disabled { None } else { self.drift }
    }

    /// Current mount minus ephemeris offset, including drift extrapolated
    /// from the last alignment.
    pub fn compute_coordinate_correction(&self) -> (f64, f64) {
        let (Some(drift), Some(last)) = (self.drift_in_effect(), self.history.last())
        else {
            return self.static_correction;
        };
        let elapsed = self.clock.now() - last.time;
        (self.static_correction.0 + drift.0 * elapsed,
         self.static_correction.1 + drift.1 * elapsed)
    }

    pub fn ephemeris_to_mount(&self, ra: f64, de: f64) -> (f64, f64) {
        let (ra_corr, de_corr) = self.compute_coordinate_correction();
        ((ra + ra_corr).rem_euclid(2.0 * PI), de + de_corr)
    }

    pub fn mount_to_ephemeris(&self, ra: f64, de: f64) -> (f64, f64) {
        let (ra_corr, de_corr) = self.compute_coordinate_correction();
        ((ra - ra_corr).rem_euclid(2.0 * PI), de - de_corr)
    }

    /// Mount position for a point offset from the body's current center.
    pub fn tile_center_to_mount(&mut self, delta_ra: f64, delta_de: f64) -> (f64, f64) {
        self.ephemeris.update(self.clock.now());
        self.ephemeris_to_mount(self.ephemeris.ra() + delta_ra,
                                self.ephemeris.de() + delta_de)
    }

    /// Where the mount must point to center the landmark now.
    pub fn landmark_mount_position(&mut self) -> Result<(f64, f64), CanonicalError> {
        let (ra_offset, de_offset) = self.require_landmark()?;
        Ok(self.tile_center_to_mount(ra_offset, de_offset))
    }

    /// Rates (radians per second) at which the mount must move to stay on
    /// the landmark: the body's motion plus drift.
    pub fn tracking_rate(&self) -> (f64, f64) {
        let (drift_ra, drift_de) = self.drift_in_effect().unwrap_or((0.0, 0.0));
        (self.ephemeris.rate_ra() + drift_ra, self.ephemeris.rate_de() + drift_de)
    }

    fn require_landmark(&self) -> Result<(f64, f64), CanonicalError> {
        self.landmark_offset.ok_or_else(|| failed_precondition_error(
            "No landmark selected"))
    }

    /// Records a new alignment point. Manual: the operator has centered the
    /// landmark, so the mount's position is taken as is. Automatic: the mount
    /// is slewed to the predicted landmark position and a still image is
    /// compared with the reference frame. Returns the relative alignment
    /// error (automatic only); above 1.0 adjacent tiles may no longer overlap.
    pub fn align(&mut self, manual: bool) -> Result<Option<f64>, CanonicalError> {
        let (ra_offset, de_offset) = self.require_landmark()?;
        let (mount_ra, mount_de, relative_error) = if manual {
            let (ra, de) = self.mount.lookup_position()?;
            (ra, de, None)
        } else {
            let (ra, de, error) = self.measure_landmark()?;
            (ra, de, Some(error))
        };

        let time = self.clock.now();
        self.ephemeris.update(time);
        let point = AlignmentPoint{
            time,
            ra_correction: ra_difference(mount_ra, self.ephemeris.ra() + ra_offset),
            de_correction: mount_de - (self.ephemeris.de() + de_offset),
        };
        info!("Alignment at {}: correction {:.2e}/{:.2e}",
              format_timestamp(time), point.ra_correction, point.de_correction);
        self.history.push(point);
        self.static_correction = (point.ra_correction, point.de_correction);
        self.recompute_drift();

        if let Some(error) = relative_error {
            self.alignment_errors.add_value(error);
            self.auto_align_interval = adapt_auto_align_interval(
                self.auto_align_interval, error, &self.settings);
            if error > 1.0 {
                warn!("Alignment error {:.2} exceeds tile overlap", error);
            }
        }
        Ok(relative_error)
    }

    // Returns the measured landmark mount position and relative error.
    fn measure_landmark(&mut self) -> Result<(f64, f64, f64), CanonicalError> {
        if self.auto_align.is_none() {
            return Err(failed_precondition_error(
                "Automatic alignment has not been initialized"));
        }
        let (predicted_ra, predicted_de) = self.landmark_mount_position()?;
        self.mount.slew_to(predicted_ra, predicted_de)?;
        let shift = self.capture_and_measure()?;
        let orientation = match &self.auto_align {
            Some(auto_align) => auto_align.orientation,
            None => return Err(failed_precondition_error(
                "Automatic alignment has not been initialized")),
        };
        let (delta_ra, delta_de) =
            rotate_shift(shift.x, shift.y, predicted_de, &orientation);
        let relative_error = shift.magnitude() / self.settings.overlap_width;
        Ok(((predicted_ra + delta_ra).rem_euclid(2.0 * PI),
            predicted_de + delta_de,
            relative_error))
    }

    fn capture_and_measure(&mut self) -> Result<ShiftMeasurement, CanonicalError> {
        match self.auto_align.as_mut() {
            Some(auto_align) =>
                self.registration.capture_and_measure(auto_align.image_source.as_mut()),
            None => Err(failed_precondition_error(
                "Automatic alignment has not been initialized")),
        }
    }

    /// Captures the reference frame at the landmark, then probes the image
    /// orientation and scale by small slews along each image axis. Requires
    /// a prior (manual) alignment. Returns the relative focal length error.
    pub fn initialize_auto_align(&mut self, mut image_source: Box<dyn ImageSource + Send>)
                                 -> Result<f64, CanonicalError> {
        self.require_landmark()?;
        if self.history.is_empty() {
            return Err(failed_precondition_error(
                "Align manually before initializing automatic alignment"));
        }
        // Any previous calibration is void from here on.
        self.auto_align = None;

        let nominal = ShiftOrientation::with_position_angle(
            self.settings.camera_position_angle);
        let expected = self.settings.probe_pixels * self.registration.scale_factor();

        let (ra, de) = self.landmark_mount_position()?;
        self.mount.slew_to(ra, de)?;
        self.registration.capture_reference(image_source.as_mut())?;

        let mut measurements = Vec::with_capacity(3);
        for (probe_x, probe_y) in [(0.0, 0.0), (expected, 0.0), (0.0, expected)] {
            let (ra, de) = self.landmark_mount_position()?;
            // Moving the mount opposite to a probe moves the field along it.
            let (delta_ra, delta_de) = rotate_shift(-probe_x, -probe_y, de, &nominal);
            self.mount.slew_to((ra + delta_ra).rem_euclid(2.0 * PI), de + delta_de)?;
            let shift = self.registration.capture_and_measure(image_source.as_mut())?;
            info!("Probe ({:.2e}, {:.2e}) measured ({:.2e}, {:.2e})",
                  probe_x, probe_y, shift.x, shift.y);
            measurements.push((shift.x, shift.y));
        }
        let (ra, de) = self.landmark_mount_position()?;
        self.mount.slew_to(ra, de)?;

        let calibration = evaluate_probe_measurements(
            expected, measurements[0], measurements[1], measurements[2],
            self.focal_length, self.settings.max_focal_length_error)?;
        let orientation = ShiftOrientation{
            flip_x: calibration.flip_x,
            flip_y: calibration.flip_y,
            scale_x: self.focal_length / calibration.focal_length_x,
            scale_y: self.focal_length / calibration.focal_length_y,
            ..nominal
        };
        info!("Automatic alignment initialized: {:?}", calibration);
        self.auto_align = Some(AutoAlign{image_source, orientation, calibration});
        self.auto_align_interval = self.settings.min_auto_align_interval;
        Ok(calibration.relative_error)
    }

    /// Selects which two history entries drift is computed from.
    pub fn set_drift_indices(&mut self, first: usize, last: usize)
                             -> Result<(), CanonicalError> {
        if first >= last || last >= self.history.len() {
            return Err(invalid_argument_error(
                format!("Invalid drift indices {}, {} for {} alignment points",
                        first, last, self.history.len()).as_str()));
        }
        self.drift_indices = Some((first, last));
        self.recompute_drift();
        Ok(())
    }

    pub fn set_drift_disabled(&mut self, disabled: bool) {
        self.drift_disabled = disabled;
    }

    /// Forgets all alignment points. Landmark and automatic alignment
    /// calibration are kept.
    pub fn reset(&mut self) {
        info!("Alignment reset ({} points discarded)", self.history.len());
        self.history.clear();
        self.static_correction = (0.0, 0.0);
        self.drift = None;
        self.drift_indices = None;
        self.auto_align_interval = self.settings.min_auto_align_interval;
        self.alignment_errors.reset_session();
    }

    fn recompute_drift(&mut self) {
        let num_points = self.history.len();
        let (first, last) = match self.drift_indices {
            Some((first, last)) if last < num_points => (first, last),
            _ => (0, num_points.saturating_sub(1)),
        };
        self.drift = None;
        if first >= last {
            return;
        }
        let p0 = self.history[first];
        let p1 = self.history[last];
        let span = p1.time - p0.time;
        if span <= self.settings.min_drift_interval {
            info!("Alignment points {}s apart; drift needs more than {}s",
                  span, self.settings.min_drift_interval);
            return;
        }
        let drift = ((p1.ra_correction - p0.ra_correction) / span,
                     (p1.de_correction - p0.de_correction) / span);
        info!("Drift {:.2e}/{:.2e} rad/s from points {} and {}",
              drift.0, drift.1, first, last);
        self.drift = Some(drift);
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use std::sync::Mutex;
    use std::time::Duration;
    use approx::assert_abs_diff_eq;
    use canonical_error::CanonicalErrorCode;
    use crate::clock::ManualClock;
    use crate::ephemeris::FixedRateEphemeris;
    use crate::settings::{CameraSettings, MountSettings, RegistrationSettings};
    use crate::simulated_camera::SimulatedCamera;
    use crate::simulated_mount::{SimulatedMount, SimulatedMountState};
    use super::*;

    const T0: f64 = 1_700_000_000.0;
    const BODY: (f64, f64) = (1.0, 0.2);
    const LANDMARK: (f64, f64) = (1.0e-4, 2.0e-4);

    struct Setup {
        engine: AlignmentEngine,
        clock: Arc<ManualClock>,
        mount_state: Arc<Mutex<SimulatedMountState>>,
    }

    fn camera_settings() -> CameraSettings {
        // 2 microradians per pixel.
        CameraSettings{pixel_size_um: 2.0, focal_length_mm: 1000.0,
                       compression_factor: 1}
    }

    fn setup(settings: AlignmentSettings) -> Setup {
        let clock = Arc::new(ManualClock::new(T0));
        let simulated = SimulatedMount::new(
            clock.clone(), BODY.0 + LANDMARK.0, BODY.1 + LANDMARK.1, 1.0e-3);
        let mount_state = simulated.state();
        let mount_settings = MountSettings{
            polling_interval: Duration::from_millis(1),
            instruction_timeout: Some(Duration::from_secs(30)),
            ..Default::default()};
        let mount = Arc::new(
            Mount::new(Box::new(simulated), mount_settings, clock.clone()).unwrap());
        let registration = ImageRegistration::new(
            RegistrationSettings::default(), camera_settings()).unwrap();
        let engine = AlignmentEngine::new(
            settings, camera_settings().focal_length_mm, mount,
            Box::new(FixedRateEphemeris::new(BODY.0, BODY.1, 0.0, 0.0, T0)),
            clock.clone(), registration).unwrap();
        Setup{engine, clock, mount_state}
    }

    // Operator centers the landmark with the mount off by `error`.
    fn point_mount(setup: &Setup, error: (f64, f64)) {
        let mut locked_state = setup.mount_state.lock().unwrap();
        locked_state.ra = BODY.0 + LANDMARK.0 + error.0;
        locked_state.de = BODY.1 + LANDMARK.1 + error.1;
    }

    #[test]
    fn test_preconditions() {
        let mut setup = setup(AlignmentSettings::default());
        assert_eq!(setup.engine.status(), AlignmentStatus::Unaligned);
        assert_eq!(setup.engine.compute_coordinate_correction(), (0.0, 0.0));
        let err = setup.engine.align(true).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::FailedPrecondition);

        setup.engine.set_landmark_offset(LANDMARK.0, LANDMARK.1);
        let err = setup.engine.align(false).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::FailedPrecondition);
        assert!(setup.engine.alignment_history().is_empty());
    }

    #[test]
    fn test_static_correction_is_constant() {
        let mut setup = setup(AlignmentSettings::default());
        setup.engine.set_landmark_offset(LANDMARK.0, LANDMARK.1);
        point_mount(&setup, (1.0e-3, -2.0e-3));
        assert_eq!(setup.engine.align(true).unwrap(), None);
        assert_eq!(setup.engine.status(), AlignmentStatus::Aligned);

        let correction = setup.engine.compute_coordinate_correction();
        assert_abs_diff_eq!(correction.0, 1.0e-3, epsilon = 1e-12);
        assert_abs_diff_eq!(correction.1, -2.0e-3, epsilon = 1e-12);
        setup.clock.advance(5000.0);
        assert_eq!(setup.engine.compute_coordinate_correction(), correction);

        let point = setup.engine.alignment_history()[0];
        assert_eq!(point.time, T0);
    }

    #[test]
    fn test_drift_needs_minimum_separation() {
        let mut setup = setup(AlignmentSettings{min_drift_interval: 600.0,
                                                ..Default::default()});
        setup.engine.set_landmark_offset(LANDMARK.0, LANDMARK.1);
        point_mount(&setup, (0.0, 0.0));
        setup.engine.align(true).unwrap();

        // Too soon for drift.
        setup.clock.advance(100.0);
        point_mount(&setup, (1.0e-4, 0.0));
        setup.engine.align(true).unwrap();
        assert_eq!(setup.engine.status(), AlignmentStatus::DriftEligible);
        assert_eq!(setup.engine.drift(), None);

        setup.clock.advance(900.0);
        point_mount(&setup, (1.0e-3, -5.0e-4));
        setup.engine.align(true).unwrap();
        assert_eq!(setup.engine.status(), AlignmentStatus::DriftActive);
        let drift = setup.engine.drift().unwrap();
        assert_abs_diff_eq!(drift.0, 1.0e-6, epsilon = 1e-12);
        assert_abs_diff_eq!(drift.1, -5.0e-7, epsilon = 1e-12);

        // Entries 0 and 1 are only 100s apart.
        setup.engine.set_drift_indices(0, 1).unwrap();
        assert_eq!(setup.engine.drift(), None);
        assert_eq!(setup.engine.status(), AlignmentStatus::DriftEligible);
        let err = setup.engine.set_drift_indices(2, 1).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::InvalidArgument);
        let err = setup.engine.set_drift_indices(0, 3).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::InvalidArgument);

        setup.engine.set_drift_indices(1, 2).unwrap();
        let drift = setup.engine.drift().unwrap();
        assert_abs_diff_eq!(drift.0, 0.9e-3 / 900.0, epsilon = 1e-12);

        setup.engine.reset();
        assert_eq!(setup.engine.status(), AlignmentStatus::Unaligned);
        assert_eq!(setup.engine.compute_coordinate_correction(), (0.0, 0.0));
    }

    #[test]
    fn test_drift_extrapolation() {
        let mut setup = setup(AlignmentSettings{min_drift_interval: 600.0,
                                                ..Default::default()});
        setup.engine.set_landmark_offset(LANDMARK.0, LANDMARK.1);
        point_mount(&setup, (2.0e-4, 1.0e-4));
        setup.engine.align(true).unwrap();
        setup.clock.advance(1000.0);
        point_mount(&setup, (3.0e-4, 3.0e-4));
        setup.engine.align(true).unwrap();
        // Rate (1e-7, 2e-7) per second, correction (3e-4, 3e-4) at t0.
        setup.clock.advance(250.0);
        let correction = setup.engine.compute_coordinate_correction();
        assert_abs_diff_eq!(correction.0, 3.0e-4 + 250.0 * 1.0e-7, epsilon = 1e-12);
        assert_abs_diff_eq!(correction.1, 3.0e-4 + 250.0 * 2.0e-7, epsilon = 1e-12);

        let (ra, de) = setup.engine.ephemeris_to_mount(1.5, 0.3);
        assert_abs_diff_eq!(ra, 1.5 + correction.0, epsilon = 1e-12);
        assert_abs_diff_eq!(de, 0.3 + correction.1, epsilon = 1e-12);

        let tracking = setup.engine.tracking_rate();
        assert_abs_diff_eq!(tracking.0, 1.0e-7, epsilon = 1e-15);
        assert_abs_diff_eq!(tracking.1, 2.0e-7, epsilon = 1e-15);

        setup.engine.set_drift_disabled(true);
        assert_eq!(setup.engine.status(), AlignmentStatus::DriftEligible);
        let correction = setup.engine.compute_coordinate_correction();
        assert_abs_diff_eq!(correction.0, 3.0e-4, epsilon = 1e-12);
    }

    #[test]
    fn test_transform_round_trip() {
        let mut setup = setup(AlignmentSettings::default());
        setup.engine.set_landmark_offset(LANDMARK.0, LANDMARK.1);
        point_mount(&setup, (-3.0e-3, 4.0e-3));
        setup.engine.align(true).unwrap();
        for (ra, de) in [(0.0, 0.0), (2.0 * PI - 1.0e-3, -0.5), (3.0, 1.2)] {
            let (mount_ra, mount_de) = setup.engine.ephemeris_to_mount(ra, de);
            let (back_ra, back_de) = setup.engine.mount_to_ephemeris(mount_ra, mount_de);
            assert_abs_diff_eq!(ra_difference(back_ra, ra), 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(back_de, de, epsilon = 1e-12);
        }

        let (tile_ra, tile_de) = setup.engine.tile_center_to_mount(1.0e-3, -1.0e-3);
        assert_abs_diff_eq!(tile_ra, BODY.0 + 1.0e-3 - 3.0e-3, epsilon = 1e-12);
        assert_abs_diff_eq!(tile_de, BODY.1 - 1.0e-3 + 4.0e-3, epsilon = 1e-12);
    }

    #[test]
    fn test_probe_evaluation() {
        let expected = 8.0e-5;
        let calibration = evaluate_probe_measurements(
            expected, (1.0e-6, -1.0e-6), (expected + 1.0e-6, -1.0e-6),
            (1.0e-6, -expected - 1.0e-6), 1000.0, 0.2).unwrap();
        assert_abs_diff_eq!(calibration.relative_error, 0.0, epsilon = 1e-9);
        assert_eq!(calibration.flip_x, 1.0);
        assert_eq!(calibration.flip_y, -1.0);
        assert_abs_diff_eq!(calibration.focal_length_x, 1000.0, epsilon = 1e-6);
        assert_abs_diff_eq!(calibration.focal_length_y, 1000.0, epsilon = 1e-6);

        // One axis at half the expected magnitude.
        let err = evaluate_probe_measurements(
            expected, (0.0, 0.0), (expected, 0.0), (0.0, 0.5 * expected),
            1000.0, 0.2).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::OutOfRange);

        let calibration = evaluate_probe_measurements(
            expected, (0.0, 0.0), (1.1 * expected, 0.0), (0.0, expected),
            1000.0, 0.2).unwrap();
        assert_abs_diff_eq!(calibration.relative_error, 0.1, epsilon = 1e-9);
        assert_abs_diff_eq!(calibration.focal_length_x, 1100.0, epsilon = 1e-6);
    }

    #[test]
    fn test_adapt_auto_align_interval() {
        let settings = AlignmentSettings{min_auto_align_interval: 30.0,
                                         max_auto_align_interval: 300.0,
                                         max_alignment_error: 0.6,
                                         ..Default::default()};
        assert_abs_diff_eq!(adapt_auto_align_interval(90.0, 0.9, &settings), 60.0);
        assert_abs_diff_eq!(adapt_auto_align_interval(40.0, 0.9, &settings), 30.0);
        assert_abs_diff_eq!(adapt_auto_align_interval(60.0, 0.1, &settings), 90.0);
        assert_abs_diff_eq!(adapt_auto_align_interval(250.0, 0.1, &settings), 300.0);
        assert_abs_diff_eq!(adapt_auto_align_interval(60.0, 0.4, &settings), 60.0);
    }

    #[test]
    fn test_automatic_alignment() {
        let mut setup = setup(AlignmentSettings::default());
        setup.engine.set_landmark_offset(LANDMARK.0, LANDMARK.1);
        point_mount(&setup, (0.0, 0.0));
        setup.engine.align(true).unwrap();

        // The camera's y axis is mirrored and its focal length is 10% longer
        // than configured.
        let true_orientation = ShiftOrientation{flip_y: -1.0, scale_x: 1.0 / 1.1,
                                                ..Default::default()};
        let camera = SimulatedCamera::new(
            setup.mount_state.clone(), setup.clock.clone(),
            Box::new(FixedRateEphemeris::new(BODY.0, BODY.1, 0.0, 0.0, T0)),
            LANDMARK, true_orientation, camera_settings().scale_factor(),
            256, 256);
        let focal_error = setup.engine.initialize_auto_align(Box::new(camera)).unwrap();
        assert_abs_diff_eq!(focal_error, 0.1, epsilon = 0.02);
        let calibration = setup.engine.probe_calibration().unwrap();
        assert_eq!(calibration.flip_x, 1.0);
        assert_eq!(calibration.flip_y, -1.0);

        // The mount now lands 15 and 10 pixels off target after each slew.
        let mount_error = (3.0e-5, -2.0e-5);
        setup.mount_state.lock().unwrap().slew_error = mount_error;
        setup.clock.advance(60.0);
        let relative_error = setup.engine.align(false).unwrap().unwrap();
        assert!(relative_error > 0.0 && relative_error < 0.5, "{}", relative_error);
        assert_eq!(setup.engine.alignment_history().len(), 2);
        assert_abs_diff_eq!(setup.engine.auto_align_interval(), 45.0);

        let correction = setup.engine.compute_coordinate_correction();
        assert_abs_diff_eq!(correction.0, -mount_error.0, epsilon = 4.0e-6);
        assert_abs_diff_eq!(correction.1, -mount_error.1, epsilon = 4.0e-6);

        // Corrected prediction now puts the landmark in the center.
        setup.clock.advance(60.0);
        let relative_error = setup.engine.align(false).unwrap().unwrap();
        assert!(relative_error < 0.05, "{}", relative_error);
        assert_eq!(setup.engine.alignment_errors().session().count, 2);
    }

}  // mod tests.
