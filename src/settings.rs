// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use canonical_error::{CanonicalError, invalid_argument_error};

pub const ARCSEC: f64 = std::f64::consts::PI / (180.0 * 3600.0);

// Radians per second.
pub const SIDEREAL_RATE: f64 = 15.041 * ARCSEC;

/// Parameters governing the command queue and the mount facade.
#[derive(Clone, Debug)]
pub struct MountSettings {
    // Interval between successive position samples while waiting for the
    // mount to settle, and between iterations of repeating instructions.
    pub polling_interval: Duration,

    // Two consecutive position samples closer than this (in both axes) mean
    // the mount has settled.
    pub lookup_precision_arcsec: f64,

    // Upper bound on position samples taken while waiting to settle.
    pub max_settle_samples: usize,

    // None means wait forever for an instruction to complete.
    pub instruction_timeout: Option<Duration>,

    // Speed (radians per second) at which a guide pulse moves the mount.
    pub guide_rate: f64,

    // Longest single pulse issued while guiding.
    pub max_guide_pulse: Duration,

    // Length of the test pulses issued by calibrate().
    pub calibration_pulse: Duration,

    // Length of each pulse issued while nudging.
    pub nudge_pulse: Duration,
}

impl Default for MountSettings {
    fn default() -> Self {
        MountSettings{
            polling_interval: Duration::from_millis(200),
            lookup_precision_arcsec: 1.0,
            max_settle_samples: 100,
            instruction_timeout: Some(Duration::from_secs(180)),
            guide_rate: 0.5 * SIDEREAL_RATE,
            max_guide_pulse: Duration::from_secs(1),
            calibration_pulse: Duration::from_secs(2),
            nudge_pulse: Duration::from_millis(500),
        }
    }
}

impl MountSettings {
    pub fn lookup_precision(&self) -> f64 {
        self.lookup_precision_arcsec * ARCSEC
    }

    pub fn validate(&self) -> Result<(), CanonicalError> {
        if self.lookup_precision_arcsec <= 0.0 {
            return Err(invalid_argument_error(
                format!("lookup_precision_arcsec must be positive; got {}",
                        self.lookup_precision_arcsec).as_str()));
        }
        if self.max_settle_samples < 2 {
            return Err(invalid_argument_error(
                format!("max_settle_samples must be at least 2; got {}",
                        self.max_settle_samples).as_str()));
        }
        if self.guide_rate <= 0.0 {
            return Err(invalid_argument_error(
                format!("guide_rate must be positive; got {}",
                        self.guide_rate).as_str()));
        }
        Ok(())
    }
}

/// Parameters of the alignment engine.
#[derive(Clone, Debug)]
pub struct AlignmentSettings {
    // Seconds. Two alignment points closer together than this in time are not
    // used for drift computation.
    pub min_drift_interval: f64,

    // Seconds. Bounds for the adaptive automatic alignment interval.
    pub min_auto_align_interval: f64,
    pub max_auto_align_interval: f64,

    // Relative alignment error (fraction of `overlap_width`) above which the
    // automatic alignment interval is shortened.
    pub max_alignment_error: f64,

    // Radians. Angular overlap between adjacent panorama tiles.
    pub overlap_width: f64,

    // Relative discrepancy between measured and expected probe shifts above
    // which auto-align initialization fails.
    pub max_focal_length_error: f64,

    // Pixels. Size of the probe displacements used by auto-align
    // initialization.
    pub probe_pixels: f64,

    // Radians. Position angle of the camera relative to celestial north.
    pub camera_position_angle: f64,
}

impl Default for AlignmentSettings {
    fn default() -> Self {
        AlignmentSettings{
            min_drift_interval: 600.0,
            min_auto_align_interval: 30.0,
            max_auto_align_interval: 300.0,
            max_alignment_error: 0.5,
            overlap_width: 120.0 * ARCSEC,
            max_focal_length_error: 0.2,
            probe_pixels: 40.0,
            camera_position_angle: 0.0,
        }
    }
}

impl AlignmentSettings {
    pub fn validate(&self) -> Result<(), CanonicalError> {
        if self.min_drift_interval < 0.0 {
            return Err(invalid_argument_error(
                format!("min_drift_interval must not be negative; got {}",
                        self.min_drift_interval).as_str()));
        }
        if self.min_auto_align_interval <= 0.0 ||
            self.max_auto_align_interval < self.min_auto_align_interval
        {
            return Err(invalid_argument_error(
                format!("Invalid auto-align interval range [{}, {}]",
                        self.min_auto_align_interval,
                        self.max_auto_align_interval).as_str()));
        }
        if self.overlap_width <= 0.0 {
            return Err(invalid_argument_error(
                format!("overlap_width must be positive; got {}",
                        self.overlap_width).as_str()));
        }
        if self.probe_pixels <= 0.0 {
            return Err(invalid_argument_error(
                format!("probe_pixels must be positive; got {}",
                        self.probe_pixels).as_str()));
        }
        Ok(())
    }
}

/// Optical parameters of the still camera.
#[derive(Clone, Debug)]
pub struct CameraSettings {
    pub pixel_size_um: f64,
    pub focal_length_mm: f64,
    // Binning applied by the image source; 1 means full resolution.
    pub compression_factor: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        CameraSettings{
            pixel_size_um: 3.75,
            focal_length_mm: 2000.0,
            compression_factor: 2,
        }
    }
}

impl CameraSettings {
    /// Radians per (compressed) image pixel.
    pub fn scale_factor(&self) -> f64 {
        self.pixel_size_um * 1.0e-3 * self.compression_factor as f64 /
            self.focal_length_mm
    }

    pub fn validate(&self) -> Result<(), CanonicalError> {
        if self.pixel_size_um <= 0.0 || self.focal_length_mm <= 0.0 {
            return Err(invalid_argument_error(
                format!("pixel_size_um and focal_length_mm must be positive; \
                         got {} and {}",
                        self.pixel_size_um, self.focal_length_mm).as_str()));
        }
        if self.compression_factor == 0 {
            return Err(invalid_argument_error(
                "compression_factor must be at least 1"));
        }
        Ok(())
    }
}

/// Tuning of feature extraction, matching and clustering.
#[derive(Clone, Debug)]
pub struct RegistrationSettings {
    // Strongest corners kept per image.
    pub max_features: usize,
    pub fast_threshold: u8,
    // Pixels. Weaker corners within this distance of a stronger one are
    // dropped.
    pub suppression_radius: u32,
    // Pixels. Half-size of the window for local contrast normalization.
    pub contrast_radius: u32,
    // Pixels. Half-size of the BRIEF sampling patch.
    pub patch_radius: u32,
    pub blur_sigma: f32,
    // Hamming distance (of 256 bits) above which a match is rejected.
    pub max_match_distance: u32,
    // Pixels. Neighborhood radius for displacement clustering.
    pub cluster_radius: f64,
    // Neighbors (including itself) a displacement needs to seed a cluster.
    pub cluster_min_samples: usize,
    // The dominant cluster must have at least this many members.
    pub min_cluster_size: usize,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        RegistrationSettings{
            max_features: 500,
            fast_threshold: 20,
            suppression_radius: 4,
            contrast_radius: 16,
            patch_radius: 12,
            blur_sigma: 1.5,
            max_match_distance: 64,
            cluster_radius: 1.5,
            cluster_min_samples: 3,
            min_cluster_size: 10,
        }
    }
}

impl RegistrationSettings {
    pub fn validate(&self) -> Result<(), CanonicalError> {
        if self.cluster_radius <= 0.0 {
            return Err(invalid_argument_error(
                format!("cluster_radius must be positive; got {}",
                        self.cluster_radius).as_str()));
        }
        if self.cluster_min_samples == 0 || self.min_cluster_size == 0 {
            return Err(invalid_argument_error(
                "cluster_min_samples and min_cluster_size must be positive"));
        }
        if self.patch_radius == 0 {
            return Err(invalid_argument_error("patch_radius must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        MountSettings::default().validate().unwrap();
        AlignmentSettings::default().validate().unwrap();
        CameraSettings::default().validate().unwrap();
        RegistrationSettings::default().validate().unwrap();
    }

    #[test]
    fn test_scale_factor() {
        let camera = CameraSettings{pixel_size_um: 2.0,
                                    focal_length_mm: 1000.0,
                                    compression_factor: 2};
        // 4um per compressed pixel over 1m is 4 microradians.
        assert_abs_diff_eq!(camera.scale_factor(), 4.0e-6, epsilon = 1.0e-12);
    }

    #[test]
    fn test_invalid_auto_align_range() {
        let settings = AlignmentSettings{min_auto_align_interval: 100.0,
                                         max_auto_align_interval: 50.0,
                                         ..Default::default()};
        assert!(settings.validate().is_err());
    }

}  // mod tests.
