// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::f64::consts::FRAC_PI_2;

/// How displacements measured along image axes map onto the sky.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShiftOrientation {
    // Radians. Angle between image "up" and celestial north.
    pub position_angle: f64,

    // +1 or -1; -1 when the image axis is mirrored.
    pub flip_x: f64,
    pub flip_y: f64,

    // Multiplies the nominal plate scale, per image axis.
    pub scale_x: f64,
    pub scale_y: f64,
}

impl Default for ShiftOrientation {
    fn default() -> Self {
        ShiftOrientation{position_angle: 0.0,
                         flip_x: 1.0, flip_y: 1.0,
                         scale_x: 1.0, scale_y: 1.0}
    }
}

impl ShiftOrientation {
    pub fn with_position_angle(position_angle: f64) -> Self {
        ShiftOrientation{position_angle, ..Default::default()}
    }
}

/// Converts a displacement (x, y) along image axes (radians of arc at the
/// nominal plate scale) into (delta RA, delta DE) at declination `de`.
/// With zero position angle and no mirroring, image x runs along DE and
/// image y along RA.
pub fn rotate_shift(x: f64, y: f64, de: f64, orientation: &ShiftOrientation)
                    -> (f64, f64) {
    let x = x * orientation.flip_x * orientation.scale_x;
    let y = y * orientation.flip_y * orientation.scale_y;
    let phi = orientation.position_angle + FRAC_PI_2;
    let (sin_phi, cos_phi) = phi.sin_cos();
    // Meridians converge toward the pole.
    let cos_de = de.cos().max(1.0e-6);
    ((y * sin_phi - x * cos_phi) / cos_de,
     x * sin_phi + y * cos_phi)
}

/// Inverse of rotate_shift().
pub fn unrotate_shift(delta_ra: f64, delta_de: f64, de: f64,
                      orientation: &ShiftOrientation) -> (f64, f64) {
    let phi = orientation.position_angle + FRAC_PI_2;
    let (sin_phi, cos_phi) = phi.sin_cos();
    let u = delta_ra * de.cos().max(1.0e-6);
    let x = delta_de * sin_phi - u * cos_phi;
    let y = u * sin_phi + delta_de * cos_phi;
    (x / (orientation.flip_x * orientation.scale_x),
     y / (orientation.flip_y * orientation.scale_y))
}

// mod tests.
