// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};

use canonical_error::{CanonicalError, unavailable_error};
use image::{GrayImage, Luma};
use image::imageops::crop_imm;
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
use imageproc::rect::Rect;
use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::clock::Clock;
use crate::ephemeris::Ephemeris;
use crate::frame_rotation::{ShiftOrientation, unrotate_shift};
use crate::image_registration::{ImageSource, RawImage};
use crate::mount_driver::ra_difference;
use crate::simulated_mount::SimulatedMountState;

/// Renders what a camera on a SimulatedMount would see of a synthetic
/// cratered landscape fixed to the landmark.
pub struct SimulatedCamera {
    mount_state: Arc<Mutex<SimulatedMountState>>,
    clock: Arc<dyn Clock + Send + Sync>,
    ephemeris: Box<dyn Ephemeris + Send>,
    landmark_offset: (f64, f64),

    // True relation of image axes to the sky, and radians per pixel at the
    // nominal plate scale.
    orientation: ShiftOrientation,
    scale_factor: f64,

    width: u32,
    height: u32,
    scene: GrayImage,
}

impl SimulatedCamera {
    pub fn new(mount_state: Arc<Mutex<SimulatedMountState>>,
               clock: Arc<dyn Clock + Send + Sync>,
               ephemeris: Box<dyn Ephemeris + Send>,
               landmark_offset: (f64, f64),
               orientation: ShiftOrientation,
               scale_factor: f64,
               width: u32, height: u32) -> Self {
        let scene = render_landscape(2 * width, 2 * height, 11);
        SimulatedCamera{mount_state, clock, ephemeris, landmark_offset,
                        orientation, scale_factor, width, height, scene}
    }
}

/// Deterministic field of bright craters and blocks on a dark background.
pub fn render_landscape(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut image = GrayImage::from_pixel(width, height, Luma([30]));
    let mut rng = SmallRng::seed_from_u64(seed);
    let num_shapes = (width as u64 * height as u64 / 900).max(1);
    for _ in 0..num_shapes {
        let x = rng.gen_range(-20..width as i32 + 20);
        let y = rng.gen_range(-20..height as i32 + 20);
        let shade = Luma([rng.gen_range(80..=255)]);
        if rng.gen_bool(0.5) {
            draw_filled_circle_mut(&mut image, (x, y), rng.gen_range(3..9), shade);
        } else {
            let rect = Rect::at(x, y).of_size(rng.gen_range(4..16),
                                              rng.gen_range(4..16));
            draw_filled_rect_mut(&mut image, rect, shade);
        }
    }
    image
}

impl ImageSource for SimulatedCamera {
    fn acquire_still_image(&mut self, _compression_factor: u32)
                           -> Result<RawImage, CanonicalError> {
        let (ra, de) = {
            let locked_state = self.mount_state.lock().unwrap();
            if !locked_state.connected {
                return Err(unavailable_error("Simulated mount is not connected"));
            }
            (locked_state.ra, locked_state.de)
        };
        self.ephemeris.update(self.clock.now());
        let landmark_ra = self.ephemeris.ra() + self.landmark_offset.0;
        let landmark_de = self.ephemeris.de() + self.landmark_offset.1;

        // The landmark relative to where the camera points, in pixels.
        let (x, y) = unrotate_shift(ra_difference(landmark_ra, ra),
                                    landmark_de - de, de, &self.orientation);
        let dx = (x / self.scale_factor).round() as i64;
        let dy = (y / self.scale_factor).round() as i64;
        debug!("Simulated still image shifted {}/{} pixels", dx, dy);

        let max_x = (self.scene.width() - self.width) as i64;
        let max_y = (self.scene.height() - self.height) as i64;
        let left = (max_x / 2 - dx).clamp(0, max_x) as u32;
        let top = (max_y / 2 - dy).clamp(0, max_y) as u32;
        let image = crop_imm(&self.scene, left, top, self.width, self.height)
            .to_image();
        Ok(RawImage{pixels: image.into_raw(), width: self.width,
                    height: self.height, bit_depth: 1})
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::ManualClock;
    use crate::ephemeris::FixedRateEphemeris;
    use crate::mount_driver::MountDriver;
    use crate::simulated_mount::SimulatedMount;
    use super::*;

    #[test]
    fn test_view_follows_pointing() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut mount = SimulatedMount::new(clock.clone(), 1.0, 0.0, 1.0e-4);
        mount.connect().unwrap();
        let mount_state = mount.state();
        let scale = 1.0e-5;
        let mut camera = SimulatedCamera::new(
            mount_state.clone(), clock.clone(),
            Box::new(FixedRateEphemeris::new(1.0, 0.0, 0.0, 0.0, 0.0)),
            (0.0, 0.0), ShiftOrientation::default(), scale, 64, 48);
        let centered = camera.acquire_still_image(1).unwrap();
        assert_eq!((centered.width, centered.height), (64, 48));
        assert_eq!(centered.pixels.len(), 64 * 48);

        // Point 5 pixels south: the landmark appears 5 pixels along +x.
        mount_state.lock().unwrap().de = -5.0 * scale;
        let moved = camera.acquire_still_image(1).unwrap();
        for y in 0..48 {
            for x in 5..64 {
                assert_eq!(moved.pixels[y * 64 + x], centered.pixels[y * 64 + x - 5]);
            }
        }

        mount_state.lock().unwrap().connected = false;
        assert!(camera.acquire_still_image(1).is_err());
    }

}  // mod tests.
