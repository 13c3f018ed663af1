// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;
use std::time::Instant;

use canonical_error::{CanonicalError, failed_precondition_error, not_found_error};
use image::GrayImage;
use imageproc::corners::corners_fast9;
use imageproc::filter::gaussian_blur_f32;
use log::{debug, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::clustering::{dbscan, largest_cluster};
use crate::image_utils::{normalize_local_contrast, pixels_to_gray8};
use crate::settings::{CameraSettings, RegistrationSettings};

/// Still image as delivered by the camera. `bit_depth` is bytes per pixel.
#[derive(Clone, Debug)]
pub struct RawImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub bit_depth: u32,
}

pub trait ImageSource {
    /// Blocks for the exposure and transfer. The source bins by
    /// `compression_factor` in each dimension.
    fn acquire_still_image(&mut self, compression_factor: u32)
                           -> Result<RawImage, CanonicalError>;
}

/// 256-bit binary intensity-comparison descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Descriptor(pub [u64; 4]);

impl Descriptor {
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0.iter().zip(other.0.iter()).map(|(a, b)| (a ^ b).count_ones()).sum()
    }
}

#[derive(Clone, Debug)]
pub struct Feature {
    pub x: f64,
    pub y: f64,
    pub score: f32,
    pub descriptor: Descriptor,
}

/// Finds FAST corners and describes them with BRIEF-style descriptors. The
/// sampling pattern is fixed at construction so features from different
/// images are comparable.
pub struct FeatureExtractor {
    settings: RegistrationSettings,

    // Offsets of the two pixels compared for each descriptor bit.
    pairs: Vec<((i32, i32), (i32, i32))>,
}

impl FeatureExtractor {
    pub fn new(settings: &RegistrationSettings) -> Self {
        let r = settings.patch_radius as i32;
        let mut rng = SmallRng::seed_from_u64(42);
        let pairs = (0..256).map(|_| {
            ((rng.gen_range(-r..=r), rng.gen_range(-r..=r)),
             (rng.gen_range(-r..=r), rng.gen_range(-r..=r)))
        }).collect();
        FeatureExtractor{settings: settings.clone(), pairs}
    }

    pub fn extract(&self, image: &GrayImage) -> Vec<Feature> {
        let normalized =
            normalize_local_contrast(image, self.settings.contrast_radius);
        let mut corners = corners_fast9(&normalized, self.settings.fast_threshold);

        // Descriptors need the whole patch inside the image.
        let margin = self.settings.patch_radius + 1;
        let (width, height) = image.dimensions();
        corners.retain(|c| c.x >= margin && c.y >= margin &&
                       c.x + margin < width && c.y + margin < height);
        corners.sort_by(|a, b| b.score.total_cmp(&a.score));

        // Greedy non-maximum suppression, strongest first.
        let suppression_sq = (self.settings.suppression_radius *
                              self.settings.suppression_radius) as i64;
        let mut kept = Vec::<(u32, u32, f32)>::new();
        for corner in &corners {
            if kept.len() >= self.settings.max_features {
                break;
            }
            let crowded = kept.iter().any(|(x, y, _)| {
                let dx = *x as i64 - corner.x as i64;
                let dy = *y as i64 - corner.y as i64;
                dx * dx + dy * dy <= suppression_sq
            });
            if !crowded {
                kept.push((corner.x, corner.y, corner.score));
            }
        }

        let smoothed = gaussian_blur_f32(&normalized, self.settings.blur_sigma);
        kept.into_iter().map(|(x, y, score)| Feature{
            x: x as f64, y: y as f64, score,
            descriptor: self.describe(&smoothed, x as i32, y as i32),
        }).collect()
    }

    fn describe(&self, smoothed: &GrayImage, x: i32, y: i32) -> Descriptor {
        let mut bits = [0_u64; 4];
        for (i, ((x1, y1), (x2, y2))) in self.pairs.iter().enumerate() {
            let p1 = smoothed.get_pixel((x + x1) as u32, (y + y1) as u32).0[0];
            let p2 = smoothed.get_pixel((x + x2) as u32, (y + y2) as u32).0[0];
            if p1 < p2 {
                bits[i / 64] |= 1 << (i % 64);
            }
        }
        Descriptor(bits)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureMatch {
    pub reference: usize,
    pub comparison: usize,
    pub distance: u32,
}

fn nearest(descriptor: &Descriptor, candidates: &[Feature]) -> Option<(usize, u32)> {
    candidates.iter().enumerate()
        .map(|(i, f)| (i, descriptor.distance(&f.descriptor)))
        .min_by_key(|(_, d)| *d)
}

/// Pairs each reference feature with its nearest comparison feature, keeping
/// only pairs that are each other's nearest neighbor and, if given, no
/// farther apart than `max_distance`.
pub fn mutual_matches(reference: &[Feature], comparison: &[Feature],
                      max_distance: Option<u32>) -> Vec<FeatureMatch> {
    let backward: Vec<Option<usize>> = comparison.iter()
        .map(|f| nearest(&f.descriptor, reference).map(|(i, _)| i))
        .collect();
    let mut matches = Vec::new();
    for (r, feature) in reference.iter().enumerate() {
        let Some((c, distance)) = nearest(&feature.descriptor, comparison) else {
            continue;
        };
        if backward[c] != Some(r) {
            continue;
        }
        if max_distance.is_some_and(|max| distance > max) {
            continue;
        }
        matches.push(FeatureMatch{reference: r, comparison: c, distance});
    }
    matches
}

/// Displacement of the comparison image's content relative to the reference
/// image, in radians along the image axes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShiftMeasurement {
    pub x: f64,
    pub y: f64,
    // Correspondences agreeing on the shift.
    pub in_cluster: usize,
    pub outliers: usize,
}

impl ShiftMeasurement {
    pub fn magnitude(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

/// Matches the two feature sets and returns the dominant displacement,
/// scaled from pixels by `scale_factor`. Fails with NotFound when fewer than
/// `min_cluster_size` matches agree.
pub fn measure_shift(reference: &[Feature], comparison: &[Feature],
                     settings: &RegistrationSettings, scale_factor: f64)
                     -> Result<ShiftMeasurement, CanonicalError> {
    let matches = mutual_matches(reference, comparison,
                                 Some(settings.max_match_distance));
    let displacements: Vec<(f64, f64)> = matches.iter().map(|m| {
        (comparison[m.comparison].x - reference[m.reference].x,
         comparison[m.comparison].y - reference[m.reference].y)
    }).collect();
    let labels = dbscan(&displacements, settings.cluster_radius,
                        settings.cluster_min_samples);
    let members = largest_cluster(&labels);
    if members.len() < settings.min_cluster_size {
        return Err(not_found_error(
            format!("Only {} of {} matches agree on a shift; need {}",
                    members.len(), matches.len(),
                    settings.min_cluster_size).as_str()));
    }
    let n = members.len() as f64;
    let sum_x: f64 = members.iter().map(|i| displacements[*i].0).sum();
    let sum_y: f64 = members.iter().map(|i| displacements[*i].1).sum();
    Ok(ShiftMeasurement{
        x: sum_x / n * scale_factor,
        y: sum_y / n * scale_factor,
        in_cluster: members.len(),
        outliers: matches.len() - members.len(),
    })
}

/// Image and features that later captures are compared against.
#[derive(Debug)]
pub struct ReferenceFrame {
    pub image: GrayImage,
    pub features: Vec<Feature>,
}

/// Measures how far the camera's view has moved since the reference frame
/// was captured.
pub struct ImageRegistration {
    settings: RegistrationSettings,
    camera: CameraSettings,
    extractor: FeatureExtractor,

    // Replaced, never modified, by set_reference().
    reference: Option<Arc<ReferenceFrame>>,
}

impl ImageRegistration {
    pub fn new(settings: RegistrationSettings, camera: CameraSettings)
               -> Result<Self, CanonicalError> {
        settings.validate()?;
        camera.validate()?;
        let extractor = FeatureExtractor::new(&settings);
        Ok(ImageRegistration{settings, camera, extractor, reference: None})
    }

    /// Radians per image pixel.
    pub fn scale_factor(&self) -> f64 {
        self.camera.scale_factor()
    }

    pub fn capture(&self, source: &mut dyn ImageSource)
                   -> Result<GrayImage, CanonicalError> {
        let raw = source.acquire_still_image(self.camera.compression_factor)?;
        pixels_to_gray8(&raw.pixels, raw.width, raw.height, raw.bit_depth)
    }

    pub fn set_reference(&mut self, image: GrayImage) -> Arc<ReferenceFrame> {
        let features = self.extractor.extract(&image);
        info!("Reference frame {}x{} with {} features",
              image.width(), image.height(), features.len());
        let reference = Arc::new(ReferenceFrame{image, features});
        self.reference = Some(reference.clone());
        reference
    }

    pub fn capture_reference(&mut self, source: &mut dyn ImageSource)
                             -> Result<Arc<ReferenceFrame>, CanonicalError> {
        let image = self.capture(source)?;
        Ok(self.set_reference(image))
    }

    pub fn reference(&self) -> Option<Arc<ReferenceFrame>> {
        self.reference.clone()
    }

    pub fn measure(&self, image: &GrayImage) -> Result<ShiftMeasurement, CanonicalError> {
        let Some(reference) = self.reference.clone() else {
            return Err(failed_precondition_error("No reference frame captured"));
        };
        let start = Instant::now();
        let features = self.extractor.extract(image);
        let shift = measure_shift(&reference.features, &features,
                                  &self.settings, self.scale_factor())?;
        debug!("Measured shift {:.2e}/{:.2e} ({} agree, {} outliers) in {:?}",
               shift.x, shift.y, shift.in_cluster, shift.outliers,
               start.elapsed());
        Ok(shift)
    }

    pub fn capture_and_measure(&self, source: &mut dyn ImageSource)
                               -> Result<ShiftMeasurement, CanonicalError> {
        let image = self.capture(source)?;
        self.measure(&image)
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use canonical_error::CanonicalErrorCode;
    use image::Luma;
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
    use imageproc::rect::Rect;
    use super::*;

    fn feature(x: f64, y: f64, descriptor: Descriptor) -> Feature {
        Feature{x, y, score: 1.0, descriptor}
    }

    // 15 features shifted by about (12, -4) and 5 shifted at random.
    fn clustered_feature_sets() -> (Vec<Feature>, Vec<Feature>) {
        let mut rng = SmallRng::seed_from_u64(7);
        let outlier_shifts = [(-30.0, 25.0), (40.0, 40.0), (-50.0, -10.0),
                              (5.0, 60.0), (70.0, -35.0)];
        let mut reference = Vec::new();
        let mut comparison = Vec::new();
        for i in 0..20 {
            let descriptor = Descriptor([rng.gen(), rng.gen(), rng.gen(), rng.gen()]);
            let (x, y) = (20.0 + 13.0 * i as f64, 300.0 - 7.0 * i as f64);
            reference.push(feature(x, y, descriptor));
            let (dx, dy) = if i < 15 {
                let jitter = 0.05 * ((i % 3) as f64 - 1.0);
                (12.0 + jitter, -4.0 - jitter)
            } else {
                outlier_shifts[i - 15]
            };
            comparison.push(feature(x + dx, y + dy, descriptor));
        }
        (reference, comparison)
    }

    #[test]
    fn test_descriptor_distance() {
        let a = Descriptor([0, 0, 0, 0]);
        let b = Descriptor([0b1011, 0, u64::MAX, 1 << 63]);
        assert_eq!(a.distance(&a), 0);
        assert_eq!(a.distance(&b), 3 + 64 + 1);
    }

    #[test]
    fn test_mutual_matches() {
        let d0 = Descriptor([0, 0, 0, 0]);
        let d1 = Descriptor([u64::MAX, 0, 0, 0]);
        let d2 = Descriptor([u64::MAX, u64::MAX, 0, 0]);
        let reference = vec![feature(0.0, 0.0, d0), feature(1.0, 1.0, d1)];
        let comparison = vec![feature(5.0, 5.0, d1), feature(6.0, 6.0, d2)];
        let matches = mutual_matches(&reference, &comparison, None);
        // d0's nearest is d1 but d1's nearest is d1: only one mutual pair.
        assert_eq!(matches, vec![FeatureMatch{reference: 1, comparison: 0,
                                              distance: 0}]);
        assert!(mutual_matches(&reference, &[], None).is_empty());
    }

    #[test]
    fn test_measure_shift_dominant_cluster() {
        let (reference, comparison) = clustered_feature_sets();
        let settings = RegistrationSettings{min_cluster_size: 10,
                                            ..Default::default()};
        let scale = 2.0e-6;
        let shift = measure_shift(&reference, &comparison, &settings, scale).unwrap();
        assert_abs_diff_eq!(shift.x, 12.0 * scale, epsilon = 1e-12);
        assert_abs_diff_eq!(shift.y, -4.0 * scale, epsilon = 1e-12);
        assert_eq!(shift.in_cluster, 15);
        assert_eq!(shift.outliers, 5);

        let settings = RegistrationSettings{min_cluster_size: 20,
                                            ..Default::default()};
        let err = measure_shift(&reference, &comparison, &settings, scale)
            .unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::NotFound);
    }

    // Deterministic cratered texture, offset by (dx, dy) pixels.
    fn render_scene(dx: i32, dy: i32) -> GrayImage {
        let mut image = GrayImage::from_pixel(256, 256, Luma([30]));
        let mut rng = SmallRng::seed_from_u64(11);
        for _ in 0..70 {
            let x = rng.gen_range(-20..276) + dx;
            let y = rng.gen_range(-20..276) + dy;
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

    #[test]
    fn test_registration_of_shifted_images() {
        let camera = CameraSettings{pixel_size_um: 2.0, focal_length_mm: 1000.0,
                                    compression_factor: 1};
        let mut registration =
            ImageRegistration::new(RegistrationSettings::default(), camera).unwrap();
        let err = registration.measure(&render_scene(0, 0)).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::FailedPrecondition);

        let reference = registration.set_reference(render_scene(0, 0));
        assert!(reference.features.len() >= 20);

        let shift = registration.measure(&render_scene(7, -3)).unwrap();
        let scale = registration.scale_factor();
        assert_abs_diff_eq!(shift.x / scale, 7.0, epsilon = 0.25);
        assert_abs_diff_eq!(shift.y / scale, -3.0, epsilon = 0.25);
        assert!(shift.in_cluster >= 10);
    }

    struct FixedSource {
        image: RawImage,
    }

    impl ImageSource for FixedSource {
        fn acquire_still_image(&mut self, _compression_factor: u32)
                               -> Result<RawImage, CanonicalError> {
            Ok(self.image.clone())
        }
    }

    #[test]
    fn test_capture_identical_frame() {
        let scene = render_scene(0, 0);
        let mut source = FixedSource{image: RawImage{
            width: scene.width(), height: scene.height(), bit_depth: 1,
            pixels: scene.into_raw()}};
        let mut registration = ImageRegistration::new(
            RegistrationSettings::default(), CameraSettings::default()).unwrap();
        let reference = registration.capture_reference(&mut source).unwrap();
        assert!(Arc::ptr_eq(&reference, &registration.reference().unwrap()));
        let shift = registration.capture_and_measure(&mut source).unwrap();
        assert_eq!(shift.x, 0.0);
        assert_eq!(shift.y, 0.0);
        assert_eq!(shift.outliers, 0);
    }

}  // mod tests.
