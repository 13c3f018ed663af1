// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::{CanonicalError, invalid_argument_error};
use image::{GrayImage, Luma};
use imageproc::filter::box_filter;
use imageproc::stats::histogram;

fn compute_lut(min_pixel_value: u8,
               peak_pixel_value: u8,
               gamma: f32) -> [u8; 256] {
    let mut lut: [u8; 256] = [0; 256];
    let scale = 256.0 / ((peak_pixel_value - min_pixel_value) as f32).powf(gamma);
    for n in 0..=255 {
        if n < min_pixel_value {
            lut[n as usize] = 0;
            continue;
        }
        if n >= peak_pixel_value {
            lut[n as usize] = 255;
            continue;
        }
        lut[n as usize] = (scale * ((n - min_pixel_value) as f32).powf(gamma)) as u8;
    }
    lut
}

// Maps min_pixel_value..peak_pixel_value to 0..255 in place, applying a
// gamma and scale factor. No-op unless peak_pixel_value > min_pixel_value.
pub fn scale_image_mut(
    image: &mut GrayImage, min_pixel_value: u8, peak_pixel_value: u8, gamma: f32) {
    if peak_pixel_value <= min_pixel_value {
        return;
    }
    let lut = compute_lut(min_pixel_value, peak_pixel_value, gamma);

    for pixel in image.pixels_mut() {
        pixel[0] = lut[pixel[0] as usize];
    }
}

/// Converts raw still-image pixels to 8 bits. `bit_depth` is the number of
/// bytes per pixel: 1, or 2 for little-endian 16-bit data. Sixteen bit data
/// is shifted down just enough for its brightest pixel to fit in 8 bits, so
/// 10 or 12 bit sensors keep their full dynamic range.
pub fn pixels_to_gray8(pixels: &[u8], width: u32, height: u32, bit_depth: u32)
                       -> Result<GrayImage, CanonicalError> {
    let num_pixels = width as usize * height as usize;
    if bit_depth != 1 && bit_depth != 2 {
        return Err(invalid_argument_error(
            format!("Unsupported bit depth {}", bit_depth).as_str()));
    }
    if pixels.len() != num_pixels * bit_depth as usize {
        return Err(invalid_argument_error(
            format!("Expected {} bytes for {}x{}x{}, got {}",
                    num_pixels * bit_depth as usize, width, height, bit_depth,
                    pixels.len()).as_str()));
    }
    if bit_depth == 1 {
        return Ok(GrayImage::from_fn(width, height, |x, y| {
            Luma([pixels[(y * width + x) as usize]])
        }));
    }
    let wide: Vec<u16> = pixels.chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();
    let peak = wide.iter().copied().max().unwrap_or(0);
    let shift = (16 - peak.leading_zeros()).saturating_sub(8);
    Ok(GrayImage::from_fn(width, height, |x, y| {
        Luma([(wide[(y * width + x) as usize] >> shift) as u8])
    }))
}

/// Returns pixel values below which lie `low_fraction` and `high_fraction`
/// of the image's pixels.
pub fn histogram_bounds(image: &GrayImage, low_fraction: f64, high_fraction: f64)
                        -> (u8, u8) {
    let histo = histogram(image).channels[0];
    let total: u64 = histo.iter().map(|c| *c as u64).sum();
    let low_count = (total as f64 * low_fraction) as u64;
    let high_count = (total as f64 * high_fraction) as u64;
    let mut low = 0_u8;
    let mut high = 255_u8;
    let mut cumulative = 0_u64;
    let mut found_low = false;
    for (value, count) in histo.iter().enumerate() {
        cumulative += *count as u64;
        if !found_low && cumulative > low_count {
            low = value as u8;
            found_low = true;
        }
        if cumulative >= high_count {
            high = value as u8;
            break;
        }
    }
    (low, high)
}

/// Removes large-scale brightness variation (the lunar terminator, limb
/// darkening) by subtracting the mean over a (2*radius+1) square window, then
/// stretches the result to the full 8-bit range.
pub fn normalize_local_contrast(image: &GrayImage, radius: u32) -> GrayImage {
    let local_mean = box_filter(image, radius, radius);
    let mut normalized = GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let value = image.get_pixel(x, y).0[0] as i16;
        let mean = local_mean.get_pixel(x, y).0[0] as i16;
        Luma([(value - mean + 128).clamp(0, 255) as u8])
    });
    let (low, high) = histogram_bounds(&normalized, 0.005, 0.995);
    scale_image_mut(&mut normalized, low, high, 1.0);
    normalized
}

// mod tests.
