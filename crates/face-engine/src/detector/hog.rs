//! HOG-style face detector.
//!
//! Scores sliding windows on their gradient-orientation layout: faces show
//! strong horizontal edge energy in the eye and mouth rows and a
//! left-right symmetric magnitude distribution. Small inputs get a single
//! 2x upsample before scanning.

use anyhow::Result;
use common::{BoundingBox, DetectionBox, DetectorKind};
use image::{imageops, RgbImage};
use imageproc::gradients::{horizontal_sobel, vertical_sobel};

use super::non_max_suppression;
use crate::image_ops::to_gray;

/// Synthetic confidence for every emitted box.
const HOG_CONFIDENCE: f32 = 0.90;

/// Smallest window scanned, in (possibly upsampled) pixels.
const MIN_WINDOW: u32 = 48;

/// Images whose short side is below this get one 2x upsample.
const UPSAMPLE_BELOW: u32 = 160;

const SCALE_FACTOR: f32 = 1.2;
const NMS_IOU: f32 = 0.30;
const SCORE_THRESHOLD: f32 = 0.62;

/// Cell grid edge within a window.
const CELLS: usize = 4;

pub struct HogDetector;

impl Default for HogDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl HogDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&self, image: &RgbImage) -> Result<Vec<DetectionBox>> {
        let gray = to_gray(image);
        let (orig_w, orig_h) = gray.dimensions();
        if orig_w == 0 || orig_h == 0 {
            return Ok(Vec::new());
        }

        // Single upsample for small inputs; detections are mapped back.
        let (gray, downscale) = if orig_w.min(orig_h) < UPSAMPLE_BELOW {
            let up = imageops::resize(
                &gray,
                orig_w * 2,
                orig_h * 2,
                imageops::FilterType::Triangle,
            );
            (up, 2u32)
        } else {
            (gray, 1u32)
        };

        let (width, height) = gray.dimensions();
        if width < MIN_WINDOW || height < MIN_WINDOW {
            return Ok(Vec::new());
        }

        let gx = horizontal_sobel(&gray);
        let gy = vertical_sobel(&gray);

        let mut hits: Vec<(BoundingBox, f32)> = Vec::new();
        let mut window = MIN_WINDOW as f32;
        while (window as u32) <= width.min(height) {
            let size = window as u32;
            let step = (size / 6).max(4);

            let mut y = 0;
            while y + size <= height {
                let mut x = 0;
                while x + size <= width {
                    let score = score_window(&gx, &gy, x, y, size);
                    if score >= SCORE_THRESHOLD {
                        hits.push((BoundingBox::new(x, y, size, size), score));
                    }
                    x += step;
                }
                y += step;
            }

            window *= SCALE_FACTOR;
        }

        let kept = non_max_suppression(hits, NMS_IOU);
        Ok(kept
            .into_iter()
            .map(|(bbox, _)| DetectionBox {
                bbox: BoundingBox::new(
                    bbox.x / downscale,
                    bbox.y / downscale,
                    (bbox.width / downscale).max(1),
                    (bbox.height / downscale).max(1),
                ),
                detector: DetectorKind::Hog,
                confidence: HOG_CONFIDENCE,
                landmarks: None,
            })
            .collect())
    }
}

/// Gradient magnitudes pooled into a CELLS x CELLS grid plus the fraction
/// of horizontal-edge energy per row band.
fn score_window(
    gx: &image::ImageBuffer<image::Luma<i16>, Vec<i16>>,
    gy: &image::ImageBuffer<image::Luma<i16>, Vec<i16>>,
    x: u32,
    y: u32,
    size: u32,
) -> f32 {
    let cell = size / CELLS as u32;
    if cell == 0 {
        return 0.0;
    }

    let mut magnitude = [[0.0f32; CELLS]; CELLS];
    let mut horizontal_energy = [0.0f32; CELLS];
    let mut total_energy = 0.0f32;

    let sample = (cell / 8).max(1);
    for cy in 0..CELLS {
        for cx in 0..CELLS {
            let x0 = x + cx as u32 * cell;
            let y0 = y + cy as u32 * cell;
            let mut sum = 0.0f32;
            let mut horiz = 0.0f32;

            let mut py = y0;
            while py < y0 + cell {
                let mut px = x0;
                while px < x0 + cell {
                    let dx = gx.get_pixel(px, py).0[0] as f32;
                    let dy = gy.get_pixel(px, py).0[0] as f32;
                    let mag = (dx * dx + dy * dy).sqrt();
                    sum += mag;
                    // Horizontal edges are gradients pointing vertically.
                    if dy.abs() > dx.abs() {
                        horiz += mag;
                    }
                    px += sample;
                }
                py += sample;
            }

            magnitude[cy][cx] = sum;
            horizontal_energy[cy] += horiz;
            total_energy += sum;
        }
    }

    if total_energy <= f32::EPSILON {
        return 0.0;
    }

    // Left-right symmetry of pooled magnitudes.
    let mut asymmetry = 0.0f32;
    for row in &magnitude {
        for cx in 0..CELLS / 2 {
            let l = row[cx];
            let r = row[CELLS - 1 - cx];
            if l + r > 0.0 {
                asymmetry += (l - r).abs() / (l + r);
            }
        }
    }
    let pairs = (CELLS * CELLS / 2) as f32;
    let symmetry = 1.0 - (asymmetry / pairs).clamp(0.0, 1.0);

    // Eye row (second quarter) and mouth row (last quarter) should carry a
    // horizontal-edge surplus relative to their share of the window.
    let row_energy: f32 = horizontal_energy.iter().sum();
    let feature_rows = if row_energy > 0.0 {
        ((horizontal_energy[1] + horizontal_energy[3]) / row_energy).clamp(0.0, 1.0)
    } else {
        0.0
    };

    // Sparse windows (blank walls) score low through this term.
    let density = (total_energy / (size as f32 * size as f32 * 8.0)).clamp(0.0, 1.0);

    0.5 * symmetry + 0.35 * feature_rows + 0.15 * density
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_image_yields_nothing() {
        let flat = RgbImage::from_pixel(200, 200, image::Rgb([90, 90, 90]));
        let detector = HogDetector::new();
        assert!(detector.detect(&flat).unwrap().is_empty());
    }

    #[test]
    fn tiny_image_yields_nothing() {
        let tiny = RgbImage::from_pixel(20, 20, image::Rgb([90, 90, 90]));
        let detector = HogDetector::new();
        assert!(detector.detect(&tiny).unwrap().is_empty());
    }

    #[test]
    fn upsampled_detections_map_back_to_original_coordinates() {
        // Whatever is detected on a small image must land inside it.
        let img = RgbImage::from_fn(100, 100, |x, y| {
            let v = (((x / 7) * 40 + (y / 9) * 23) % 255) as u8;
            image::Rgb([v, v, v])
        });
        let detector = HogDetector::new();
        for d in detector.detect(&img).unwrap() {
            assert!(d.bbox.x < 100 && d.bbox.y < 100);
            assert!(d.confidence == HOG_CONFIDENCE);
            assert_eq!(d.detector, DetectorKind::Hog);
        }
    }
}
