//! Haar-contrast face detector.
//!
//! A classical integral-image detector: multi-scale sliding window scored
//! by a small bank of Haar-like contrast rules (frontal and profile sets),
//! followed by neighbour grouping. Roughly an order of magnitude faster
//! than the neural backends, which is why the cascade tries it first.

use anyhow::Result;
use common::{BoundingBox, DetectionBox, DetectorKind};
use image::{GrayImage, Luma, RgbImage};
use imageproc::integral_image::{integral_image, sum_image_pixels};

use super::non_max_suppression;
use crate::image_ops::to_gray;

/// Synthetic confidence reported for every grouped hit; the classical
/// backend has no calibrated score to offer.
const HAAR_CONFIDENCE: f32 = 0.75;

/// Window scale step between pyramid levels.
const SCALE_FACTOR: f32 = 1.1;

/// Minimum raw hits that must agree on a region before it is emitted.
const MIN_NEIGHBORS: usize = 5;

/// Smallest window considered, in pixels.
const MIN_SIZE: u32 = 30;

/// Raw hits overlapping at least this much are grouped as one face.
const GROUP_IOU: f32 = 0.30;

/// Windows with less luma spread than this are rejected outright.
const MIN_WINDOW_STDDEV: f32 = 12.0;

/// Region within a unit window, as fractions of the window side.
#[derive(Clone, Copy)]
struct Region {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
}

/// One Haar-like contrast rule: `darker` must be dimmer than `brighter`
/// by at least `min_gap` (as a fraction of full scale).
struct ContrastRule {
    darker: Region,
    brighter: Region,
    min_gap: f32,
    weight: f32,
}

fn frontal_rules() -> Vec<ContrastRule> {
    vec![
        // Eye band sits in shadow relative to the cheeks below it.
        ContrastRule {
            darker: Region { x: 0.15, y: 0.20, w: 0.70, h: 0.20 },
            brighter: Region { x: 0.15, y: 0.42, w: 0.70, h: 0.20 },
            min_gap: 0.02,
            weight: 2.0,
        },
        // ...and relative to the forehead above it.
        ContrastRule {
            darker: Region { x: 0.15, y: 0.20, w: 0.70, h: 0.20 },
            brighter: Region { x: 0.15, y: 0.03, w: 0.70, h: 0.15 },
            min_gap: 0.02,
            weight: 1.5,
        },
        // Nose bridge is brighter than each eye socket.
        ContrastRule {
            darker: Region { x: 0.15, y: 0.24, w: 0.22, h: 0.16 },
            brighter: Region { x: 0.40, y: 0.28, w: 0.20, h: 0.30 },
            min_gap: 0.01,
            weight: 1.0,
        },
        ContrastRule {
            darker: Region { x: 0.63, y: 0.24, w: 0.22, h: 0.16 },
            brighter: Region { x: 0.40, y: 0.28, w: 0.20, h: 0.30 },
            min_gap: 0.01,
            weight: 1.0,
        },
        // Mouth band against the chin.
        ContrastRule {
            darker: Region { x: 0.25, y: 0.65, w: 0.50, h: 0.18 },
            brighter: Region { x: 0.25, y: 0.84, w: 0.50, h: 0.13 },
            min_gap: 0.01,
            weight: 1.0,
        },
    ]
}

/// Profile rules for a face turned toward the window's left edge; the
/// mirrored set covers the other side.
fn profile_rules(mirrored: bool) -> Vec<ContrastRule> {
    let flip = |r: Region| {
        if mirrored {
            Region {
                x: 1.0 - r.x - r.w,
                ..r
            }
        } else {
            r
        }
    };
    vec![
        // Single visible eye socket darker than the near cheek.
        ContrastRule {
            darker: flip(Region { x: 0.15, y: 0.22, w: 0.30, h: 0.18 }),
            brighter: flip(Region { x: 0.15, y: 0.44, w: 0.30, h: 0.20 }),
            min_gap: 0.02,
            weight: 2.0,
        },
        // The far half of the window is background or hair, dimmer than
        // the lit facial half.
        ContrastRule {
            darker: flip(Region { x: 0.60, y: 0.10, w: 0.35, h: 0.75 }),
            brighter: flip(Region { x: 0.05, y: 0.10, w: 0.45, h: 0.75 }),
            min_gap: 0.04,
            weight: 1.5,
        },
    ]
}

pub struct HaarDetector {
    frontal: Vec<ContrastRule>,
    profile_left: Vec<ContrastRule>,
    profile_right: Vec<ContrastRule>,
}

impl Default for HaarDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl HaarDetector {
    pub fn new() -> Self {
        Self {
            frontal: frontal_rules(),
            profile_left: profile_rules(false),
            profile_right: profile_rules(true),
        }
    }

    pub fn detect(&self, image: &RgbImage) -> Result<Vec<DetectionBox>> {
        let gray = to_gray(image);
        let (width, height) = gray.dimensions();
        if width < MIN_SIZE || height < MIN_SIZE {
            return Ok(Vec::new());
        }

        let integral = integral_image::<_, u64>(&gray);

        let mut hits: Vec<(BoundingBox, f32)> = Vec::new();
        let mut window = MIN_SIZE as f32;
        while (window as u32) <= width.min(height) {
            let size = window as u32;
            let step = (size / 8).max(2);

            let mut y = 0;
            while y + size <= height {
                let mut x = 0;
                while x + size <= width {
                    if let Some(score) = self.score_window(&integral, &gray, x, y, size) {
                        hits.push((BoundingBox::new(x, y, size, size), score));
                    }
                    x += step;
                }
                y += step;
            }

            window *= SCALE_FACTOR;
        }

        let grouped = group_hits(hits, MIN_NEIGHBORS, GROUP_IOU);
        Ok(grouped
            .into_iter()
            .map(|bbox| DetectionBox {
                bbox,
                detector: DetectorKind::Haar,
                confidence: HAAR_CONFIDENCE,
                landmarks: None,
            })
            .collect())
    }

    /// Score one window, or `None` if it does not look like a face.
    fn score_window(
        &self,
        integral: &image::ImageBuffer<Luma<u64>, Vec<u64>>,
        gray: &GrayImage,
        x: u32,
        y: u32,
        size: u32,
    ) -> Option<f32> {
        if window_stddev(gray, x, y, size) < MIN_WINDOW_STDDEV {
            return None;
        }

        let frontal = rule_score(integral, &self.frontal, x, y, size);
        let left = rule_score(integral, &self.profile_left, x, y, size);
        let right = rule_score(integral, &self.profile_right, x, y, size);

        let best = frontal.max(left).max(right);
        (best >= 0.65).then_some(best)
    }
}

/// Fraction of rule weight satisfied within a window.
fn rule_score(
    integral: &image::ImageBuffer<Luma<u64>, Vec<u64>>,
    rules: &[ContrastRule],
    x: u32,
    y: u32,
    size: u32,
) -> f32 {
    let mut satisfied = 0.0f32;
    let mut total = 0.0f32;
    for rule in rules {
        total += rule.weight;
        let darker = region_mean(integral, x, y, size, &rule.darker);
        let brighter = region_mean(integral, x, y, size, &rule.brighter);
        if (brighter - darker) / 255.0 >= rule.min_gap {
            satisfied += rule.weight;
        }
    }
    if total > 0.0 {
        satisfied / total
    } else {
        0.0
    }
}

/// Mean intensity of a unit-space region inside the window.
fn region_mean(
    integral: &image::ImageBuffer<Luma<u64>, Vec<u64>>,
    wx: u32,
    wy: u32,
    size: u32,
    region: &Region,
) -> f32 {
    let left = wx + (region.x * size as f32) as u32;
    let top = wy + (region.y * size as f32) as u32;
    let w = ((region.w * size as f32) as u32).max(1);
    let h = ((region.h * size as f32) as u32).max(1);
    let right = left + w - 1;
    let bottom = top + h - 1;

    let sum = sum_image_pixels(integral, left, top, right, bottom)[0];
    sum as f32 / (w as f32 * h as f32)
}

/// Sampled standard deviation of a window's luma, for flat-region
/// rejection. Samples an 8x8 grid rather than every pixel.
fn window_stddev(gray: &GrayImage, x: u32, y: u32, size: u32) -> f32 {
    let step = (size / 8).max(1);
    let mut values = Vec::with_capacity(64);
    let mut sy = y;
    while sy < y + size {
        let mut sx = x;
        while sx < x + size {
            values.push(gray.get_pixel(sx, sy).0[0] as f32);
            sx += step;
        }
        sy += step;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    var.sqrt()
}

/// Cluster raw hits and keep groups with enough agreeing neighbours,
/// emitting the average box of each surviving group.
pub(crate) fn group_hits(
    hits: Vec<(BoundingBox, f32)>,
    min_neighbors: usize,
    iou_threshold: f32,
) -> Vec<BoundingBox> {
    let seeds = non_max_suppression(hits.clone(), iou_threshold);

    let mut groups: Vec<BoundingBox> = Vec::new();
    for (seed, _) in seeds {
        let members: Vec<&BoundingBox> = hits
            .iter()
            .filter(|(b, _)| b.iou(&seed) >= iou_threshold)
            .map(|(b, _)| b)
            .collect();
        if members.len() < min_neighbors {
            continue;
        }

        let n = members.len() as u64;
        let x = members.iter().map(|b| b.x as u64).sum::<u64>() / n;
        let y = members.iter().map(|b| b.y as u64).sum::<u64>() / n;
        let w = members.iter().map(|b| b.width as u64).sum::<u64>() / n;
        let h = members.iter().map(|b| b.height as u64).sum::<u64>() / n;
        groups.push(BoundingBox::new(x as u32, y as u32, w as u32, h as u32));
    }
    groups
}
