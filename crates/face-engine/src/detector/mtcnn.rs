//! Multi-stage cascaded detector (P-Net / R-Net / O-Net) over ONNX
//! Runtime.
//!
//! The slowest backend and the last resort of the cascade, but the one
//! that recovers occluded and sunglasses cases the others miss. Inputs
//! are consumed in RGB order; this module owns that conversion contract,
//! whatever byte order the surrounding pipeline favours.

use anyhow::{Context, Result};
use common::{BoundingBox, DetectionBox, DetectorKind, FivePointLandmarks};
use image::{imageops, RgbImage};
use ndarray::{Array, IxDyn};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::Value,
};
use tokio::sync::Mutex;

/// P-Net sliding stride in model pixels.
const PNET_STRIDE: f32 = 2.0;

/// P-Net receptive cell edge.
const PNET_CELL: f32 = 12.0;

/// Stage-crop edge lengths.
const RNET_SIZE: u32 = 24;
const ONET_SIZE: u32 = 48;

/// Candidate carried between stages, in full-image f32 coordinates.
#[derive(Debug, Clone)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    reg: [f32; 4],
    landmarks: Option<FivePointLandmarks>,
}

impl Candidate {
    fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    fn iou(&self, other: &Candidate, min_mode: bool) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let denom = if min_mode {
            self.area().min(other.area())
        } else {
            self.area() + other.area() - inter
        };
        if denom > 0.0 {
            inter / denom
        } else {
            0.0
        }
    }

    /// Apply the stage's bounding-box regression.
    fn refine(&mut self) {
        let w = self.width();
        let h = self.height();
        let [dx1, dy1, dx2, dy2] = self.reg;
        self.x1 += dx1 * w;
        self.y1 += dy1 * h;
        self.x2 += dx2 * w;
        self.y2 += dy2 * h;
        self.reg = [0.0; 4];
    }

    /// Expand to a square around the center, as the stage crops expect.
    fn to_square(&mut self) {
        let side = self.width().max(self.height());
        let cx = (self.x1 + self.x2) / 2.0;
        let cy = (self.y1 + self.y2) / 2.0;
        self.x1 = cx - side / 2.0;
        self.y1 = cy - side / 2.0;
        self.x2 = self.x1 + side;
        self.y2 = self.y1 + side;
    }
}

fn nms(mut candidates: Vec<Candidate>, threshold: f32, min_mode: bool) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut keep: Vec<Candidate> = Vec::new();
    for c in candidates {
        if keep.iter().all(|k| k.iou(&c, min_mode) < threshold) {
            keep.push(c);
        }
    }
    keep
}

pub struct MtcnnDetector {
    pnet: Mutex<Session>,
    rnet: Mutex<Session>,
    onet: Mutex<Session>,
    min_face: u32,
    thresholds: [f32; 3],
    scale_factor: f32,
}

impl MtcnnDetector {
    pub fn load(
        pnet_path: &str,
        rnet_path: &str,
        onet_path: &str,
        min_face: u32,
        thresholds: [f32; 3],
        scale_factor: f32,
    ) -> Result<Self> {
        Ok(Self {
            pnet: Mutex::new(load_session(pnet_path)?),
            rnet: Mutex::new(load_session(rnet_path)?),
            onet: Mutex::new(load_session(onet_path)?),
            min_face: min_face.max(12),
            thresholds,
            scale_factor,
        })
    }

    pub async fn detect(&self, image: &RgbImage) -> Result<Vec<DetectionBox>> {
        let (width, height) = image.dimensions();
        if width.min(height) < self.min_face {
            return Ok(Vec::new());
        }

        let candidates = self.stage_pnet(image).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self.stage_refine(image, candidates, RNET_SIZE, 1).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self.stage_refine(image, candidates, ONET_SIZE, 2).await?;

        Ok(candidates
            .into_iter()
            .filter_map(|c| {
                let x1 = c.x1.max(0.0) as u32;
                let y1 = c.y1.max(0.0) as u32;
                let x2 = (c.x2.min(width as f32)) as u32;
                let y2 = (c.y2.min(height as f32)) as u32;
                if x2 <= x1 || y2 <= y1 {
                    return None;
                }
                Some(DetectionBox {
                    bbox: BoundingBox::new(x1, y1, x2 - x1, y2 - y1),
                    detector: DetectorKind::Mtcnn,
                    confidence: c.score.clamp(0.0, 1.0),
                    landmarks: c.landmarks,
                })
            })
            .collect())
    }

    /// Proposal stage: run the fully-convolutional P-Net over an image
    /// pyramid and collect regressed, NMS-pruned candidates.
    async fn stage_pnet(&self, image: &RgbImage) -> Result<Vec<Candidate>> {
        let (width, height) = image.dimensions();
        let mut scale = PNET_CELL / self.min_face as f32;

        let mut all: Vec<Candidate> = Vec::new();
        while (width.min(height) as f32) * scale >= PNET_CELL {
            let sw = ((width as f32 * scale).ceil() as u32).max(1);
            let sh = ((height as f32 * scale).ceil() as u32).max(1);
            let scaled = imageops::resize(image, sw, sh, imageops::FilterType::Triangle);

            let input_tensor = Value::from_array(normalized_tensor(&scaled))?;
            let (scores, regs) = {
                let mut session = self.pnet.lock().await;
                let outputs = session.run(ort::inputs![input_tensor])?;

                let mut score = None;
                for name in ["prob1", "softmax", "scores", "output1"] {
                    if let Some(v) = outputs.get(name) {
                        score = Some(to_array(v)?);
                        break;
                    }
                }
                let mut reg = None;
                for name in ["conv4-2", "reg", "boxes", "output0"] {
                    if let Some(v) = outputs.get(name) {
                        reg = Some(to_array(v)?);
                        break;
                    }
                }
                match (score, reg) {
                    (Some(s), Some(r)) => (s, r),
                    _ => anyhow::bail!("proposal network outputs not recognized"),
                }
            };

            let mut level = generate_pnet_candidates(&scores, &regs, scale, self.thresholds[0]);
            level = nms(level, 0.5, false);
            all.extend(level);

            scale *= self.scale_factor;
        }

        let mut kept = nms(all, 0.7, false);
        for c in &mut kept {
            c.refine();
            c.to_square();
        }
        Ok(kept)
    }

    /// Refinement stages: crop each candidate, run R-Net or O-Net, keep
    /// confident ones, re-regress, square up, and NMS.
    async fn stage_refine(
        &self,
        image: &RgbImage,
        candidates: Vec<Candidate>,
        crop_size: u32,
        stage: usize,
    ) -> Result<Vec<Candidate>> {
        let threshold = self.thresholds[stage];
        let session = if stage == 1 { &self.rnet } else { &self.onet };
        let is_output_stage = stage == 2;

        let mut kept = Vec::new();
        for mut candidate in candidates {
            let crop = crop_candidate(image, &candidate, crop_size);
            let input_tensor = Value::from_array(normalized_tensor(&crop))?;

            let (score, reg, landmarks) = {
                let mut guard = session.lock().await;
                let outputs = guard.run(ort::inputs![input_tensor])?;

                let mut score = None;
                for name in ["prob1", "softmax", "scores", "output1"] {
                    if let Some(v) = outputs.get(name) {
                        let flat: Vec<f32> = to_array(v)?.iter().copied().collect();
                        // Two-class softmax: face probability is the
                        // second entry.
                        score = flat.get(1).or(flat.first()).copied();
                        break;
                    }
                }
                let score = score.context("refinement score output not recognized")?;

                let mut reg = [0.0f32; 4];
                for name in ["conv5-2", "conv6-2", "reg", "boxes", "output0"] {
                    if let Some(v) = outputs.get(name) {
                        let flat: Vec<f32> = to_array(v)?.iter().copied().collect();
                        if flat.len() >= 4 {
                            reg.copy_from_slice(&flat[..4]);
                            break;
                        }
                    }
                }

                let landmarks = if is_output_stage {
                    let mut found = None;
                    for name in ["conv6-3", "landmarks", "points", "output2"] {
                        if let Some(v) = outputs.get(name) {
                            let flat: Vec<f32> = to_array(v)?.iter().copied().collect();
                            if flat.len() >= 10 {
                                let mut points = [0.0f32; 10];
                                points.copy_from_slice(&flat[..10]);
                                found = Some(points);
                                break;
                            }
                        }
                    }
                    found
                } else {
                    None
                };

                (score, reg, landmarks)
            };

            if score < threshold {
                continue;
            }

            candidate.score = score;
            candidate.reg = reg;
            if let Some(points) = landmarks {
                // Landmark outputs are normalized to the candidate square.
                let w = candidate.width();
                let h = candidate.height();
                let map = |(nx, ny): (f32, f32)| (candidate.x1 + nx * w, candidate.y1 + ny * h);
                candidate.landmarks = Some(FivePointLandmarks {
                    left_eye: map((points[0], points[5])),
                    right_eye: map((points[1], points[6])),
                    nose: map((points[2], points[7])),
                    mouth_left: map((points[3], points[8])),
                    mouth_right: map((points[4], points[9])),
                });
            }
            candidate.refine();
            if !is_output_stage {
                candidate.to_square();
            }
            kept.push(candidate);
        }

        Ok(nms(kept, 0.7, is_output_stage))
    }
}

fn load_session(path: &str) -> Result<Session> {
    Session::builder()
        .context("failed to create session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("failed to set optimization level")?
        .with_intra_threads(2)
        .context("failed to set intra threads")?
        .commit_from_file(path)
        .with_context(|| format!("failed to load model from {}", path))
}

/// Pack an RGB image as NCHW normalized to `(x - 127.5) / 128`, RGB plane
/// order (the network's required order).
fn normalized_tensor(image: &RgbImage) -> Array<f32, IxDyn> {
    let (width, height) = image.dimensions();
    let mut input = Array::zeros(IxDyn(&[1, 3, height as usize, width as usize]));
    for (x, y, pixel) in image.enumerate_pixels() {
        for channel in 0..3 {
            input[[0, channel, y as usize, x as usize]] =
                (pixel[channel] as f32 - 127.5) / 128.0;
        }
    }
    input
}

/// Crop a candidate square (clamped to the image) and resize to the stage
/// input edge.
fn crop_candidate(image: &RgbImage, candidate: &Candidate, size: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let x1 = (candidate.x1.max(0.0) as u32).min(width.saturating_sub(1));
    let y1 = (candidate.y1.max(0.0) as u32).min(height.saturating_sub(1));
    let x2 = (candidate.x2.min(width as f32) as u32).max(x1 + 1);
    let y2 = (candidate.y2.min(height as f32) as u32).max(y1 + 1);

    let crop = image::DynamicImage::ImageRgb8(image.clone())
        .crop_imm(x1, y1, (x2 - x1).min(width - x1), (y2 - y1).min(height - y1))
        .to_rgb8();
    imageops::resize(&crop, size, size, imageops::FilterType::Triangle)
}

type ScoreMap = Array<f32, IxDyn>;

fn to_array(value: &Value) -> Result<Array<f32, IxDyn>> {
    let (shape, data) = value.try_extract_tensor::<f32>()?;
    let shape_usize: Vec<usize> = shape.as_ref().iter().map(|&x| x as usize).collect();
    Ok(Array::from_shape_vec(IxDyn(&shape_usize), data.to_vec())?)
}

/// Walk the P-Net output grid and lift confident cells back into
/// full-image coordinates.
fn generate_pnet_candidates(
    scores: &ScoreMap,
    regs: &ScoreMap,
    scale: f32,
    threshold: f32,
) -> Vec<Candidate> {
    let dims = scores.shape();
    if dims.len() != 4 || dims[1] < 2 {
        return Vec::new();
    }
    let rows = dims[2];
    let cols = dims[3];

    let mut out = Vec::new();
    for i in 0..rows {
        for j in 0..cols {
            let score = scores[[0, 1, i, j]];
            if score < threshold {
                continue;
            }
            let reg = [
                regs[[0, 0, i, j]],
                regs[[0, 1, i, j]],
                regs[[0, 2, i, j]],
                regs[[0, 3, i, j]],
            ];
            out.push(Candidate {
                x1: (PNET_STRIDE * j as f32 + 1.0) / scale,
                y1: (PNET_STRIDE * i as f32 + 1.0) / scale,
                x2: (PNET_STRIDE * j as f32 + PNET_CELL) / scale,
                y2: (PNET_STRIDE * i as f32 + PNET_CELL) / scale,
                score,
                reg,
                landmarks: None,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Candidate {
        Candidate {
            x1,
            y1,
            x2,
            y2,
            score,
            reg: [0.0; 4],
            landmarks: None,
        }
    }

    #[test]
    fn square_expansion_keeps_center() {
        let mut c = candidate(10.0, 20.0, 50.0, 40.0, 0.9);
        c.to_square();
        assert!((c.width() - c.height()).abs() < 1e-4);
        assert!((c.width() - 40.0).abs() < 1e-4);
        assert!(((c.x1 + c.x2) / 2.0 - 30.0).abs() < 1e-4);
        assert!(((c.y1 + c.y2) / 2.0 - 30.0).abs() < 1e-4);
    }

    #[test]
    fn regression_refines_by_box_fractions() {
        let mut c = candidate(0.0, 0.0, 100.0, 100.0, 0.9);
        c.reg = [0.1, 0.2, -0.1, -0.2];
        c.refine();
        assert!((c.x1 - 10.0).abs() < 1e-4);
        assert!((c.y1 - 20.0).abs() < 1e-4);
        assert!((c.x2 - 90.0).abs() < 1e-4);
        assert!((c.y2 - 80.0).abs() < 1e-4);
    }

    #[test]
    fn nms_min_mode_suppresses_contained_boxes() {
        let big = candidate(0.0, 0.0, 100.0, 100.0, 0.9);
        let contained = candidate(10.0, 10.0, 40.0, 40.0, 0.8);
        // Union-mode IoU of these is small, min-mode is 1.0.
        let kept_union = nms(vec![big.clone(), contained.clone()], 0.7, false);
        assert_eq!(kept_union.len(), 2);
        let kept_min = nms(vec![big, contained], 0.7, true);
        assert_eq!(kept_min.len(), 1);
    }

    #[test]
    fn pnet_grid_maps_back_through_scale() {
        let mut scores = Array::zeros(IxDyn(&[1, 2, 2, 2]));
        scores[[0, 1, 1, 1]] = 0.95;
        let regs = Array::zeros(IxDyn(&[1, 4, 2, 2]));

        let candidates = generate_pnet_candidates(&scores, &regs, 0.5, 0.6);
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert!((c.x1 - 6.0).abs() < 1e-4);
        assert!((c.y1 - 6.0).abs() < 1e-4);
        assert!((c.x2 - 28.0).abs() < 1e-4);
        assert!((c.score - 0.95).abs() < 1e-4);
    }

    #[test]
    fn normalized_tensor_is_rgb_nchw() {
        let img = RgbImage::from_pixel(2, 2, image::Rgb([255, 127, 0]));
        let t = normalized_tensor(&img);
        assert_eq!(t.shape(), &[1, 3, 2, 2]);
        assert!((t[[0, 0, 0, 0]] - (255.0 - 127.5) / 128.0).abs() < 1e-5);
        assert!((t[[0, 1, 0, 0]] - (127.0 - 127.5) / 128.0).abs() < 1e-5);
        assert!((t[[0, 2, 0, 0]] - (0.0 - 127.5) / 128.0).abs() < 1e-5);
    }
}
