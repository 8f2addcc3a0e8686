//! SSD face detector over ONNX Runtime.

use anyhow::{Context, Result};
use common::{BoundingBox, DetectionBox, DetectorKind};
use image::{imageops, RgbImage};
use ndarray::{Array, IxDyn};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::Value,
};
use tokio::sync::Mutex;

/// Model input edge length.
const INPUT_SIZE: u32 = 300;

/// Per-channel means the SSD backbone was trained with (BGR order).
const MEAN_BGR: [f32; 3] = [104.0, 117.0, 123.0];

pub struct DnnDetector {
    session: Mutex<Session>,
    confidence_threshold: f32,
}

impl DnnDetector {
    /// Load the SSD model from disk.
    pub fn load(model_path: &str, confidence_threshold: f32) -> Result<Self> {
        let session = Session::builder()
            .context("failed to create session builder")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("failed to set optimization level")?
            .with_intra_threads(4)
            .context("failed to set intra threads")?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load ssd model from {}", model_path))?;

        Ok(Self {
            session: Mutex::new(session),
            confidence_threshold,
        })
    }

    pub async fn detect(&self, image: &RgbImage) -> Result<Vec<DetectionBox>> {
        let (orig_w, orig_h) = image.dimensions();
        if orig_w == 0 || orig_h == 0 {
            return Ok(Vec::new());
        }

        let input_tensor = Value::from_array(preprocess(image))?;

        let mut session = self.session.lock().await;
        let outputs = session.run(ort::inputs![input_tensor])?;

        let output_value = outputs
            .get("detection_out")
            .or_else(|| outputs.get("output"))
            .or_else(|| outputs.get("output0"))
            .context("no detection output tensor found")?;
        let (shape, data) = output_value.try_extract_tensor::<f32>()?;

        let shape_usize: Vec<usize> = shape.as_ref().iter().map(|&x| x as usize).collect();
        let output = Array::from_shape_vec(IxDyn(&shape_usize), data.to_vec())?;
        drop(outputs);
        drop(session);

        Ok(postprocess(
            &output,
            orig_w,
            orig_h,
            self.confidence_threshold,
        ))
    }
}

/// Resize to the model edge and pack as mean-subtracted BGR NCHW.
fn preprocess(image: &RgbImage) -> Array<f32, IxDyn> {
    let resized = imageops::resize(
        image,
        INPUT_SIZE,
        INPUT_SIZE,
        imageops::FilterType::Triangle,
    );

    let size = INPUT_SIZE as usize;
    let mut input = Array::zeros(IxDyn(&[1, 3, size, size]));
    for (x, y, pixel) in resized.enumerate_pixels() {
        // The backbone consumes BGR planes; reorder from the RGB buffer.
        input[[0, 0, y as usize, x as usize]] = pixel[2] as f32 - MEAN_BGR[0];
        input[[0, 1, y as usize, x as usize]] = pixel[1] as f32 - MEAN_BGR[1];
        input[[0, 2, y as usize, x as usize]] = pixel[0] as f32 - MEAN_BGR[2];
    }
    input
}

/// Parse SSD output rows `[image_id, label, conf, x1, y1, x2, y2]` with
/// normalized corners, keeping confident, non-degenerate boxes.
fn postprocess(
    output: &Array<f32, IxDyn>,
    orig_w: u32,
    orig_h: u32,
    confidence_threshold: f32,
) -> Vec<DetectionBox> {
    let dims = output.shape();
    if dims.len() != 4 || dims[3] != 7 {
        return Vec::new();
    }
    let rows = dims[2];

    let mut boxes = Vec::new();
    for i in 0..rows {
        let confidence = output[[0, 0, i, 2]];
        if confidence < confidence_threshold {
            continue;
        }

        let x1 = (output[[0, 0, i, 3]].clamp(0.0, 1.0) * orig_w as f32) as u32;
        let y1 = (output[[0, 0, i, 4]].clamp(0.0, 1.0) * orig_h as f32) as u32;
        let x2 = (output[[0, 0, i, 5]].clamp(0.0, 1.0) * orig_w as f32) as u32;
        let y2 = (output[[0, 0, i, 6]].clamp(0.0, 1.0) * orig_h as f32) as u32;

        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        boxes.push(DetectionBox {
            bbox: BoundingBox::new(x1, y1, x2 - x1, y2 - y1),
            detector: DetectorKind::Dnn,
            confidence: confidence.clamp(0.0, 1.0),
            landmarks: None,
        });
    }
    boxes
}
