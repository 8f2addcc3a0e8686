//! Scripted detection backend.
//!
//! Returns a fixed set of boxes regardless of input, or a scripted error.
//! Used by the integration suites and during bring-up on machines without
//! model files.

use anyhow::{anyhow, Result};
use common::DetectionBox;
use image::RgbImage;

pub struct StaticDetector {
    boxes: Vec<DetectionBox>,
    fail: bool,
}

impl StaticDetector {
    /// Always returns the given boxes.
    pub fn with_boxes(boxes: Vec<DetectionBox>) -> Self {
        Self { boxes, fail: false }
    }

    /// Always returns no faces.
    pub fn empty() -> Self {
        Self {
            boxes: Vec::new(),
            fail: false,
        }
    }

    /// Always errors, for exercising the cascade's failure path.
    pub fn failing() -> Self {
        Self {
            boxes: Vec::new(),
            fail: true,
        }
    }

    pub fn detect(&self, _image: &RgbImage) -> Result<Vec<DetectionBox>> {
        if self.fail {
            return Err(anyhow!("scripted detector failure"));
        }
        Ok(self.boxes.clone())
    }
}
