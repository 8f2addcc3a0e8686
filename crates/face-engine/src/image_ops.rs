//! Image decoding, cropping and the enhancement variants the detection
//! cascade falls back to when the original image yields nothing.

use anyhow::Result;
use common::{BoundingBox, CoreError};
use image::{DynamicImage, GrayImage, RgbImage};
use imageproc::contrast::equalize_histogram;
use imageproc::filter::{filter3x3, median_filter};

/// Enhancement applied to an image before a cascade re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enhancement {
    /// Global histogram equalization of the luma plane.
    HistogramEqualized,
    /// Contrast-limited adaptive (tile-based) equalization.
    Clahe,
    /// Median denoise.
    Denoised,
    /// 3x3 unsharp kernel.
    Sharpened,
}

impl Enhancement {
    /// Order in which variants are attempted by the cascade.
    pub const ALL: [Enhancement; 4] = [
        Enhancement::HistogramEqualized,
        Enhancement::Clahe,
        Enhancement::Denoised,
        Enhancement::Sharpened,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Enhancement::HistogramEqualized => "histogram_equalized",
            Enhancement::Clahe => "clahe",
            Enhancement::Denoised => "denoised",
            Enhancement::Sharpened => "sharpened",
        }
    }
}

/// Decode raw upload bytes into an RGB image. Undecodable bytes are an
/// input error: the photo is rejected wholesale, never half-processed.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, CoreError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| CoreError::input(format!("failed to decode image: {}", e)))?;
    Ok(decoded.to_rgb8())
}

/// Crop a face box out of the full image. The box is expected to be
/// pre-clamped; a zero-sized result is a programming error upstream.
pub fn crop_face(image: &RgbImage, bbox: &BoundingBox) -> RgbImage {
    DynamicImage::ImageRgb8(image.clone())
        .crop_imm(bbox.x, bbox.y, bbox.width, bbox.height)
        .to_rgb8()
}

/// Luma plane of an RGB image.
pub fn to_gray(image: &RgbImage) -> GrayImage {
    DynamicImage::ImageRgb8(image.clone()).to_luma8()
}

/// Produce one enhancement variant of the image.
pub fn enhance(image: &RgbImage, enhancement: Enhancement) -> RgbImage {
    match enhancement {
        Enhancement::HistogramEqualized => {
            let gray = to_gray(image);
            let equalized = equalize_histogram(&gray);
            DynamicImage::ImageLuma8(equalized).to_rgb8()
        }
        Enhancement::Clahe => {
            let gray = to_gray(image);
            let normalized = clahe(&gray, 8, 8, 2.0);
            DynamicImage::ImageLuma8(normalized).to_rgb8()
        }
        Enhancement::Denoised => median_filter(image, 1, 1),
        Enhancement::Sharpened => {
            let kernel: [f32; 9] = [0.0, -1.0, 0.0, -1.0, 5.0, -1.0, 0.0, -1.0, 0.0];
            filter3x3(image, &kernel)
        }
    }
}

/// Contrast-limited adaptive histogram equalization over a tile grid with
/// bilinear blending between neighbouring tile mappings.
pub fn clahe(gray: &GrayImage, tiles_x: u32, tiles_y: u32, clip_limit: f32) -> GrayImage {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return gray.clone();
    }

    let tiles_x = tiles_x.max(1).min(width);
    let tiles_y = tiles_y.max(1).min(height);
    let tile_w = width.div_ceil(tiles_x);
    let tile_h = height.div_ceil(tiles_y);

    // Per-tile clipped CDF lookup tables.
    let mut luts = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);

            let mut hist = [0u32; 256];
            let mut count = 0u32;
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x, y).0[0] as usize] += 1;
                    count += 1;
                }
            }
            if count == 0 {
                continue;
            }

            // Clip and redistribute the excess uniformly.
            let limit = ((clip_limit * count as f32 / 256.0).ceil() as u32).max(1);
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > limit {
                    excess += *bin - limit;
                    *bin = limit;
                }
            }
            let bonus = excess / 256;
            for bin in hist.iter_mut() {
                *bin += bonus;
            }

            let lut = &mut luts[(ty * tiles_x + tx) as usize];
            let mut cdf = 0u32;
            for (value, bin) in hist.iter().enumerate() {
                cdf += *bin;
                lut[value] = ((cdf as f32 / count as f32) * 255.0).round() as u8;
            }
        }
    }

    let tile_at = |tx: i64, ty: i64| -> &[u8; 256] {
        let tx = tx.clamp(0, tiles_x as i64 - 1) as u32;
        let ty = ty.clamp(0, tiles_y as i64 - 1) as u32;
        &luts[(ty * tiles_x + tx) as usize]
    };

    let mut out = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let value = gray.get_pixel(x, y).0[0] as usize;

            // Position relative to tile centers.
            let fx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
            let fy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
            let tx0 = fx.floor() as i64;
            let ty0 = fy.floor() as i64;
            let wx = fx - tx0 as f32;
            let wy = fy - ty0 as f32;

            let v00 = tile_at(tx0, ty0)[value] as f32;
            let v10 = tile_at(tx0 + 1, ty0)[value] as f32;
            let v01 = tile_at(tx0, ty0 + 1)[value] as f32;
            let v11 = tile_at(tx0 + 1, ty0 + 1)[value] as f32;

            let top = v00 * (1.0 - wx) + v10 * wx;
            let bottom = v01 * (1.0 - wx) + v11 * wx;
            let blended = top * (1.0 - wy) + bottom * wy;
            out.put_pixel(x, y, image::Luma([blended.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

/// Mean luminance of a grayscale region, used by the landmark-free pose
/// fallback. Returns 0 for an empty region.
pub fn mean_luma(gray: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) -> f32 {
    let x1 = x1.min(gray.width());
    let y1 = y1.min(gray.height());
    if x0 >= x1 || y0 >= y1 {
        return 0.0;
    }
    let mut sum = 0u64;
    for y in y0..y1 {
        for x in x0..x1 {
            sum += gray.get_pixel(x, y).0[0] as u64;
        }
    }
    sum as f32 / ((x1 - x0) as u64 * (y1 - y0) as u64) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, _| {
            let v = (x * 255 / width.max(1)) as u8;
            image::Rgb([v, v, v])
        })
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(matches!(err, CoreError::Input(_)));
    }

    #[test]
    fn decode_accepts_png_bytes() {
        let img = gradient_image(32, 32);
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        let decoded = decode_image(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (32, 32));
    }

    #[test]
    fn crop_matches_bbox() {
        let img = gradient_image(100, 80);
        let crop = crop_face(&img, &BoundingBox::new(10, 5, 40, 30));
        assert_eq!(crop.dimensions(), (40, 30));
    }

    #[test]
    fn all_enhancements_preserve_dimensions() {
        let img = gradient_image(64, 48);
        for enhancement in Enhancement::ALL {
            let out = enhance(&img, enhancement);
            assert_eq!(out.dimensions(), (64, 48), "{:?}", enhancement);
        }
    }

    #[test]
    fn clahe_spreads_flat_regions() {
        // A flat image stays flat; CLAHE must not invent contrast.
        let flat = GrayImage::from_pixel(32, 32, image::Luma([128]));
        let out = clahe(&flat, 4, 4, 2.0);
        let min = out.pixels().map(|p| p.0[0]).min().unwrap();
        let max = out.pixels().map(|p| p.0[0]).max().unwrap();
        assert!(max - min <= 8);
    }

    #[test]
    fn mean_luma_of_halves() {
        let mut img = GrayImage::new(10, 10);
        for y in 0..10 {
            for x in 0..10 {
                let v = if x < 5 { 50 } else { 200 };
                img.put_pixel(x, y, image::Luma([v]));
            }
        }
        assert!((mean_luma(&img, 0, 0, 5, 10) - 50.0).abs() < 1e-3);
        assert!((mean_luma(&img, 5, 0, 10, 10) - 200.0).abs() < 1e-3);
        assert_eq!(mean_luma(&img, 5, 5, 5, 5), 0.0);
    }
}
