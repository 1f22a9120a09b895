//! Image preprocessing for the PaddleOCR models
//!
//! Handles resizing, normalization, and tensor conversion.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{s, Array3, Array4};

/// Detection model normalization (ImageNet statistics on [0, 1] pixels)
pub const DET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const DET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Recognition model normalization: maps [0, 255] to [-1, 1]
pub const REC_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
pub const REC_STD: [f32; 3] = [0.5, 0.5, 0.5];

/// Recognition models are trained on 48x320 crops
const REC_BASE_WIDTH: f32 = 320.0;

/// Target size for the detector: the longest side is capped at
/// `limit_side_len` and both sides are rounded to multiples of 32.
pub fn detection_size(width: u32, height: u32, limit_side_len: u32) -> (u32, u32) {
    let longest = width.max(height) as f32;
    let ratio = if longest > limit_side_len as f32 {
        limit_side_len as f32 / longest
    } else {
        1.0
    };

    let round32 = |v: f32| (((v / 32.0).round() as u32) * 32).max(32);
    (round32(width as f32 * ratio), round32(height as f32 * ratio))
}

/// Normalized HWC -> CHW conversion of an RGB image
pub fn normalize_chw(image: &RgbImage, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    let (w, h) = image.dimensions();
    let mut chw = Array3::<f32>::zeros((3, h as usize, w as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            let v = pixel[c] as f32 / 255.0;
            chw[[c, y as usize, x as usize]] = (v - mean[c]) / std[c];
        }
    }

    chw
}

/// Resize and normalize an image into a detector batch of one.
///
/// The probability map comes back at the resized size; callers map it to the
/// source by the ratio of the map to the source dimensions.
pub fn preprocess_for_detection(image: &RgbImage, limit_side_len: u32) -> Array4<f32> {
    let (src_w, src_h) = image.dimensions();
    let (dst_w, dst_h) = detection_size(src_w, src_h, limit_side_len);
    let resized = imageops::resize(image, dst_w, dst_h, FilterType::Triangle);

    normalize_chw(&resized, &DET_MEAN, &DET_STD).insert_axis(ndarray::Axis(0))
}

/// Batch text crops for the recognizer.
///
/// Every crop is resized to `height`, keeping its aspect ratio, and
/// right-padded with zeros to the widest crop of the batch (at least the
/// model's base width).
pub fn preprocess_for_recognition(crops: &[&RgbImage], height: u32) -> Array4<f32> {
    let base_ratio = REC_BASE_WIDTH / 48.0;
    let max_ratio = crops
        .iter()
        .map(|c| c.width() as f32 / c.height().max(1) as f32)
        .fold(base_ratio, f32::max);
    let batch_width = (height as f32 * max_ratio).ceil() as usize;

    let mut batch = Array4::<f32>::zeros((crops.len(), 3, height as usize, batch_width));

    for (i, crop) in crops.iter().enumerate() {
        let ratio = crop.width() as f32 / crop.height().max(1) as f32;
        let width = ((height as f32 * ratio).ceil() as usize).clamp(1, batch_width);
        let resized = imageops::resize(*crop, width as u32, height, FilterType::Triangle);
        let chw = normalize_chw(&resized, &REC_MEAN, &REC_STD);
        batch.slice_mut(s![i, .., .., ..width]).assign(&chw);
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_detection_size_keeps_small_images() {
        assert_eq!(detection_size(640, 480, 960), (640, 480));
        assert_eq!(detection_size(100, 50, 960), (96, 64));
    }

    #[test]
    fn test_detection_size_limits_longest_side() {
        let (w, h) = detection_size(1920, 1080, 960);
        assert_eq!(w, 960);
        assert_eq!(h % 32, 0);
        assert!(h <= 544 && h >= 512);
    }

    #[test]
    fn test_detection_size_never_zero() {
        assert_eq!(detection_size(3, 2, 960), (32, 32));
    }

    #[test]
    fn test_normalize_chw() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));

        let chw = normalize_chw(&img, &REC_MEAN, &REC_STD);
        assert_eq!(chw.dim(), (3, 1, 2));
        assert!((chw[[0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((chw[[1, 0, 0]] + 1.0).abs() < 1e-6);
        assert!((chw[[1, 0, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_detection_tensor_shape() {
        let img = RgbImage::from_pixel(100, 50, Rgb([255, 255, 255]));
        let tensor = preprocess_for_detection(&img, 960);
        assert_eq!(tensor.dim(), (1, 3, 64, 96));
        // White pixel through ImageNet normalization
        assert!((tensor[[0, 0, 10, 10]] - (1.0 - DET_MEAN[0]) / DET_STD[0]).abs() < 1e-4);
    }

    #[test]
    fn test_recognition_batch_pads_to_widest() {
        let narrow = RgbImage::from_pixel(20, 10, Rgb([255, 255, 255]));
        let wide = RgbImage::from_pixel(200, 10, Rgb([255, 255, 255]));

        let batch = preprocess_for_recognition(&[&narrow, &wide], 48);
        assert_eq!(batch.dim(), (2, 3, 48, 960));

        // Narrow crop occupies 96 columns, the rest is zero padding
        assert!((batch[[0, 0, 10, 50]] - 1.0).abs() < 1e-6);
        assert_eq!(batch[[0, 0, 10, 500]], 0.0);
        assert!((batch[[1, 0, 10, 900]] - 1.0).abs() < 1e-6);
    }
}
