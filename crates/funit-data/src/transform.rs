use std::path::Path;

use funit_nn::Rng;
use funit_tensor::{Shape, Tensor};
use image::imageops::{self, FilterType};
use image::Rgb32FImage;

use crate::error::DataError;
use crate::preprocess::LUMA;

/// Geometric augmentation and tensor conversion.
///
/// Applied in order: random horizontal flip, resize of the shorter edge to
/// `resize`, random (or centre) crop, conversion to `[C, H, W]` and
/// normalisation to `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    pub random_flip: bool,
    pub resize: Option<u32>,
    pub crop_height: u32,
    pub crop_width: u32,
    pub center_crop: bool,
    /// 3 for RGB, 1 for luminance.
    pub channels: usize,
}

impl Transform {
    /// Deterministic transform for evaluation: centre crop, no flip.
    pub fn test(resize: Option<u32>, crop_height: u32, crop_width: u32, channels: usize) -> Self {
        Self {
            random_flip: false,
            resize,
            crop_height,
            crop_width,
            center_crop: true,
            channels,
        }
    }

    /// Training transform: random crop and random flip.
    pub fn train(resize: Option<u32>, crop_height: u32, crop_width: u32, channels: usize) -> Self {
        Self {
            random_flip: true,
            center_crop: false,
            ..Self::test(resize, crop_height, crop_width, channels)
        }
    }

    pub fn output_shape(&self) -> Shape {
        Shape::from_slice(&[
            self.channels,
            self.crop_height as usize,
            self.crop_width as usize,
        ])
    }

    pub fn apply(&self, img: Rgb32FImage, path: &Path, rng: &mut Rng) -> Result<Tensor, DataError> {
        let mut img = img;
        if self.random_flip && rng.bernoulli(0.5) {
            img = imageops::flip_horizontal(&img);
        }
        if let Some(size) = self.resize {
            let (w, h) = resize_shorter_edge(img.width(), img.height(), size);
            if (w, h) != img.dimensions() {
                img = imageops::resize(&img, w, h, FilterType::Triangle);
            }
        }

        let (w, h) = img.dimensions();
        let (cw, ch) = (self.crop_width, self.crop_height);
        if w < cw || h < ch {
            return Err(DataError::TooSmall {
                path: path.to_path_buf(),
                width: w,
                height: h,
                crop: (cw, ch),
            });
        }
        let (left, top) = if self.center_crop {
            (centre_offset(w, cw), centre_offset(h, ch))
        } else {
            (
                rng.below((w - cw + 1) as usize) as u32,
                rng.below((h - ch + 1) as usize) as u32,
            )
        };
        let cropped = imageops::crop_imm(&img, left, top, cw, ch).to_image();
        Ok(self.to_tensor(&cropped))
    }

    fn to_tensor(&self, img: &Rgb32FImage) -> Tensor {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let mut data = vec![0.0; self.channels * h * w];
        for (x, y, px) in img.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if self.channels == 1 {
                let luma: f32 = px.0.iter().zip(LUMA).map(|(v, k)| v * k).sum();
                data[y * w + x] = normalise(luma);
            } else {
                for c in 0..3 {
                    data[(c * h + y) * w + x] = normalise(px.0[c]);
                }
            }
        }
        Tensor::new(data, Shape::from_slice(&[self.channels, h, w]))
    }
}

/// Mean 0.5, std 0.5 normalisation.
fn normalise(v: f32) -> f64 {
    (v as f64 - 0.5) / 0.5
}

/// Shorter edge becomes `size`; the longer edge keeps the aspect ratio,
/// truncated.
pub fn resize_shorter_edge(width: u32, height: u32, size: u32) -> (u32, u32) {
    if width <= height {
        let h = (size as u64 * height as u64 / width.max(1) as u64) as u32;
        (size, h)
    } else {
        let w = (size as u64 * width as u64 / height.max(1) as u64) as u32;
        (w, size)
    }
}

fn centre_offset(len: u32, crop: u32) -> u32 {
    ((len - crop) as f64 / 2.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn ramp(w: u32, h: u32) -> Rgb32FImage {
        Rgb32FImage::from_fn(w, h, |x, y| {
            let v = (x + y * w) as f32 / (w * h) as f32;
            Rgb([v, v, v])
        })
    }

    #[test]
    fn shorter_edge_resize_keeps_aspect() {
        assert_eq!(resize_shorter_edge(200, 100, 50), (100, 50));
        assert_eq!(resize_shorter_edge(90, 120, 30), (30, 40));
        assert_eq!(resize_shorter_edge(64, 64, 32), (32, 32));
    }

    #[test]
    fn centre_crop_is_deterministic_and_normalised() {
        let t = Transform::test(None, 2, 2, 3);
        let mut rng = Rng::new(0);
        let a = t.apply(ramp(4, 4), Path::new("a.png"), &mut rng).unwrap();
        let b = t.apply(ramp(4, 4), Path::new("a.png"), &mut rng).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.dims(), &[3, 2, 2]);
        assert!(a.max() <= 1.0 && a.min() >= -1.0);
        // centre crop of a 4x4 ramp starts at (1, 1): value 5/16
        assert!((a.data()[0] - (2.0 * 5.0 / 16.0 - 1.0)).abs() < 1e-6);
    }

    #[test]
    fn luminance_output_has_one_channel() {
        let t = Transform::test(Some(4), 4, 4, 1);
        let out = t
            .apply(ramp(8, 8), Path::new("a.png"), &mut Rng::new(1))
            .unwrap();
        assert_eq!(out.dims(), &[1, 4, 4]);
    }

    #[test]
    fn too_small_for_crop_is_an_error() {
        let t = Transform::train(None, 8, 8, 3);
        let err = t
            .apply(ramp(4, 4), Path::new("small.png"), &mut Rng::new(2))
            .unwrap_err();
        assert!(matches!(err, DataError::TooSmall { .. }));
    }
}
