//! Image decoding and per-class pixel preprocessing.

use std::path::Path;

use image::{ImageReader, Rgb, Rgb32FImage};
use serde::{Deserialize, Serialize};

use crate::error::{image_error, io_error, DataError};

/// Luminance weights used for greyscale conversion (ITU-R BT.709).
pub const LUMA: [f32; 3] = [0.2125, 0.7154, 0.0721];

/// A pixel-wise operation applied right after decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelOp {
    /// Replace RGB by its luminance on all three channels.
    Grey,
    /// `v -> 1 - v` on RGB.
    Invert,
    /// Composite onto a white background using the alpha channel.
    DropAlpha,
}

/// Operations applied to every image of the class named `class`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRule {
    pub class: String,
    pub ops: Vec<PixelOp>,
}

impl ClassRule {
    pub fn new(class: impl Into<String>, ops: &[PixelOp]) -> Self {
        Self {
            class: class.into(),
            ops: ops.to_vec(),
        }
    }
}

/// Decodes images and applies the rule matching each image's class.
#[derive(Debug, Clone, Default)]
pub struct Preprocess {
    rules: Vec<ClassRule>,
}

impl Preprocess {
    pub fn new(rules: Vec<ClassRule>) -> Self {
        Self { rules }
    }

    /// Rules for the microscopy datasets this model was tuned on.
    pub fn microscopy_rules() -> Vec<ClassRule> {
        vec![
            ClassRule::new("malaria", &[PixelOp::Grey, PixelOp::Invert]),
            ClassRule::new("Human_HT29_colon-cancer", &[PixelOp::Grey]),
            ClassRule::new("dp", &[PixelOp::DropAlpha, PixelOp::Grey]),
        ]
    }

    pub fn rules(&self) -> &[ClassRule] {
        &self.rules
    }

    /// Decode `path` (format guessed from content) and apply `class`'s rule.
    ///
    /// The result is always three-channel RGB in `[0, 1]`; greyscale sources
    /// are replicated across channels and alpha is dropped unless a
    /// [`PixelOp::DropAlpha`] rule composites it first.
    pub fn load(&self, path: &Path, class: &str) -> Result<Rgb32FImage, DataError> {
        let decoded = ImageReader::open(path)
            .map_err(io_error(path))?
            .with_guessed_format()
            .map_err(io_error(path))?
            .decode()
            .map_err(image_error(path))?;
        let rgba = decoded.to_rgba32f();
        let ops = self
            .rules
            .iter()
            .find(|r| r.class == class)
            .map(|r| r.ops.as_slice())
            .unwrap_or(&[]);

        let (width, height) = rgba.dimensions();
        let mut out = Rgb32FImage::new(width, height);
        for (dst, src) in out.pixels_mut().zip(rgba.pixels()) {
            let mut px = src.0;
            for op in ops {
                apply_op(*op, &mut px);
            }
            *dst = Rgb([px[0], px[1], px[2]]);
        }
        Ok(out)
    }
}

fn apply_op(op: PixelOp, px: &mut [f32; 4]) {
    match op {
        PixelOp::Grey => {
            let y = LUMA[0] * px[0] + LUMA[1] * px[1] + LUMA[2] * px[2];
            px[..3].fill(y);
        }
        PixelOp::Invert => {
            for v in &mut px[..3] {
                *v = 1.0 - *v;
            }
        }
        PixelOp::DropAlpha => {
            let a = px[3];
            for v in &mut px[..3] {
                *v = *v * a + (1.0 - a);
            }
            px[3] = 1.0;
        }
    }
}
