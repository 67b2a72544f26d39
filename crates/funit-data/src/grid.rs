use std::path::Path;

use funit_tensor::Tensor;
use image::{Rgb, RgbImage};

use crate::error::{image_error, DataError};

/// Write batches of `[-1, 1]` images as a PNG grid: one row per tensor,
/// one column per sample.
///
/// Each tensor is `[B, C, H, W]` with `C` of 1 or 3. Cells are sized to the
/// largest image; smaller images sit in the top-left corner of their cell.
pub fn save_image_grid(rows: &[&Tensor], path: &Path) -> Result<(), DataError> {
    if rows.is_empty() {
        return Err(DataError::Grid(String::from("no rows to write")));
    }
    let mut cell = (0, 0);
    let mut cols = 0;
    for row in rows {
        if row.ndim() != 4 {
            return Err(DataError::Grid(format!(
                "expected [B, C, H, W], got {}",
                row.shape()
            )));
        }
        let (n, c, h, w) = row.shape().as_nchw();
        if c != 1 && c != 3 {
            return Err(DataError::Grid(format!("unsupported channel count {c}")));
        }
        cell = (cell.0.max(w), cell.1.max(h));
        cols = cols.max(n);
    }

    let mut grid = RgbImage::new((cell.0 * cols) as u32, (cell.1 * rows.len()) as u32);
    for (r, row) in rows.iter().enumerate() {
        let (n, c, h, w) = row.shape().as_nchw();
        let data = row.data();
        for s in 0..n {
            for y in 0..h {
                for x in 0..w {
                    let channel = |ch: usize| to_u8(data[((s * c + ch) * h + y) * w + x]);
                    let px = if c == 1 {
                        let v = channel(0);
                        Rgb([v, v, v])
                    } else {
                        Rgb([channel(0), channel(1), channel(2)])
                    };
                    grid.put_pixel((s * cell.0 + x) as u32, (r * cell.1 + y) as u32, px);
                }
            }
        }
    }
    grid.save(path).map_err(image_error(path))
}

fn to_u8(v: f64) -> u8 {
    (((v + 1.0) * 0.5).clamp(0.0, 1.0) * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use funit_tensor::Shape;

    #[test]
    fn value_mapping() {
        assert_eq!(to_u8(-1.0), 0);
        assert_eq!(to_u8(1.0), 255);
        assert_eq!(to_u8(3.0), 255);
        assert_eq!(to_u8(0.0), 128);
    }

    #[test]
    fn grid_dimensions_follow_largest_cell() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.png");
        let a = Tensor::full(Shape::nchw(2, 3, 4, 4), 1.0);
        let b = Tensor::full(Shape::nchw(3, 1, 2, 6), -1.0);
        save_image_grid(&[&a, &b], &path).unwrap();

        let img = image::open(&path).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (18, 8));
        assert_eq!(img.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(img.get_pixel(0, 4), &Rgb([0, 0, 0]));
    }

    #[test]
    fn rejects_non_image_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let bad = Tensor::zeros(Shape::from_slice(&[2, 3]));
        let err = save_image_grid(&[&bad], &dir.path().join("x.png")).unwrap_err();
        assert!(matches!(err, DataError::Grid(_)));
    }
}
