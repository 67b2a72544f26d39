//! NCHW image kernels and their adjoints.
//!
//! Every forward kernel here has a matching `*_backward` that maps a gradient
//! with the output's shape back onto the input's shape. Padding is never
//! implicit: convolutions and pools run over the valid region only, and
//! callers pad explicitly with [`pad2d`].

use crate::{Shape, Tensor};

/// Border handling for [`pad2d`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadMode {
    /// Mirror without repeating the edge pixel.
    Reflect,
    /// Repeat the edge pixel.
    Replicate,
    /// Fill with zeros.
    Zero,
}

/// Output extent of a valid (unpadded) window sweep.
pub fn window_out(len: usize, kernel: usize, stride: usize) -> usize {
    assert!(
        len >= kernel,
        "window of size {kernel} does not fit extent {len}"
    );
    (len - kernel) / stride + 1
}

/// 2-D cross-correlation. `weight` is `[co, ci, k, k]`, `bias` is `[co]`.
pub fn conv2d(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>, stride: usize) -> Tensor {
    let (n, ci, h, w) = input.shape().as_nchw();
    let (co, wci, kh, kw) = weight.shape().as_nchw();
    assert_eq!(
        ci, wci,
        "conv2d: input has {ci} channels, weight expects {wci}"
    );
    let oh = window_out(h, kh, stride);
    let ow = window_out(w, kw, stride);

    let x = input.data();
    let wt = weight.data();
    let mut out = vec![0.0; n * co * oh * ow];

    for b in 0..n {
        for o in 0..co {
            let plane = &mut out[(b * co + o) * oh * ow..(b * co + o + 1) * oh * ow];
            if let Some(bias) = bias {
                plane.fill(bias.data()[o]);
            }
            for c in 0..ci {
                let src = &x[(b * ci + c) * h * w..(b * ci + c + 1) * h * w];
                for i in 0..kh {
                    for j in 0..kw {
                        let wv = wt[((o * ci + c) * kh + i) * kw + j];
                        if wv == 0.0 {
                            continue;
                        }
                        for y in 0..oh {
                            let row = &src[(y * stride + i) * w..];
                            let dst = &mut plane[y * ow..(y + 1) * ow];
                            for (xo, d) in dst.iter_mut().enumerate() {
                                *d += wv * row[xo * stride + j];
                            }
                        }
                    }
                }
            }
        }
    }
    Tensor::new(out, Shape::nchw(n, co, oh, ow))
}

/// Gradient of [`conv2d`] w.r.t. its input.
pub fn conv2d_backward_input(
    grad_output: &Tensor,
    weight: &Tensor,
    input_shape: &Shape,
    stride: usize,
) -> Tensor {
    let (n, ci, h, w) = input_shape.as_nchw();
    let (co, _, kh, kw) = weight.shape().as_nchw();
    let (_, _, oh, ow) = grad_output.shape().as_nchw();

    let g = grad_output.data();
    let wt = weight.data();
    let mut out = vec![0.0; n * ci * h * w];

    for b in 0..n {
        for o in 0..co {
            let gplane = &g[(b * co + o) * oh * ow..(b * co + o + 1) * oh * ow];
            for c in 0..ci {
                let dst = &mut out[(b * ci + c) * h * w..(b * ci + c + 1) * h * w];
                for i in 0..kh {
                    for j in 0..kw {
                        let wv = wt[((o * ci + c) * kh + i) * kw + j];
                        if wv == 0.0 {
                            continue;
                        }
                        for y in 0..oh {
                            let row = &mut dst[(y * stride + i) * w..];
                            for xo in 0..ow {
                                row[xo * stride + j] += wv * gplane[y * ow + xo];
                            }
                        }
                    }
                }
            }
        }
    }
    Tensor::new(out, input_shape.clone())
}

/// Gradient of [`conv2d`] w.r.t. its weight, shaped `[co, ci, k, k]`.
pub fn conv2d_backward_weight(
    grad_output: &Tensor,
    input: &Tensor,
    kernel: usize,
    stride: usize,
) -> Tensor {
    let (n, ci, h, w) = input.shape().as_nchw();
    let (_, co, oh, ow) = grad_output.shape().as_nchw();

    let g = grad_output.data();
    let x = input.data();
    let mut out = vec![0.0; co * ci * kernel * kernel];

    for b in 0..n {
        for o in 0..co {
            let gplane = &g[(b * co + o) * oh * ow..(b * co + o + 1) * oh * ow];
            for c in 0..ci {
                let src = &x[(b * ci + c) * h * w..(b * ci + c + 1) * h * w];
                for i in 0..kernel {
                    for j in 0..kernel {
                        let mut acc = 0.0;
                        for y in 0..oh {
                            let row = &src[(y * stride + i) * w..];
                            let grow = &gplane[y * ow..(y + 1) * ow];
                            for (xo, &gv) in grow.iter().enumerate() {
                                acc += gv * row[xo * stride + j];
                            }
                        }
                        out[((o * ci + c) * kernel + i) * kernel + j] += acc;
                    }
                }
            }
        }
    }
    Tensor::new(out, Shape::nchw(co, ci, kernel, kernel))
}

/// Gradient of a per-channel bias: sum over batch and space, shaped `[c]`.
pub fn channel_sum(grad_output: &Tensor) -> Tensor {
    let (n, c, h, w) = grad_output.shape().as_nchw();
    let g = grad_output.data();
    let mut out = vec![0.0; c];
    for b in 0..n {
        for (ch, o) in out.iter_mut().enumerate() {
            *o += g[(b * c + ch) * h * w..(b * c + ch + 1) * h * w]
                .iter()
                .sum::<f64>();
        }
    }
    Tensor::new(out, Shape::from_slice(&[c]))
}

/// Source coordinate of padded position `i`, or `None` for a zero fill.
fn pad_source(i: usize, pad: usize, len: usize, mode: PadMode) -> Option<usize> {
    let j = i as isize - pad as isize;
    let last = len as isize - 1;
    if (0..=last).contains(&j) {
        return Some(j as usize);
    }
    match mode {
        PadMode::Zero => None,
        PadMode::Replicate => Some(j.clamp(0, last) as usize),
        PadMode::Reflect => {
            let r = if j < 0 { -j } else { 2 * last - j };
            Some(r as usize)
        }
    }
}

/// Pad height and width by `pad` on every side.
pub fn pad2d(input: &Tensor, pad: usize, mode: PadMode) -> Tensor {
    if pad == 0 {
        return input.clone();
    }
    let (n, c, h, w) = input.shape().as_nchw();
    if mode == PadMode::Reflect {
        assert!(
            pad < h && pad < w,
            "reflection pad {pad} needs extent above {pad}, got {h}x{w}"
        );
    }
    let (ph, pw) = (h + 2 * pad, w + 2 * pad);
    let x = input.data();
    let mut out = vec![0.0; n * c * ph * pw];

    for plane in 0..n * c {
        let src = &x[plane * h * w..(plane + 1) * h * w];
        let dst = &mut out[plane * ph * pw..(plane + 1) * ph * pw];
        for y in 0..ph {
            let Some(sy) = pad_source(y, pad, h, mode) else {
                continue;
            };
            for xo in 0..pw {
                if let Some(sx) = pad_source(xo, pad, w, mode) {
                    dst[y * pw + xo] = src[sy * w + sx];
                }
            }
        }
    }
    Tensor::new(out, Shape::nchw(n, c, ph, pw))
}

/// Adjoint of [`pad2d`]: folds the border gradient back onto its sources.
pub fn pad2d_backward(grad_output: &Tensor, pad: usize, mode: PadMode) -> Tensor {
    if pad == 0 {
        return grad_output.clone();
    }
    let (n, c, ph, pw) = grad_output.shape().as_nchw();
    let (h, w) = (ph - 2 * pad, pw - 2 * pad);
    let g = grad_output.data();
    let mut out = vec![0.0; n * c * h * w];

    for plane in 0..n * c {
        let src = &g[plane * ph * pw..(plane + 1) * ph * pw];
        let dst = &mut out[plane * h * w..(plane + 1) * h * w];
        for y in 0..ph {
            let Some(sy) = pad_source(y, pad, h, mode) else {
                continue;
            };
            for xo in 0..pw {
                if let Some(sx) = pad_source(xo, pad, w, mode) {
                    dst[sy * w + sx] += src[y * pw + xo];
                }
            }
        }
    }
    Tensor::new(out, Shape::nchw(n, c, h, w))
}

/// Average pool with a square window and no padding.
pub fn avg_pool2d(input: &Tensor, kernel: usize, stride: usize) -> Tensor {
    let (n, c, h, w) = input.shape().as_nchw();
    let oh = window_out(h, kernel, stride);
    let ow = window_out(w, kernel, stride);
    let norm = 1.0 / (kernel * kernel) as f64;
    let x = input.data();
    let mut out = vec![0.0; n * c * oh * ow];

    for plane in 0..n * c {
        let src = &x[plane * h * w..(plane + 1) * h * w];
        for y in 0..oh {
            for xo in 0..ow {
                let mut acc = 0.0;
                for i in 0..kernel {
                    for j in 0..kernel {
                        acc += src[(y * stride + i) * w + xo * stride + j];
                    }
                }
                out[(plane * oh + y) * ow + xo] = acc * norm;
            }
        }
    }
    Tensor::new(out, Shape::nchw(n, c, oh, ow))
}

pub fn avg_pool2d_backward(
    grad_output: &Tensor,
    input_shape: &Shape,
    kernel: usize,
    stride: usize,
) -> Tensor {
    let (n, c, h, w) = input_shape.as_nchw();
    let (_, _, oh, ow) = grad_output.shape().as_nchw();
    let norm = 1.0 / (kernel * kernel) as f64;
    let g = grad_output.data();
    let mut out = vec![0.0; n * c * h * w];

    for plane in 0..n * c {
        let dst = &mut out[plane * h * w..(plane + 1) * h * w];
        for y in 0..oh {
            for xo in 0..ow {
                let gv = g[(plane * oh + y) * ow + xo] * norm;
                for i in 0..kernel {
                    for j in 0..kernel {
                        dst[(y * stride + i) * w + xo * stride + j] += gv;
                    }
                }
            }
        }
    }
    Tensor::new(out, input_shape.clone())
}

/// Nearest-neighbour resize to `(out_h, out_w)`.
///
/// Source index is `floor(dst * in / out)`, clamped to the last row/column.
pub fn resize_nearest(input: &Tensor, out_h: usize, out_w: usize) -> Tensor {
    let (n, c, h, w) = input.shape().as_nchw();
    let rows = nearest_index(h, out_h);
    let cols = nearest_index(w, out_w);
    let x = input.data();
    let mut out = Vec::with_capacity(n * c * out_h * out_w);

    for plane in 0..n * c {
        let src = &x[plane * h * w..(plane + 1) * h * w];
        for &sy in &rows {
            for &sx in &cols {
                out.push(src[sy * w + sx]);
            }
        }
    }
    Tensor::new(out, Shape::nchw(n, c, out_h, out_w))
}

/// Adjoint of [`resize_nearest`].
pub fn resize_nearest_backward(grad_output: &Tensor, input_shape: &Shape) -> Tensor {
    let (n, c, h, w) = input_shape.as_nchw();
    let (_, _, oh, ow) = grad_output.shape().as_nchw();
    let rows = nearest_index(h, oh);
    let cols = nearest_index(w, ow);
    let g = grad_output.data();
    let mut out = vec![0.0; n * c * h * w];

    for plane in 0..n * c {
        let dst = &mut out[plane * h * w..(plane + 1) * h * w];
        for (y, &sy) in rows.iter().enumerate() {
            for (xo, &sx) in cols.iter().enumerate() {
                dst[sy * w + sx] += g[(plane * oh + y) * ow + xo];
            }
        }
    }
    Tensor::new(out, input_shape.clone())
}

fn nearest_index(in_len: usize, out_len: usize) -> Vec<usize> {
    (0..out_len)
        .map(|d| ((d * in_len) / out_len).min(in_len - 1))
        .collect()
}

/// Integer-factor nearest upsampling.
pub fn upsample_nearest2d(input: &Tensor, scale: usize) -> Tensor {
    let (_, _, h, w) = input.shape().as_nchw();
    resize_nearest(input, h * scale, w * scale)
}

pub fn upsample_nearest2d_backward(grad_output: &Tensor, input_shape: &Shape) -> Tensor {
    resize_nearest_backward(grad_output, input_shape)
}

/// Mean over height and width: `[n, c, h, w] -> [n, c]`.
pub fn spatial_mean(input: &Tensor) -> Tensor {
    let (n, c, h, w) = input.shape().as_nchw();
    let hw = (h * w) as f64;
    let x = input.data();
    let out = (0..n * c)
        .map(|plane| x[plane * h * w..(plane + 1) * h * w].iter().sum::<f64>() / hw)
        .collect();
    Tensor::new(out, Shape::from_slice(&[n, c]))
}

pub fn spatial_mean_backward(grad_output: &Tensor, input_shape: &Shape) -> Tensor {
    let (n, c, h, w) = input_shape.as_nchw();
    let hw = h * w;
    let g = grad_output.data();
    assert_eq!(g.len(), n * c, "spatial_mean_backward: gradient must be [n, c]");
    let mut out = Vec::with_capacity(n * c * hw);
    for &gv in g {
        out.extend(std::iter::repeat(gv / hw as f64).take(hw));
    }
    Tensor::new(out, input_shape.clone())
}

/// Gather channel `labels[b]` of every sample: `[n, c, h, w] -> [n, h, w]`.
pub fn select_channel(input: &Tensor, labels: &[usize]) -> Tensor {
    let (n, c, h, w) = input.shape().as_nchw();
    assert_eq!(labels.len(), n, "select_channel: one label per sample");
    let x = input.data();
    let mut out = Vec::with_capacity(n * h * w);
    for (b, &label) in labels.iter().enumerate() {
        assert!(label < c, "label {label} out of range for {c} classes");
        out.extend_from_slice(&x[(b * c + label) * h * w..(b * c + label + 1) * h * w]);
    }
    Tensor::new(out, Shape::from_slice(&[n, h, w]))
}

/// Scatter a `[n, h, w]` gradient back into channel `labels[b]`.
pub fn select_channel_backward(grad_output: &Tensor, labels: &[usize], channels: usize) -> Tensor {
    let n = labels.len();
    let hw = grad_output.numel() / n.max(1);
    let (h, w) = (grad_output.shape()[1], grad_output.shape()[2]);
    let g = grad_output.data();
    let mut out = vec![0.0; n * channels * hw];
    for (b, &label) in labels.iter().enumerate() {
        out[(b * channels + label) * hw..(b * channels + label + 1) * hw]
            .copy_from_slice(&g[b * hw..(b + 1) * hw]);
    }
    Tensor::new(out, Shape::nchw(n, channels, h, w))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: Shape) -> Tensor {
        let n = shape.numel();
        Tensor::new((0..n).map(|i| i as f64 * 0.1 - 0.3).collect(), shape)
    }

    /// `<A x, y> == <x, A^T y>` for a linear map and its claimed adjoint.
    fn assert_adjoint(
        x: &Tensor,
        forward: impl Fn(&Tensor) -> Tensor,
        backward: impl Fn(&Tensor) -> Tensor,
    ) {
        let ax = forward(x);
        let y = ramp(ax.shape().clone()).map(|v| (v * 7.0).sin());
        let lhs: f64 = ax.mul(&y).sum();
        let rhs: f64 = x.mul(&backward(&y)).sum();
        assert!(
            (lhs - rhs).abs() < 1e-9 * (1.0 + lhs.abs()),
            "adjoint mismatch: {lhs} vs {rhs}"
        );
    }

    #[test]
    fn conv2d_identity_kernel() {
        let x = ramp(Shape::nchw(1, 1, 3, 3));
        let w = Tensor::new(vec![1.0], Shape::nchw(1, 1, 1, 1));
        let b = Tensor::from_slice(&[0.5]);
        let y = conv2d(&x, &w, Some(&b), 1);
        assert_eq!(y.dims(), &[1, 1, 3, 3]);
        assert!((y.get(&[0, 0, 1, 1]) - (x.get(&[0, 0, 1, 1]) + 0.5)).abs() < 1e-12);
    }

    #[test]
    fn conv2d_stride_output_size() {
        let x = ramp(Shape::nchw(2, 3, 7, 7));
        let w = ramp(Shape::nchw(4, 3, 3, 3));
        let y = conv2d(&x, &w, None, 2);
        assert_eq!(y.dims(), &[2, 4, 3, 3]);
    }

    #[test]
    fn conv2d_backward_input_is_adjoint() {
        let x = ramp(Shape::nchw(2, 2, 6, 5));
        let w = ramp(Shape::nchw(3, 2, 3, 3)).map(|v| v.cos());
        assert_adjoint(
            &x,
            |x| conv2d(x, &w, None, 2),
            |g| conv2d_backward_input(g, &w, x.shape(), 2),
        );
    }

    #[test]
    fn conv2d_backward_weight_is_adjoint() {
        let x = ramp(Shape::nchw(2, 2, 5, 5)).map(|v| v.sin());
        let w = ramp(Shape::nchw(3, 2, 3, 3));
        assert_adjoint(
            &w,
            |w| conv2d(&x, w, None, 1),
            |g| conv2d_backward_weight(g, &x, 3, 1),
        );
    }

    #[test]
    fn reflect_pad_matches_mirror() {
        let tall = Tensor::new(
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0],
            Shape::nchw(1, 1, 3, 3),
        );
        let p = pad2d(&tall, 1, PadMode::Reflect);
        assert_eq!(p.dims(), &[1, 1, 5, 5]);
        // Row -1 mirrors row 1, column -1 mirrors column 1.
        assert_eq!(p.get(&[0, 0, 0, 0]), 5.0);
        assert_eq!(p.get(&[0, 0, 0, 2]), 5.0);
        assert_eq!(p.get(&[0, 0, 4, 4]), 5.0);
        assert_eq!(p.get(&[0, 0, 2, 0]), 5.0);
        assert_eq!(p.get(&[0, 0, 1, 1]), 1.0);
    }

    #[test]
    fn pad_modes_are_adjoint() {
        let x = ramp(Shape::nchw(1, 2, 4, 5));
        for mode in [PadMode::Reflect, PadMode::Replicate, PadMode::Zero] {
            assert_adjoint(&x, |x| pad2d(x, 2, mode), |g| pad2d_backward(g, 2, mode));
        }
    }

    #[test]
    fn avg_pool_and_adjoint() {
        let x = Tensor::ones(Shape::nchw(1, 1, 5, 5));
        let y = avg_pool2d(&x, 3, 2);
        assert_eq!(y.dims(), &[1, 1, 2, 2]);
        assert!(y.data().iter().all(|&v| (v - 1.0).abs() < 1e-12));

        let x = ramp(Shape::nchw(2, 1, 7, 6));
        assert_adjoint(
            &x,
            |x| avg_pool2d(x, 3, 2),
            |g| avg_pool2d_backward(g, x.shape(), 3, 2),
        );
    }

    #[test]
    fn resize_nearest_follows_floor_rule() {
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], Shape::nchw(1, 1, 2, 2));
        let up = upsample_nearest2d(&x, 2);
        assert_eq!(up.dims(), &[1, 1, 4, 4]);
        assert_eq!(up.get(&[0, 0, 1, 1]), 1.0);
        assert_eq!(up.get(&[0, 0, 3, 2]), 4.0);

        let big = ramp(Shape::nchw(1, 1, 6, 6));
        let small = resize_nearest(&big, 4, 4);
        // floor(3 * 6 / 4) = 4
        assert_eq!(small.get(&[0, 0, 3, 3]), big.get(&[0, 0, 4, 4]));

        assert_adjoint(
            &big,
            |x| resize_nearest(x, 4, 5),
            |g| resize_nearest_backward(g, big.shape()),
        );
    }

    #[test]
    fn spatial_mean_and_adjoint() {
        let x = ramp(Shape::nchw(2, 3, 2, 2));
        let m = spatial_mean(&x);
        assert_eq!(m.dims(), &[2, 3]);
        let expected = (x.get(&[1, 2, 0, 0])
            + x.get(&[1, 2, 0, 1])
            + x.get(&[1, 2, 1, 0])
            + x.get(&[1, 2, 1, 1]))
            / 4.0;
        assert!((m.get(&[1, 2]) - expected).abs() < 1e-12);
        assert_adjoint(&x, spatial_mean, |g| spatial_mean_backward(g, x.shape()));
    }

    #[test]
    fn select_channel_and_adjoint() {
        let x = ramp(Shape::nchw(2, 3, 2, 2));
        let labels = [2, 0];
        let s = select_channel(&x, &labels);
        assert_eq!(s.dims(), &[2, 2, 2]);
        assert_eq!(s.get(&[0, 1, 1]), x.get(&[0, 2, 1, 1]));
        assert_eq!(s.get(&[1, 0, 1]), x.get(&[1, 0, 0, 1]));
        assert_adjoint(
            &x,
            |x| select_channel(x, &labels),
            |g| select_channel_backward(g, &labels, 3),
        );
    }

    #[test]
    fn channel_sum_reduces_batch_and_space() {
        let g = Tensor::ones(Shape::nchw(2, 3, 2, 2));
        assert_eq!(channel_sum(&g).data(), &[8.0, 8.0, 8.0]);
    }
}
