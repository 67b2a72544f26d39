use crate::Shape;

/// Dense row-major `f64` tensor with CPU storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f64>,
    shape: Shape,
    strides: Vec<usize>,
}

impl Tensor {
    /// Wrap row-major `data` as a tensor of `shape`.
    pub fn new(data: Vec<f64>, shape: Shape) -> Self {
        assert_eq!(
            data.len(),
            shape.numel(),
            "tensor data length does not match shape {shape}"
        );
        let strides = shape.contiguous_strides();
        Self {
            data,
            shape,
            strides,
        }
    }

    pub fn zeros(shape: Shape) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: Shape) -> Self {
        Self::full(shape, 1.0)
    }

    pub fn full(shape: Shape, value: f64) -> Self {
        let n = shape.numel();
        Self::new(vec![value; n], shape)
    }

    /// Tensor of zeros with the same shape as `self`.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape.clone())
    }

    /// Create a tensor from a closure over multi-indices.
    pub fn from_fn(shape: Shape, f: impl Fn(&[usize]) -> f64) -> Self {
        let n = shape.numel();
        let ndim = shape.ndim();
        let mut data = Vec::with_capacity(n);
        let mut idx = vec![0usize; ndim];

        for _ in 0..n {
            data.push(f(&idx));
            for d in (0..ndim).rev() {
                idx[d] += 1;
                if idx[d] < shape[d] {
                    break;
                }
                idx[d] = 0;
            }
        }
        Self::new(data, shape)
    }

    pub fn scalar(val: f64) -> Self {
        Self::new(vec![val], Shape::scalar())
    }

    pub fn from_slice(s: &[f64]) -> Self {
        Self::new(s.to_vec(), Shape::from_slice(&[s.len()]))
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }
    pub fn data(&self) -> &[f64] {
        &self.data
    }
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }
    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    fn flat_index(&self, idx: &[usize]) -> usize {
        debug_assert_eq!(idx.len(), self.ndim());
        idx.iter()
            .zip(self.strides.iter())
            .map(|(i, s)| i * s)
            .sum()
    }

    /// Element at `idx`, one index per dimension.
    pub fn get(&self, idx: &[usize]) -> f64 {
        self.data[self.flat_index(idx)]
    }

    pub fn set(&mut self, idx: &[usize], val: f64) {
        let fi = self.flat_index(idx);
        self.data[fi] = val;
    }

    /// Value of a single-element tensor.
    pub fn item(&self) -> f64 {
        assert_eq!(self.numel(), 1, "item() on tensor of shape {}", self.shape);
        self.data[0]
    }

    /// Reshape to a shape with the same element count.
    pub fn reshape(&self, new_shape: Shape) -> Self {
        assert_eq!(
            self.shape.numel(),
            new_shape.numel(),
            "reshape: incompatible sizes {} -> {}",
            self.shape,
            new_shape
        );
        Self::new(self.data.clone(), new_shape)
    }

    /// Transpose of a 2-D tensor.
    pub fn transpose(&self) -> Self {
        assert_eq!(self.ndim(), 2, "transpose requires a 2-D tensor");
        let (m, n) = (self.shape[0], self.shape[1]);
        let mut out = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                out[j * m + i] = self.data[i * n + j];
            }
        }
        Self::new(out, Shape::from_slice(&[n, m]))
    }

    // Element-wise

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        let data: Vec<f64> = self.data.iter().map(|&v| f(v)).collect();
        Self::new(data, self.shape.clone())
    }

    /// Apply `f` pairwise, broadcasting as NumPy does.
    pub fn zip_with(&self, other: &Self, f: impl Fn(f64, f64) -> f64) -> Self {
        if self.shape == other.shape {
            let data: Vec<f64> = self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Self::new(data, self.shape.clone());
        }

        let out_shape = Shape::broadcast(&self.shape, &other.shape).unwrap_or_else(|| {
            panic!(
                "zip_with: shapes {} and {} do not broadcast",
                self.shape, other.shape
            )
        });

        Self::from_fn(out_shape, |idx| {
            f(self.broadcast_get(idx), other.broadcast_get(idx))
        })
    }

    fn broadcast_get(&self, idx: &[usize]) -> f64 {
        let nd = self.ndim();
        let offset = idx.len() - nd;
        let mut fi = 0;
        for d in 0..nd {
            let i = if self.shape[d] == 1 { 0 } else { idx[d + offset] };
            fi += i * self.strides[d];
        }
        self.data[fi]
    }

    pub fn add(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn div(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a / b)
    }

    pub fn neg(&self) -> Self {
        self.map(|v| -v)
    }

    pub fn scale(&self, s: f64) -> Self {
        self.map(|v| v * s)
    }

    pub fn add_scalar(&self, s: f64) -> Self {
        self.map(|v| v + s)
    }

    /// In-place `self += alpha * other` for same-shaped tensors.
    pub fn axpy(&mut self, alpha: f64, other: &Self) {
        assert_eq!(
            self.shape, other.shape,
            "axpy: shape mismatch {} vs {}",
            self.shape, other.shape
        );
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += alpha * b;
        }
    }

    pub fn tanh(&self) -> Self {
        self.map(f64::tanh)
    }
    pub fn abs(&self) -> Self {
        self.map(f64::abs)
    }
    pub fn sqrt(&self) -> Self {
        self.map(f64::sqrt)
    }
    pub fn exp(&self) -> Self {
        self.map(f64::exp)
    }

    pub fn relu(&self) -> Self {
        self.map(|v| if v > 0.0 { v } else { 0.0 })
    }

    /// Leaky ReLU with the given negative slope.
    pub fn leaky_relu(&self, slope: f64) -> Self {
        self.map(|v| if v > 0.0 { v } else { v * slope })
    }

    // Reductions

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn mean(&self) -> f64 {
        self.sum() / self.numel() as f64
    }

    pub fn max(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn min(&self) -> f64 {
        self.data.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Euclidean norm over all elements.
    pub fn norm_l2(&self) -> f64 {
        self.data.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    /// Largest absolute value.
    pub fn max_abs(&self) -> f64 {
        self.data.iter().fold(0.0, |m, v| m.max(v.abs()))
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Fraction of elements satisfying `pred`.
    pub fn fraction(&self, pred: impl Fn(f64) -> bool) -> f64 {
        let hits = self.data.iter().filter(|&&v| pred(v)).count();
        hits as f64 / self.numel() as f64
    }

    /// Sum along an axis, removing it.
    pub fn sum_axis(&self, axis: usize) -> Self {
        assert!(axis < self.ndim());
        let dims = self.dims();
        let outer: usize = dims[..axis].iter().product();
        let size = dims[axis];
        let inner: usize = dims[axis + 1..].iter().product();

        let mut new_dims = dims.to_vec();
        new_dims.remove(axis);
        if new_dims.is_empty() {
            return Self::scalar(self.sum());
        }

        let mut out = vec![0.0; outer * inner];
        for o in 0..outer {
            for k in 0..size {
                let src = &self.data[(o * size + k) * inner..(o * size + k + 1) * inner];
                let dst = &mut out[o * inner..(o + 1) * inner];
                for (d, s) in dst.iter_mut().zip(src) {
                    *d += s;
                }
            }
        }
        Self::new(out, Shape::new(new_dims))
    }

    pub fn mean_axis(&self, axis: usize) -> Self {
        let n = self.shape[axis] as f64;
        self.sum_axis(axis).scale(1.0 / n)
    }

    /// Matrix multiply for 2-D tensors.
    pub fn matmul(&self, other: &Self) -> Self {
        assert_eq!(self.ndim(), 2);
        assert_eq!(other.ndim(), 2);
        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];
        assert_eq!(
            other.shape[0], k,
            "matmul: inner dimensions differ ({} vs {})",
            self.shape, other.shape
        );

        let mut out = vec![0.0; m * n];
        for i in 0..m {
            let row = &mut out[i * n..(i + 1) * n];
            for p in 0..k {
                let a = self.data[i * k + p];
                if a == 0.0 {
                    continue;
                }
                let b_row = &other.data[p * n..(p + 1) * n];
                for (o, &b) in row.iter_mut().zip(b_row) {
                    *o += a * b;
                }
            }
        }
        Self::new(out, Shape::from_slice(&[m, n]))
    }

    // Leading (batch) dimension

    /// Stack same-shaped tensors along a new leading dimension.
    pub fn stack(tensors: &[&Tensor]) -> Self {
        assert!(!tensors.is_empty(), "stack: need at least one tensor");
        let inner_shape = tensors[0].shape();
        for t in &tensors[1..] {
            assert_eq!(
                t.shape(),
                inner_shape,
                "stack: all tensors must have same shape"
            );
        }

        let mut new_dims = Vec::with_capacity(inner_shape.ndim() + 1);
        new_dims.push(tensors.len());
        new_dims.extend_from_slice(inner_shape.dims());

        let mut data = Vec::with_capacity(inner_shape.numel() * tensors.len());
        for t in tensors {
            data.extend_from_slice(t.data());
        }
        Self::new(data, Shape::new(new_dims))
    }

    /// Concatenate along the leading dimension.
    pub fn cat(tensors: &[&Tensor]) -> Self {
        assert!(!tensors.is_empty(), "cat: need at least one tensor");
        let tail = &tensors[0].dims()[1..];
        let mut n = 0;
        for t in tensors {
            assert_eq!(
                &t.dims()[1..],
                tail,
                "cat: trailing dimensions differ ({} vs {})",
                t.shape(),
                tensors[0].shape()
            );
            n += t.shape()[0];
        }
        let mut data = Vec::with_capacity(tensors.iter().map(|t| t.numel()).sum());
        for t in tensors {
            data.extend_from_slice(t.data());
        }
        Self::new(data, tensors[0].shape().with_batch(n))
    }

    /// Slice `len` entries of the leading dimension starting at `start`.
    pub fn narrow(&self, start: usize, len: usize) -> Self {
        let n = self.shape[0];
        assert!(start + len <= n, "narrow: {start}+{len} exceeds {n}");
        let inner = self.numel() / n.max(1);
        let data = self.data[start * inner..(start + len) * inner].to_vec();
        Self::new(data, self.shape.with_batch(len))
    }

    /// Split the leading dimension into two halves of sizes `first` and the rest.
    pub fn split_at(&self, first: usize) -> (Self, Self) {
        let n = self.shape[0];
        (self.narrow(0, first), self.narrow(first, n - first))
    }
}
