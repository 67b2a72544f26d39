use std::fmt;

/// Dimension list of a row-major tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    pub fn from_slice(dims: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
        }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    /// Shorthand for an image batch shape.
    pub fn nchw(n: usize, c: usize, h: usize, w: usize) -> Self {
        Self {
            dims: vec![n, c, h, w],
        }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product::<usize>()
    }

    /// Unpack a 4-D shape as `(n, c, h, w)`.
    ///
    /// Panics if the shape is not 4-D; every image kernel relies on this.
    pub fn as_nchw(&self) -> (usize, usize, usize, usize) {
        assert_eq!(self.ndim(), 4, "expected NCHW shape, got {self}");
        (self.dims[0], self.dims[1], self.dims[2], self.dims[3])
    }

    /// Same shape with the leading (batch) dimension replaced.
    pub fn with_batch(&self, n: usize) -> Self {
        assert!(self.ndim() >= 1, "with_batch on a scalar shape");
        let mut dims = self.dims.clone();
        dims[0] = n;
        Self { dims }
    }

    /// Contiguous row-major strides.
    pub fn contiguous_strides(&self) -> Vec<usize> {
        let n = self.dims.len();
        if n == 0 {
            return Vec::new();
        }
        let mut strides = vec![0usize; n];
        strides[n - 1] = 1;
        for i in (0..n - 1).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// NumPy broadcasting of two shapes, `None` when incompatible.
    pub fn broadcast(a: &Shape, b: &Shape) -> Option<Shape> {
        let n = a.ndim().max(b.ndim());
        let mut result = Vec::with_capacity(n);
        for i in 0..n {
            let da = if i < n - a.ndim() { 1 } else { a.dims[i - (n - a.ndim())] };
            let db = if i < n - b.ndim() { 1 } else { b.dims[i - (n - b.ndim())] };
            if da == db || db == 1 {
                result.push(da);
            } else if da == 1 {
                result.push(db);
            } else {
                return None;
            }
        }
        Some(Shape::new(result))
    }
}

impl std::ops::Index<usize> for Shape {
    type Output = usize;
    fn index(&self, i: usize) -> &usize {
        &self.dims[i]
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}
