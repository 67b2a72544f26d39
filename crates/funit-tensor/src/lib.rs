//! Dense `f64` tensors and the NCHW image kernels used by funit.

mod shape;
mod tensor;

pub mod ops;

pub use ops::PadMode;
pub use shape::Shape;
pub use tensor::Tensor;
