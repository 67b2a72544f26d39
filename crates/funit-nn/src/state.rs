//! Saving and loading parameter snapshots as safetensors files (F64).

use std::path::Path;

use funit_tensor::{Shape, Tensor};

use crate::module::StateDict;
use crate::Module;

/// Errors from snapshot IO or from loading a snapshot into a module.
#[derive(Debug)]
pub enum StateError {
    Io(std::io::Error),
    Parse(safetensors::SafeTensorError),
    Serialize(safetensors::SafeTensorError),
    UnsupportedDtype(String),
    MissingKey(String),
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {e}"),
            Self::Parse(e) => write!(f, "parse error: {e}"),
            Self::Serialize(e) => write!(f, "serialize error: {e}"),
            Self::UnsupportedDtype(d) => write!(f, "unsupported dtype: {d}"),
            Self::MissingKey(k) => write!(f, "missing parameter: {k}"),
            Self::ShapeMismatch {
                name,
                expected,
                got,
            } => write!(f, "shape mismatch for {name}: expected {expected:?}, got {got:?}"),
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) | Self::Serialize(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StateError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Write `state` to `path`.
pub fn save(state: &StateDict, path: &Path) -> Result<(), StateError> {
    let tensor_data: Vec<(&str, Vec<u8>, Vec<usize>)> = state
        .iter()
        .map(|(name, tensor)| {
            let bytes = tensor.data().iter().flat_map(|v| v.to_le_bytes()).collect();
            (name.as_str(), bytes, tensor.dims().to_vec())
        })
        .collect();

    let views = tensor_data
        .iter()
        .map(|(name, bytes, shape)| {
            safetensors::tensor::TensorView::new(safetensors::Dtype::F64, shape.clone(), bytes)
                .map(|view| (*name, view))
                .map_err(StateError::Serialize)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let serialized = safetensors::tensor::serialize(views, &None).map_err(StateError::Serialize)?;
    std::fs::write(path, serialized)?;
    Ok(())
}

/// Read a snapshot written by [`save`]. F32 files are widened to F64.
pub fn load(path: &Path) -> Result<StateDict, StateError> {
    let data = std::fs::read(path)?;
    let tensors = safetensors::SafeTensors::deserialize(&data).map_err(StateError::Parse)?;

    let mut result = StateDict::new();
    for (name, view) in tensors.tensors() {
        let bytes = view.data();
        let values: Vec<f64> = match view.dtype() {
            safetensors::Dtype::F64 => bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
            safetensors::Dtype::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            other => return Err(StateError::UnsupportedDtype(format!("{other:?}"))),
        };
        result.insert(name, Tensor::new(values, Shape::new(view.shape().to_vec())));
    }
    Ok(result)
}

pub fn save_module(module: &dyn Module, path: &Path) -> Result<(), StateError> {
    save(&module.state_dict(), path)
}

pub fn load_module(module: &mut dyn Module, path: &Path) -> Result<(), StateError> {
    module.load_state_dict(&load(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Linear;

    #[test]
    fn module_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fc.safetensors");
        let src = Linear::new(3, 2, 11);
        save_module(&src, &path).unwrap();

        let mut dst = Linear::new(3, 2, 99);
        load_module(&mut dst, &path).unwrap();
        assert_eq!(dst.state_dict(), src.state_dict());
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fc.safetensors");
        save_module(&Linear::new(3, 2, 1), &path).unwrap();

        let mut wrong = Linear::new(4, 2, 1);
        match load_module(&mut wrong, &path) {
            Err(StateError::ShapeMismatch { name, .. }) => assert_eq!(name, "weight"),
            other => panic!("expected shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load(Path::new("/nonexistent/snapshot.safetensors")).unwrap_err();
        assert!(matches!(err, StateError::Io(_)));
    }
}
