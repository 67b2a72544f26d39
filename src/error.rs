use std::fmt;
use std::path::PathBuf;

use funit_data::DataError;
use funit_nn::StateError;

/// Errors surfaced by configuration, training and inference.
#[derive(Debug)]
pub enum FunitError {
    /// A configuration value is out of range or inconsistent.
    Config(String),
    /// The configuration file is not valid YAML for the schema.
    Yaml(serde_yaml::Error),
    /// Filesystem access failed.
    Io { path: PathBuf, source: std::io::Error },
    /// Dataset listing, decoding or image writing failed.
    Data(DataError),
    /// Snapshot read/write or parameter loading failed.
    State(StateError),
    /// Tensors handed to an operation have incompatible shapes.
    Shape(String),
    /// No snapshot exists where one was expected.
    NoCheckpoint(PathBuf),
}

pub type Result<T> = std::result::Result<T, FunitError>;

impl fmt::Display for FunitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Yaml(e) => write!(f, "configuration parse error: {e}"),
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Data(e) => write!(f, "data error: {e}"),
            Self::State(e) => write!(f, "checkpoint error: {e}"),
            Self::Shape(msg) => write!(f, "shape error: {msg}"),
            Self::NoCheckpoint(dir) => write!(f, "no checkpoint found in {}", dir.display()),
        }
    }
}

impl std::error::Error for FunitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Yaml(e) => Some(e),
            Self::Io { source, .. } => Some(source),
            Self::Data(e) => Some(e),
            Self::State(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for FunitError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml(e)
    }
}

impl From<DataError> for FunitError {
    fn from(e: DataError) -> Self {
        Self::Data(e)
    }
}

impl From<StateError> for FunitError {
    fn from(e: StateError) -> Self {
        Self::State(e)
    }
}

pub(crate) fn io_error(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> FunitError {
    let path = path.into();
    move |source| FunitError::Io { path, source }
}
