use std::fmt;
use std::path::PathBuf;

/// Errors from listing, decoding or writing images.
#[derive(Debug)]
pub enum DataError {
    /// Reading a list file or directory failed.
    Io { path: PathBuf, source: std::io::Error },
    /// An image could not be decoded or encoded.
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    /// A dataset root contained no usable images.
    Empty(PathBuf),
    /// An image is smaller than the requested crop after resizing.
    TooSmall {
        path: PathBuf,
        width: u32,
        height: u32,
        crop: (u32, u32),
    },
    /// Tensors handed to the grid writer have incompatible shapes.
    Grid(String),
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Image { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Empty(root) => write!(f, "no images found under {}", root.display()),
            Self::TooSmall {
                path,
                width,
                height,
                crop,
            } => write!(
                f,
                "{}: {width}x{height} image cannot be cropped to {}x{}",
                path.display(),
                crop.0,
                crop.1
            ),
            Self::Grid(msg) => write!(f, "image grid: {msg}"),
        }
    }
}

impl std::error::Error for DataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Image { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub(crate) fn io_error(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> DataError {
    let path = path.into();
    move |source| DataError::Io { path, source }
}

pub(crate) fn image_error(path: impl Into<PathBuf>) -> impl FnOnce(image::ImageError) -> DataError {
    let path = path.into();
    move |source| DataError::Image { path, source }
}
