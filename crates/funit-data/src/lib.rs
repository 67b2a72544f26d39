//! Labelled image datasets, augmentation and batching for few-shot translation.

mod dataset;
mod error;
mod grid;
mod loader;
mod preprocess;
mod transform;

pub use dataset::{
    list_images, Dataset, ImageFolder, ImageLabelFilelist, Sample, FOLDER_EXTENSIONS,
};
pub use error::DataError;
pub use grid::save_image_grid;
pub use loader::{Batch, DataLoader};
pub use preprocess::{ClassRule, PixelOp, Preprocess, LUMA};
pub use transform::{resize_shorter_edge, Transform};
