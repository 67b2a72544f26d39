use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use funit_nn::Rng;
use funit_tensor::Tensor;
use tracing::{info, warn};

use crate::error::{io_error, DataError};
use crate::preprocess::Preprocess;
use crate::transform::Transform;

/// Extensions picked up by [`ImageFolder`], compared case-insensitively.
pub const FOLDER_EXTENSIONS: [&str; 3] = ["tif", "png", "dib"];

/// One transformed image and its class index.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub image: Tensor,
    pub label: usize,
}

/// An indexed collection of labelled images.
pub trait Dataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Class names, in label order.
    fn class_names(&self) -> &[String];

    fn num_classes(&self) -> usize {
        self.class_names().len()
    }

    fn label(&self, index: usize) -> usize;

    /// Decode and transform item `index`. `rng` drives random augmentation.
    fn get(&self, index: usize, rng: &mut Rng) -> Result<Sample, DataError>;
}

impl<D: Dataset + ?Sized> Dataset for Box<D> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn class_names(&self) -> &[String] {
        (**self).class_names()
    }

    fn label(&self, index: usize) -> usize {
        (**self).label(index)
    }

    fn get(&self, index: usize, rng: &mut Rng) -> Result<Sample, DataError> {
        (**self).get(index, rng)
    }
}

/// Paths, labels and the pipeline shared by both dataset layouts.
#[derive(Debug, Clone)]
struct Listing {
    classes: Vec<String>,
    items: Vec<(PathBuf, usize)>,
    preprocess: Preprocess,
    transform: Transform,
}

impl Listing {
    fn get(&self, index: usize, rng: &mut Rng) -> Result<Sample, DataError> {
        let (path, label) = &self.items[index];
        let img = self.preprocess.load(path, &self.classes[*label])?;
        let image = self.transform.apply(img, path, rng)?;
        Ok(Sample {
            image,
            label: *label,
        })
    }
}

macro_rules! impl_dataset {
    ($ty:ty) => {
        impl Dataset for $ty {
            fn len(&self) -> usize {
                self.listing.items.len()
            }

            fn class_names(&self) -> &[String] {
                &self.listing.classes
            }

            fn label(&self, index: usize) -> usize {
                self.listing.items[index].1
            }

            fn get(&self, index: usize, rng: &mut Rng) -> Result<Sample, DataError> {
                self.listing.get(index, rng)
            }
        }
    };
}

/// Images named by a list file of paths relative to `root`.
///
/// The class of each entry is the first component of its relative path;
/// classes are sorted and labelled by position.
#[derive(Debug, Clone)]
pub struct ImageLabelFilelist {
    listing: Listing,
}

impl ImageLabelFilelist {
    pub fn new(
        root: &Path,
        filelist: &Path,
        preprocess: Preprocess,
        transform: Transform,
    ) -> Result<Self, DataError> {
        let text = std::fs::read_to_string(filelist).map_err(io_error(filelist))?;
        let entries: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if entries.is_empty() {
            return Err(DataError::Empty(filelist.to_path_buf()));
        }

        let classes: Vec<String> = entries
            .iter()
            .map(|e| first_component(e).to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let items = entries
            .iter()
            .map(|e| {
                let label = classes
                    .binary_search_by(|c| c.as_str().cmp(first_component(e)))
                    .unwrap_or_default();
                (root.join(e), label)
            })
            .collect::<Vec<_>>();

        info!(
            "image list {}: {} images, {} classes under {}",
            filelist.display(),
            items.len(),
            classes.len(),
            root.display()
        );
        Ok(Self {
            listing: Listing {
                classes,
                items,
                preprocess,
                transform,
            },
        })
    }
}

fn first_component(entry: &str) -> &str {
    entry.split('/').next().unwrap_or(entry)
}

impl_dataset!(ImageLabelFilelist);

/// Images stored as `root/<class>/<file>`, one sub-directory per class.
///
/// Only `*.tif`, `*.png` and `*.dib` files directly inside a class directory
/// are listed. Classes and files are sorted by name.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    listing: Listing,
}

impl ImageFolder {
    /// `expected_classes` is only checked, never enforced: a mismatch is
    /// logged as a warning.
    pub fn new(
        root: &Path,
        expected_classes: Option<usize>,
        preprocess: Preprocess,
        transform: Transform,
    ) -> Result<Self, DataError> {
        let mut classes = Vec::new();
        for entry in std::fs::read_dir(root).map_err(io_error(root))? {
            let entry = entry.map_err(io_error(root))?;
            if entry.file_type().map_err(io_error(entry.path()))?.is_dir() {
                classes.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        classes.sort();

        let mut items = Vec::new();
        for (label, class) in classes.iter().enumerate() {
            let files = list_images(&root.join(class))?;
            items.extend(files.into_iter().map(|p| (p, label)));
        }
        if items.is_empty() {
            return Err(DataError::Empty(root.to_path_buf()));
        }

        info!(
            "image folder {}: {} images, classes {:?}",
            root.display(),
            items.len(),
            classes
        );
        if let Some(expected) = expected_classes {
            if expected != classes.len() {
                warn!(
                    "configured for {expected} classes but {} were found under {}",
                    classes.len(),
                    root.display()
                );
            }
        }
        Ok(Self {
            listing: Listing {
                classes,
                items,
                preprocess,
                transform,
            },
        })
    }
}

/// Image files directly inside `dir`, sorted by name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, DataError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_error(dir))? {
        let path = entry.map_err(io_error(dir))?.path();
        if path.is_file() && has_image_extension(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| FOLDER_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

impl_dataset!(ImageFolder);
