//! Few-shot unsupervised image-to-image translation (FUNIT).
//!
//! A generator splits an image into a spatial content code and a class code
//! averaged over a few examples of a target class, then decodes the content
//! with AdaIN parameters predicted from the class code. A multi-task patch
//! discriminator scores each class separately.
//!
//! ```ignore
//! let config = FunitConfig::load(Path::new("configs/funit_animals.yaml"))?;
//! let mut trainer = Trainer::new(config)?;
//! let (mut content, mut class) = trainer::training_loaders(trainer.config())?;
//! trainer.run(&mut content, &mut class, Path::new("outputs"))?;
//! ```

pub mod config;
pub mod error;
pub mod losses;
pub mod model;
pub mod networks;
pub mod trainer;

pub use config::{DatasetLayout, DisConfig, FunitConfig, GenConfig, OptimizerKind};
pub use error::{FunitError, Result};
pub use losses::{DisLoss, GradientPenalty};
pub use model::{DisLosses, FunitModel, GenLosses, TestImages};
pub use networks::{FewShotGen, GpPatchMcResDis};
pub use trainer::{StepLosses, Trainer};
