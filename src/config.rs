//! Training configuration, read from YAML.
//!
//! Field names follow the FUNIT configuration files so existing configs load
//! unchanged; every field has a default matching the animal-faces setup, so a
//! config only needs to name what it changes.

use std::path::{Path, PathBuf};

use funit_data::{ClassRule, Preprocess, Transform};
use funit_nn::{Init, LrPolicy, ScalerConfig};
use serde::{Deserialize, Serialize};

use crate::error::{io_error, FunitError, Result};
use crate::losses::{DisLoss, GradientPenalty};

/// Generator hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenConfig {
    pub nf: usize,
    pub nf_mlp: usize,
    pub n_downs_class: usize,
    pub n_downs_content: usize,
    pub n_mlp_blks: usize,
    pub n_res_blks: usize,
    pub latent_dim: usize,
    pub input_nc: usize,
    pub output_nc: usize,
    /// The adversarial term enters the generator loss every `update_every`
    /// iterations.
    pub update_every: usize,
    pub kernel_size_7: usize,
    pub kernel_size_4: usize,
    pub kernel_size_5: usize,
}

impl Default for GenConfig {
    fn default() -> Self {
        Self {
            nf: 64,
            nf_mlp: 256,
            n_downs_class: 4,
            n_downs_content: 3,
            n_mlp_blks: 3,
            n_res_blks: 2,
            latent_dim: 64,
            input_nc: 3,
            output_nc: 3,
            update_every: 1,
            kernel_size_7: 3,
            kernel_size_4: 3,
            kernel_size_5: 3,
        }
    }
}

/// Discriminator hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisConfig {
    pub nf: usize,
    /// Must be even; blocks come in pairs.
    pub n_res_blks: usize,
    pub num_classes: usize,
    pub input_nc: usize,
    pub kernel_size_7: usize,
}

impl Default for DisConfig {
    fn default() -> Self {
        Self {
            nf: 64,
            n_res_blks: 10,
            num_classes: 119,
            input_nc: 3,
            kernel_size_7: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Rmsprop,
    Adam,
}

/// How the training images are laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetLayout {
    /// `data_list_*` names files relative to `data_folder_*`.
    #[default]
    Filelist,
    /// `data_folder_*` holds one sub-directory per class.
    Folder,
}

/// Complete training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunitConfig {
    pub image_save_iter: usize,
    pub snapshot_save_iter: usize,
    pub log_iter: usize,
    pub max_iter: usize,
    /// Number of samples per row of the written image grids.
    pub display_size: usize,
    pub seed: u64,

    pub optimizer: OptimizerKind,
    pub weight_decay: f64,
    pub lr_gen: f64,
    pub lr_dis: f64,
    pub lr_policy: LrPolicy,
    pub init: Init,
    pub ema_beta: f64,
    pub loss_scaler: ScalerConfig,

    pub gan_w: f64,
    pub fm_w: f64,
    pub r_w: f64,
    pub dis_loss: DisLoss,
    pub gradient_penalty: GradientPenalty,

    pub gen: GenConfig,
    pub dis: DisConfig,

    pub batch_size: usize,
    pub new_size: Option<u32>,
    pub crop_image_height: u32,
    pub crop_image_width: u32,
    pub dataset: DatasetLayout,
    pub data_folder_train: PathBuf,
    pub data_list_train: PathBuf,
    pub data_folder_test: PathBuf,
    pub data_list_test: PathBuf,
    /// Per-class pixel operations for the folder layout. File lists always
    /// load plain RGB.
    pub preprocess_rules: Vec<ClassRule>,
}

impl Default for FunitConfig {
    fn default() -> Self {
        Self {
            image_save_iter: 2500,
            snapshot_save_iter: 10000,
            log_iter: 1,
            max_iter: 100000,
            display_size: 16,
            seed: 1,
            optimizer: OptimizerKind::Rmsprop,
            weight_decay: 1e-4,
            lr_gen: 1e-4,
            lr_dis: 1e-4,
            lr_policy: LrPolicy::Constant,
            init: Init::Kaiming,
            ema_beta: 0.999,
            loss_scaler: ScalerConfig::default(),
            gan_w: 1.0,
            fm_w: 1.0,
            r_w: 0.1,
            dis_loss: DisLoss::Wasserstein,
            gradient_penalty: GradientPenalty::Interpolated { weight: 10.0 },
            gen: GenConfig::default(),
            dis: DisConfig::default(),
            batch_size: 64,
            new_size: Some(140),
            crop_image_height: 128,
            crop_image_width: 128,
            dataset: DatasetLayout::Filelist,
            data_folder_train: PathBuf::from("./datasets/animals"),
            data_list_train: PathBuf::from("./datasets/animals_list_train.txt"),
            data_folder_test: PathBuf::from("./datasets/animals"),
            data_list_test: PathBuf::from("./datasets/animals_list_test.txt"),
            preprocess_rules: Preprocess::microscopy_rules(),
        }
    }
}

impl FunitConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(io_error(path))?;
        Self::from_yaml(&text)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject configurations the networks or the training loop cannot run.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(FunitError::Config(msg));
        let positive = [
            ("batch_size", self.batch_size),
            ("max_iter", self.max_iter),
            ("log_iter", self.log_iter),
            ("image_save_iter", self.image_save_iter),
            ("snapshot_save_iter", self.snapshot_save_iter),
            ("gen.nf", self.gen.nf),
            ("gen.nf_mlp", self.gen.nf_mlp),
            ("gen.latent_dim", self.gen.latent_dim),
            ("gen.update_every", self.gen.update_every),
            ("gen.kernel_size_7", self.gen.kernel_size_7),
            ("gen.kernel_size_4", self.gen.kernel_size_4),
            ("gen.kernel_size_5", self.gen.kernel_size_5),
            ("dis.nf", self.dis.nf),
            ("dis.num_classes", self.dis.num_classes),
            ("dis.kernel_size_7", self.dis.kernel_size_7),
        ];
        for (name, value) in positive {
            if value == 0 {
                return fail(format!("{name} must be positive"));
            }
        }
        if self.crop_image_height == 0 || self.crop_image_width == 0 {
            return fail(String::from("crop size must be positive"));
        }
        if self.dis.n_res_blks < 2 || self.dis.n_res_blks % 2 != 0 {
            return fail(format!(
                "dis.n_res_blks must be a positive multiple of 2, got {}",
                self.dis.n_res_blks
            ));
        }
        if self.gen.n_downs_class < 2 {
            return fail(format!(
                "gen.n_downs_class must be at least 2, got {}",
                self.gen.n_downs_class
            ));
        }
        if self.gen.n_mlp_blks < 2 {
            return fail(format!(
                "gen.n_mlp_blks must be at least 2, got {}",
                self.gen.n_mlp_blks
            ));
        }
        for (name, nc) in [
            ("gen.input_nc", self.gen.input_nc),
            ("gen.output_nc", self.gen.output_nc),
            ("dis.input_nc", self.dis.input_nc),
        ] {
            if nc != 1 && nc != 3 {
                return fail(format!("{name} must be 1 or 3, got {nc}"));
            }
        }
        if self.gen.output_nc != self.gen.input_nc || self.dis.input_nc != self.gen.output_nc {
            return fail(String::from(
                "gen.input_nc, gen.output_nc and dis.input_nc must agree",
            ));
        }
        if let Some(size) = self.new_size {
            if size < self.crop_image_height.min(self.crop_image_width) {
                return fail(format!(
                    "new_size {size} is smaller than the crop {}x{}",
                    self.crop_image_width, self.crop_image_height
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.ema_beta) {
            return fail(format!("ema_beta must lie in [0, 1], got {}", self.ema_beta));
        }
        if self.lr_gen <= 0.0 || self.lr_dis <= 0.0 {
            return fail(String::from("learning rates must be positive"));
        }
        if let LrPolicy::Step { step_size: 0, .. } = self.lr_policy {
            return fail(String::from("step_size must be positive"));
        }
        Ok(())
    }

    /// Decoder for the configured layout: `preprocess_rules` apply to
    /// [`DatasetLayout::Folder`] only.
    pub fn preprocess(&self) -> Preprocess {
        match self.dataset {
            DatasetLayout::Folder => Preprocess::new(self.preprocess_rules.clone()),
            DatasetLayout::Filelist => Preprocess::default(),
        }
    }

    pub fn train_transform(&self) -> Transform {
        Transform::train(
            self.new_size,
            self.crop_image_height,
            self.crop_image_width,
            self.gen.input_nc,
        )
    }

    pub fn test_transform(&self) -> Transform {
        Transform::test(
            self.new_size,
            self.crop_image_height,
            self.crop_image_width,
            self.gen.input_nc,
        )
    }
}
