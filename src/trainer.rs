//! Optimizers, schedules, snapshots and the training loop around [`FunitModel`].

use std::fs;
use std::path::{Path, PathBuf};

use funit_data::{
    save_image_grid, Batch, DataLoader, Dataset, ImageFolder, ImageLabelFilelist, Transform,
};
use funit_nn::{state, Adam, LossScaler, Module, Optimizer, Rmsprop, Rng, Scheduler, StateDict};
use tracing::{info, warn};

use crate::config::{DatasetLayout, FunitConfig, OptimizerKind};
use crate::error::{io_error, FunitError, Result};
use crate::model::{DisLosses, FunitModel, GenLosses};

/// Loader type used for training: either dataset layout behind one type.
pub type Loader = DataLoader<Box<dyn Dataset>>;

/// Loss terms of one training iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLosses {
    pub dis: DisLosses,
    pub gen: GenLosses,
    /// Whether each optimizer actually stepped (`false` when the loss scaler
    /// found non-finite gradients).
    pub dis_stepped: bool,
    pub gen_stepped: bool,
}

/// Drives [`FunitModel`] through alternating discriminator and generator
/// steps.
///
/// ```ignore
/// let mut trainer = Trainer::new(config.clone())?;
/// let (mut content, mut class) = training_loaders(&config)?;
/// trainer.run(&mut content, &mut class, Path::new("outputs"))?;
/// ```
pub struct Trainer {
    pub model: FunitModel,
    config: FunitConfig,
    gen_opt: Box<dyn Optimizer>,
    dis_opt: Box<dyn Optimizer>,
    gen_sched: Box<dyn Scheduler>,
    dis_sched: Box<dyn Scheduler>,
    scaler: LossScaler,
    rng: Rng,
    iteration: usize,
}

fn build_optimizer(kind: OptimizerKind, lr: f64, weight_decay: f64) -> Box<dyn Optimizer> {
    match kind {
        OptimizerKind::Rmsprop => Box::new(Rmsprop::new(lr).with_weight_decay(weight_decay)),
        OptimizerKind::Adam => {
            Box::new(Adam::with_betas(lr, 0.5, 0.999).with_weight_decay(weight_decay))
        }
    }
}

/// Unscale, step unless the gradients overflowed, and update the scale.
fn apply_gradients(
    optimizer: &mut dyn Optimizer,
    module: &mut dyn Module,
    scaler: &mut LossScaler,
) -> bool {
    let mut params = module.parameters_mut();
    let finite = scaler.unscale(&mut params);
    if finite {
        optimizer.step(&mut params);
    } else {
        warn!("non-finite gradients at scale {}, skipping step", scaler.scale());
    }
    scaler.update(finite);
    finite
}

impl Trainer {
    pub fn new(config: FunitConfig) -> Result<Self> {
        config.validate()?;
        let model = FunitModel::new(&config)?;
        info!(
            "generator: {} parameters, discriminator: {} parameters",
            model.gen.num_parameters(),
            model.dis.num_parameters()
        );
        Ok(Self {
            model,
            gen_opt: build_optimizer(config.optimizer, config.lr_gen, config.weight_decay),
            dis_opt: build_optimizer(config.optimizer, config.lr_dis, config.weight_decay),
            gen_sched: config.lr_policy.build(config.lr_gen),
            dis_sched: config.lr_policy.build(config.lr_dis),
            scaler: LossScaler::new(&config.loss_scaler),
            rng: Rng::new(config.seed.wrapping_add(0x6A09)),
            iteration: 0,
            config,
        })
    }

    pub fn config(&self) -> &FunitConfig {
        &self.config
    }

    /// Completed iterations.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn scaler(&self) -> &LossScaler {
        &self.scaler
    }

    pub fn dis_step(&mut self, co: &Batch, cl: &Batch) -> Result<(DisLosses, bool)> {
        self.dis_opt.set_lr(self.dis_sched.lr(self.iteration));
        let losses = self.model.dis_update(
            co,
            cl,
            &self.config,
            &mut self.rng,
            self.scaler.scale(),
        )?;
        let stepped = apply_gradients(self.dis_opt.as_mut(), &mut self.model.dis, &mut self.scaler);
        Ok((losses, stepped))
    }

    /// Generator step followed by the moving-average update of `gen_test`.
    pub fn gen_step(&mut self, co: &Batch, cl: &Batch) -> Result<(GenLosses, bool)> {
        self.gen_opt.set_lr(self.gen_sched.lr(self.iteration));
        let losses = self.model.gen_update(
            co,
            cl,
            &self.config,
            self.iteration,
            self.scaler.scale(),
        )?;
        let stepped = apply_gradients(self.gen_opt.as_mut(), &mut self.model.gen, &mut self.scaler);
        self.model.update_average(self.config.ema_beta);
        Ok((losses, stepped))
    }

    /// One iteration: a discriminator step, then a generator step.
    pub fn step(&mut self, co: &Batch, cl: &Batch) -> Result<StepLosses> {
        let (dis, dis_stepped) = self.dis_step(co, cl)?;
        let (gen, gen_stepped) = self.gen_step(co, cl)?;
        self.iteration += 1;
        Ok(StepLosses {
            dis,
            gen,
            dis_stepped,
            gen_stepped,
        })
    }

    /// Train until `max_iter`, logging, writing sample grids and snapshots
    /// under `output` on the configured intervals.
    pub fn run<C: Dataset, S: Dataset>(
        &mut self,
        content: &mut DataLoader<C>,
        class: &mut DataLoader<S>,
        output: &Path,
    ) -> Result<()> {
        let images_dir = output.join("images");
        let checkpoint_dir = output.join("checkpoints");
        fs::create_dir_all(&images_dir).map_err(io_error(&images_dir))?;
        info!(
            "training from iteration {} to {}",
            self.iteration, self.config.max_iter
        );

        while self.iteration < self.config.max_iter {
            let co = next_batch(content)?;
            let cl = next_batch(class)?;
            let losses = self.step(&co, &cl)?;
            let it = self.iteration;

            if it % self.config.log_iter == 0 {
                let (d, g) = (&losses.dis, &losses.gen);
                info!(
                    "iteration {it:08}/{:08}: dis {:.4} (real {:.4}, fake {:.4}, penalty {:.4}, acc {:.3}) gen {:.4} (adv {:.4}, x_rec {:.4}, c_rec {:.4}, m_rec {:.4}, acc {:.3})",
                    self.config.max_iter,
                    d.total,
                    d.real,
                    d.fake,
                    d.penalty,
                    d.acc,
                    g.total,
                    g.adv,
                    g.x_rec,
                    g.c_rec,
                    g.m_rec,
                    g.acc,
                );
            }
            if it % self.config.image_save_iter == 0 {
                self.write_images(&co, &cl, &images_dir.join(format!("gen_{it:08}.png")))?;
            }
            if it % self.config.snapshot_save_iter == 0 {
                self.save_snapshot(&checkpoint_dir)?;
            }
        }
        Ok(())
    }

    /// Write a grid of the first `display_size` inputs with their
    /// reconstructions and translations.
    pub fn write_images(&mut self, co: &Batch, cl: &Batch, path: &Path) -> Result<()> {
        let n = self.config.display_size.min(co.len()).min(cl.len());
        let head = |b: &Batch| Batch {
            images: b.images.narrow(0, n),
            labels: b.labels[..n].to_vec(),
        };
        let images = self.model.test(&head(co), &head(cl))?;
        save_image_grid(&images.rows(), path)?;
        info!("wrote {}", path.display());
        Ok(())
    }

    /// Save `gen_XXXXXXXX.safetensors` (`gen.*` and `gen_test.*`) and
    /// `dis_XXXXXXXX.safetensors`, numbered by the current iteration.
    pub fn save_snapshot(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(io_error(dir))?;
        let it = self.iteration;
        let mut gen_state = StateDict::new();
        for (prefix, module) in [("gen", &self.model.gen), ("gen_test", &self.model.gen_test)] {
            gen_state.extend(
                module
                    .state_dict()
                    .into_iter()
                    .map(|(name, t)| (format!("{prefix}.{name}"), t)),
            );
        }
        state::save(&gen_state, &snapshot_path(dir, "gen", it))?;
        state::save(&self.model.dis.state_dict(), &snapshot_path(dir, "dis", it))?;
        info!("saved snapshot {it:08} to {}", dir.display());
        Ok(())
    }

    /// Load the newest snapshot in `dir` and continue counting from its
    /// iteration. Optimizer state starts fresh.
    pub fn resume(&mut self, dir: &Path) -> Result<usize> {
        let it = load_generators(&mut self.model, dir)?;
        let dis_state = state::load(&snapshot_path(dir, "dis", it))?;
        self.model.dis.load_state_dict(&dis_state)?;
        self.iteration = it;
        info!("resumed from iteration {it:08}");
        Ok(it)
    }
}

fn snapshot_path(dir: &Path, kind: &str, iteration: usize) -> PathBuf {
    dir.join(format!("{kind}_{iteration:08}.safetensors"))
}

/// Newest `{kind}_XXXXXXXX.safetensors` in `dir`, with its iteration.
pub fn latest_snapshot(dir: &Path, kind: &str) -> Result<Option<(usize, PathBuf)>> {
    let prefix = format!("{kind}_");
    let mut latest = None;
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let path = entry.map_err(io_error(dir))?.path();
        let iteration = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(&prefix))
            .and_then(|n| n.strip_suffix(".safetensors"))
            .and_then(|n| n.parse::<usize>().ok());
        if let Some(it) = iteration {
            if latest.as_ref().map_or(true, |(best, _)| it > *best) {
                latest = Some((it, path));
            }
        }
    }
    Ok(latest)
}

fn strip_prefix(state: &StateDict, prefix: &str) -> StateDict {
    state
        .iter()
        .filter_map(|(name, t)| {
            name.strip_prefix(prefix)
                .map(|rest| (rest.to_string(), t.clone()))
        })
        .collect()
}

/// Load `gen` and `gen_test` from the newest generator snapshot in `dir`.
/// Returns the snapshot's iteration.
pub fn load_generators(model: &mut FunitModel, dir: &Path) -> Result<usize> {
    let (it, path) =
        latest_snapshot(dir, "gen")?.ok_or_else(|| FunitError::NoCheckpoint(dir.to_path_buf()))?;
    let gen_state = state::load(&path)?;
    model.gen.load_state_dict(&strip_prefix(&gen_state, "gen."))?;
    model
        .gen_test
        .load_state_dict(&strip_prefix(&gen_state, "gen_test."))?;
    info!("loaded generators from {}", path.display());
    Ok(it)
}

fn next_batch<D: Dataset>(loader: &mut DataLoader<D>) -> Result<Batch> {
    match loader.next() {
        Some(batch) => Ok(batch?),
        None => Err(FunitError::Config(format!(
            "{} images cannot fill a batch of {}",
            loader.dataset().len(),
            loader.batch_size()
        ))),
    }
}

/// Open the configured dataset layout at `folder` (and `list`, for file
/// lists).
pub fn open_dataset(
    config: &FunitConfig,
    folder: &Path,
    list: &Path,
    transform: Transform,
) -> Result<Box<dyn Dataset>> {
    Ok(match config.dataset {
        DatasetLayout::Filelist => Box::new(ImageLabelFilelist::new(
            folder,
            list,
            config.preprocess(),
            transform,
        )?),
        DatasetLayout::Folder => Box::new(ImageFolder::new(
            folder,
            Some(config.dis.num_classes),
            config.preprocess(),
            transform,
        )?),
    })
}

/// Independently shuffled, endlessly cycling content and class loaders over
/// the training set.
pub fn training_loaders(config: &FunitConfig) -> Result<(Loader, Loader)> {
    let make = |seed: u64| -> Result<Loader> {
        let dataset = open_dataset(
            config,
            &config.data_folder_train,
            &config.data_list_train,
            config.train_transform(),
        )?;
        if dataset.num_classes() > config.dis.num_classes {
            return Err(FunitError::Config(format!(
                "training set has {} classes but the discriminator scores only {}",
                dataset.num_classes(),
                config.dis.num_classes
            )));
        }
        Ok(DataLoader::new(dataset, config.batch_size, seed)
            .shuffle(true)
            .drop_last(true)
            .repeat(true))
    };
    Ok((make(config.seed)?, make(config.seed.wrapping_add(1))?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use funit_tensor::Tensor;

    #[test]
    fn latest_snapshot_picks_highest_iteration() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "gen_00000100.safetensors",
            "gen_00002000.safetensors",
            "gen_00000300.safetensors",
            "dis_00009000.safetensors",
            "gen_latest.safetensors",
        ] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let (it, path) = latest_snapshot(dir.path(), "gen").unwrap().unwrap();
        assert_eq!(it, 2000);
        assert!(path.ends_with("gen_00002000.safetensors"));
        assert!(latest_snapshot(dir.path(), "opt").unwrap().is_none());
    }

    #[test]
    fn strip_prefix_selects_one_network() {
        let mut state = StateDict::new();
        state.insert(String::from("gen.a"), Tensor::scalar(1.0));
        state.insert(String::from("gen_test.a"), Tensor::scalar(2.0));
        let gen = strip_prefix(&state, "gen.");
        assert_eq!(gen.len(), 1);
        assert_eq!(gen["a"].item(), 1.0);
    }

    #[test]
    fn missing_snapshot_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = latest_snapshot(&dir.path().join("absent"), "gen").unwrap_err();
        assert!(matches!(err, FunitError::Io { .. }));
    }
}
