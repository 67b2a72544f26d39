use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use funit::{trainer, FunitConfig, FunitError, FunitModel, Result, Trainer};
use funit_data::{list_images, save_image_grid};
use funit_nn::Rng;
use funit_tensor::Tensor;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "funit", about = "Few-shot unsupervised image-to-image translation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model from a YAML configuration
    Train {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Directory for sample grids and checkpoints
        #[arg(short, long, default_value = "outputs")]
        output: PathBuf,

        /// Continue from the newest snapshot in <output>/checkpoints
        #[arg(long)]
        resume: bool,
    },

    /// Translate one image into a class given by a few example images
    Translate {
        /// Configuration file the checkpoint was trained with
        #[arg(short, long)]
        config: PathBuf,

        /// Checkpoint directory
        #[arg(long)]
        checkpoint: PathBuf,

        /// Content image
        #[arg(long)]
        content: PathBuf,

        /// Directory of target-class images
        #[arg(long)]
        class: PathBuf,

        /// Number of class images to average
        #[arg(short = 'k', long, default_value = "1")]
        shots: usize,

        /// Output PNG
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("funit=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Train {
            config,
            output,
            resume,
        } => train(&config, &output, resume),
        Commands::Translate {
            config,
            checkpoint,
            content,
            class,
            shots,
            output,
        } => translate(&config, &checkpoint, &content, &class, shots, &output),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn train(config_path: &Path, output: &Path, resume: bool) -> Result<()> {
    let config = FunitConfig::load(config_path)?;
    info!("loaded configuration from {}", config_path.display());
    let (mut content, mut class) = trainer::training_loaders(&config)?;
    let mut trainer = Trainer::new(config)?;
    if resume {
        trainer.resume(&output.join("checkpoints"))?;
    }
    trainer.run(&mut content, &mut class, output)
}

fn translate(
    config_path: &Path,
    checkpoint: &Path,
    content: &Path,
    class_dir: &Path,
    shots: usize,
    output: &Path,
) -> Result<()> {
    let config = FunitConfig::load(config_path)?;
    let mut model = FunitModel::new(&config)?;
    trainer::load_generators(&mut model, checkpoint)?;

    let class_name = class_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let mut class_images = list_images(class_dir)?;
    class_images.truncate(shots);
    if class_images.is_empty() {
        return Err(FunitError::Config(format!(
            "no class images in {}",
            class_dir.display()
        )));
    }

    let mut rng = Rng::new(config.seed);
    let mut load = |path: &Path, class: &str| -> Result<Tensor> {
        let img = config.preprocess().load(path, class)?;
        Ok(config.test_transform().apply(img, path, &mut rng)?)
    };
    let style: Vec<Tensor> = class_images
        .iter()
        .map(|p| load(p, class_name))
        .collect::<Result<_>>()?;
    let content_image = load(content, "")?;

    let style_refs: Vec<&Tensor> = style.iter().collect();
    let style_batch = Tensor::stack(&style_refs);
    let content_batch = Tensor::stack(&[&content_image]);
    let class_code = model.compute_k_style(&style_batch, style.len())?;
    let translated = model.translate_simple(&content_batch, &class_code)?;

    save_image_grid(&[&translated], output)?;
    info!(
        "translated {} with {} shot(s) of {} into {}",
        content.display(),
        style.len(),
        class_dir.display(),
        output.display()
    );
    Ok(())
}
