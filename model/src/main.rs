//! Command line front end.
//!
//! Usage:
//!   capsnet train --data-dir ./mnist --epochs 10
//!   capsnet evaluate --checkpoint capsnet.json.gz --data-dir ./mnist
//!   capsnet predict --checkpoint capsnet.json.gz digit.png
//!   capsnet summary --preset compact

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ndarray::{Array3, Axis};
use tracing::info;
use tracing_subscriber::EnvFilter;

use capsnet::model::config::{LrSchedule, NetworkConfig, OptimizerType, TrainingConfig};
use capsnet::model::optimizer::{self, LrScheduler};
use capsnet::train_data::{load_image, Batch, MnistDataLoader};
use capsnet::{CapsNet, ModelBuilder};

#[derive(Parser)]
#[command(name = "capsnet")]
#[command(about = "Capsule network with dynamic routing for MNIST")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train on MNIST and evaluate after every epoch
    Train(TrainArgs),
    /// Evaluate a checkpoint on the MNIST test set
    Evaluate {
        #[arg(long)]
        checkpoint: PathBuf,

        #[arg(long, default_value = "data")]
        data_dir: PathBuf,

        #[arg(long, default_value = "1000")]
        test_batch_size: usize,

        /// Only use the first N test samples
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Classify image files
    Predict {
        #[arg(long)]
        checkpoint: PathBuf,

        /// PNG or JPEG files
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Invert dark-on-light images
        #[arg(long)]
        invert: bool,
    },
    /// Print layer shapes and parameter counts
    Summary {
        #[arg(long, value_enum, default_value = "paper")]
        preset: Preset,

        /// JSON network config, overrides --preset
        #[arg(long)]
        network_config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct TrainArgs {
    /// Directory holding the MNIST IDX files
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Input batch size for training
    #[arg(long, default_value = "64")]
    batch_size: usize,

    /// Input batch size for testing
    #[arg(long, default_value = "1000")]
    test_batch_size: usize,

    /// Number of epochs to train
    #[arg(long, default_value = "10")]
    epochs: usize,

    /// Learning rate (Adam 0.001, SGD 0.01 when unset)
    #[arg(long)]
    lr: Option<f32>,

    /// SGD momentum
    #[arg(long, default_value = "0.5")]
    momentum: f32,

    #[arg(long, value_enum, default_value = "adam")]
    optimizer: OptimizerKind,

    /// Random seed
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Batches to wait before logging training status
    #[arg(long, default_value = "10")]
    log_interval: usize,

    /// Only use the first N samples of each split
    #[arg(long)]
    limit: Option<usize>,

    #[arg(long, value_enum, default_value = "paper")]
    preset: Preset,

    /// JSON network config, overrides --preset
    #[arg(long)]
    network_config: Option<PathBuf>,

    /// Random translation in pixels (the paper uses 2)
    #[arg(long, default_value = "0")]
    max_shift: usize,

    /// Stop after N epochs without test loss improvement (0 disables)
    #[arg(long, default_value = "0")]
    patience: usize,

    /// Multiply the learning rate by GAMMA every STEP epochs, given as STEP:GAMMA
    #[arg(long)]
    lr_step: Option<String>,

    /// Checkpoint path
    #[arg(short = 'o', long, default_value = "capsnet.json.gz")]
    output: PathBuf,

    /// Worker threads (defaults to all cores)
    #[arg(long)]
    threads: Option<usize>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Paper,
    Compact,
}

#[derive(Clone, Copy, ValueEnum)]
enum OptimizerKind {
    Adam,
    Sgd,
}

fn network_config(preset: Preset, path: Option<&PathBuf>) -> Result<NetworkConfig> {
    if let Some(path) = path {
        return NetworkConfig::from_json_file(path)
            .with_context(|| format!("reading network config {}", path.display()));
    }
    Ok(match preset {
        Preset::Paper => NetworkConfig::default(),
        Preset::Compact => NetworkConfig::compact(),
    })
}

fn parse_lr_step(s: &str) -> Result<LrSchedule> {
    let Some((step, gamma)) = s.split_once(':') else {
        bail!("expected STEP:GAMMA, got {s}");
    };
    Ok(LrSchedule::StepDecay {
        step_size: step.parse().context("invalid step")?,
        gamma: gamma.parse().context("invalid gamma")?,
    })
}

fn train(args: TrainArgs) -> Result<()> {
    let network_config = network_config(args.preset, args.network_config.as_ref())?;

    let (optimizer_type, default_lr) = match args.optimizer {
        OptimizerKind::Adam => (OptimizerType::default(), 0.001),
        OptimizerKind::Sgd => (
            OptimizerType::SGD {
                momentum: args.momentum,
            },
            0.01,
        ),
    };
    let training_config = TrainingConfig {
        batch_size: args.batch_size,
        test_batch_size: args.test_batch_size,
        learning_rate: args.lr.unwrap_or(default_lr),
        num_epochs: args.epochs,
        log_interval: args.log_interval,
        seed: args.seed,
        early_stopping_patience: args.patience,
        optimizer_type,
        lr_schedule: args.lr_step.as_deref().map(parse_lr_step).transpose()?,
        max_shift: args.max_shift,
        ..TrainingConfig::default()
    };

    let loader = MnistDataLoader::new(&args.data_dir).with_limit(args.limit);
    let train_set = loader.load_train().context("loading training set")?;
    let test_set = loader.load_test().context("loading test set")?;

    let mut model = ModelBuilder::new()
        .with_network_config(network_config)
        .with_training_config(training_config.clone())
        .build()?;
    model.summary()?;

    let mut optimizer =
        optimizer::from_config(&training_config.optimizer_type, training_config.learning_rate);
    let scheduler = training_config
        .lr_schedule
        .as_ref()
        .map(LrScheduler::from_config);

    model.train(
        &train_set,
        &test_set,
        optimizer.as_mut(),
        scheduler,
        Some(args.output.as_path()),
    )?;

    info!(
        "Training finished: best test loss {:.4}, accuracy {:.2}%",
        model.state.best_loss,
        100.0 * model.state.best_accuracy
    );
    Ok(())
}

fn evaluate(checkpoint: PathBuf, data_dir: PathBuf, batch_size: usize, limit: Option<usize>) -> Result<()> {
    let mut model = CapsNet::load(&checkpoint, TrainingConfig::default())
        .with_context(|| format!("loading checkpoint {}", checkpoint.display()))?;
    let test_set = MnistDataLoader::new(data_dir)
        .with_limit(limit)
        .load_test()
        .context("loading test set")?;

    let evaluation = model.evaluate(&test_set, batch_size)?;
    info!(
        "Test set: Average loss: {:.4} (margin {:.4}, reconstruction {:.4})",
        evaluation.loss, evaluation.margin, evaluation.reconstruction
    );
    evaluation.metrics.log();
    Ok(())
}

fn predict(checkpoint: PathBuf, images: Vec<PathBuf>, invert: bool) -> Result<()> {
    let mut model = CapsNet::load(&checkpoint, TrainingConfig::default())
        .with_context(|| format!("loading checkpoint {}", checkpoint.display()))?;
    let (channels, height, width) = model.network_config.input_shape;
    if channels != 1 {
        bail!("prediction needs a single-channel network, got {channels} channels");
    }

    let mut stack = Array3::zeros((images.len(), height, width));
    for (i, path) in images.iter().enumerate() {
        let pixels = load_image(path, (height, width), invert)
            .with_context(|| format!("reading {}", path.display()))?;
        stack.index_axis_mut(Axis(0), i).assign(&pixels);
    }
    let batch = Batch::from_images(&stack.view(), vec![0; images.len()]);

    for (path, prediction) in images.iter().zip(model.predict(&batch.inputs.view())?) {
        let confidence = prediction.lengths[prediction.class];
        println!("{}: {} (length {:.3})", path.display(), prediction.class, confidence);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Command::Train(TrainArgs {
        threads: Some(threads),
        ..
    }) = &cli.command
    {
        rayon::ThreadPoolBuilder::new()
            .num_threads(*threads)
            .build_global()
            .context("configuring thread pool")?;
    }

    match cli.command {
        Command::Train(args) => train(args),
        Command::Evaluate {
            checkpoint,
            data_dir,
            test_batch_size,
            limit,
        } => evaluate(checkpoint, data_dir, test_batch_size, limit),
        Command::Predict {
            checkpoint,
            images,
            invert,
        } => predict(checkpoint, images, invert),
        Command::Summary {
            preset,
            network_config: path,
        } => {
            let config = network_config(preset, path.as_ref())?;
            let mut model = ModelBuilder::new().with_network_config(config).build()?;
            model.summary()?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lr_step() {
        let schedule = parse_lr_step("3:0.5").unwrap();
        assert!(matches!(
            schedule,
            LrSchedule::StepDecay { step_size: 3, gamma } if (gamma - 0.5).abs() < 1e-7
        ));
    }

    #[test]
    fn test_parse_lr_step_errors() {
        assert!(parse_lr_step("3").is_err());
        assert!(parse_lr_step("x:0.5").is_err());
        assert!(parse_lr_step("3:y").is_err());
        assert!(parse_lr_step(":0.5").is_err());
    }
}
