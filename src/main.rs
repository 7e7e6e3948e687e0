//! Trains a GAN to draw a single MNIST digit, then plots the loss history and a grid of samples
//! and saves the generator.
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run --release -- train --data-dir data/mnist
//! cargo run --release -- sample --model-path generator.json
//! ```
//!
//! Progress and epoch timings are printed per epoch. Logging defaults to `info`, set
//! `RUST_LOG=debug` for per-step diagnostics.

use std::{error::Error, fs, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use digit_gan::{
    dataloader::{BatchSource, DataLoader, SeededShuffle, ThreadShuffle},
    datasets::{load_mnist, select_class},
    gan::Architecture,
    persist::{DEFAULT_MODEL_PATH, load_generator, save_generator},
    plot::{DEFAULT_EXTENT, plot_history, plot_sample_grid},
    training::{OptimizerKind, TrainConfig, TrainingSession},
};

#[derive(Parser)]
#[command(about = "Generative adversarial network for a single MNIST digit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a generator and discriminator on one digit class
    Train(TrainArgs),
    /// Render a sample grid from a saved generator
    Sample(SampleArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Directory holding the MNIST training images and labels as decompressed IDX files
    /// (gunzip the `*-ubyte.gz` downloads first)
    #[clap(long, default_value = "data")]
    data_dir: PathBuf,
    #[clap(short, long, default_value_t = 7)]
    digit: u8,
    #[clap(short, long, default_value_t = 100)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 100)]
    epochs: usize,
    #[clap(short, long, default_value_t = 1e-4)]
    lr: f32,
    #[clap(long, value_enum, default_value_t = OptimizerKind::Adam)]
    optimizer: OptimizerKind,
    #[clap(short, long, default_value_t = 0.9)]
    momentum: f32,
    #[clap(long, default_value_t = 2)]
    latent_dim: usize,
    /// Fixes initialization, latent sampling and shuffling
    #[clap(short, long)]
    seed: Option<u64>,
    #[clap(short, long, default_value = "output")]
    output_dir: PathBuf,
    #[clap(long, default_value = DEFAULT_MODEL_PATH)]
    model_path: PathBuf,
    /// The sample grid is (2n + 1) x (2n + 1) images
    #[clap(long, default_value_t = 2)]
    grid_n: usize,
    #[clap(long, default_value_t = false)]
    no_plots: bool,
}

#[derive(Args)]
struct SampleArgs {
    #[clap(long, default_value = DEFAULT_MODEL_PATH)]
    model_path: PathBuf,
    #[clap(long, default_value_t = 2)]
    grid_n: usize,
    #[clap(long, default_value_t = DEFAULT_EXTENT)]
    extent: f32,
    #[clap(short, long, default_value = "output")]
    output_dir: PathBuf,
}

fn train(args: TrainArgs) -> Result<(), Box<dyn Error>> {
    let config = TrainConfig {
        digit: args.digit,
        batch_size: args.batch_size,
        epochs: args.epochs,
        learning_rate: args.lr,
        optimizer: args.optimizer,
        momentum: args.momentum,
        seed: args.seed,
        ..TrainConfig::default()
    };
    let architecture = Architecture {
        latent_dim: args.latent_dim,
        ..Architecture::default()
    };

    let dataset = load_mnist(&args.data_dir)?;
    let samples = select_class(&dataset, config.digit, config.batch_size)?;
    let mut loader: Box<dyn BatchSource> = match config.seed {
        Some(seed) => Box::new(DataLoader::new(
            samples,
            config.batch_size,
            SeededShuffle::new(seed),
        )?),
        None => Box::new(DataLoader::new(samples, config.batch_size, ThreadShuffle)?),
    };
    log::info!(
        "Training on {} images of digit {} in {} batches per epoch, optimizer {}",
        loader.n_samples(),
        config.digit,
        loader.n_batches(),
        config.optimizer
    );

    let mut session = TrainingSession::new(architecture, &config)?;
    let history = session.train(&mut *loader, config.epochs, &mut std::io::stdout().lock())?;

    if !args.no_plots {
        fs::create_dir_all(&args.output_dir)?;
        plot_history(
            &history.generator_losses(),
            &args.output_dir.join(format!("loss_digit_{}.png", config.digit)),
        )?;
        plot_sample_grid(
            session.generator(),
            args.grid_n,
            DEFAULT_EXTENT,
            &args.output_dir.join(format!("samples_digit_{}.png", config.digit)),
        )?;
    }
    save_generator(session.generator(), &args.model_path)?;
    Ok(())
}

fn sample(args: SampleArgs) -> Result<(), Box<dyn Error>> {
    let generator = load_generator(&args.model_path)?;
    fs::create_dir_all(&args.output_dir)?;
    plot_sample_grid(
        &generator,
        args.grid_n,
        args.extent,
        &args.output_dir.join("samples.png"),
    )?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Train(args) => train(args),
        Command::Sample(args) => sample(args),
    }
}
