//! Adversarial training: one step updates both networks from a single batch, the loop runs
//! steps over every batch of every epoch and keeps a per-epoch loss history.

use std::{
    fmt::{self, Display},
    io::Write,
    time::{Duration, Instant},
};

use clap::ValueEnum;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{
    dataloader::BatchSource,
    gan::{Architecture, Discriminator, Generator},
    loss,
    nn::{Mode, NNError},
    optim::{Adam, Optim, OptimError, SGD},
    tape::{GradientEngine, Tape, TapeError},
    tensor::{Tensor, TensorError},
};

/// Errors raised while training
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Network(#[from] NNError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Gradient(#[from] TapeError),
    #[error(transparent)]
    Optimizer(#[from] OptimError),
    #[error("Failed to report progress: {0}")]
    Io(#[from] std::io::Error),
    #[error("Epoch {epoch} produced no batches")]
    EmptyEpoch { epoch: usize },
}

/// Toggles between optimizer types
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

impl Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Adam => write!(f, "adam"),
            OptimizerKind::Sgd => write!(f, "sgd"),
        }
    }
}

/// Hyperparameters of a training run
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    /// Digit class the generator learns to imitate
    pub digit: u8,
    pub batch_size: usize,
    pub epochs: usize,
    /// Shared by both optimizers
    pub learning_rate: f32,
    pub optimizer: OptimizerKind,
    /// Only used by SGD
    pub momentum: f32,
    /// Seeds network initialization, latent sampling and shuffling. Random when unset.
    pub seed: Option<u64>,
    /// Maximum number of progress ticks printed per epoch
    pub progress_width: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            digit: 7,
            batch_size: 100,
            epochs: 100,
            learning_rate: 1e-4,
            optimizer: OptimizerKind::Adam,
            momentum: 0.9,
            seed: None,
            progress_width: 10,
        }
    }
}

impl TrainConfig {
    /// The configured seed, or a fresh random one
    pub fn resolve_seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| rand::rng().random())
    }

    fn optimizer_for(&self, params: Vec<Tensor>) -> Box<dyn Optim> {
        match self.optimizer {
            OptimizerKind::Adam => Box::new(Adam::new(params, self.learning_rate)),
            OptimizerKind::Sgd => Box::new(SGD::new(params, self.learning_rate, self.momentum)),
        }
    }
}

/// Mean losses of a single training step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLosses {
    pub generator: f32,
    pub discriminator: f32,
}

/// Summary of one completed epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochRecord {
    /// Arithmetic mean of the per-step generator losses
    pub generator_loss: f32,
    pub discriminator_loss: f32,
    pub elapsed: Duration,
}

/// Append-only record of completed epochs, in order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    records: Vec<EpochRecord>,
}

impl History {
    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn generator_losses(&self) -> Vec<f32> {
        self.records.iter().map(|r| r.generator_loss).collect()
    }

    pub fn discriminator_losses(&self) -> Vec<f32> {
        self.records.iter().map(|r| r.discriminator_loss).collect()
    }

    fn push(&mut self, record: EpochRecord) {
        self.records.push(record);
    }
}

/// Prints up to `width` ticks spread evenly over the batches of an epoch
struct ProgressBar {
    width: usize,
    n_batches: usize,
    done: usize,
    ticks: usize,
}

impl ProgressBar {
    fn new(width: usize, n_batches: usize) -> Self {
        Self {
            width,
            n_batches,
            done: 0,
            ticks: 0,
        }
    }

    fn advance(&mut self, out: &mut impl Write) -> std::io::Result<()> {
        self.done += 1;
        let target = match self.n_batches {
            0 => self.width,
            n => (self.done * self.width / n).min(self.width),
        };
        if target > self.ticks {
            write!(out, "{}", "=".repeat(target - self.ticks))?;
            self.ticks = target;
        }
        out.flush()
    }
}

/// Everything a training run mutates: both networks, their optimizers, the latent sampler and
/// the history of completed epochs
pub struct TrainingSession<E: GradientEngine = Tape> {
    generator: Generator,
    discriminator: Discriminator,
    generator_optim: Box<dyn Optim>,
    discriminator_optim: Box<dyn Optim>,
    engine: E,
    latent_rng: Pcg64Mcg,
    history: History,
    progress_width: usize,
}

impl TrainingSession<Tape> {
    /// Builds freshly initialized networks and one optimizer per network
    pub fn new(architecture: Architecture, config: &TrainConfig) -> Result<Self, TrainError> {
        let seed = config.resolve_seed();
        log::info!("Initializing networks with seed {}", seed);
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let generator = Generator::new(architecture.clone(), &mut rng)?;
        let discriminator = Discriminator::new(architecture, &mut rng)?;
        let generator_optim = config.optimizer_for(generator.parameters());
        let discriminator_optim = config.optimizer_for(discriminator.parameters());
        let mut session = Self::from_parts(
            generator,
            discriminator,
            generator_optim,
            discriminator_optim,
            Tape::new(),
            rng.random(),
        );
        session.progress_width = config.progress_width;
        Ok(session)
    }
}

impl<E: GradientEngine> TrainingSession<E> {
    pub fn from_parts(
        generator: Generator,
        discriminator: Discriminator,
        generator_optim: Box<dyn Optim>,
        discriminator_optim: Box<dyn Optim>,
        engine: E,
        latent_seed: u64,
    ) -> Self {
        Self {
            generator,
            discriminator,
            generator_optim,
            discriminator_optim,
            engine,
            latent_rng: Pcg64Mcg::seed_from_u64(latent_seed),
            history: History::default(),
            progress_width: TrainConfig::default().progress_width,
        }
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// One adversarial update from a batch of real images `[n, side, side, 1]`.
    ///
    /// Both losses are computed from a single forward pass recorded by two nested traces. Each
    /// network is then differentiated through its own trace, with respect to its own
    /// parameters, and both gradients exist before either network is updated.
    pub fn train_step(&mut self, batch: &Tensor) -> Result<StepLosses, TrainError> {
        let batch_size = batch.shape().first().copied().unwrap_or(0);
        let latent_dim = self.generator.architecture().latent_dim;
        let latents = Tensor::randn(&[batch_size, latent_dim], &mut self.latent_rng);

        let (generator, discriminator) = (&self.generator, &self.discriminator);
        let ((losses, discriminator_trace), generator_trace) = self.engine.record(|| {
            self.engine.record(|| -> Result<(Tensor, Tensor), TrainError> {
                let fake = generator.forward(&latents, Mode::Train)?;
                let real_logits = discriminator.forward(batch, Mode::Train)?;
                let fake_logits = discriminator.forward(&fake, Mode::Train)?;
                Ok((
                    loss::generator_loss(&fake_logits)?,
                    loss::discriminator_loss(&real_logits, &fake_logits)?,
                ))
            })
        });
        let (generator_loss, discriminator_loss) = losses?;

        let generator_grads = self.engine.gradient(
            &generator_trace,
            &generator_loss,
            &self.generator.parameters(),
        )?;
        let discriminator_grads = self.engine.gradient(
            &discriminator_trace,
            &discriminator_loss,
            &self.discriminator.parameters(),
        )?;
        self.generator_optim.step(&generator_grads)?;
        self.discriminator_optim.step(&discriminator_grads)?;

        let losses = StepLosses {
            generator: generator_loss.item()?,
            discriminator: discriminator_loss.item()?,
        };
        log::debug!(
            "step losses: generator {:.5}, discriminator {:.5}, grad norms {:.5} / {:.5}",
            losses.generator,
            losses.discriminator,
            generator_grads.global_norm(),
            discriminator_grads.global_norm()
        );
        Ok(losses)
    }

    /// Trains for `epochs` passes over `source`, writing one progress line per epoch to `out`.
    /// Returns the history, which grows by one record per epoch.
    pub fn train<B: BatchSource + ?Sized>(
        &mut self,
        source: &mut B,
        epochs: usize,
        out: &mut impl Write,
    ) -> Result<&History, TrainError> {
        for epoch in 1..=epochs {
            write!(out, "{epoch}/{epochs} :")?;
            let start = Instant::now();
            let mut progress = ProgressBar::new(self.progress_width, source.n_batches());
            let (mut generator_sum, mut discriminator_sum, mut n) = (0.0, 0.0, 0);
            for batch in source.epoch() {
                let losses = self.train_step(&batch)?;
                if !losses.generator.is_finite() || !losses.discriminator.is_finite() {
                    log::warn!(
                        "Non-finite loss in epoch {} step {}: {:?}",
                        epoch,
                        n + 1,
                        losses
                    );
                }
                generator_sum += losses.generator;
                discriminator_sum += losses.discriminator;
                n += 1;
                progress.advance(out)?;
            }
            if n == 0 {
                return Err(TrainError::EmptyEpoch { epoch });
            }

            let record = EpochRecord {
                generator_loss: generator_sum / n as f32,
                discriminator_loss: discriminator_sum / n as f32,
                elapsed: start.elapsed(),
            };
            writeln!(out, ": {}", record.generator_loss)?;
            writeln!(
                out,
                "Epoch {} took {:.2} seconds",
                epoch,
                record.elapsed.as_secs_f32()
            )?;
            log::info!(
                "Epoch {} discriminator loss {}",
                epoch,
                record.discriminator_loss
            );
            self.history.push(record);
        }
        Ok(&self.history)
    }
}
