//! The generator and discriminator networks
//!
//! Both are fixed layer stacks parameterized by an [`Architecture`]. The default architecture maps a
//! 2 dimensional latent vector to a 28x28 grayscale image:
//!
//! ```text
//! generator:     latent -> Dense(7*7*256, ReLU) -> BatchNorm -> Reshape(7, 7, 256)
//!                -> ConvT(128, s1, ReLU) -> BatchNorm -> ConvT(64, s2, ReLU) -> BatchNorm
//!                -> ConvT(1, s2, Sigmoid)                                   [28, 28, 1]
//! discriminator: image -> Conv(64, s2) -> LeakyReLU -> Dropout
//!                -> Conv(128, s2) -> LeakyReLU -> Dropout -> Flatten -> Dense(1)   [1]
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    nn::{
        Activation, BatchNorm, Conv2d, ConvTranspose2d, Dense, Dropout, Flatten, Layer, Mode,
        NNError, Reshape, Sequential,
    },
    tensor::Tensor,
};

/// Sizes and hyperparameters of both networks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    /// Length of the latent vectors fed to the generator
    pub latent_dim: usize,
    /// Channels of the generator's 7x7, 7x7 and 14x14 stages
    pub generator_channels: [usize; 3],
    /// Channels of the discriminator's two downsampling stages
    pub discriminator_channels: [usize; 2],
    pub kernel_size: usize,
    /// Side of the generator's first spatial grid, images are four times larger
    pub base_side: usize,
    pub leaky_slope: f32,
    pub dropout_rate: f32,
}

impl Default for Architecture {
    fn default() -> Self {
        Self {
            latent_dim: 2,
            generator_channels: [256, 128, 64],
            discriminator_channels: [64, 128],
            kernel_size: 5,
            base_side: 7,
            leaky_slope: 0.3,
            dropout_rate: 0.3,
        }
    }
}

impl Architecture {
    /// Side of the (square, single channel) images
    pub fn image_side(&self) -> usize {
        self.base_side * 4
    }

    /// Shape of a single image, `[side, side, 1]`
    pub fn image_shape(&self) -> [usize; 3] {
        [self.image_side(), self.image_side(), 1]
    }

    pub fn validate(&self) -> Result<(), NNError> {
        let sizes = [self.latent_dim, self.kernel_size, self.base_side]
            .into_iter()
            .chain(self.generator_channels)
            .chain(self.discriminator_channels);
        if sizes.into_iter().any(|s| s == 0) {
            return Err(NNError::InvalidArchitecture(format!(
                "all sizes must be positive: {self:?}"
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(NNError::InvalidArchitecture(format!(
                "dropout rate {} outside [0, 1)",
                self.dropout_rate
            )));
        }
        Ok(())
    }
}

/// Maps latent vectors `[n, latent_dim]` to images `[n, side, side, 1]` with values in `[0, 1]`
pub struct Generator {
    architecture: Architecture,
    net: Sequential,
}

impl Generator {
    pub fn new(architecture: Architecture, rng: &mut impl Rng) -> Result<Self, NNError> {
        architecture.validate()?;
        let Architecture {
            latent_dim,
            generator_channels: [c0, c1, c2],
            kernel_size: k,
            base_side: side,
            ..
        } = architecture;
        let dense_units = side * side * c0;
        let net = Sequential::new()
            .add(Dense::new(latent_dim, dense_units, rng)?)
            .add(Activation::relu())
            .add(BatchNorm::new(dense_units)?)
            .add(Reshape::new(&[side, side, c0]))
            .add(ConvTranspose2d::new(c0, c1, k, 1, rng)?)
            .add(Activation::relu())
            .add(BatchNorm::new(c1)?)
            .add(ConvTranspose2d::new(c1, c2, k, 2, rng)?)
            .add(Activation::relu())
            .add(BatchNorm::new(c2)?)
            .add(ConvTranspose2d::new(c2, 1, k, 2, rng)?)
            .add(Activation::sigmoid());
        Ok(Self { architecture, net })
    }

    pub fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    pub fn forward(&self, latents: &Tensor, mode: Mode) -> Result<Tensor, NNError> {
        let shape = latents.shape();
        match shape.as_slice() {
            [_, dim] if *dim == self.architecture.latent_dim => self.net.forward(latents, mode),
            [_, dim] => Err(NNError::InputSizeMismatch {
                layer: "Generator",
                expected: self.architecture.latent_dim,
                got: *dim,
            }),
            _ => Err(NNError::InputRankMismatch {
                layer: "Generator",
                expected: 2,
                shape,
            }),
        }
    }

    /// Synthesizes images in evaluation mode, deterministic for fixed parameters and latents
    pub fn generate(&self, latents: &Tensor) -> Result<Tensor, NNError> {
        self.forward(latents, Mode::Eval)
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        self.net.parameters()
    }

    pub fn buffers(&self) -> Vec<Tensor> {
        self.net.buffers()
    }
}

/// Maps images `[n, side, side, 1]` to raw authenticity logits `[n, 1]`
pub struct Discriminator {
    architecture: Architecture,
    net: Sequential,
}

impl Discriminator {
    pub fn new(architecture: Architecture, rng: &mut impl Rng) -> Result<Self, NNError> {
        architecture.validate()?;
        let Architecture {
            discriminator_channels: [c0, c1],
            kernel_size: k,
            base_side: side,
            leaky_slope,
            dropout_rate,
            ..
        } = architecture;
        let net = Sequential::new()
            .add(Conv2d::new(1, c0, k, 2, rng)?)
            .add(Activation::leaky_relu(leaky_slope))
            .add(Dropout::new(dropout_rate, rng.random())?)
            .add(Conv2d::new(c0, c1, k, 2, rng)?)
            .add(Activation::leaky_relu(leaky_slope))
            .add(Dropout::new(dropout_rate, rng.random())?)
            .add(Flatten)
            .add(Dense::new(side * side * c1, 1, rng)?);
        Ok(Self { architecture, net })
    }

    /// Scores a batch of images, dropout is only active in [`Mode::Train`]
    pub fn forward(&self, images: &Tensor, mode: Mode) -> Result<Tensor, NNError> {
        let shape = images.shape();
        let [side, _, channels] = self.architecture.image_shape();
        match shape.as_slice() {
            [_, h, w, c] if (*h, *w, *c) == (side, side, channels) => {
                self.net.forward(images, mode)
            }
            [_, h, _, _] if *h != side => Err(NNError::InputSizeMismatch {
                layer: "Discriminator",
                expected: side,
                got: *h,
            }),
            [_, _, w, _] if *w != side => Err(NNError::InputSizeMismatch {
                layer: "Discriminator",
                expected: side,
                got: *w,
            }),
            [_, _, _, c] => Err(NNError::InputSizeMismatch {
                layer: "Discriminator",
                expected: channels,
                got: *c,
            }),
            _ => Err(NNError::InputRankMismatch {
                layer: "Discriminator",
                expected: 4,
                shape,
            }),
        }
    }

    /// Scores images in evaluation mode
    pub fn score(&self, images: &Tensor) -> Result<Tensor, NNError> {
        self.forward(images, Mode::Eval)
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        self.net.parameters()
    }
}
