//! A small tensor library with reverse-mode gradients, and a generative adversarial network
//! built on it that learns to draw a single MNIST digit.

pub mod backprop_fns;
pub mod conv;
pub mod dataloader;
pub mod datasets;
pub mod gan;
pub mod loss;
pub mod nn;
pub mod optim;
pub mod persist;
pub mod plot;
pub mod tape;
pub mod tensor;
pub mod training;
