//! Saving and restoring a trained generator
//!
//! The artifact is a single JSON document holding the architecture followed by every parameter
//! and batch-norm running statistic in layer order, each with its shape.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    gan::{Architecture, Generator},
    nn::NNError,
    tensor::{Tensor, TensorError},
};

const FORMAT: &str = "digit-gan/generator";
const VERSION: u32 = 1;

/// Where the generator is saved when no path is given
pub const DEFAULT_MODEL_PATH: &str = "generator.json";

/// Errors for saving and loading models
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Could not access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed model file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported model format '{format}' version {version}")]
    UnsupportedFormat { format: String, version: u32 },
    #[error("Model stores {found} {kind}, the architecture needs {expected}")]
    CountMismatch {
        kind: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Stored {kind} {index} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        kind: &'static str,
        index: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error(transparent)]
    Network(#[from] NNError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl From<&Tensor> for StoredTensor {
    fn from(tensor: &Tensor) -> Self {
        Self {
            shape: tensor.shape(),
            data: tensor.to_vec(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GeneratorArtifact {
    format: String,
    version: u32,
    architecture: Architecture,
    parameters: Vec<StoredTensor>,
    buffers: Vec<StoredTensor>,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PersistError + '_ {
    move |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes the generator's architecture and values to `path`, replacing any existing file
pub fn save_generator(generator: &Generator, path: &Path) -> Result<(), PersistError> {
    let artifact = GeneratorArtifact {
        format: FORMAT.to_string(),
        version: VERSION,
        architecture: generator.architecture().clone(),
        parameters: generator.parameters().iter().map(StoredTensor::from).collect(),
        buffers: generator.buffers().iter().map(StoredTensor::from).collect(),
    };
    let mut writer = BufWriter::new(File::create(path).map_err(io_error(path))?);
    serde_json::to_writer(&mut writer, &artifact)?;
    writer.flush().map_err(io_error(path))?;
    log::info!("Generator saved to '{}'.", path.display());
    Ok(())
}

/// Rebuilds a generator saved by [`save_generator`]
pub fn load_generator(path: &Path) -> Result<Generator, PersistError> {
    let reader = BufReader::new(File::open(path).map_err(io_error(path))?);
    let artifact: GeneratorArtifact = serde_json::from_reader(reader)?;
    if artifact.format != FORMAT || artifact.version != VERSION {
        return Err(PersistError::UnsupportedFormat {
            format: artifact.format,
            version: artifact.version,
        });
    }

    // initial values are overwritten below
    let generator = Generator::new(artifact.architecture, &mut Pcg64Mcg::seed_from_u64(0))?;
    restore("parameters", generator.parameters(), artifact.parameters)?;
    restore("buffers", generator.buffers(), artifact.buffers)?;
    log::info!("Generator loaded from '{}'.", path.display());
    Ok(generator)
}

fn restore(
    kind: &'static str,
    targets: Vec<Tensor>,
    stored: Vec<StoredTensor>,
) -> Result<(), PersistError> {
    if targets.len() != stored.len() {
        return Err(PersistError::CountMismatch {
            kind,
            expected: targets.len(),
            found: stored.len(),
        });
    }
    for (index, (mut target, stored)) in targets.into_iter().zip(stored).enumerate() {
        if target.shape() != stored.shape {
            return Err(PersistError::ShapeMismatch {
                kind,
                index,
                expected: target.shape(),
                found: stored.shape,
            });
        }
        target.set_data(stored.data)?;
    }
    Ok(())
}
