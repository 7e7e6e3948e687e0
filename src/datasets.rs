//! Loads the MNIST handwritten digits and derives the single class training pool
//!
//! The raw files use the IDX format: a big-endian header (magic number, item count and, for
//! images, rows and columns) followed by one unsigned byte per label or pixel.
//! <http://yann.lecun.com/exdb/mnist/>

use std::{
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;

const IMAGES_MAGIC: u32 = 2051;
const LABELS_MAGIC: u32 = 2049;
const MAX_INTENSITY: f32 = 255.0;

/// File names of the training split, with the alternative spelling some mirrors use
const TRAIN_IMAGES: [&str; 2] = ["train-images-idx3-ubyte", "train-images.idx3-ubyte"];
const TRAIN_LABELS: [&str; 2] = ["train-labels-idx1-ubyte", "train-labels.idx1-ubyte"];

/// Errors for loading and filtering datasets
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("None of {candidates:?} found in {dir}")]
    MissingFile {
        dir: PathBuf,
        candidates: Vec<String>,
    },
    #[error("{path} is gzip compressed, decompress it first")]
    Compressed { path: PathBuf },
    #[error("{path} has magic number {found}, expected {expected}")]
    BadMagic {
        path: PathBuf,
        expected: u32,
        found: u32,
    },
    #[error("{path} is truncated: expected {expected} bytes, found {found}")]
    Truncated {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    #[error("{path} declares {count} images of {rows}x{cols}, too large to address")]
    BadHeader {
        path: PathBuf,
        count: u32,
        rows: u32,
        cols: u32,
    },
    #[error("Image size {rows}x{cols} overflows")]
    ImageTooLarge { rows: usize, cols: usize },
    #[error("{images} images but {labels} labels")]
    CountMismatch { images: usize, labels: usize },
    #[error("Batch size must be positive")]
    InvalidBatchSize,
}

/// A labeled collection of single channel images, pixels are raw intensities in `0..=255`
#[derive(Debug, Clone)]
pub struct LabeledImages {
    pixels: Vec<u8>,
    labels: Vec<u8>,
    rows: usize,
    cols: usize,
}

impl LabeledImages {
    pub fn new(
        pixels: Vec<u8>,
        labels: Vec<u8>,
        rows: usize,
        cols: usize,
    ) -> Result<Self, DatasetError> {
        let size = rows
            .checked_mul(cols)
            .ok_or(DatasetError::ImageTooLarge { rows, cols })?;
        let n_images = pixels.len().checked_div(size).unwrap_or(0);
        if n_images * size != pixels.len() || n_images != labels.len() {
            return Err(DatasetError::CountMismatch {
                images: n_images,
                labels: labels.len(),
            });
        }
        Ok(Self {
            pixels,
            labels,
            rows,
            cols,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn image_dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    fn image(&self, index: usize) -> &[u8] {
        let size = self.rows * self.cols;
        &self.pixels[index * size..(index + 1) * size]
    }
}

/// Normalized images of a single class, flattened as `[len, height, width, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSet {
    data: Vec<f32>,
    sample_shape: [usize; 3],
}

impl SampleSet {
    pub fn new(data: Vec<f32>, sample_shape: [usize; 3]) -> Self {
        debug_assert_eq!(data.len() % sample_shape.iter().product::<usize>().max(1), 0);
        Self { data, sample_shape }
    }

    pub fn len(&self) -> usize {
        match self.sample_shape.iter().product::<usize>() {
            0 => 0,
            size => self.data.len() / size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sample_shape(&self) -> [usize; 3] {
        self.sample_shape
    }

    pub fn sample(&self, index: usize) -> &[f32] {
        let size = self.sample_shape.iter().product::<usize>();
        &self.data[index * size..(index + 1) * size]
    }
}

/// Usable pool size for a filtered set of `n_samples`: the largest multiple of `batch_size`
/// not exceeding it
pub fn trimmed_len(n_samples: usize, batch_size: usize) -> usize {
    n_samples - n_samples % batch_size
}

/// Selects every image labeled `class`, trims the selection to a multiple of `batch_size`,
/// scales intensities into `[0, 1]` and shapes each image as `(rows, cols, 1)`.
/// Labels are dropped, the source collection is left untouched.
pub fn select_class(
    dataset: &LabeledImages,
    class: u8,
    batch_size: usize,
) -> Result<SampleSet, DatasetError> {
    if batch_size == 0 {
        return Err(DatasetError::InvalidBatchSize);
    }
    let selected = dataset
        .labels
        .iter()
        .enumerate()
        .filter(|(_, label)| **label == class)
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    let usable = trimmed_len(selected.len(), batch_size);
    log::info!(
        "Selected {} images of class {}, keeping {} (batch size {})",
        selected.len(),
        class,
        usable,
        batch_size
    );
    let data = selected[..usable]
        .iter()
        .flat_map(|&i| dataset.image(i).iter().map(|&p| p as f32 / MAX_INTENSITY))
        .collect();
    Ok(SampleSet::new(data, [dataset.rows, dataset.cols, 1]))
}

/// Loads the MNIST training split from `dir`
pub fn load_mnist(dir: &Path) -> Result<LabeledImages, DatasetError> {
    let images_path = find_file(dir, &TRAIN_IMAGES)?;
    let labels_path = find_file(dir, &TRAIN_LABELS)?;
    let (pixels, rows, cols) = parse_images(&images_path, &read(&images_path)?)?;
    let labels = parse_labels(&labels_path, &read(&labels_path)?)?;
    let dataset = LabeledImages::new(pixels, labels, rows, cols)?;
    log::info!(
        "Loaded {} images of {}x{} from '{}'",
        dataset.len(),
        rows,
        cols,
        dir.display()
    );
    Ok(dataset)
}

fn find_file(dir: &Path, candidates: &[&str]) -> Result<PathBuf, DatasetError> {
    if let Some(path) = candidates
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
    {
        return Ok(path);
    }
    // the downloads are gzipped, only the decompressed files are read
    if let Some(path) = candidates
        .iter()
        .map(|name| dir.join(format!("{name}.gz")))
        .find(|path| path.is_file())
    {
        return Err(DatasetError::Compressed { path });
    }
    Err(DatasetError::MissingFile {
        dir: dir.to_path_buf(),
        candidates: candidates.iter().map(|c| c.to_string()).collect(),
    })
}

fn read(path: &Path) -> Result<Vec<u8>, DatasetError> {
    fs::read(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads the big-endian header words, `None` if the buffer is too short
fn header<const N: usize>(bytes: &[u8]) -> Option<[u32; N]> {
    let mut words = [0; N];
    for (i, word) in words.iter_mut().enumerate() {
        let chunk = bytes.get(i * 4..i * 4 + 4)?;
        *word = u32::from_be_bytes(chunk.try_into().ok()?);
    }
    Some(words)
}

fn parse_images(path: &Path, bytes: &[u8]) -> Result<(Vec<u8>, usize, usize), DatasetError> {
    let truncated = |expected| DatasetError::Truncated {
        path: path.to_path_buf(),
        expected,
        found: bytes.len(),
    };
    let [magic, count, rows, cols] = header::<4>(bytes).ok_or_else(|| truncated(16))?;
    if magic != IMAGES_MAGIC {
        return Err(DatasetError::BadMagic {
            path: path.to_path_buf(),
            expected: IMAGES_MAGIC,
            found: magic,
        });
    }
    let expected = (count as usize)
        .checked_mul(rows as usize)
        .and_then(|n| n.checked_mul(cols as usize))
        .and_then(|n| n.checked_add(16))
        .ok_or_else(|| DatasetError::BadHeader {
            path: path.to_path_buf(),
            count,
            rows,
            cols,
        })?;
    if bytes.len() < expected {
        return Err(truncated(expected));
    }
    Ok((bytes[16..expected].to_vec(), rows as usize, cols as usize))
}

fn parse_labels(path: &Path, bytes: &[u8]) -> Result<Vec<u8>, DatasetError> {
    let truncated = |expected| DatasetError::Truncated {
        path: path.to_path_buf(),
        expected,
        found: bytes.len(),
    };
    let [magic, count] = header::<2>(bytes).ok_or_else(|| truncated(8))?;
    if magic != LABELS_MAGIC {
        return Err(DatasetError::BadMagic {
            path: path.to_path_buf(),
            expected: LABELS_MAGIC,
            found: magic,
        });
    }
    let expected = (count as usize).saturating_add(8);
    if bytes.len() < expected {
        return Err(truncated(expected));
    }
    Ok(bytes[8..expected].to_vec())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use super::*;

    /// `n` tiny 2x2 images, image `i` is filled with `i` and labeled `i % 3`
    pub(crate) fn toy_dataset(n: usize) -> LabeledImages {
        let pixels = (0..n).flat_map(|i| [i as u8; 4]).collect();
        let labels = (0..n).map(|i| (i % 3) as u8).collect();
        LabeledImages::new(pixels, labels, 2, 2).unwrap()
    }

    fn idx_images(count: u32, rows: u32, cols: u32, pixels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for word in [IMAGES_MAGIC, count, rows, cols] {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes.extend_from_slice(pixels);
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for word in [LABELS_MAGIC, labels.len() as u32] {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes.extend_from_slice(labels);
        bytes
    }

    #[test]
    fn test_trimmed_len() {
        assert_eq!(trimmed_len(0, 100), 0);
        assert_eq!(trimmed_len(99, 100), 0);
        assert_eq!(trimmed_len(600, 100), 600);
        assert_eq!(trimmed_len(6265, 100), 6200);
        for (s, b) in [(17, 4), (5, 5), (3, 7), (1000, 33)] {
            let t = trimmed_len(s, b);
            assert!(t <= s && t % b == 0 && s - t < b);
        }
    }

    #[test]
    fn test_select_class() {
        let dataset = toy_dataset(10);
        // class 1 holds images 1, 4 and 7
        let samples = select_class(&dataset, 1, 2).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples.sample_shape(), [2, 2, 1]);
        assert_eq!(samples.sample(0), &[1.0 / 255.0; 4]);
        assert_eq!(samples.sample(1), &[4.0 / 255.0; 4]);
        // the source is untouched
        assert_eq!(dataset.len(), 10);

        let all = select_class(&dataset, 1, 1).unwrap();
        assert_eq!(all.len(), 3);
        assert!(select_class(&dataset, 9, 1).unwrap().is_empty());
        assert!(matches!(
            select_class(&dataset, 1, 0),
            Err(DatasetError::InvalidBatchSize)
        ));
    }

    #[test]
    fn test_normalization_range() {
        let pixels = vec![0, 128, 255, 64];
        let dataset = LabeledImages::new(pixels, vec![7], 2, 2).unwrap();
        let samples = select_class(&dataset, 7, 1).unwrap();
        assert_eq!(samples.sample(0)[0], 0.0);
        assert_eq!(samples.sample(0)[2], 1.0);
        assert!(samples.sample(0).iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_count_mismatch() {
        assert!(matches!(
            LabeledImages::new(vec![0; 8], vec![1], 2, 2),
            Err(DatasetError::CountMismatch {
                images: 2,
                labels: 1
            })
        ));
    }

    #[test]
    fn test_parse_idx() {
        let path = Path::new("mem");
        let bytes = idx_images(2, 1, 2, &[1, 2, 3, 4]);
        let (pixels, rows, cols) = parse_images(path, &bytes).unwrap();
        assert_eq!((pixels, rows, cols), (vec![1, 2, 3, 4], 1, 2));
        assert_eq!(parse_labels(path, &idx_labels(&[7, 1])).unwrap(), vec![7, 1]);

        assert!(matches!(
            parse_images(path, &idx_images(3, 1, 2, &[1, 2, 3, 4])),
            Err(DatasetError::Truncated { expected: 22, .. })
        ));
        assert!(matches!(
            parse_images(path, &idx_labels(&[1; 8])),
            Err(DatasetError::BadMagic { found: 2049, .. })
        ));
        assert!(matches!(
            parse_labels(path, &[0, 0]),
            Err(DatasetError::Truncated { expected: 8, .. })
        ));
    }

    #[test]
    fn test_oversized_header() {
        let path = Path::new("mem");
        assert!(matches!(
            parse_images(path, &idx_images(u32::MAX, u32::MAX, u32::MAX, &[0; 16])),
            Err(DatasetError::BadHeader {
                count: u32::MAX,
                rows: u32::MAX,
                cols: u32::MAX,
                ..
            })
        ));
        let mut labels = LABELS_MAGIC.to_be_bytes().to_vec();
        labels.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            parse_labels(path, &labels),
            Err(DatasetError::Truncated { found: 8, .. })
        ));
        assert!(matches!(
            LabeledImages::new(vec![0; 4], vec![1], usize::MAX, 2),
            Err(DatasetError::ImageTooLarge {
                rows: usize::MAX,
                cols: 2
            })
        ));
    }

    #[test]
    fn test_load_mnist_from_dir() {
        let dir = std::env::temp_dir().join(format!("digit-gan-mnist-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let mut images = fs::File::create(dir.join(TRAIN_IMAGES[1])).unwrap();
        images
            .write_all(&idx_images(3, 2, 2, &[0; 12]))
            .unwrap();
        fs::write(dir.join(TRAIN_LABELS[0]), idx_labels(&[7, 3, 7])).unwrap();

        let dataset = load_mnist(&dir).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.image_dims(), (2, 2));
        assert_eq!(dataset.labels(), &[7, 3, 7]);

        let missing = load_mnist(&dir.join("nope"));
        assert!(matches!(missing, Err(DatasetError::MissingFile { .. })));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_gzipped_files_are_reported() {
        let dir = std::env::temp_dir().join(format!("digit-gan-gz-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let gz = dir.join(format!("{}.gz", TRAIN_IMAGES[0]));
        fs::write(&gz, [0x1f, 0x8b, 0x08]).unwrap();

        match load_mnist(&dir) {
            Err(DatasetError::Compressed { path }) => assert_eq!(path, gz),
            other => panic!("expected a compressed file error, got {other:?}"),
        }
        fs::remove_dir_all(&dir).unwrap();
    }
}
