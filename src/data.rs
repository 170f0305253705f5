use crate::config::TrainConfig;
use candle_core::{Device, Tensor};
use clap::ValueEnum;
use image::imageops::FilterType;
use rand::seq::SliceRandom;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const CIFAR_SIZE: usize = 32;
const CIFAR_CHANNELS: usize = 3;
const CIFAR_RECORD_BYTES: usize = CIFAR_SIZE * CIFAR_SIZE * CIFAR_CHANNELS + 1;
const CIFAR_TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];
/// Every source is decoded to RGB.
pub const IMAGE_CHANNELS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    /// CIFAR-10 binary training batches.
    Cifar10,
    /// A directory tree of image files.
    #[value(alias = "imagenet", alias = "lfw")]
    Folder,
    /// Uniform random images, no files needed.
    Fake,
}

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("{path} holds {bytes} bytes, not a whole number of 3073-byte CIFAR records")]
    TruncatedCifar { path: PathBuf, bytes: usize },
    #[error("no CIFAR-10 training batches (data_batch_N.bin) under {0}")]
    MissingCifar(PathBuf),
    #[error("no images found under {0}")]
    Empty(PathBuf),
    #[error("failed to build the decode thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DatasetError {
    let path = path.to_path_buf();
    move |source| DatasetError::Io { path, source }
}

/// `[0, 255]` byte to `[-1, 1]`.
fn normalize(byte: u8) -> f32 {
    byte as f32 / 255.0 * 2.0 - 1.0
}

/// In-memory image set, `[N, C, S, S]` row-major, values in [-1, 1].
pub struct ImageDataset {
    pixels: Vec<f32>,
    len: usize,
    image_size: usize,
}

impl ImageDataset {
    pub fn load(config: &TrainConfig, seed: u64) -> Result<Self, DatasetError> {
        let dataset = match config.dataset {
            DatasetKind::Cifar10 => Self::cifar10(&config.dataroot, config.image_size)?,
            DatasetKind::Folder => Self::folder(&config.dataroot, config.image_size, config.workers)?,
            DatasetKind::Fake => Self::fake(config.fake_samples, config.image_size, seed),
        };
        info!(
            "Loaded {:?} dataset: {} images at {}x{}",
            config.dataset, dataset.len, dataset.image_size, dataset.image_size
        );
        Ok(dataset)
    }

    pub fn fake(len: usize, image_size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let count = len * IMAGE_CHANNELS * image_size * image_size;
        let pixels = (0..count).map(|_| rng.gen_range(-1.0f32..=1.0)).collect();
        Self {
            pixels,
            len,
            image_size,
        }
    }

    /// Reads the five training batches from `root` or `root/cifar-10-batches-bin`.
    /// Missing batch files are skipped as long as at least one is present.
    pub fn cifar10(root: &Path, image_size: usize) -> Result<Self, DatasetError> {
        let dir = if root.join(CIFAR_TRAIN_FILES[0]).exists() {
            root.to_path_buf()
        } else {
            root.join("cifar-10-batches-bin")
        };

        let mut pixels = Vec::new();
        let mut len = 0;
        for name in CIFAR_TRAIN_FILES {
            let path = dir.join(name);
            if !path.exists() {
                warn!("CIFAR-10 batch {} not found, skipping", path.display());
                continue;
            }
            let bytes = std::fs::read(&path).map_err(io_error(&path))?;
            if bytes.is_empty() || bytes.len() % CIFAR_RECORD_BYTES != 0 {
                return Err(DatasetError::TruncatedCifar {
                    path,
                    bytes: bytes.len(),
                });
            }
            for record in bytes.chunks_exact(CIFAR_RECORD_BYTES) {
                // byte 0 is the label
                let chw = &record[1..];
                if image_size == CIFAR_SIZE {
                    pixels.extend(chw.iter().map(|&b| normalize(b)));
                } else {
                    pixels.extend(resize_chw(chw, CIFAR_SIZE, image_size));
                }
                len += 1;
            }
        }
        if len == 0 {
            return Err(DatasetError::MissingCifar(dir));
        }
        Ok(Self {
            pixels,
            len,
            image_size,
        })
    }

    /// Every image file under `root`, resized on the short side and center-cropped
    /// to `image_size`. Files are decoded on a pool of `workers` threads.
    pub fn folder(root: &Path, image_size: usize, workers: usize) -> Result<Self, DatasetError> {
        let mut paths = Vec::new();
        collect_image_paths(root, &mut paths)?;
        if paths.is_empty() {
            return Err(DatasetError::Empty(root.to_path_buf()));
        }
        paths.sort();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build()?;
        let images = pool.install(|| {
            paths
                .par_iter()
                .map(|path| decode_image(path, image_size))
                .collect::<Result<Vec<_>, _>>()
        })?;

        Ok(Self {
            len: images.len(),
            pixels: images.concat(),
            image_size,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn image_len(&self) -> usize {
        IMAGE_CHANNELS * self.image_size * self.image_size
    }

    /// Reshuffles all indices and splits them into batches. The last batch keeps
    /// the remainder and may be smaller than `batch_size`.
    pub fn shuffled_batches<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.len).collect();
        indices.shuffle(rng);
        indices
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Stacks the selected images into a `[B, C, S, S]` tensor.
    pub fn batch(&self, indices: &[usize], device: &Device) -> candle_core::Result<Tensor> {
        let image_len = self.image_len();
        let mut data = Vec::with_capacity(indices.len() * image_len);
        for &idx in indices {
            if idx >= self.len {
                candle_core::bail!("image index {} out of range for {} images", idx, self.len)
            }
            data.extend_from_slice(&self.pixels[idx * image_len..(idx + 1) * image_len]);
        }
        Tensor::from_vec(
            data,
            (indices.len(), IMAGE_CHANNELS, self.image_size, self.image_size),
            device,
        )
    }
}

fn collect_image_paths(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), DatasetError> {
    for entry in std::fs::read_dir(dir).map_err(io_error(dir))? {
        let path = entry.map_err(io_error(dir))?.path();
        if path.is_dir() {
            collect_image_paths(&path, out)?;
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        {
            out.push(path);
        }
    }
    Ok(())
}

fn decode_image(path: &Path, image_size: usize) -> Result<Vec<f32>, DatasetError> {
    let image = image::open(path).map_err(|source| DatasetError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    let size = image_size as u32;
    let rgb = image.resize_to_fill(size, size, FilterType::Triangle).to_rgb8();
    Ok(hwc_to_chw(rgb.as_raw(), image_size))
}

fn hwc_to_chw(hwc: &[u8], size: usize) -> Vec<f32> {
    let plane = size * size;
    let mut chw = vec![0f32; IMAGE_CHANNELS * plane];
    for (i, px) in hwc.chunks_exact(IMAGE_CHANNELS).enumerate() {
        for (c, &b) in px.iter().enumerate() {
            chw[c * plane + i] = normalize(b);
        }
    }
    chw
}

fn resize_chw(chw: &[u8], from: usize, to: usize) -> Vec<f32> {
    let plane = from * from;
    let mut hwc = Vec::with_capacity(chw.len());
    for i in 0..plane {
        for c in 0..IMAGE_CHANNELS {
            hwc.push(chw[c * plane + i]);
        }
    }
    let size = from as u32;
    match image::RgbImage::from_raw(size, size, hwc) {
        Some(img) => {
            let resized = image::imageops::resize(&img, to as u32, to as u32, FilterType::Triangle);
            hwc_to_chw(resized.as_raw(), to)
        }
        // from_raw only fails on a length mismatch, which chunks_exact rules out
        None => vec![0.0; IMAGE_CHANNELS * to * to],
    }
}
