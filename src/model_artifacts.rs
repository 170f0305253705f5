use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use safetensors::SafeTensors;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

/// Lower bound on the value range when min-max normalizing a sample grid.
const GRID_MIN_RANGE: f32 = 1e-5;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("reading checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not a safetensors file: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: safetensors::SafeTensorError,
    },
    #[error("checkpoint is missing tensor '{0}'")]
    Missing(String),
    #[error("checkpoint holds tensor '{0}' that the model does not have")]
    Unexpected(String),
    #[error("tensor '{name}' has shape {found:?} in the checkpoint, model expects {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("model parameters are unavailable: {0}")]
    Poisoned(String),
}

/// `<outf>/<prefix>_epoch_<epoch>.safetensors`
pub fn checkpoint_path(outf: &Path, prefix: &str, epoch: usize) -> PathBuf {
    outf.join(format!("{}_epoch_{}.safetensors", prefix, epoch))
}

pub fn save_checkpoint(varmap: &VarMap, path: &Path) -> Result<()> {
    varmap
        .save(path)
        .with_context(|| format!("saving checkpoint {}", path.display()))?;
    info!("Saved safetensors checkpoint: {}", path.display());
    Ok(())
}

/// Checks that the checkpoint at `path` holds exactly the model's tensors with
/// matching shapes.
pub fn validate_checkpoint(varmap: &VarMap, path: &Path) -> std::result::Result<(), CheckpointError> {
    let bytes = std::fs::read(path).map_err(|source| CheckpointError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let checkpoint = SafeTensors::deserialize(&bytes).map_err(|source| CheckpointError::Format {
        path: path.to_path_buf(),
        source,
    })?;

    let data = varmap
        .data()
        .lock()
        .map_err(|e| CheckpointError::Poisoned(e.to_string()))?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    for name in names {
        let view = checkpoint
            .tensor(name)
            .map_err(|_| CheckpointError::Missing(name.clone()))?;
        let expected = data[name].as_tensor().dims();
        if view.shape() != expected {
            return Err(CheckpointError::ShapeMismatch {
                name: name.clone(),
                expected: expected.to_vec(),
                found: view.shape().to_vec(),
            });
        }
    }

    let known: HashSet<&str> = data.keys().map(String::as_str).collect();
    let mut extra: Vec<&str> = checkpoint
        .names()
        .into_iter()
        .filter(|name| !known.contains(name))
        .collect();
    extra.sort_unstable();
    if let Some(name) = extra.first() {
        return Err(CheckpointError::Unexpected(name.to_string()));
    }
    Ok(())
}

/// Replaces the values in `varmap` with the ones stored at `path`.
pub fn resume_from_checkpoint(varmap: &mut VarMap, path: &Path) -> Result<()> {
    validate_checkpoint(varmap, path)?;
    varmap
        .load(path)
        .with_context(|| format!("loading checkpoint {}", path.display()))?;
    info!("Resumed from checkpoint: {}", path.display());
    Ok(())
}

/// Placement of `n` images in a padded grid with at most `nrow` per row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridLayout {
    pub cols: usize,
    pub rows: usize,
    pub width: usize,
    pub height: usize,
    cell_width: usize,
    cell_height: usize,
    padding: usize,
}

impl GridLayout {
    pub fn new(n: usize, nrow: usize, image_height: usize, image_width: usize, padding: usize) -> Self {
        if n == 1 {
            // A lone image is written as-is.
            return Self {
                cols: 1,
                rows: 1,
                width: image_width,
                height: image_height,
                cell_width: image_width,
                cell_height: image_height,
                padding: 0,
            };
        }
        let cols = nrow.min(n).max(1);
        let rows = n.div_ceil(cols);
        let cell_width = image_width + padding;
        let cell_height = image_height + padding;
        Self {
            cols,
            rows,
            width: cols * cell_width + padding,
            height: rows * cell_height + padding,
            cell_width,
            cell_height,
            padding,
        }
    }

    /// Top-left pixel of image `index`.
    fn origin(&self, index: usize) -> (usize, usize) {
        let (row, col) = (index / self.cols, index % self.cols);
        (col * self.cell_width + self.padding, row * self.cell_height + self.padding)
    }
}

/// Writes a `[B, C, H, W]` batch as one PNG grid, min-max normalized over the
/// whole batch. Single-channel images are written as gray RGB.
pub fn save_image_grid(images: &Tensor, path: &Path, nrow: usize, padding: usize) -> Result<()> {
    let images = images.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    let (n, channels, height, width) = images.dims4()?;
    if n == 0 {
        anyhow::bail!("cannot write an empty image grid to {}", path.display());
    }
    if channels != 1 && channels != 3 {
        anyhow::bail!("image grid needs 1 or 3 channels, got {}", channels);
    }
    let values = images.flatten_all()?.to_vec1::<f32>()?;
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = (max - min).max(GRID_MIN_RANGE);
    let to_byte = |v: f32| ((v.clamp(min, max) - min) / range * 255.0 + 0.5).clamp(0.0, 255.0) as u8;

    let layout = GridLayout::new(n, nrow, height, width, padding);
    let mut buffer = vec![0u8; layout.width * layout.height * 3];
    let plane = height * width;
    for index in 0..n {
        let (x0, y0) = layout.origin(index);
        let image = &values[index * channels * plane..(index + 1) * channels * plane];
        for y in 0..height {
            for x in 0..width {
                let dst = ((y0 + y) * layout.width + x0 + x) * 3;
                for c in 0..3 {
                    let src = (c % channels) * plane + y * width + x;
                    buffer[dst + c] = to_byte(image[src]);
                }
            }
        }
    }

    let grid = image::RgbImage::from_raw(layout.width as u32, layout.height as u32, buffer)
        .context("image grid buffer does not match its dimensions")?;
    grid.save(path)
        .with_context(|| format!("writing image grid {}", path.display()))?;
    Ok(())
}
