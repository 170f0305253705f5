use super::layers::{self, BatchNorm2d};
use candle_core::{Module, Result, Tensor};
use candle_nn::{ConvTranspose2d, VarBuilder};

/// Number of stride-2 upsampling blocks needed to grow a 4x4 seed to `image_size`.
/// `None` when the size cannot be reached by doubling.
pub fn upsampling_stages(image_size: usize) -> Option<usize> {
    if image_size >= 4 && image_size.is_power_of_two() {
        Some((image_size / 4).trailing_zeros() as usize)
    } else {
        None
    }
}

// ConvTranspose -> BatchNorm -> ReLU
struct UpBlock {
    conv: ConvTranspose2d,
    norm: BatchNorm2d,
}

impl UpBlock {
    fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        padding: usize,
        conv_vb: VarBuilder,
        norm_vb: VarBuilder,
    ) -> Result<Self> {
        let conv = layers::conv_transpose2d(in_channels, out_channels, 4, stride, padding, conv_vb)?;
        let norm = BatchNorm2d::new(out_channels, norm_vb)?;
        Ok(Self { conv, norm })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.norm.forward(&self.conv.forward(x)?)?.relu()
    }
}

/// DCGAN generator: `[B, nz, 1, 1]` latents to `[B, nc, S, S]` images in [-1, 1].
///
/// Parameters are named after their position in the layer stack (`main.<i>.weight`),
/// three slots per block for conv, norm and activation.
pub struct Generator {
    blocks: Vec<UpBlock>,
    to_image: ConvTranspose2d,
    nz: usize,
}

impl Generator {
    pub fn new(nz: usize, ngf: usize, nc: usize, image_size: usize, vb: VarBuilder) -> Result<Self> {
        let stages = upsampling_stages(image_size).ok_or_else(|| {
            candle_core::Error::Msg(format!("generator cannot produce {image_size}x{image_size} images"))
        })?;

        let main = vb.pp("main");
        let mut channels = ngf << stages;
        let mut blocks = Vec::with_capacity(stages + 1);
        blocks.push(UpBlock::new(nz, channels, 1, 0, main.pp(0), main.pp(1))?);
        for stage in 1..=stages {
            let slot = 3 * stage;
            blocks.push(UpBlock::new(channels, channels / 2, 2, 1, main.pp(slot), main.pp(slot + 1))?);
            channels /= 2;
        }
        let to_image = layers::conv_transpose2d(ngf, nc, 1, 1, 0, main.pp(3 * (stages + 1)))?;

        Ok(Self { blocks, to_image, nz })
    }

    pub fn latent_dim(&self) -> usize {
        self.nz
    }
}

impl Module for Generator {
    fn forward(&self, z: &Tensor) -> Result<Tensor> {
        let mut x = z.clone();
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        self.to_image.forward(&x)?.tanh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_upsampling_stages() {
        assert_eq!(upsampling_stages(4), Some(0));
        assert_eq!(upsampling_stages(8), Some(1));
        assert_eq!(upsampling_stages(32), Some(3));
        assert_eq!(upsampling_stages(64), Some(4));
        assert_eq!(upsampling_stages(2), None);
        assert_eq!(upsampling_stages(48), None);
    }

    #[test]
    fn test_generator_output_shape_and_range() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let generator = Generator::new(16, 8, 3, 32, vb)?;
        assert_eq!(generator.latent_dim(), 16);

        let z = Tensor::randn(0f32, 1f32, (4, 16, 1, 1), &device)?;
        let out = generator.forward(&z)?;
        assert_eq!(out.dims(), &[4, 3, 32, 32]);
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));

        // 32x32 keeps the five-convolution layout: slots 0, 3, 6, 9 and 12.
        let data = varmap.data().lock().unwrap();
        let conv_slots: Vec<usize> = [0usize, 3, 6, 9, 12]
            .into_iter()
            .filter(|slot| data.contains_key(&format!("main.{slot}.weight")))
            .collect();
        assert_eq!(conv_slots.len(), 5);
        assert_eq!(data.get("main.0.weight").unwrap().as_tensor().dims(), &[16, 64, 4, 4]);
        assert_eq!(data.get("main.12.weight").unwrap().as_tensor().dims(), &[8, 3, 1, 1]);
        Ok(())
    }

    #[test]
    fn test_generator_initialization_statistics() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _generator = Generator::new(100, 64, 3, 32, vb)?;

        let data = varmap.data().lock().unwrap();
        let mut conv_weights = Vec::new();
        let mut norm_scales = Vec::new();
        let mut norm_shifts = Vec::new();
        for (name, var) in data.iter() {
            let tensor = var.as_tensor();
            let values = tensor.flatten_all()?.to_vec1::<f32>()?;
            if tensor.rank() == 4 {
                conv_weights.extend(values);
            } else if name.ends_with(".bias") {
                norm_shifts.extend(values);
            } else {
                norm_scales.extend(values);
            }
        }

        let (mean, std) = mean_std(&conv_weights);
        assert!(conv_weights.len() > 100_000);
        assert!(mean.abs() < 1e-3);
        assert!((std - 0.02).abs() < 1e-3);

        let (mean, std) = mean_std(&norm_scales);
        assert!((mean - 1.0).abs() < 5e-3);
        assert!((std - 0.02).abs() < 5e-3);

        assert!(!norm_shifts.is_empty());
        assert!(norm_shifts.iter().all(|&b| b == 0.0));
        Ok(())
    }

    fn mean_std(values: &[f32]) -> (f32, f32) {
        let n = values.len() as f64;
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        (mean as f32, var.sqrt() as f32)
    }
}
