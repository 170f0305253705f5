use candle_core::{Module, Result, Tensor};
use candle_nn::{ConvTranspose2d, ConvTranspose2dConfig, Init, VarBuilder};
use rand::rngs::StdRng;
use rand::Rng;

pub const INIT_STDEV: f64 = 0.02;
pub const BATCH_NORM_EPS: f64 = 1e-5;

/// Role a parameter plays in its layer. Declared where the layer is built and
/// the only thing that decides the initial values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamRole {
    ConvWeight,
    NormScale,
    NormShift,
}

impl ParamRole {
    pub fn init(self) -> Init {
        match self {
            ParamRole::ConvWeight => Init::Randn { mean: 0.0, stdev: INIT_STDEV },
            ParamRole::NormScale => Init::Randn { mean: 1.0, stdev: INIT_STDEV },
            ParamRole::NormShift => Init::Const(0.0),
        }
    }
}

/// Bias-free transposed convolution with a square kernel.
pub fn conv_transpose2d(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    vb: VarBuilder,
) -> Result<ConvTranspose2d> {
    let weight = vb.get_with_hints(
        (in_channels, out_channels, kernel, kernel),
        "weight",
        ParamRole::ConvWeight.init(),
    )?;
    let config = ConvTranspose2dConfig {
        padding,
        stride,
        ..Default::default()
    };
    Ok(ConvTranspose2d::new(weight, None, config))
}

/// Batch normalization over `[B, C, H, W]` that always normalizes with the
/// statistics of the batch it is given. No running averages are kept.
pub struct BatchNorm2d {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl BatchNorm2d {
    pub fn new(num_features: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(num_features, "weight", ParamRole::NormScale.init())?;
        let bias = vb.get_with_hints(num_features, "bias", ParamRole::NormShift.init())?;
        Ok(Self {
            weight,
            bias,
            eps: BATCH_NORM_EPS,
        })
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, channels, _, _) = x.dims4()?;
        let mean = x.mean_keepdim(0)?.mean_keepdim(2)?.mean_keepdim(3)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(0)?.mean_keepdim(2)?.mean_keepdim(3)?;
        let normed = centered.broadcast_div(&var.affine(1.0, self.eps)?.sqrt()?)?;
        normed
            .broadcast_mul(&self.weight.reshape((1, channels, 1, 1))?)?
            .broadcast_add(&self.bias.reshape((1, channels, 1, 1))?)
    }
}

/// Inverted dropout: during training, zeros each element with probability `p`
/// and scales the survivors by 1/(1-p). The mask is drawn from `rng` on the host.
pub fn dropout(x: &Tensor, p: f64, train: bool, rng: &mut StdRng) -> Result<Tensor> {
    if !train || p <= 0.0 || p >= 1.0 {
        return Ok(x.clone());
    }
    let scale = (1.0 / (1.0 - p)) as f32;
    let mask: Vec<f32> = (0..x.elem_count())
        .map(|_| if rng.r#gen::<f64>() >= p { scale } else { 0.0 })
        .collect();
    let mask = Tensor::from_vec(mask, x.dims(), x.device())?.to_dtype(x.dtype())?;
    x.mul(&mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use rand::SeedableRng;

    #[test]
    fn test_batch_norm_normalizes_per_channel() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let bn = BatchNorm2d::new(2, vb)?;

        let x = Tensor::randn(3.0f32, 5.0f32, (16, 2, 4, 4), &device)?;
        let y = bn.forward(&x)?;
        assert_eq!(y.dims(), x.dims());

        // scale starts near 1 and shift at 0, so each channel is close to N(0, 1).
        for c in 0..2 {
            let channel = y.narrow(1, c, 1)?.flatten_all()?.to_vec1::<f32>()?;
            let mean = channel.iter().sum::<f32>() / channel.len() as f32;
            let var = channel.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / channel.len() as f32;
            assert!(mean.abs() < 0.1);
            assert!((var.sqrt() - 1.0).abs() < 0.1);
        }
        Ok(())
    }

    #[test]
    fn test_norm_shift_starts_at_zero() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _bn = BatchNorm2d::new(8, vb.pp("bn"))?;
        let data = varmap.data().lock().unwrap();
        let bias = data.get("bn.bias").unwrap().as_tensor().to_vec1::<f32>()?;
        assert!(bias.iter().all(|&b| b == 0.0));
        Ok(())
    }

    #[test]
    fn test_dropout_is_identity_outside_training() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let x = Tensor::ones((4, 4), DType::F32, &Device::Cpu)?;
        let y = dropout(&x, 0.5, false, &mut rng)?;
        assert_eq!(x.to_vec2::<f32>()?, y.to_vec2::<f32>()?);

        let y = dropout(&x, 0.5, true, &mut rng)?;
        for v in y.flatten_all()?.to_vec1::<f32>()? {
            assert!(v == 0.0 || (v - 2.0).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_dropout_mask_follows_seed() -> Result<()> {
        let x = Tensor::ones((16, 16), DType::F32, &Device::Cpu)?;
        let draw = |seed: u64| -> Result<Vec<f32>> {
            let mut rng = StdRng::seed_from_u64(seed);
            dropout(&x, 0.3, true, &mut rng)?.flatten_all()?.to_vec1::<f32>()
        };
        assert_eq!(draw(5)?, draw(5)?);
        assert_ne!(draw(5)?, draw(6)?);
        Ok(())
    }
}
