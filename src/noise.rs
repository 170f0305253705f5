use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Seeded source for every random draw the training loop makes: Gaussian noise,
/// generator latents, diffusion timesteps and the per-epoch shuffle.
///
/// Drawing on the host from one `StdRng` keeps a run reproducible from its seed
/// on every candle backend, including the CPU one which cannot be reseeded.
#[derive(Clone)]
pub struct NoiseSampler {
    rng: StdRng,
    device: Device,
}

impl NoiseSampler {
    pub fn new(seed: u64, device: &Device) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            device: device.clone(),
        }
    }

    /// Standard-normal tensor of the given shape.
    pub fn randn(&mut self, dims: &[usize]) -> Result<Tensor> {
        let count: usize = dims.iter().product();
        let values: Vec<f32> = (0..count).map(|_| self.rng.sample(StandardNormal)).collect();
        Tensor::from_vec(values, dims, &self.device)
    }

    pub fn randn_like(&mut self, x: &Tensor) -> Result<Tensor> {
        self.randn(x.dims())
    }

    /// Latent batch `[batch, nz, 1, 1]` for the generator.
    pub fn latents(&mut self, batch: usize, nz: usize) -> Result<Tensor> {
        self.randn(&[batch, nz, 1, 1])
    }

    /// One timestep per sample, uniform in `[0, num_steps)`, as a `u32` tensor.
    pub fn timesteps(&mut self, batch: usize, num_steps: usize) -> Result<Tensor> {
        let steps: Vec<u32> = (0..batch)
            .map(|_| self.rng.gen_range(0..num_steps as u32))
            .collect();
        Tensor::from_vec(steps, (batch,), &self.device)
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}
