use candle_core::{DType, Device, Result, Tensor};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How a clean image is mixed with Gaussian noise at timestep `t`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardProcess {
    /// `x_t = x_0 + sqrt(1 - ᾱ_t) * ε`. The clean image is not rescaled.
    Additive,
    /// `x_t = sqrt(ᾱ_t) * x_0 + sqrt(1 - ᾱ_t) * ε` (DDPM q(x_t | x_0)).
    Canonical,
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("noise schedule needs at least one timestep")]
    NoSteps,
    #[error("beta bounds must satisfy 0 < beta_start < beta_end < 1, got start={start}, end={end}")]
    InvalidBounds { start: f64, end: f64 },
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

/// Checks the preconditions of [`NoiseSchedule::new`] without allocating anything.
pub fn check_schedule_bounds(beta_start: f64, beta_end: f64, num_steps: usize) -> std::result::Result<(), ScheduleError> {
    if num_steps == 0 {
        return Err(ScheduleError::NoSteps);
    }
    if !(beta_start > 0.0 && beta_start < beta_end && beta_end < 1.0) {
        return Err(ScheduleError::InvalidBounds { start: beta_start, end: beta_end });
    }
    Ok(())
}

/// Linear variance schedule and every table derived from it.
///
/// Built once at startup and handed to the trainer; nothing here mutates after
/// construction. Tables are computed in f64 and stored as f32 tensors on the
/// training device.
#[derive(Debug)]
pub struct NoiseSchedule {
    pub num_steps: usize,
    pub betas: Tensor,
    pub alphas: Tensor,
    pub alphas_bar: Tensor,
    pub sqrt_alphas_bar: Tensor,
    pub sqrt_one_minus_alphas_bar: Tensor,
    forward_process: ForwardProcess,
}

impl NoiseSchedule {
    /// Creates the schedule with `num_steps` betas evenly spaced from `beta_start` to `beta_end`.
    pub fn new(
        beta_start: f64,
        beta_end: f64,
        num_steps: usize,
        forward_process: ForwardProcess,
        device: &Device,
    ) -> std::result::Result<Self, ScheduleError> {
        check_schedule_bounds(beta_start, beta_end, num_steps)?;

        let betas = linspace(beta_start, beta_end, num_steps);
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let alphas_bar: Vec<f64> = alphas
            .iter()
            .scan(1.0f64, |cum_prod, &a| {
                *cum_prod *= a;
                Some(*cum_prod)
            })
            .collect();
        let sqrt_alphas_bar: Vec<f64> = alphas_bar.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_bar: Vec<f64> = alphas_bar.iter().map(|a| (1.0 - a).sqrt()).collect();

        let to_tensor = |values: &[f64]| -> Result<Tensor> {
            Tensor::new(values, device)?.to_dtype(DType::F32)
        };

        Ok(Self {
            num_steps,
            betas: to_tensor(&betas)?,
            alphas: to_tensor(&alphas)?,
            alphas_bar: to_tensor(&alphas_bar)?,
            sqrt_alphas_bar: to_tensor(&sqrt_alphas_bar)?,
            sqrt_one_minus_alphas_bar: to_tensor(&sqrt_one_minus_alphas_bar)?,
            forward_process,
        })
    }

    pub fn forward_process(&self) -> ForwardProcess {
        self.forward_process
    }

    /// Diffuses `x_0` to the per-sample timesteps `t` using the supplied noise.
    ///
    /// Pure: identical `(x_0, t, noise)` always give an identical `x_t`.
    pub fn diffuse(&self, x_0: &Tensor, t: &Tensor, noise: &Tensor) -> Result<Tensor> {
        if noise.dims() != x_0.dims() {
            candle_core::bail!(
                "noise shape {:?} does not match image shape {:?}",
                noise.dims(),
                x_0.dims()
            )
        }
        let noise_scale = extract(&self.sqrt_one_minus_alphas_bar, t, x_0.dims())?;
        let scaled_noise = noise.broadcast_mul(&noise_scale)?;
        match self.forward_process {
            ForwardProcess::Additive => x_0.add(&scaled_noise),
            ForwardProcess::Canonical => {
                let signal_scale = extract(&self.sqrt_alphas_bar, t, x_0.dims())?;
                x_0.broadcast_mul(&signal_scale)?.add(&scaled_noise)
            }
        }
    }
}

/// Gathers `table[t[b]]` for every sample and reshapes the result to
/// `[B, 1, 1, ...]` with the rank of `x_shape`, ready for broadcasting.
pub fn extract(table: &Tensor, t: &Tensor, x_shape: &[usize]) -> Result<Tensor> {
    let table_len = table.dims1()?;
    let batch = t.dims1()?;
    if x_shape.first() != Some(&batch) {
        candle_core::bail!(
            "extract: {} timesteps cannot broadcast against shape {:?}",
            batch,
            x_shape
        )
    }

    let t = t.to_dtype(DType::U32)?;
    let steps = t.to_vec1::<u32>()?;
    if let Some(&step) = steps.iter().find(|&&s| s as usize >= table_len) {
        candle_core::bail!("extract: timestep {} out of range for a table of {} entries", step, table_len)
    }

    let mut out_shape = vec![1usize; x_shape.len()];
    out_shape[0] = batch;
    table.index_select(&t, 0)?.to_dtype(DType::F32)?.reshape(out_shape)
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n)
        .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
        .collect()
}
