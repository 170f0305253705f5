pub mod generator;
pub mod layers;
pub mod unet;

use candle_core::{Result, Tensor};

/// A network trained to recover the noise that was mixed into a diffused image.
pub trait ScoreNetwork {
    /// `x_t`: `[B, C, H, W]` diffused images, `t`: `[B]` u32 timesteps.
    /// Returns the predicted noise with the shape of `x_t`.
    fn predict_noise(&self, x_t: &Tensor, t: &Tensor, train: bool) -> Result<Tensor>;
}
