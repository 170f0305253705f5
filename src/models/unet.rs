use super::layers::dropout;
use super::ScoreNetwork;
use crate::config::{ScoreNetConfig, NUM_GROUPS};
use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Embedding, GroupNorm, Linear, VarBuilder};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Mutex;

const GROUP_NORM_EPS: f64 = 1e-5;

fn conv3x3(in_channels: usize, out_channels: usize, stride: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    candle_nn::conv2d(in_channels, out_channels, 3, cfg, vb)
}

fn conv1x1(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Conv2d> {
    candle_nn::conv2d(in_channels, out_channels, 1, Default::default(), vb)
}

fn group_norm(channels: usize, vb: VarBuilder) -> Result<GroupNorm> {
    candle_nn::group_norm(NUM_GROUPS, channels, GROUP_NORM_EPS, vb)
}

/// Fixed sinusoidal table `[num_steps, dim]`, sin and cos interleaved per frequency.
fn sinusoidal_table(num_steps: usize, dim: usize, device: &Device) -> Result<Tensor> {
    let half = dim / 2;
    let mut values = Vec::with_capacity(num_steps * dim);
    for pos in 0..num_steps {
        for i in 0..half {
            let freq = (-((2 * i) as f64) / dim as f64 * 10000f64.ln()).exp();
            let angle = pos as f64 * freq;
            values.push(angle.sin() as f32);
            values.push(angle.cos() as f32);
        }
    }
    Tensor::from_vec(values, (num_steps, dim), device)
}

// --- Time embedding ---
struct TimeEmbedding {
    table: Embedding,
    projection1: Linear,
    projection2: Linear,
}

impl TimeEmbedding {
    fn new(num_steps: usize, dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        // The table is a plain tensor, not a var: it is never trained or saved.
        let table = Embedding::new(sinusoidal_table(num_steps, dim, vb.device())?, dim);
        let projection1 = candle_nn::linear(dim, hidden, vb.pp("projection1"))?;
        let projection2 = candle_nn::linear(hidden, hidden, vb.pp("projection2"))?;
        Ok(Self {
            table,
            projection1,
            projection2,
        })
    }

    fn forward(&self, t: &Tensor) -> Result<Tensor> {
        let x = self.table.forward(t)?;
        let x = self.projection1.forward(&x)?;
        let x = candle_nn::ops::silu(&x)?;
        self.projection2.forward(&x)
    }
}

// --- Self-attention over spatial positions ---
struct AttnBlock {
    norm: GroupNorm,
    q: Conv2d,
    k: Conv2d,
    v: Conv2d,
    proj: Conv2d,
}

impl AttnBlock {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: group_norm(channels, vb.pp("norm"))?,
            q: conv1x1(channels, channels, vb.pp("q"))?,
            k: conv1x1(channels, channels, vb.pp("k"))?,
            v: conv1x1(channels, channels, vb.pp("v"))?,
            proj: conv1x1(channels, channels, vb.pp("proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        let normed = self.norm.forward(x)?;
        // q, v: [B, HW, C]; k: [B, C, HW]
        let q = self.q.forward(&normed)?.reshape((b, c, h * w))?.transpose(1, 2)?.contiguous()?;
        let k = self.k.forward(&normed)?.reshape((b, c, h * w))?;
        let v = self.v.forward(&normed)?.reshape((b, c, h * w))?.transpose(1, 2)?.contiguous()?;

        let weights = (q.matmul(&k)? * (c as f64).powf(-0.5))?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;
        let attended = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, c, h, w))?;
        x + self.proj.forward(&attended)?
    }
}

// --- Residual block with time conditioning ---
struct ResBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    temb_proj: Linear,
    norm2: GroupNorm,
    conv2: Conv2d,
    shortcut: Option<Conv2d>,
    attn: Option<AttnBlock>,
    dropout_rate: f64,
}

impl ResBlock {
    fn new(
        in_channels: usize,
        out_channels: usize,
        temb_dim: usize,
        dropout_rate: f64,
        with_attn: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let shortcut = if in_channels != out_channels {
            Some(conv1x1(in_channels, out_channels, vb.pp("shortcut"))?)
        } else {
            None
        };
        let attn = if with_attn {
            Some(AttnBlock::new(out_channels, vb.pp("attn"))?)
        } else {
            None
        };
        Ok(Self {
            norm1: group_norm(in_channels, vb.pp("norm1"))?,
            conv1: conv3x3(in_channels, out_channels, 1, vb.pp("conv1"))?,
            temb_proj: candle_nn::linear(temb_dim, out_channels, vb.pp("temb_proj"))?,
            norm2: group_norm(out_channels, vb.pp("norm2"))?,
            conv2: conv3x3(out_channels, out_channels, 1, vb.pp("conv2"))?,
            shortcut,
            attn,
            dropout_rate,
        })
    }

    fn forward(&self, x: &Tensor, temb: &Tensor, train: bool, rng: &mut StdRng) -> Result<Tensor> {
        let h = candle_nn::ops::silu(&self.norm1.forward(x)?)?;
        let h = self.conv1.forward(&h)?;

        let t = self.temb_proj.forward(&candle_nn::ops::silu(temb)?)?;
        let h = h.broadcast_add(&t.unsqueeze(2)?.unsqueeze(3)?)?;

        let h = candle_nn::ops::silu(&self.norm2.forward(&h)?)?;
        let h = dropout(&h, self.dropout_rate, train, rng)?;
        let h = self.conv2.forward(&h)?;

        let skip = match &self.shortcut {
            Some(conv) => conv.forward(x)?,
            None => x.clone(),
        };
        let h = (h + skip)?;
        match &self.attn {
            Some(attn) => attn.forward(&h),
            None => Ok(h),
        }
    }
}

enum Stage {
    Res(ResBlock),
    Down(Conv2d),
    Up(Conv2d),
}

/// DDPM-style UNet predicting the noise in `x_t` given the timestep.
///
/// Each resolution level `i` has `channel * channel_mult[i]` channels. Skip
/// activations from every downward stage are concatenated back in on the way up.
pub struct UNet {
    time_embedding: TimeEmbedding,
    head: Conv2d,
    down: Vec<Stage>,
    middle: Vec<ResBlock>,
    up: Vec<Stage>,
    tail_norm: GroupNorm,
    tail_conv: Conv2d,
    num_steps: usize,
    dropout_rng: Mutex<StdRng>,
}

impl UNet {
    pub fn new(cfg: &ScoreNetConfig, in_channels: usize, vb: VarBuilder) -> Result<Self> {
        let ch = cfg.channel;
        let temb_dim = ch * 4;
        let levels = cfg.channel_mult.len();
        let time_embedding = TimeEmbedding::new(cfg.num_steps, ch, temb_dim, vb.pp("time_embedding"))?;
        let head = conv3x3(in_channels, ch, 1, vb.pp("head"))?;

        let mut skip_channels = vec![ch];
        let mut now_ch = ch;
        let mut down = Vec::new();
        let down_vb = vb.pp("down");
        for (level, &mult) in cfg.channel_mult.iter().enumerate() {
            let out_ch = ch * mult;
            for _ in 0..cfg.num_res_blocks {
                let block = ResBlock::new(
                    now_ch,
                    out_ch,
                    temb_dim,
                    cfg.dropout,
                    cfg.attn.contains(&level),
                    down_vb.pp(down.len()),
                )?;
                down.push(Stage::Res(block));
                now_ch = out_ch;
                skip_channels.push(now_ch);
            }
            if level + 1 != levels {
                down.push(Stage::Down(conv3x3(now_ch, now_ch, 2, down_vb.pp(down.len()))?));
                skip_channels.push(now_ch);
            }
        }

        let middle = vec![
            ResBlock::new(now_ch, now_ch, temb_dim, cfg.dropout, true, vb.pp("middle.0"))?,
            ResBlock::new(now_ch, now_ch, temb_dim, cfg.dropout, false, vb.pp("middle.1"))?,
        ];

        let mut up = Vec::new();
        let up_vb = vb.pp("up");
        for (level, &mult) in cfg.channel_mult.iter().enumerate().rev() {
            let out_ch = ch * mult;
            for _ in 0..=cfg.num_res_blocks {
                let skip = skip_channels.pop().ok_or_else(|| {
                    candle_core::Error::Msg("unet skip connections exhausted".into())
                })?;
                let block = ResBlock::new(
                    skip + now_ch,
                    out_ch,
                    temb_dim,
                    cfg.dropout,
                    cfg.attn.contains(&level),
                    up_vb.pp(up.len()),
                )?;
                up.push(Stage::Res(block));
                now_ch = out_ch;
            }
            if level != 0 {
                up.push(Stage::Up(conv3x3(now_ch, now_ch, 1, up_vb.pp(up.len()))?));
            }
        }
        if !skip_channels.is_empty() {
            candle_core::bail!("unet left {} skip connections unused", skip_channels.len())
        }

        let tail_norm = group_norm(now_ch, vb.pp("tail_norm"))?;
        let tail_conv = conv3x3(now_ch, in_channels, 1, vb.pp("tail_conv"))?;

        Ok(Self {
            time_embedding,
            head,
            down,
            middle,
            up,
            tail_norm,
            tail_conv,
            num_steps: cfg.num_steps,
            dropout_rng: Mutex::new(StdRng::seed_from_u64(0)),
        })
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// Restarts the dropout mask stream from `seed`.
    pub fn reseed_dropout(&self, seed: u64) -> Result<()> {
        let mut rng = self
            .dropout_rng
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("dropout rng unavailable: {}", e)))?;
        *rng = StdRng::seed_from_u64(seed);
        Ok(())
    }
}

impl ScoreNetwork for UNet {
    fn predict_noise(&self, x_t: &Tensor, t: &Tensor, train: bool) -> Result<Tensor> {
        let t = t.to_dtype(DType::U32)?;
        let temb = self.time_embedding.forward(&t)?;
        let mut rng = self
            .dropout_rng
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("dropout rng unavailable: {}", e)))?;

        let mut h = self.head.forward(x_t)?;
        let mut skips = vec![h.clone()];
        for stage in &self.down {
            h = match stage {
                Stage::Res(block) => block.forward(&h, &temb, train, &mut rng)?,
                Stage::Down(conv) => conv.forward(&h)?,
                Stage::Up(_) => candle_core::bail!("upsampling stage in the downward path"),
            };
            skips.push(h.clone());
        }

        for block in &self.middle {
            h = block.forward(&h, &temb, train, &mut rng)?;
        }

        for stage in &self.up {
            h = match stage {
                Stage::Res(block) => {
                    let skip = skips
                        .pop()
                        .ok_or_else(|| candle_core::Error::Msg("unet skip connections exhausted".into()))?;
                    block.forward(&Tensor::cat(&[&h, &skip], 1)?, &temb, train, &mut rng)?
                }
                Stage::Up(conv) => {
                    let (_, _, height, width) = h.dims4()?;
                    conv.forward(&h.upsample_nearest2d(height * 2, width * 2)?)?
                }
                Stage::Down(_) => candle_core::bail!("downsampling stage in the upward path"),
            };
        }

        let h = candle_nn::ops::silu(&self.tail_norm.forward(&h)?)?;
        self.tail_conv.forward(&h)
    }
}
