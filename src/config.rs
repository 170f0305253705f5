use crate::data::DatasetKind;
use crate::diffusion::{check_schedule_bounds, ForwardProcess, ScheduleError};
use crate::models::generator::upsampling_stages;
use anyhow::Context;
use candle_core::{Device, Result, Tensor};
use clap::ValueEnum;
use rand::Rng;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

/// Fixed divisor applied to the summed per-element noise-prediction error.
pub const LOSS_SCALE: f64 = 1000.0;
/// Write real/fake sample grids every N batches.
pub const SAMPLE_INTERVAL_BATCHES: usize = 100;
pub const GRID_NROW: usize = 8;
pub const GRID_PADDING: usize = 2;
/// GroupNorm group count used throughout the score network.
pub const NUM_GROUPS: usize = 32;
pub const TREND_WINDOW: usize = 10;
pub const MAX_RANDOM_SEED: u64 = 10_000;
pub const ADAM_BETA2: f64 = 0.999;

/// Which network has its gradients cleared at the start of every iteration.
///
/// There is no default: the choice changes what the score optimizer sees and
/// has to be made explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradReset {
    /// Clear the score network: each score step sees only this iteration's
    /// real and fake branch gradients.
    Score,
    /// Clear the generator: score gradients are never cleared and keep
    /// accumulating across iterations, including the ones produced while the
    /// generator is updated.
    Generator,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("--zeroGrad is required: choose which network is reset each iteration (score | generator)")]
    MissingGradReset,
    #[error("--imageSize {cli} disagrees with img_size {model} in the model config")]
    ImageSizeMismatch { cli: usize, model: usize },
    #[error("{field} is set on both surfaces with different values: command line {cli}, model config {model}")]
    Conflict {
        field: &'static str,
        cli: String,
        model: String,
    },
    #[error("--{0} must be greater than zero")]
    Zero(&'static str),
    #[error("image size {0} is not a power of two of at least 4; the generator cannot reach it")]
    GeneratorGeometry(usize),
    #[error("score network: {0}")]
    ScoreNetGeometry(String),
    #[error("--lr must be positive and --beta1 must lie in [0, 1), got lr={lr}, beta1={beta1}")]
    Optimizer { lr: f64, beta1: f64 },
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Diffusion and score-network hyperparameters, kept separate from the command
/// line. Field names follow the JSON record the score network was described with;
/// unknown keys are ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreNetConfig {
    #[serde(rename = "T")]
    pub num_steps: usize,
    pub channel: usize,
    pub channel_mult: Vec<usize>,
    pub attn: Vec<usize>,
    pub num_res_blocks: usize,
    pub dropout: f64,
    pub beta_1: f64,
    #[serde(rename = "beta_T")]
    pub beta_t: f64,
    pub img_size: usize,
    /// Optional mirrors of command-line settings; when present they must agree.
    pub epoch: Option<usize>,
    pub batch_size: Option<usize>,
    pub lr: Option<f64>,
}

impl Default for ScoreNetConfig {
    fn default() -> Self {
        Self {
            num_steps: 20,
            channel: 32,
            channel_mult: vec![1, 2, 3, 4],
            attn: vec![2],
            num_res_blocks: 1,
            dropout: 0.15,
            beta_1: 1e-4,
            beta_t: 0.02,
            img_size: 32,
            epoch: None,
            batch_size: None,
            lr: None,
        }
    }
}

impl ScoreNetConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening model config {}", path.display()))?;
        let config = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("parsing model config {}", path.display()))?;
        Ok(config)
    }

    fn validate_geometry(&self) -> std::result::Result<(), ConfigError> {
        let geometry = |msg: String| Err(ConfigError::ScoreNetGeometry(msg));
        if self.channel_mult.is_empty() {
            return geometry("channel_mult must list at least one level".into());
        }
        if self.channel == 0 || self.channel % 2 != 0 {
            return geometry(format!("channel {} must be a positive even number", self.channel));
        }
        // the head output feeds the first ResBlock's GroupNorm and every level's skip
        if self.channel % NUM_GROUPS != 0 {
            return geometry(format!(
                "channel {} is not divisible into {} groups",
                self.channel, NUM_GROUPS
            ));
        }
        if let Some(mult) = self
            .channel_mult
            .iter()
            .find(|&&m| m == 0 || (self.channel * m) % NUM_GROUPS != 0)
        {
            return geometry(format!(
                "channel {} x mult {} is not divisible into {} groups",
                self.channel, mult, NUM_GROUPS
            ));
        }
        if let Some(level) = self.attn.iter().find(|&&a| a >= self.channel_mult.len()) {
            return geometry(format!(
                "attention level {} exceeds the {} resolution levels",
                level,
                self.channel_mult.len()
            ));
        }
        if self.num_res_blocks == 0 {
            return geometry("num_res_blocks must be at least 1".into());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return geometry(format!("dropout {} must lie in [0, 1)", self.dropout));
        }
        let downsample = 1usize << (self.channel_mult.len() - 1);
        if self.img_size == 0 || self.img_size % downsample != 0 {
            return geometry(format!(
                "img_size {} is not divisible by {} ({} downsampling stages)",
                self.img_size,
                downsample,
                self.channel_mult.len() - 1
            ));
        }
        Ok(())
    }
}

/// Run configuration taken from the command line.
#[derive(Clone, Debug, Serialize)]
pub struct TrainConfig {
    pub dataset: DatasetKind,
    pub dataroot: PathBuf,
    pub workers: usize,
    pub batch_size: usize,
    pub image_size: usize,
    pub nz: usize,
    pub ngf: usize,
    pub ndf: usize,
    pub niter: usize,
    pub lr: f64,
    pub beta1: f64,
    pub cuda: bool,
    pub ngpu: usize,
    pub net_g: Option<PathBuf>,
    pub net_s: Option<PathBuf>,
    pub outf: PathBuf,
    pub manual_seed: Option<u64>,
    pub zero_grad: Option<GradReset>,
    pub forward_process: ForwardProcess,
    pub fake_samples: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetKind::Fake,
            dataroot: PathBuf::from("."),
            workers: 2,
            batch_size: 64,
            image_size: 32,
            nz: 100,
            ngf: 64,
            ndf: 64,
            niter: 25,
            lr: 0.0002,
            beta1: 0.5,
            cuda: false,
            ngpu: 1,
            net_g: None,
            net_s: None,
            outf: PathBuf::from("."),
            manual_seed: None,
            zero_grad: None,
            forward_process: ForwardProcess::Additive,
            fake_samples: 1000,
        }
    }
}

impl TrainConfig {
    /// Reconciles the command line with the model config. Any disagreement is an
    /// error rather than a silent preference for one surface.
    pub fn validate(&self, model: &ScoreNetConfig) -> std::result::Result<GradReset, ConfigError> {
        let grad_reset = self.zero_grad.ok_or(ConfigError::MissingGradReset)?;

        for (field, value) in [
            ("batchSize", self.batch_size),
            ("nz", self.nz),
            ("ngf", self.ngf),
            ("ngpu", self.ngpu),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(field));
            }
        }
        if self.dataset == DatasetKind::Fake && self.fake_samples == 0 {
            return Err(ConfigError::Zero("fakeSamples"));
        }
        if !(self.lr > 0.0 && (0.0..1.0).contains(&self.beta1)) {
            return Err(ConfigError::Optimizer { lr: self.lr, beta1: self.beta1 });
        }

        if self.image_size != model.img_size {
            return Err(ConfigError::ImageSizeMismatch {
                cli: self.image_size,
                model: model.img_size,
            });
        }
        if let Some(epoch) = model.epoch.filter(|&e| e != self.niter) {
            return Err(ConfigError::Conflict {
                field: "epochs",
                cli: self.niter.to_string(),
                model: epoch.to_string(),
            });
        }
        if let Some(batch_size) = model.batch_size.filter(|&b| b != self.batch_size) {
            return Err(ConfigError::Conflict {
                field: "batch size",
                cli: self.batch_size.to_string(),
                model: batch_size.to_string(),
            });
        }
        if let Some(lr) = model.lr.filter(|&lr| lr != self.lr) {
            return Err(ConfigError::Conflict {
                field: "learning rate",
                cli: self.lr.to_string(),
                model: lr.to_string(),
            });
        }

        if upsampling_stages(self.image_size).is_none() {
            return Err(ConfigError::GeneratorGeometry(self.image_size));
        }
        model.validate_geometry()?;
        check_schedule_bounds(model.beta_1, model.beta_t, model.num_steps)?;

        if self.ndf != 64 {
            warn!("--ndf {} has no effect: no discriminator is trained", self.ndf);
        }
        Ok(grad_reset)
    }
}

/// Uses the manual seed when given, otherwise draws one from `[1, MAX_RANDOM_SEED]`.
pub fn resolve_seed(manual_seed: Option<u64>) -> u64 {
    let seed = manual_seed.unwrap_or_else(|| rand::thread_rng().gen_range(1..=MAX_RANDOM_SEED));
    info!("Random Seed: {}", seed);
    seed
}

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!("Initialized Rayon thread pool with {} threads", num_threads),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

pub fn get_device(use_cuda: bool) -> Device {
    if use_cuda {
        #[cfg(feature = "cuda")]
        {
            match Device::new_cuda(0) {
                Ok(device) => {
                    info!("Using CUDA device 0");
                    return device;
                }
                Err(e) => {
                    warn!("Failed to initialize CUDA: {}. Falling back to CPU.", e);
                }
            }
        }
        #[cfg(not(feature = "cuda"))]
        {
            warn!("--cuda flag set but binary was compiled without the 'cuda' feature. Falling back to CPU.");
        }
    } else if candle_core::utils::cuda_is_available() {
        warn!("You have a CUDA device, so you should probably run with --cuda");
    }

    #[cfg(feature = "mkl")]
    info!("Using CPU device with Intel MKL BLAS acceleration");

    #[cfg(not(feature = "mkl"))]
    info!("Using CPU device");

    Device::Cpu
}

/// How forward passes are spread over compute devices. Chosen once at startup;
/// the training loop only ever calls [`DevicePlan::forward`].
#[derive(Clone, Debug)]
pub enum DevicePlan {
    Single(Device),
    /// Scatter each batch into `shards` micro-batches and gather the outputs.
    /// Parameters live on `device` only, so the shards run there in turn.
    DataParallel { device: Device, shards: usize },
}

impl DevicePlan {
    pub fn resolve(use_cuda: bool, ngpu: usize) -> Self {
        let device = get_device(use_cuda);
        if device.is_cuda() && ngpu > 1 {
            info!("Splitting each batch into {} shards", ngpu);
            DevicePlan::DataParallel { device, shards: ngpu }
        } else {
            if ngpu > 1 {
                warn!("--ngpu {} ignored: multi-device splitting needs a CUDA device", ngpu);
            }
            DevicePlan::Single(device)
        }
    }

    pub fn device(&self) -> &Device {
        match self {
            DevicePlan::Single(device) => device,
            DevicePlan::DataParallel { device, .. } => device,
        }
    }

    /// Runs `f` over the batch. Every input must share the same leading batch
    /// dimension; outputs are concatenated along it.
    pub fn forward<F>(&self, inputs: &[&Tensor], f: F) -> Result<Tensor>
    where
        F: Fn(&[Tensor]) -> Result<Tensor>,
    {
        match self {
            DevicePlan::Single(_) => {
                let inputs: Vec<Tensor> = inputs.iter().map(|&t| t.clone()).collect();
                f(&inputs)
            }
            DevicePlan::DataParallel { shards, .. } => {
                let chunked = inputs
                    .iter()
                    .map(|t| t.chunk(*shards, 0))
                    .collect::<Result<Vec<_>>>()?;
                let num_chunks = chunked.first().map(Vec::len).unwrap_or(0);
                if num_chunks == 0 || chunked.iter().any(|c| c.len() != num_chunks) {
                    candle_core::bail!("data-parallel forward needs inputs with a shared batch dimension")
                }
                let outputs = (0..num_chunks)
                    .map(|i| {
                        let shard: Vec<Tensor> = chunked.iter().map(|c| c[i].clone()).collect();
                        f(&shard)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Tensor::cat(&outputs, 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn valid_config() -> TrainConfig {
        TrainConfig {
            zero_grad: Some(GradReset::Score),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        let grad_reset = valid_config().validate(&ScoreNetConfig::default()).unwrap();
        assert_eq!(grad_reset, GradReset::Score);
    }

    #[test]
    fn test_missing_grad_reset_is_rejected() {
        let config = TrainConfig::default();
        assert!(matches!(
            config.validate(&ScoreNetConfig::default()),
            Err(ConfigError::MissingGradReset)
        ));
    }

    #[test]
    fn test_dual_surface_conflicts_are_rejected() {
        let config = valid_config();

        let model = ScoreNetConfig { img_size: 64, ..Default::default() };
        assert!(matches!(
            config.validate(&model),
            Err(ConfigError::ImageSizeMismatch { cli: 32, model: 64 })
        ));

        let model = ScoreNetConfig { batch_size: Some(80), ..Default::default() };
        assert!(matches!(config.validate(&model), Err(ConfigError::Conflict { field: "batch size", .. })));

        let model = ScoreNetConfig { lr: Some(1e-4), ..Default::default() };
        assert!(matches!(config.validate(&model), Err(ConfigError::Conflict { field: "learning rate", .. })));

        let model = ScoreNetConfig { epoch: Some(200), ..Default::default() };
        assert!(matches!(config.validate(&model), Err(ConfigError::Conflict { field: "epochs", .. })));

        let model = ScoreNetConfig {
            epoch: Some(config.niter),
            batch_size: Some(config.batch_size),
            lr: Some(config.lr),
            ..Default::default()
        };
        assert!(config.validate(&model).is_ok());
    }

    #[test]
    fn test_geometry_errors() {
        let config = TrainConfig { image_size: 24, ..valid_config() };
        let model = ScoreNetConfig { img_size: 24, ..Default::default() };
        assert!(matches!(config.validate(&model), Err(ConfigError::GeneratorGeometry(24))));

        let config = valid_config();
        let model = ScoreNetConfig { attn: vec![4], ..Default::default() };
        assert!(matches!(config.validate(&model), Err(ConfigError::ScoreNetGeometry(_))));

        let model = ScoreNetConfig { channel: 16, ..Default::default() };
        assert!(matches!(config.validate(&model), Err(ConfigError::ScoreNetGeometry(_))));

        // every level is divisible by 32, but the 16-channel head output is not
        let model = ScoreNetConfig {
            channel: 16,
            channel_mult: vec![2, 4],
            attn: vec![1],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(&model),
            Err(ConfigError::ScoreNetGeometry(ref msg)) if msg.contains("channel 16 is not divisible")
        ));

        let model = ScoreNetConfig { beta_1: 0.5, beta_t: 0.1, ..Default::default() };
        assert!(matches!(config.validate(&model), Err(ConfigError::Schedule(_))));

        let config = TrainConfig { batch_size: 0, ..valid_config() };
        assert!(matches!(config.validate(&ScoreNetConfig::default()), Err(ConfigError::Zero("batchSize"))));
    }

    #[test]
    fn test_model_config_json_ignores_unknown_keys() {
        let json = r#"{
            "state": "train",
            "T": 50,
            "channel": 64,
            "channel_mult": [1, 2],
            "attn": [1],
            "beta_T": 0.03,
            "device": "cuda:0"
        }"#;
        let config: ScoreNetConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.num_steps, 50);
        assert_eq!(config.channel, 64);
        assert_eq!(config.channel_mult, vec![1, 2]);
        assert_eq!(config.beta_t, 0.03);
        assert_eq!(config.beta_1, 1e-4);
        assert_eq!(config.img_size, 32);
        assert_eq!(config.epoch, None);
    }

    #[test]
    fn test_resolve_seed() {
        assert_eq!(resolve_seed(Some(13)), 13);
        let drawn = resolve_seed(None);
        assert!((1..=MAX_RANDOM_SEED).contains(&drawn));
    }

    #[test]
    fn test_data_parallel_forward_matches_single() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::arange(0f32, 24., &device)?.reshape((6, 4))?;
        let t = Tensor::arange(0u32, 6, &device)?;
        let f = |s: &[Tensor]| -> Result<Tensor> {
            let scale = s[1].to_dtype(DType::F32)?.unsqueeze(1)?;
            s[0].broadcast_mul(&scale)
        };

        let single = DevicePlan::Single(device.clone()).forward(&[&x, &t], f)?;
        let split = DevicePlan::DataParallel { device, shards: 4 }.forward(&[&x, &t], f)?;
        assert_eq!(single.dims(), &[6, 4]);
        assert_eq!(single.to_vec2::<f32>()?, split.to_vec2::<f32>()?);
        Ok(())
    }
}
