mod config;
mod data;
mod diffusion;
mod model_artifacts;
mod models;
mod noise;
mod train;

use clap::Parser;
use config::{GradReset, ScoreNetConfig, TrainConfig};
use data::DatasetKind;
use diffusion::ForwardProcess;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Score-GAN: a DCGAN generator trained through a diffusion score network",
    after_help = "EXAMPLES:
    # Train on CIFAR-10, resetting score gradients every iteration
    cargo run --release -- --dataset cifar10 --dataroot ./data --zeroGrad score

    # Smoke test on random images
    cargo run --release -- --dataset fake --dataroot . --niter 1 --zeroGrad score

    # Resume both networks on the GPU
    cargo run --release --features cuda -- --dataset folder --dataroot ./faces --cuda \\
        --netG out/netG_epoch_24.safetensors --netS out/netS_epoch_24.safetensors --zeroGrad score"
)]
struct Args {
    /// Dataset source
    #[arg(long, value_enum)]
    dataset: DatasetKind,

    /// Path to the dataset
    #[arg(long)]
    dataroot: PathBuf,

    /// Number of image decoding threads
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Input batch size
    #[arg(long = "batchSize", default_value_t = 64)]
    batch_size: usize,

    /// Height and width of the images; must equal img_size in the model config
    #[arg(long = "imageSize", default_value_t = 32)]
    image_size: usize,

    /// Size of the latent z vector
    #[arg(long, default_value_t = 100)]
    nz: usize,

    #[arg(long, default_value_t = 64)]
    ngf: usize,

    /// Accepted for compatibility; no discriminator is trained
    #[arg(long, default_value_t = 64)]
    ndf: usize,

    /// Number of epochs to train for
    #[arg(long, default_value_t = 25)]
    niter: usize,

    /// Learning rate for both optimizers
    #[arg(long, default_value_t = 0.0002)]
    lr: f64,

    /// beta1 for Adam
    #[arg(long, default_value_t = 0.5)]
    beta1: f64,

    /// Use CUDA GPU acceleration (requires --features cuda at compile time)
    #[arg(long)]
    cuda: bool,

    /// Number of micro-batches each batch is split into on the GPU
    #[arg(long, default_value_t = 1)]
    ngpu: usize,

    /// Generator checkpoint to continue training from
    #[arg(long = "netG")]
    net_g: Option<PathBuf>,

    /// Score network checkpoint to continue training from
    #[arg(long = "netS")]
    net_s: Option<PathBuf>,

    /// Folder for sample images, checkpoints and logs
    #[arg(long, default_value = ".")]
    outf: PathBuf,

    #[arg(long = "manualSeed")]
    manual_seed: Option<u64>,

    /// JSON file with the score network and noise schedule settings
    #[arg(long = "modelConfig")]
    model_config: Option<PathBuf>,

    /// Which network's gradients are cleared at the start of every iteration
    #[arg(long = "zeroGrad", value_enum)]
    zero_grad: Option<GradReset>,

    /// How clean images are mixed with noise
    #[arg(long = "forwardProcess", value_enum, default_value_t = ForwardProcess::Additive)]
    forward_process: ForwardProcess,

    /// Number of images in the fake dataset
    #[arg(long = "fakeSamples", default_value_t = 1000)]
    fake_samples: usize,
}

impl From<Args> for TrainConfig {
    fn from(args: Args) -> Self {
        Self {
            dataset: args.dataset,
            dataroot: args.dataroot,
            workers: args.workers,
            batch_size: args.batch_size,
            image_size: args.image_size,
            nz: args.nz,
            ngf: args.ngf,
            ndf: args.ndf,
            niter: args.niter,
            lr: args.lr,
            beta1: args.beta1,
            cuda: args.cuda,
            ngpu: args.ngpu,
            net_g: args.net_g,
            net_s: args.net_s,
            outf: args.outf,
            manual_seed: args.manual_seed,
            zero_grad: args.zero_grad,
            forward_process: args.forward_process,
            fake_samples: args.fake_samples,
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let model_config = match &args.model_config {
        Some(path) => {
            info!("Loading model config from {}", path.display());
            ScoreNetConfig::load(path)?
        }
        None => ScoreNetConfig::default(),
    };
    info!("{:?}", model_config);

    let config = TrainConfig::from(args);
    let summary = train::train(&config, &model_config)?;
    info!(
        "Finished {} epochs ({} iterations) with seed {}",
        summary.epochs_completed, summary.iterations, summary.seed
    );
    if let Some(last) = summary.last {
        info!("Final Loss_D: {:.4} Loss_G: {:.4}", last.loss_d, last.loss_g);
    }
    if let Some(path) = summary.summary_log {
        info!("Run summary: {}", path.display());
    }
    Ok(())
}

fn main() -> ExitCode {
    config::init_cpu_parallelism();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("score_gan=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    let args = Args::parse();

    if args.cuda && !cfg!(feature = "cuda") {
        error!(
            "--cuda was requested, but this binary was compiled without CUDA support. Re-run with: cargo run --release --features cuda -- --cuda ..."
        );
        return ExitCode::FAILURE;
    }

    match run(args) {
        Ok(()) => {
            info!("Training completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Training failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
