use crate::config::{
    resolve_seed, DevicePlan, GradReset, ScoreNetConfig, TrainConfig, ADAM_BETA2, GRID_NROW, GRID_PADDING,
    LOSS_SCALE, SAMPLE_INTERVAL_BATCHES, TREND_WINDOW,
};
use crate::data::{ImageDataset, IMAGE_CHANNELS};
use crate::diffusion::NoiseSchedule;
use crate::model_artifacts::{checkpoint_path, resume_from_checkpoint, save_checkpoint, save_image_grid};
use crate::models::generator::Generator;
use crate::models::unet::UNet;
use crate::models::ScoreNetwork;
use crate::noise::NoiseSampler;
use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{DType, Module, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use chrono::Utc;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Serialize)]
struct EpochLogEntry {
    epoch: usize,
    loss_d: f64,
    loss_g: f64,
    d_x: f64,
    d_g_z1: f64,
    d_g_z2: f64,
}

#[derive(Serialize)]
struct TrainingRunLog {
    run_type: String,
    started_at: String,
    finished_at: String,
    use_cuda: bool,
    seed: u64,
    config: TrainConfig,
    model_config: ScoreNetConfig,
    grad_reset: GradReset,
    epochs_requested: usize,
    epochs_completed: usize,
    iterations: usize,
    epoch_metrics: Vec<EpochLogEntry>,
}

#[derive(Serialize)]
struct RealtimeLogEvent {
    event: String,
    timestamp: String,
    epoch: Option<usize>,
    loss_d: Option<f64>,
    loss_g: Option<f64>,
    message: Option<String>,
}

impl RealtimeLogEvent {
    fn new(event: &str) -> Self {
        Self {
            event: event.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            epoch: None,
            loss_d: None,
            loss_g: None,
            message: None,
        }
    }
}

fn create_realtime_log_file(outf: &Path) -> Result<PathBuf> {
    let file_name = format!(
        "training_live_{}_{}.jsonl",
        Utc::now().format("%Y%m%d_%H%M%S"),
        std::process::id()
    );
    let file_path = outf.join(file_name);
    std::fs::File::create(&file_path)?;
    Ok(file_path)
}

fn append_realtime_event(log_path: &Path, event: &RealtimeLogEvent) -> Result<()> {
    let mut f = std::fs::OpenOptions::new().append(true).open(log_path)?;
    let line = serde_json::to_string(event)?;
    writeln!(f, "{}", line)?;
    Ok(())
}

/// Average and per-epoch slope of both losses over the last `window` epochs.
fn compute_window_trend(epoch_metrics: &[EpochLogEntry], window: usize) -> Option<(f64, f64, f64, f64)> {
    if epoch_metrics.len() < window || window < 2 {
        return None;
    }
    let slice = &epoch_metrics[epoch_metrics.len() - window..];
    let d_avg = slice.iter().map(|e| e.loss_d).sum::<f64>() / window as f64;
    let g_avg = slice.iter().map(|e| e.loss_g).sum::<f64>() / window as f64;
    let d_slope = (slice[window - 1].loss_d - slice[0].loss_d) / (window as f64 - 1.0);
    let g_slope = (slice[window - 1].loss_g - slice[0].loss_g) / (window as f64 - 1.0);
    Some((d_avg, g_avg, d_slope, g_slope))
}

fn persist_training_log(outf: &Path, run_log: &TrainingRunLog) -> Result<PathBuf> {
    let file_name = format!(
        "training_{}_{}.json",
        Utc::now().format("%Y%m%d_%H%M%S"),
        std::process::id()
    );
    let file_path = outf.join(file_name);

    let file = std::fs::File::create(&file_path)?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(writer, run_log)?;

    Ok(file_path)
}

fn parameter_count(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

/// Score-network gradients that survive from one iteration to the next.
/// Stored as vars so the accumulated values hold no autograd graph.
struct CarriedGradients {
    vars: Vec<Var>,
    carried: Vec<Option<Var>>,
}

impl CarriedGradients {
    fn new(vars: Vec<Var>) -> Self {
        let carried = vec![None; vars.len()];
        Self { vars, carried }
    }

    /// Adds the gradients `grads` holds for the tracked vars.
    fn accumulate(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        for (var, slot) in self.vars.iter().zip(self.carried.iter_mut()) {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            match slot {
                Some(total) => total.set(&(total.as_tensor() + grad)?)?,
                None => *slot = Some(Var::from_tensor(grad)?),
            }
        }
        Ok(())
    }

    /// Overwrites the tracked vars' entries in `grads` with the running totals.
    fn apply(&self, grads: &mut GradStore) {
        for (var, slot) in self.vars.iter().zip(&self.carried) {
            if let Some(total) = slot {
                grads.insert(var.as_tensor(), total.as_tensor().clone());
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct IterationStats {
    pub loss_d: f64,
    pub loss_g: f64,
    pub d_x: f64,
    pub d_g_z1: f64,
    pub d_g_z2: f64,
}

impl IterationStats {
    fn is_finite(&self) -> bool {
        [self.loss_d, self.loss_g, self.d_x, self.d_g_z1, self.d_g_z2]
            .iter()
            .all(|v| v.is_finite())
    }
}

#[derive(Debug)]
pub struct TrainingSummary {
    pub seed: u64,
    pub epochs_completed: usize,
    pub iterations: usize,
    pub last: Option<IterationStats>,
    pub summary_log: Option<PathBuf>,
}

/// Generator and score network trained against each other through the
/// noise-prediction loss, each with its own Adam optimizer.
pub struct HybridTrainer {
    schedule: NoiseSchedule,
    plan: DevicePlan,
    generator: Generator,
    generator_vars: VarMap,
    score_net: UNet,
    score_vars: VarMap,
    opt_g: AdamW,
    opt_s: AdamW,
    sampler: NoiseSampler,
    fixed_latents: Tensor,
    carried: CarriedGradients,
    grad_reset: GradReset,
    outf: PathBuf,
}

impl HybridTrainer {
    pub fn new(
        config: &TrainConfig,
        model_config: &ScoreNetConfig,
        grad_reset: GradReset,
        plan: DevicePlan,
        seed: u64,
    ) -> Result<Self> {
        let device = plan.device().clone();
        let schedule = NoiseSchedule::new(
            model_config.beta_1,
            model_config.beta_t,
            model_config.num_steps,
            config.forward_process,
            &device,
        )?;
        info!(
            "Noise schedule: T={}, beta {} -> {}, {:?} forward process",
            schedule.num_steps,
            model_config.beta_1,
            model_config.beta_t,
            schedule.forward_process()
        );

        let mut generator_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&generator_vars, DType::F32, &device);
        let generator = Generator::new(config.nz, config.ngf, IMAGE_CHANNELS, config.image_size, vb)?;
        if let Some(path) = &config.net_g {
            resume_from_checkpoint(&mut generator_vars, path)?;
        }
        info!("Generator: {} parameters", parameter_count(&generator_vars));

        let mut score_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&score_vars, DType::F32, &device);
        let score_net = UNet::new(model_config, IMAGE_CHANNELS, vb)?;
        score_net.reseed_dropout(seed)?;
        if let Some(path) = &config.net_s {
            resume_from_checkpoint(&mut score_vars, path)?;
        }
        info!(
            "Score network: {} parameters, {} timesteps",
            parameter_count(&score_vars),
            score_net.num_steps()
        );

        let params = ParamsAdamW {
            lr: config.lr,
            beta1: config.beta1,
            beta2: ADAM_BETA2,
            eps: 1e-8,
            weight_decay: 0.0,
        };
        let opt_g = AdamW::new(generator_vars.all_vars(), params.clone())?;
        let opt_s = AdamW::new(score_vars.all_vars(), params)?;

        let mut sampler = NoiseSampler::new(seed, &device);
        let fixed_latents = sampler.latents(config.batch_size, config.nz)?;
        let carried = CarriedGradients::new(score_vars.all_vars());

        Ok(Self {
            schedule,
            plan,
            generator,
            generator_vars,
            score_net,
            score_vars,
            opt_g,
            opt_s,
            sampler,
            fixed_latents,
            carried,
            grad_reset,
            outf: config.outf.clone(),
        })
    }

    fn generate(&self, z: &Tensor) -> candle_core::Result<Tensor> {
        self.plan.forward(&[z], |s| self.generator.forward(&s[0]))
    }

    /// Diffuses `x_0` with `noise` at `t` and scores the prediction against
    /// `target`. Returns the scaled summed loss and the mean squared error.
    fn noise_loss(
        &self,
        x_0: &Tensor,
        t: &Tensor,
        noise: &Tensor,
        target: &Tensor,
    ) -> candle_core::Result<(Tensor, f64)> {
        let x_t = self.schedule.diffuse(x_0, t, noise)?;
        let predicted = self
            .plan
            .forward(&[&x_t, t], |s| self.score_net.predict_noise(&s[0], &s[1], true))?;
        let mse = (predicted - target)?.sqr()?;
        let mean = mse.mean_all()?.to_scalar::<f32>()? as f64;
        let loss = (mse.sum_all()? / LOSS_SCALE)?;
        Ok((loss, mean))
    }

    /// One score-network update on a real batch and an equally sized generated one.
    /// Returns `(errD, D(x), D(G(z))_1)`.
    pub fn score_step(&mut self, real: &Tensor) -> Result<(f64, f64, f64)> {
        let batch = real.dim(0)?;
        let steps = self.schedule.num_steps;

        let t = self.sampler.timesteps(batch, steps)?;
        let noise = self.sampler.randn_like(real)?;
        let (err_real, d_x) = self.noise_loss(real, &t, &noise, &noise)?;

        let z = self.sampler.latents(batch, self.generator.latent_dim())?;
        let fake = self.generate(&z)?;
        let t = self.sampler.timesteps(batch, steps)?;
        let noise = self.sampler.randn_like(&fake)?;
        // The fake branch is scored against an independent draw, not the noise
        // that was mixed in.
        let target = self.sampler.randn_like(&fake)?;
        let (err_fake, d_g_z1) = self.noise_loss(&fake, &t, &noise, &target)?;

        let err_d = (err_real + err_fake)?;
        let mut grads = err_d.backward()?;
        if self.grad_reset == GradReset::Generator {
            self.carried.accumulate(&grads)?;
            self.carried.apply(&mut grads);
        }
        self.opt_s.step(&grads)?;

        Ok((err_d.to_scalar::<f32>()? as f64, d_x, d_g_z1))
    }

    /// One generator update through the current score network. Only generator
    /// parameters are stepped. Returns `(errG, D(G(z))_2)`.
    pub fn generator_step(&mut self, batch: usize) -> Result<(f64, f64)> {
        let z = self.sampler.latents(batch, self.generator.latent_dim())?;
        let fake = self.generate(&z)?;
        let t = self.sampler.timesteps(batch, self.schedule.num_steps)?;
        let noise = self.sampler.randn_like(&fake)?;
        let (err_g, d_g_z2) = self.noise_loss(&fake, &t, &noise, &noise)?;

        let grads = err_g.backward()?;
        self.opt_g.step(&grads)?;
        if self.grad_reset == GradReset::Generator {
            self.carried.accumulate(&grads)?;
        }

        Ok((err_g.to_scalar::<f32>()? as f64, d_g_z2))
    }

    pub fn train_iteration(&mut self, real: &Tensor) -> Result<IterationStats> {
        let (loss_d, d_x, d_g_z1) = self.score_step(real)?;
        let (loss_g, d_g_z2) = self.generator_step(real.dim(0)?)?;
        Ok(IterationStats {
            loss_d,
            loss_g,
            d_x,
            d_g_z1,
            d_g_z2,
        })
    }

    /// Writes the real batch and the generator's output for the fixed latents.
    pub fn save_samples(&self, real: &Tensor, epoch: usize) -> Result<()> {
        save_image_grid(real, &self.outf.join("real_samples.png"), GRID_NROW, GRID_PADDING)?;
        let fake = self.generate(&self.fixed_latents)?;
        let path = self.outf.join(format!("fake_samples_epoch_{:03}.png", epoch));
        save_image_grid(&fake, &path, GRID_NROW, GRID_PADDING)
    }

    pub fn checkpoint(&self, epoch: usize) -> Result<()> {
        save_checkpoint(&self.generator_vars, &checkpoint_path(&self.outf, "netG", epoch))?;
        save_checkpoint(&self.score_vars, &checkpoint_path(&self.outf, "netS", epoch))
    }
}

/// Runs the full training schedule described by `config`.
pub fn train(config: &TrainConfig, model_config: &ScoreNetConfig) -> Result<TrainingSummary> {
    let grad_reset = config.validate(model_config)?;
    std::fs::create_dir_all(&config.outf)?;
    info!("{:?}", config);

    let seed = resolve_seed(config.manual_seed);
    let plan = DevicePlan::resolve(config.cuda, config.ngpu);
    let device = plan.device().clone();
    let dataset = ImageDataset::load(config, seed)?;
    if dataset.is_empty() {
        anyhow::bail!("dataset is empty");
    }

    let mut trainer = HybridTrainer::new(config, model_config, grad_reset, plan, seed)?;
    info!("Gradient reset each iteration: {:?}", grad_reset);

    let started_at = Utc::now();
    let live_log_path = match create_realtime_log_file(&config.outf) {
        Ok(path) => {
            info!("Realtime training log: {}", path.display());
            Some(path)
        }
        Err(e) => {
            warn!("Failed to create realtime training log: {}", e);
            None
        }
    };
    if let Some(path) = &live_log_path {
        let mut start_event = RealtimeLogEvent::new("start");
        start_event.message = Some(format!(
            "seed={},images={},grad_reset={:?}",
            seed,
            dataset.len(),
            grad_reset
        ));
        let _ = append_realtime_event(path, &start_event);
    }

    let mut epoch_metrics = Vec::with_capacity(config.niter);
    let mut iterations = 0;
    let mut last = None;

    for epoch in 0..config.niter {
        let epoch_start = Instant::now();
        let batches = dataset.shuffled_batches(config.batch_size, trainer.sampler.rng_mut());
        let num_batches = batches.len();
        let mut totals = IterationStats::default();

        for (i, indices) in batches.iter().enumerate() {
            let real = dataset.batch(indices, &device)?;
            let stats = trainer.train_iteration(&real)?;
            if !stats.is_finite() {
                warn!("Non-finite loss at [{}/{}][{}/{}]", epoch, config.niter, i, num_batches);
            }
            info!(
                "[{}/{}][{}/{}] Loss_D: {:.4} Loss_G: {:.4} D(x): {:.4} D(G(z)): {:.4} / {:.4}",
                epoch,
                config.niter,
                i,
                num_batches,
                stats.loss_d,
                stats.loss_g,
                stats.d_x,
                stats.d_g_z1,
                stats.d_g_z2
            );

            if i % SAMPLE_INTERVAL_BATCHES == 0 {
                trainer.save_samples(&real, epoch)?;
            }

            totals.loss_d += stats.loss_d;
            totals.loss_g += stats.loss_g;
            totals.d_x += stats.d_x;
            totals.d_g_z1 += stats.d_g_z1;
            totals.d_g_z2 += stats.d_g_z2;
            iterations += 1;
            last = Some(stats);
        }

        trainer.checkpoint(epoch)?;

        let n = num_batches.max(1) as f64;
        let entry = EpochLogEntry {
            epoch,
            loss_d: totals.loss_d / n,
            loss_g: totals.loss_g / n,
            d_x: totals.d_x / n,
            d_g_z1: totals.d_g_z1 / n,
            d_g_z2: totals.d_g_z2 / n,
        };
        info!(
            "Epoch {}/{} done in {:.1}s: avg Loss_D {:.4}, avg Loss_G {:.4}",
            epoch,
            config.niter,
            epoch_start.elapsed().as_secs_f64(),
            entry.loss_d,
            entry.loss_g
        );
        if let Some(path) = &live_log_path {
            let mut epoch_event = RealtimeLogEvent::new("epoch");
            epoch_event.epoch = Some(epoch);
            epoch_event.loss_d = Some(entry.loss_d);
            epoch_event.loss_g = Some(entry.loss_g);
            if let Err(e) = append_realtime_event(path, &epoch_event) {
                warn!("Failed to append realtime log: {}", e);
            }
        }
        epoch_metrics.push(entry);

        if (epoch + 1) % TREND_WINDOW == 0 {
            if let Some((d_avg, g_avg, d_slope, g_slope)) = compute_window_trend(&epoch_metrics, TREND_WINDOW) {
                info!(
                    "Trend@{} (last {}): loss_d_avg={:.6}, loss_g_avg={:.6}, loss_d_slope={:+.6}/epoch, loss_g_slope={:+.6}/epoch",
                    epoch + 1,
                    TREND_WINDOW,
                    d_avg,
                    g_avg,
                    d_slope,
                    g_slope
                );
                if let Some(path) = &live_log_path {
                    let mut trend_event = RealtimeLogEvent::new("trend");
                    trend_event.epoch = Some(epoch);
                    trend_event.loss_d = Some(d_avg);
                    trend_event.loss_g = Some(g_avg);
                    trend_event.message = Some(format!(
                        "window={},loss_d_slope={:+.6},loss_g_slope={:+.6}",
                        TREND_WINDOW, d_slope, g_slope
                    ));
                    let _ = append_realtime_event(path, &trend_event);
                }
            }
        }
    }

    info!("Training complete: {} epochs, {} iterations", epoch_metrics.len(), iterations);
    if let Some(path) = &live_log_path {
        let mut end_event = RealtimeLogEvent::new("end");
        end_event.epoch = Some(epoch_metrics.len());
        end_event.loss_d = epoch_metrics.last().map(|e| e.loss_d);
        end_event.loss_g = epoch_metrics.last().map(|e| e.loss_g);
        end_event.message = Some("finished".to_string());
        let _ = append_realtime_event(path, &end_event);
    }

    let epochs_completed = epoch_metrics.len();
    let run_log = TrainingRunLog {
        run_type: "hybrid".to_string(),
        started_at: started_at.to_rfc3339(),
        finished_at: Utc::now().to_rfc3339(),
        use_cuda: device.is_cuda(),
        seed,
        config: config.clone(),
        model_config: model_config.clone(),
        grad_reset,
        epochs_requested: config.niter,
        epochs_completed,
        iterations,
        epoch_metrics,
    };
    let summary_log = match persist_training_log(&config.outf, &run_log) {
        Ok(path) => {
            info!("Training JSON log saved: {}", path.display());
            Some(path)
        }
        Err(e) => {
            warn!("Failed to save training JSON log: {}", e);
            None
        }
    };

    Ok(TrainingSummary {
        seed,
        epochs_completed,
        iterations,
        last,
        summary_log,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DatasetKind;
    use candle_core::Device;

    fn tiny_config(outf: &Path, grad_reset: GradReset) -> TrainConfig {
        TrainConfig {
            dataset: DatasetKind::Fake,
            fake_samples: 32,
            batch_size: 8,
            image_size: 8,
            nz: 16,
            ngf: 8,
            niter: 1,
            outf: outf.to_path_buf(),
            manual_seed: Some(1),
            zero_grad: Some(grad_reset),
            ..Default::default()
        }
    }

    fn tiny_model() -> ScoreNetConfig {
        ScoreNetConfig {
            num_steps: 20,
            channel: 32,
            channel_mult: vec![1, 2],
            attn: vec![1],
            img_size: 8,
            ..Default::default()
        }
    }

    fn files_with_prefix(dir: &Path, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.sort();
        names
    }

    fn snapshot(varmap: &VarMap) -> Vec<(String, Vec<f32>)> {
        let data = varmap.data().lock().unwrap();
        let mut values: Vec<(String, Vec<f32>)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()))
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        values
    }

    #[test]
    fn test_end_to_end_single_epoch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let summary = train(&tiny_config(dir.path(), GradReset::Score), &tiny_model())?;

        assert_eq!(summary.seed, 1);
        assert_eq!(summary.epochs_completed, 1);
        assert_eq!(summary.iterations, 4);
        assert!(summary.last.is_some_and(|s| s.is_finite()));

        assert_eq!(files_with_prefix(dir.path(), "netG_epoch_"), vec!["netG_epoch_0.safetensors"]);
        assert_eq!(files_with_prefix(dir.path(), "netS_epoch_"), vec!["netS_epoch_0.safetensors"]);
        assert_eq!(files_with_prefix(dir.path(), "real_samples"), vec!["real_samples.png"]);
        assert_eq!(
            files_with_prefix(dir.path(), "fake_samples_epoch_"),
            vec!["fake_samples_epoch_000.png"]
        );
        assert_eq!(files_with_prefix(dir.path(), "training_live_").len(), 1);

        let log_path = summary.summary_log.expect("summary log written");
        let log: serde_json::Value = serde_json::from_reader(std::fs::File::open(log_path)?)?;
        assert_eq!(log["epochs_completed"], 1);
        assert_eq!(log["grad_reset"], "score");
        Ok(())
    }

    #[test]
    fn test_accumulating_score_gradients_trains() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = TrainConfig {
            niter: 2,
            ..tiny_config(dir.path(), GradReset::Generator)
        };
        let summary = train(&config, &tiny_model())?;
        assert_eq!(summary.iterations, 8);
        assert!(summary.last.is_some_and(|s| s.is_finite()));
        assert_eq!(files_with_prefix(dir.path(), "netS_epoch_").len(), 2);
        Ok(())
    }

    #[test]
    fn test_resume_from_previous_run() -> Result<()> {
        let first = tempfile::tempdir()?;
        train(&tiny_config(first.path(), GradReset::Score), &tiny_model())?;

        let second = tempfile::tempdir()?;
        let config = TrainConfig {
            net_g: Some(first.path().join("netG_epoch_0.safetensors")),
            net_s: Some(first.path().join("netS_epoch_0.safetensors")),
            ..tiny_config(second.path(), GradReset::Score)
        };
        let summary = train(&config, &tiny_model())?;
        assert_eq!(summary.epochs_completed, 1);

        // A generator checkpoint cannot stand in for the score network.
        let third = tempfile::tempdir()?;
        let config = TrainConfig {
            net_s: Some(first.path().join("netG_epoch_0.safetensors")),
            ..tiny_config(third.path(), GradReset::Score)
        };
        assert!(train(&config, &tiny_model()).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_grad_reset_fails_before_training() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainConfig {
            zero_grad: None,
            ..tiny_config(dir.path(), GradReset::Score)
        };
        assert!(train(&config, &tiny_model()).is_err());
        assert!(files_with_prefix(dir.path(), "netG_epoch_").is_empty());
    }

    #[test]
    fn test_each_step_only_moves_its_own_network() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = tiny_config(dir.path(), GradReset::Score);
        let plan = DevicePlan::Single(Device::Cpu);
        let mut trainer = HybridTrainer::new(&config, &tiny_model(), GradReset::Score, plan, 3)?;
        let real = ImageDataset::fake(8, 8, 0).batch(&(0..8).collect::<Vec<_>>(), &Device::Cpu)?;

        let g_before = snapshot(&trainer.generator_vars);
        let s_before = snapshot(&trainer.score_vars);
        trainer.score_step(&real)?;
        assert_eq!(snapshot(&trainer.generator_vars), g_before);
        assert_ne!(snapshot(&trainer.score_vars), s_before);

        let s_before = snapshot(&trainer.score_vars);
        trainer.generator_step(8)?;
        assert_eq!(snapshot(&trainer.score_vars), s_before);
        assert_ne!(snapshot(&trainer.generator_vars), g_before);
        Ok(())
    }

    #[test]
    fn test_score_loss_scales_summed_error_against_fresh_target() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = tiny_config(dir.path(), GradReset::Score);
        let model = ScoreNetConfig { dropout: 0.0, ..tiny_model() };
        let plan = DevicePlan::Single(Device::Cpu);
        let mut trainer = HybridTrainer::new(&config, &model, GradReset::Score, plan, 5)?;
        let real = ImageDataset::fake(8, 8, 0).batch(&(0..8).collect::<Vec<_>>(), &Device::Cpu)?;

        let summed_error = |x_0: &Tensor, t: &Tensor, noise: &Tensor, target: &Tensor| -> Result<(f64, f64)> {
            let x_t = trainer.schedule.diffuse(x_0, t, noise)?;
            let predicted = trainer.score_net.predict_noise(&x_t, t, false)?;
            let mse = (predicted - target)?.sqr()?.flatten_all()?.to_vec1::<f32>()?;
            let sum = mse.iter().map(|&v| v as f64).sum::<f64>();
            Ok((sum / 1000.0, sum / mse.len() as f64))
        };

        // replay the draws score_step makes, in the same order
        let mut replay = trainer.sampler.clone();
        let t = replay.timesteps(8, 20)?;
        let noise = replay.randn_like(&real)?;
        let (real_loss, real_mean) = summed_error(&real, &t, &noise, &noise)?;
        let z = replay.latents(8, config.nz)?;
        let fake = trainer.generator.forward(&z)?;
        let t = replay.timesteps(8, 20)?;
        let noise = replay.randn_like(&fake)?;
        let target = replay.randn_like(&fake)?;
        let (fake_loss, fake_mean) = summed_error(&fake, &t, &noise, &target)?;
        let (same_target_loss, _) = summed_error(&fake, &t, &noise, &noise)?;

        let close = |a: f64, b: f64| (a - b).abs() <= 1e-4 * b.abs().max(1.0);
        let (loss, mean) = trainer.noise_loss(&fake, &t, &noise, &target)?;
        assert!(close(loss.to_scalar::<f32>()? as f64, fake_loss));
        assert!(close(mean, fake_mean));

        let (err_d, d_x, d_g_z1) = trainer.score_step(&real)?;
        assert!(close(err_d, real_loss + fake_loss));
        assert!(close(d_x, real_mean));
        assert!(close(d_g_z1, fake_mean));
        assert!(!close(err_d, real_loss + same_target_loss));
        Ok(())
    }

    #[test]
    fn test_carried_gradients_accumulate() -> candle_core::Result<()> {
        let w = Var::new(&[1f32, 2.0], &Device::Cpu)?;
        let mut carried = CarriedGradients::new(vec![w.clone()]);

        // d/dw sum(3w) = 3
        let grads = (w.as_tensor() * 3.0)?.sum_all()?.backward()?;
        carried.accumulate(&grads)?;
        // d/dw sum(w^2) = 2w
        let mut grads = w.as_tensor().sqr()?.sum_all()?.backward()?;
        carried.accumulate(&grads)?;
        carried.apply(&mut grads);

        let total = grads.get(w.as_tensor()).unwrap().to_vec1::<f32>()?;
        assert_eq!(total, vec![5.0, 7.0]);
        Ok(())
    }

    #[test]
    fn test_window_trend() {
        let metrics: Vec<EpochLogEntry> = (0..4)
            .map(|e| EpochLogEntry {
                epoch: e,
                loss_d: 10.0 - e as f64,
                loss_g: 1.0,
                d_x: 0.0,
                d_g_z1: 0.0,
                d_g_z2: 0.0,
            })
            .collect();
        assert!(compute_window_trend(&metrics, 5).is_none());
        let (d_avg, g_avg, d_slope, g_slope) = compute_window_trend(&metrics, 3).unwrap();
        assert!((d_avg - 8.0).abs() < 1e-12);
        assert!((g_avg - 1.0).abs() < 1e-12);
        assert!((d_slope + 1.0).abs() < 1e-12);
        assert_eq!(g_slope, 0.0);
    }
}
