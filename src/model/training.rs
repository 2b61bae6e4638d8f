use std::path::PathBuf;
use std::time::Instant;

use burn::{
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::{Distribution, ElementConversion, backend::AutodiffBackend},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{GanError, Result as GanResult};
use crate::logging::{LossLog, LossRecord};
use crate::model::{
    architecture::{Critic, Discriminator, Generator, ModelConfig, OrthogonalWeights},
    checkpoint::{Checkpointer, LoadOutcome},
    constants::MODEL_NAME,
    data::{ImageBatcher, ImageFolderDataset, ImageSource, LoaderSource, image_loader},
    ema::ParameterAverager,
    loss::{GanLoss, GanType},
    sampling::Sampler,
};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub optimizer_g: AdamConfig,
    pub optimizer_d: AdamConfig,

    pub checkpoint_dir: String,
    pub result_dir: String,
    pub log_dir: String,
    pub sample_dir: String,
    pub dataset: String,

    #[config(default = "GanType::Hinge")]
    pub gan_type: GanType,

    #[config(default = 50)]
    pub epoch: usize,

    /// Generator updates per epoch.
    #[config(default = 10000)]
    pub iteration: usize,

    #[config(default = 2048)]
    pub batch_size: usize,

    #[config(default = 1000)]
    pub print_freq: usize,

    #[config(default = 1000)]
    pub save_freq: usize,

    #[config(default = 5e-5)]
    pub generator_lr: f64,

    #[config(default = 2e-4)]
    pub discriminator_lr: f64,

    #[config(default = 0.9999)]
    pub moving_average_decay: f64,

    #[config(default = 10.0)]
    pub gradient_penalty_lambda: f64,

    #[config(default = 1e-4)]
    pub orthogonal_scale: f64,

    /// Discriminator updates per generator update.
    #[config(default = 2)]
    pub n_critic: usize,

    #[config(default = 64)]
    pub sample_count: usize,

    #[config(default = 10)]
    pub test_count: usize,

    #[config(default = 42)]
    pub seed: u64,

    /// Threads decoding training images.
    #[config(default = 4)]
    pub num_workers: usize,

    #[config(default = 5)]
    pub keep_checkpoints: usize,

    #[config(default = false)]
    pub fresh_on_corrupt: bool,
}

impl TrainingConfig {
    pub fn total_iterations(&self) -> usize {
        self.epoch * self.iteration
    }

    /// Run name shared by checkpoint, result and log directories.
    pub fn model_dir(&self) -> String {
        let sn = if self.model.spectral_norm { "_sn" } else { "" };
        format!(
            "{MODEL_NAME}_{}_{}_{}ch_{}critic{sn}",
            self.model.image_size, self.gan_type, self.model.base_channels, self.n_critic
        )
    }

    pub fn run_paths(&self) -> RunPaths {
        let model_dir = self.model_dir();
        RunPaths {
            checkpoints: PathBuf::from(&self.checkpoint_dir).join(&model_dir),
            results: PathBuf::from(&self.result_dir).join(&model_dir),
            logs: PathBuf::from(&self.log_dir).join(&model_dir),
            samples: PathBuf::from(&self.sample_dir),
        }
    }
}

/// Output directories of one run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub checkpoints: PathBuf,
    pub results: PathBuf,
    pub logs: PathBuf,
    pub samples: PathBuf,
}

impl RunPaths {
    pub fn create(&self) -> GanResult<()> {
        for dir in [&self.checkpoints, &self.results, &self.logs, &self.samples] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// How many optimizer and averaging updates have been applied so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCounters {
    pub discriminator_updates: usize,
    pub generator_updates: usize,
    pub average_updates: usize,
}

/// Everything a run needs to continue bit-for-bit from where it stopped.
pub struct TrainingState<B: AutodiffBackend, OG, OD> {
    pub generator: Generator<B>,
    pub discriminator: Discriminator<B>,
    pub averaged_generator: Generator<B::InnerBackend>,
    pub optimizer_g: OG,
    pub optimizer_d: OD,
    /// Completed generator iterations.
    pub step: usize,
    pub counters: UpdateCounters,
}

/// Fresh networks, optimizers and an averaged copy of the generator.
#[allow(clippy::type_complexity)]
pub fn init_state<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: &B::Device,
) -> TrainingState<
    B,
    impl Optimizer<Generator<B>, B> + Clone + use<B>,
    impl Optimizer<Discriminator<B>, B> + Clone + use<B>,
> {
    let generator = config.model.init_generator::<B>(device);
    let discriminator = config.model.init_discriminator::<B>(device);
    let averaged_generator = ParameterAverager::new(config.moving_average_decay)
        .init(&generator);

    TrainingState {
        generator,
        discriminator,
        averaged_generator,
        optimizer_g: config.optimizer_g.init::<B, Generator<B>>(),
        optimizer_d: config.optimizer_d.init::<B, Discriminator<B>>(),
        step: 0,
        counters: UpdateCounters::default(),
    }
}

/// Trainable parameter counts of both networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkSummary {
    pub generator: usize,
    pub discriminator: usize,
}

impl NetworkSummary {
    pub fn of<B: AutodiffBackend, OG, OD>(state: &TrainingState<B, OG, OD>) -> Self {
        Self {
            generator: state.generator.num_params(),
            discriminator: state.discriminator.num_params(),
        }
    }
}

fn log_network_summary<B: AutodiffBackend, OG, OD>(state: &TrainingState<B, OG, OD>) -> NetworkSummary {
    let summary = NetworkSummary::of(state);
    info!(
        generator = summary.generator,
        discriminator = summary.discriminator,
        "parameter count"
    );
    summary
}

/// Where the trainer currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initializing,
    WarmStart,
    Running,
    Sampling,
    Checkpointing,
    Finished,
}

/// Losses of the last discriminator update and the generator update of one iteration.
#[derive(Debug, Clone, Copy)]
pub struct IterationLosses {
    pub discriminator: f32,
    pub generator: f32,
}

pub struct Trainer<B: AutodiffBackend, OG, OD> {
    config: TrainingConfig,
    state: TrainingState<B, OG, OD>,
    loss: GanLoss,
    averager: ParameterAverager,
    checkpointer: Checkpointer,
    sampler: Sampler<B::InnerBackend>,
    loss_log: LossLog,
    device: B::Device,
    stage: Stage,
    last_saved_step: Option<usize>,
}

impl<B, OG, OD> Trainer<B, OG, OD>
where
    B: AutodiffBackend,
    OG: Optimizer<Generator<B>, B> + Clone,
    OD: Optimizer<Discriminator<B>, B> + Clone,
{
    pub fn new(
        config: TrainingConfig,
        state: TrainingState<B, OG, OD>,
        device: B::Device,
    ) -> GanResult<Self> {
        let paths = config.run_paths();
        paths.create()?;

        Ok(Self {
            loss: GanLoss::new(config.gan_type, config.gradient_penalty_lambda),
            averager: ParameterAverager::new(config.moving_average_decay),
            checkpointer: Checkpointer::new(paths.checkpoints.clone(), config.keep_checkpoints),
            sampler: Sampler::new(&config, &paths, &device),
            loss_log: LossLog::new(paths.logs.join("losses.jsonl")),
            config,
            state,
            device,
            stage: Stage::Initializing,
            last_saved_step: None,
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn state(&self) -> &TrainingState<B, OG, OD> {
        &self.state
    }

    pub fn into_state(self) -> TrainingState<B, OG, OD> {
        self.state
    }

    /// Continue from the newest checkpoint if there is one.
    pub fn resume(&mut self) -> GanResult<()> {
        match self.checkpointer.load(&self.state, &self.device) {
            LoadOutcome::Loaded(state) => {
                self.transition(Stage::WarmStart);
                info!(" [*] Load SUCCESS, resuming at step {}", state.step);
                self.last_saved_step = Some(state.step);
                self.state = state;
            }
            LoadOutcome::NotFound => info!(" [!] No checkpoint found, starting fresh"),
            LoadOutcome::Corrupt(reason) if self.config.fresh_on_corrupt => {
                warn!("ignoring corrupt checkpoint and starting fresh: {reason}");
            }
            LoadOutcome::Corrupt(reason) => return Err(GanError::CheckpointCorrupt(reason)),
        }
        Ok(())
    }

    /// Train until `epoch * iteration` generator iterations have completed.
    pub fn fit<S: ImageSource<B>>(&mut self, source: &mut S) -> GanResult<()> {
        let total = self.config.total_iterations();
        let iteration = self.config.iteration;
        let start = Instant::now();
        self.transition(Stage::Running);

        while self.state.step < total {
            let losses = self.train_iteration(source)?;
            let step = self.state.step;
            let epoch = (step - 1) / iteration;
            let idx = (step - 1) % iteration;
            debug!(
                epoch,
                step,
                d_loss = losses.discriminator,
                g_loss = losses.generator,
                "iteration done"
            );

            if step % self.config.print_freq == 0 {
                let elapsed = start.elapsed().as_secs_f64();
                info!(
                    "Epoch: [{epoch:2}] [{:5}/{:5}] time: {elapsed:4.4}, d_loss: {:.8}, g_loss: {:.8}",
                    idx + 1,
                    iteration,
                    losses.discriminator,
                    losses.generator
                );
                self.loss_log.append(&LossRecord {
                    epoch,
                    step,
                    d_loss: losses.discriminator,
                    g_loss: losses.generator,
                    elapsed_secs: elapsed,
                })?;
                self.transition(Stage::Sampling);
                self.sampler
                    .training_grid(&self.state.averaged_generator, epoch, idx)?;
                self.transition(Stage::Running);
            }

            if step % self.config.save_freq == 0 {
                self.checkpoint()?;
            }

            if step % iteration == 0 && step < total {
                self.checkpoint()?;
                self.sampler.visualize(&self.state.averaged_generator, epoch)?;
            }
        }

        self.checkpoint()?;
        self.transition(Stage::Finished);
        self.sampler
            .visualize(&self.state.averaged_generator, self.config.epoch.saturating_sub(1))?;
        Ok(())
    }

    /// `n_critic` discriminator updates on fresh batches, one generator update,
    /// then one refresh of the averaged generator.
    pub fn train_iteration<S: ImageSource<B>>(&mut self, source: &mut S) -> GanResult<IterationLosses> {
        let mut d_loss = 0.0;
        for _ in 0..self.config.n_critic {
            let real = source.next_batch(self.config.batch_size, &self.device)?;
            d_loss = self.discriminator_step(real)?;
        }
        let g_loss = self.generator_step()?;

        self.state.averaged_generator = self
            .averager
            .update(&self.state.averaged_generator, &self.state.generator);
        self.state.counters.average_updates += 1;
        self.state.step += 1;

        Ok(IterationLosses {
            discriminator: d_loss,
            generator: g_loss,
        })
    }

    fn discriminator_step(&mut self, real: Tensor<B, 4>) -> GanResult<f32> {
        let [batch, ..] = real.dims();
        // Fake images are constants here; only the discriminator learns.
        let fake = self.state.generator.forward(self.noise(batch)).detach();

        let discriminator = &self.state.discriminator;
        let real_scores = discriminator.critique(real.clone());
        let fake_scores = discriminator.critique(fake.clone());
        let mut loss =
            self.loss
                .discriminator_loss(discriminator, real_scores, fake_scores, real, fake);
        if self.config.orthogonal_scale > 0.0 {
            loss = loss + discriminator.orthogonal_penalty(self.config.orthogonal_scale);
        }

        let value = ensure_finite("discriminator", self.state.step, &loss)?;
        let grads = GradientsParams::from_grads(loss.backward(), discriminator);
        self.state.discriminator = self.state.optimizer_d.step(
            self.config.discriminator_lr,
            self.state.discriminator.clone(),
            grads,
        );
        self.state.counters.discriminator_updates += 1;
        Ok(value)
    }

    fn generator_step(&mut self) -> GanResult<f32> {
        let noise = self.noise(self.config.batch_size);
        let generator = &self.state.generator;
        let fake_scores = self.state.discriminator.critique(generator.forward(noise));
        let mut loss = self.loss.generator_loss(fake_scores);
        if self.config.orthogonal_scale > 0.0 {
            loss = loss + generator.orthogonal_penalty(self.config.orthogonal_scale);
        }

        let value = ensure_finite("generator", self.state.step, &loss)?;
        let grads = GradientsParams::from_grads(loss.backward(), generator);
        self.state.generator = self.state.optimizer_g.step(
            self.config.generator_lr,
            self.state.generator.clone(),
            grads,
        );
        self.state.counters.generator_updates += 1;
        Ok(value)
    }

    fn noise(&self, batch: usize) -> Tensor<B, 2> {
        Tensor::random(
            [batch, self.config.model.noise_dim],
            Distribution::Normal(0.0, 1.0),
            &self.device,
        )
    }

    fn checkpoint(&mut self) -> GanResult<()> {
        if self.last_saved_step == Some(self.state.step) {
            return Ok(());
        }
        let previous = self.stage;
        self.transition(Stage::Checkpointing);
        let path = self.checkpointer.save(&self.state)?;
        info!(" [*] Saved checkpoint {}", path.display());
        self.last_saved_step = Some(self.state.step);
        self.transition(previous);
        Ok(())
    }

    fn transition(&mut self, next: Stage) {
        if self.stage != next {
            debug!(from = ?self.stage, to = ?next, "stage change");
            self.stage = next;
        }
    }
}

/// Read a scalar loss back, refusing NaN and infinities before any optimizer step.
fn ensure_finite<B: Backend>(network: &'static str, step: usize, loss: &Tensor<B, 1>) -> GanResult<f32> {
    let value: f32 = loss.clone().into_scalar().elem();
    if !value.is_finite() {
        error!(network, step, value, "loss diverged");
        return Err(GanError::NumericDivergence {
            network,
            step,
            value,
        });
    }
    Ok(value)
}

/// Train phase: image folder in, checkpoints, logs and sample grids out.
pub fn train<B: AutodiffBackend>(config: TrainingConfig, device: B::Device) -> GanResult<()> {
    let paths = config.run_paths();
    paths.create()?;
    config.save(paths.logs.join("config.json"))?;

    B::seed(config.seed);

    let size = config.model.image_size.pixels();
    let channels = config.model.channels;
    let dataset = ImageFolderDataset::new(&config.dataset, size, channels)?;
    let loader = image_loader::<B, _>(
        dataset,
        ImageBatcher::new(channels, size),
        config.batch_size,
        config.seed,
        config.num_workers,
    );
    let mut source = LoaderSource::new(loader.as_ref());

    info!(
        "training {} for {} iterations ({} x {})",
        config.model_dir(),
        config.total_iterations(),
        config.epoch,
        config.iteration
    );
    let state = init_state::<B>(&config, &device);
    log_network_summary(&state);
    let mut trainer = Trainer::new(config, state, device)?;
    trainer.resume()?;
    trainer.fit(&mut source)?;
    info!(" [*] Training finished!");
    Ok(())
}

/// Test phase: restore the newest checkpoint and write `test_count` grids
/// from the averaged generator.
pub fn test<B: AutodiffBackend>(config: TrainingConfig, device: B::Device) -> GanResult<Vec<PathBuf>> {
    let paths = config.run_paths();
    paths.create()?;
    B::seed(config.seed);

    let template = init_state::<B>(&config, &device);
    let checkpointer = Checkpointer::new(paths.checkpoints.clone(), config.keep_checkpoints);
    let state = match checkpointer.load(&template, &device) {
        LoadOutcome::Loaded(state) => state,
        LoadOutcome::NotFound => {
            return Err(GanError::NoCheckpoint(
                paths.checkpoints.display().to_string(),
            ));
        }
        LoadOutcome::Corrupt(reason) => return Err(GanError::CheckpointCorrupt(reason)),
    };
    info!(" [*] Load SUCCESS at step {}", state.step);

    let sampler = Sampler::<B::InnerBackend>::new(&config, &paths, &device);
    let written = sampler.test_images(&state.averaged_generator, config.test_count)?;
    info!(" [*] Test finished, {} images written", written.len());
    Ok(written)
}
